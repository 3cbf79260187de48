use async_trait::async_trait;
use evscrape_core::{Collection, CollectionRow, FlagMarker};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use crate::BackoffPolicy;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("collection backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("collection backend quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("collection data is malformed: {0}")]
    Malformed(String),
    #[error("row position {position} is outside the collection (rows: {rows})")]
    InvalidPosition { position: usize, rows: usize },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::BackendUnavailable(_) | StoreError::QuotaExceeded(_)
        )
    }
}

/// Persistent collection backend.
///
/// Row positions are 1-based and count data rows only: position 1 is the
/// first row below the header. Positions passed to one call always refer to
/// the snapshot taken before that call.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    fn name(&self) -> &str;

    async fn read_all(&self) -> Result<Collection, StoreError>;

    async fn write_header(&self, header: &[String]) -> Result<(), StoreError>;

    /// Header and first rows of an empty collection in one write. Backends
    /// that cannot do this atomically fall back to two calls.
    async fn initialize(&self, header: &[String], rows: &[Vec<String>]) -> Result<(), StoreError> {
        self.write_header(header).await?;
        if rows.is_empty() {
            return Ok(());
        }
        self.insert_rows_at_top(rows).await
    }

    /// Inserts directly below the header, keeping `rows` in the given order.
    async fn insert_rows_at_top(&self, rows: &[Vec<String>]) -> Result<(), StoreError>;

    async fn delete_rows(&self, positions: &[usize]) -> Result<(), StoreError>;

    async fn set_flagged(&self, positions: &[usize]) -> Result<(), StoreError>;
}

pub(crate) fn descending_positions(positions: &[usize], rows: usize) -> Result<Vec<usize>, StoreError> {
    if let Some(&position) = positions.iter().find(|&&p| p == 0 || p > rows) {
        return Err(StoreError::InvalidPosition { position, rows });
    }
    let mut sorted = positions.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    sorted.dedup();
    Ok(sorted)
}

#[derive(Debug, Default)]
pub struct MemoryCollectionStore {
    name: String,
    state: Mutex<Collection>,
}

impl MemoryCollectionStore {
    pub fn new(name: impl Into<String>, collection: Collection) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(collection),
        }
    }

    pub async fn snapshot(&self) -> Collection {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl CollectionStore for MemoryCollectionStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_all(&self) -> Result<Collection, StoreError> {
        Ok(self.snapshot().await)
    }

    async fn write_header(&self, header: &[String]) -> Result<(), StoreError> {
        self.state.lock().await.header = header.to_vec();
        Ok(())
    }

    async fn initialize(&self, header: &[String], rows: &[Vec<String>]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.header = header.to_vec();
        state.rows.splice(0..0, rows.iter().cloned().map(CollectionRow::new));
        Ok(())
    }

    async fn insert_rows_at_top(&self, rows: &[Vec<String>]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.has_header() {
            return Err(StoreError::Malformed(format!(
                "{}: cannot insert rows before a header exists",
                self.name
            )));
        }
        let inserted = rows.iter().cloned().map(CollectionRow::new);
        state.rows.splice(0..0, inserted);
        Ok(())
    }

    async fn delete_rows(&self, positions: &[usize]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for position in descending_positions(positions, state.rows.len())? {
            state.rows.remove(position - 1);
        }
        Ok(())
    }

    async fn set_flagged(&self, positions: &[usize]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for position in descending_positions(positions, state.rows.len())? {
            state.rows[position - 1].marker = FlagMarker::Set;
        }
        Ok(())
    }
}

pub struct RetryingStore<S> {
    inner: S,
    backoff: BackoffPolicy,
}

impl<S: CollectionStore> RetryingStore<S> {
    pub fn new(inner: S, backoff: BackoffPolicy) -> Self {
        Self { inner, backoff }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    async fn retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T, StoreError>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(err) if err.is_retryable() && attempt < self.backoff.max_retries => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        collection = self.inner.name(),
                        operation,
                        attempt,
                        ?delay,
                        error = %err,
                        "collection store call failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<S: CollectionStore> CollectionStore for RetryingStore<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn read_all(&self) -> Result<Collection, StoreError> {
        self.retry("read_all", move || self.inner.read_all()).await
    }

    async fn write_header(&self, header: &[String]) -> Result<(), StoreError> {
        self.retry("write_header", move || self.inner.write_header(header)).await
    }

    async fn initialize(&self, header: &[String], rows: &[Vec<String>]) -> Result<(), StoreError> {
        self.retry("initialize", move || self.inner.initialize(header, rows)).await
    }

    async fn insert_rows_at_top(&self, rows: &[Vec<String>]) -> Result<(), StoreError> {
        self.retry("insert_rows_at_top", move || self.inner.insert_rows_at_top(rows))
            .await
    }

    async fn delete_rows(&self, positions: &[usize]) -> Result<(), StoreError> {
        self.retry("delete_rows", move || self.inner.delete_rows(positions)).await
    }

    async fn set_flagged(&self, positions: &[usize]) -> Result<(), StoreError> {
        self.retry("set_flagged", move || self.inner.set_flagged(positions)).await
    }
}
