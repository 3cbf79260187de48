use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use evscrape_core::{Collection, CollectionRow, Event, EventFields, FlagMarker};
use evscrape_storage::{CollectionStore, MemoryCollectionStore, StoreError};
use evscrape_sync::{dedupe_collection, mark_reviewed, merge_batch, MergeEngine};

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn event(title: &str, start_date: &str, location: &str) -> Event {
    Event::new(EventFields {
        title: Some(title.to_string()),
        start_date: Some(start_date.to_string()),
        location: Some(location.to_string()),
        source: Some("X".to_string()),
        ..Default::default()
    })
    .unwrap()
}

const HEADER: [&str; 5] = ["flag", "title", "start_date", "location", "source"];

fn memory_store(rows: &[[&str; 5]]) -> MemoryCollectionStore {
    let rows = rows.iter().map(|r| CollectionRow::new(strings(r))).collect();
    MemoryCollectionStore::new("sheet", Collection::new(strings(&HEADER), rows))
}

/// Read always fails; counts any write that slips through.
#[derive(Default)]
struct UnreadableStore {
    writes: AtomicUsize,
}

#[async_trait]
impl CollectionStore for UnreadableStore {
    fn name(&self) -> &str {
        "unreadable"
    }

    async fn read_all(&self) -> Result<Collection, StoreError> {
        Err(StoreError::QuotaExceeded("read quota".into()))
    }

    async fn write_header(&self, _header: &[String]) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn insert_rows_at_top(&self, _rows: &[Vec<String>]) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_rows(&self, _positions: &[usize]) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_flagged(&self, _positions: &[usize]) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Serves the first read from memory; later reads hit the quota.
struct QuotaAfterFirstRead {
    inner: MemoryCollectionStore,
    reads: AtomicUsize,
}

#[async_trait]
impl CollectionStore for QuotaAfterFirstRead {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn read_all(&self) -> Result<Collection, StoreError> {
        if self.reads.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(StoreError::QuotaExceeded("read quota".into()));
        }
        self.inner.read_all().await
    }

    async fn write_header(&self, header: &[String]) -> Result<(), StoreError> {
        self.inner.write_header(header).await
    }

    async fn insert_rows_at_top(&self, rows: &[Vec<String>]) -> Result<(), StoreError> {
        self.inner.insert_rows_at_top(rows).await
    }

    async fn delete_rows(&self, positions: &[usize]) -> Result<(), StoreError> {
        self.inner.delete_rows(positions).await
    }

    async fn set_flagged(&self, positions: &[usize]) -> Result<(), StoreError> {
        self.inner.set_flagged(positions).await
    }
}

#[tokio::test]
async fn failed_read_is_not_an_empty_collection() {
    let store = UnreadableStore::default();
    let err = merge_batch(&store, &MergeEngine::default(), &[event("Beach Party", "26 Dec", "Doha")], false)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::QuotaExceeded(_)));
    assert_eq!(store.writes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn desert_safari_merge_inserts_only_beach_party() {
    let store = memory_store(&[["", "Desert Safari", "25 Dec", "Doha", "X"]]);
    let outcome = merge_batch(
        &store,
        &MergeEngine::default(),
        &[event("desert safari", "25 Dec", "Doha"), event("Beach Party", "26 Dec", "Doha")],
        false,
    )
    .await
    .unwrap();
    assert_eq!(outcome.inserted, 1);
    assert_eq!(outcome.already_present, 1);

    let rows = store.snapshot().await.rows;
    assert_eq!(rows[0].cells, strings(&["", "Beach Party", "26 Dec", "Doha", "X"]));
    assert_eq!(rows[1].cell(1), "Desert Safari");
}

#[tokio::test]
async fn merge_with_dedupe_cleans_preexisting_duplicates() {
    let store = memory_store(&[
        ["", "Beach Party", "26 Dec", "Doha", "X"],
        ["kept", "beach party", "26 Dec", "doha", "X"],
    ]);
    let outcome = merge_batch(&store, &MergeEngine::default(), &[event("Chess Night", "27 Dec", "Doha")], true)
        .await
        .unwrap();
    assert_eq!(outcome.inserted, 1);
    assert_eq!(outcome.duplicates_removed, 1);

    let rows = store.snapshot().await.rows;
    let titles = rows.iter().map(|r| r.cell(1)).collect::<Vec<_>>();
    assert_eq!(titles, vec!["Chess Night", "beach party"]);
}

#[tokio::test]
async fn failed_dedupe_still_reports_committed_inserts() {
    let store = QuotaAfterFirstRead {
        inner: memory_store(&[["", "Desert Safari", "25 Dec", "Doha", "X"]]),
        reads: AtomicUsize::new(0),
    };
    let outcome = merge_batch(&store, &MergeEngine::default(), &[event("Beach Party", "26 Dec", "Doha")], true)
        .await
        .unwrap();
    assert_eq!(outcome.inserted, 1);
    assert_eq!(outcome.duplicates_removed, 0);
    assert!(outcome.dedupe_error.as_deref().is_some_and(|e| e.contains("quota")));
    assert_eq!(store.inner.snapshot().await.rows.len(), 2);
}

#[tokio::test]
async fn first_merge_writes_header_and_rows_together() {
    let store = MemoryCollectionStore::new("sheet", Collection::default());
    let outcome = merge_batch(&store, &MergeEngine::default(), &[event("Beach Party", "26 Dec", "Doha")], false)
        .await
        .unwrap();
    assert!(outcome.header_initialized);
    assert_eq!(outcome.inserted, 1);

    let collection = store.snapshot().await;
    assert!(collection.has_header());
    assert_eq!(collection.rows.len(), 1);
    assert_eq!(collection.rows[0].cell(1), "26 Dec");
}

#[tokio::test]
async fn marked_row_becomes_the_dedupe_survivor() {
    let store = memory_store(&[
        ["", "Desert Safari", "25 Dec", "Doha", "X"],
        ["", "Beach Party", "26 Dec", "Doha", "X"],
        ["", " desert safari ", "25 Dec", "Doha", "X"],
    ]);
    let titles = HashSet::from(["desert safari".to_string()]);

    let marked = mark_reviewed(&store, &titles, "title").await.unwrap();
    assert_eq!(marked, 1);
    assert_eq!(mark_reviewed(&store, &titles, "title").await.unwrap(), 0);

    let plan = dedupe_collection(&store, &MergeEngine::default()).await.unwrap();
    assert_eq!(plan.rows_to_delete, vec![1]);
    assert_eq!(plan.duplicate_groups[0].survivor, 3);

    let rows = store.snapshot().await.rows;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].cell(1), " desert safari ");
    assert_eq!(rows[1].marker, FlagMarker::Set);
}

#[tokio::test]
async fn marking_requires_the_title_column() {
    let store = memory_store(&[["", "Desert Safari", "25 Dec", "Doha", "X"]]);
    let err = mark_reviewed(&store, &HashSet::new(), "name").await.unwrap_err();
    assert!(matches!(err, StoreError::Malformed(_)));
}
