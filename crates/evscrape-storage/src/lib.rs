//! Collection persistence and HTTP page fetching for evscrape.

use std::time::Duration;

mod collection;
mod csv_store;
mod fetch;

pub use collection::{CollectionStore, MemoryCollectionStore, RetryingStore, StoreError};
pub use csv_store::{export_events_csv, read_column_values, CsvCollectionStore, DEFAULT_MARKER_COLUMN};
pub use fetch::{FetchConfig, FetchError, FetchedPage, PageFetcher};

pub const CRATE_NAME: &str = "evscrape-storage";

/// Exponential, capped delay between attempts. Shared by page fetches and
/// collection store retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// `base_delay * 2^attempt`, never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_the_cap() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        let delays = (0..4).map(|a| policy.delay_for_attempt(a)).collect::<Vec<_>>();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(350),
                Duration::from_millis(350),
            ]
        );
        assert_eq!(policy.delay_for_attempt(64), Duration::from_millis(350));
        assert_eq!(BackoffPolicy::none().max_retries, 0);
    }
}
