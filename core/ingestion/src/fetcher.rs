use async_trait::async_trait;
use chrono::NaiveDate;
use litwatch_schemas::RawRecord;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::error::FetchError;

/// Largest page requested from a source in one call
pub const MAX_PAGE_SIZE: usize = 100;

/// Default cap on records fetched per run
pub const DEFAULT_MAX_RECORDS: usize = 1000;

/// Opaque server-side handle to a stored result set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationToken(pub String);

/// Outcome of a search: how many records match and where to page them from
#[derive(Debug, Clone)]
pub struct SearchHandle {
    pub total_count: usize,
    pub token: Option<ContinuationToken>,
}

/// A paginated literature search service
#[async_trait]
pub trait LiteratureSource: Send + Sync {
    /// Run `query`, restricted to records published on or after `after`
    /// when given
    async fn search(
        &self,
        query: &str,
        after: Option<NaiveDate>,
    ) -> Result<SearchHandle, FetchError>;

    /// One page of the stored result set
    async fn fetch_page(
        &self,
        token: &ContinuationToken,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RawRecord>, FetchError>;
}

/// Serializes callers so consecutive requests are at least `min_interval` apart.
/// Share one gate (behind an `Arc`) between every client that draws on the
/// same rate budget.
#[derive(Debug)]
pub struct RateGate {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the next request may go out, then claim the slot
    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Records from one fetch run
#[derive(Debug, Clone, Default)]
pub struct FetchBatch {
    pub records: Vec<RawRecord>,
    /// Matches reported by the source, before the record cap
    pub total_count: usize,
    /// False when the search or a page failed and some matches were never retrieved
    pub complete: bool,
    /// True when the source reported more matches than the record cap allows
    pub truncated: bool,
}

/// Drives a [`LiteratureSource`]: search once, then page through the
/// result set with bounded page size and total
pub struct SourceFetcher {
    source: Arc<dyn LiteratureSource>,
    page_size: usize,
    max_records: usize,
}

impl SourceFetcher {
    pub fn new(source: Arc<dyn LiteratureSource>) -> Self {
        Self {
            source,
            page_size: MAX_PAGE_SIZE,
            max_records: DEFAULT_MAX_RECORDS,
        }
    }

    pub fn with_limits(mut self, page_size: usize, max_records: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self.max_records = max_records;
        self
    }

    /// Number of matches, 0 when the search fails
    pub async fn count(&self, query: &str, after: Option<NaiveDate>) -> usize {
        match self.source.search(query, after).await {
            Ok(handle) => handle.total_count,
            Err(e) => {
                warn!("Search failed while counting: {}", e);
                0
            }
        }
    }

    /// Every retrievable record, each external id at most once
    pub async fn fetch_all(&self, query: &str, after: Option<NaiveDate>) -> Vec<RawRecord> {
        self.fetch_batch(query, after).await.records
    }

    /// Like [`SourceFetcher::fetch_all`], but also reports whether the run
    /// saw every match
    pub async fn fetch_batch(&self, query: &str, after: Option<NaiveDate>) -> FetchBatch {
        let handle = match self.source.search(query, after).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Search failed: {}", e);
                return FetchBatch::default();
            }
        };

        if handle.total_count == 0 {
            info!("Search matched no records");
            return FetchBatch {
                complete: true,
                ..Default::default()
            };
        }

        let Some(token) = handle.token else {
            warn!(
                "Search matched {} records but returned no continuation token",
                handle.total_count
            );
            return FetchBatch {
                total_count: handle.total_count,
                ..Default::default()
            };
        };

        let target = handle.total_count.min(self.max_records);
        let truncated = handle.total_count > self.max_records;
        if truncated {
            warn!(
                "Search matched {} records, fetching only the first {}",
                handle.total_count, target
            );
        }

        let mut records = Vec::with_capacity(target);
        let mut seen = HashSet::new();
        let mut complete = true;
        let mut offset = 0;

        while offset < target {
            let limit = self.page_size.min(target - offset);
            let page = match self.source.fetch_page(&token, offset, limit).await {
                Ok(page) => page,
                Err(e) => {
                    warn!("Page at offset {} failed, stopping: {}", offset, e);
                    complete = false;
                    break;
                }
            };

            if page.is_empty() {
                debug!("Empty page at offset {}, result set exhausted", offset);
                break;
            }

            let fetched = page.len();
            for record in page {
                if seen.insert(record.external_id.clone()) {
                    records.push(record);
                } else {
                    debug!("Dropping duplicate record {}", record.external_id);
                }
            }

            debug!("Fetched {} records at offset {}", fetched, offset);
            offset += limit;
        }

        info!(
            "Fetched {} of {} matching records",
            records.len(),
            handle.total_count
        );

        FetchBatch {
            records,
            total_count: handle.total_count,
            complete,
            truncated,
        }
    }
}
