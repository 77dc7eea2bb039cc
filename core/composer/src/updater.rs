use chrono::Utc;
use litwatch_ingestion::{Analysis, Database, GuardedGenerator, SourceFetcher, TermExtractor};
use litwatch_schemas::{generate_cycle_id, CycleId, SummaryRequest};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::composer::{ComposeError, SummaryComposer};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleMode {
    /// Only records published since the progress cursor
    Incremental,
    /// Ignore the cursor and use the source's default window
    Initial,
}

/// What one update cycle did
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: CycleId,
    pub mode: CycleMode,
    pub fetched: usize,
    pub added: usize,
    pub already_stored: usize,
    /// Records left for a later cycle because analysis timed out
    pub skipped: usize,
    /// Records whose write to the store failed
    pub failed: usize,
    pub fetch_complete: bool,
    pub summary_version: Option<u32>,
    pub summary_error: Option<String>,
    pub cursor_advanced: bool,
}

/// Runs ingestion cycles: fetch, analyze, index, store, re-summarize, and
/// advance the progress cursor only when nothing was left behind.
pub struct UpdateOrchestrator {
    db: Arc<Mutex<Database>>,
    fetcher: SourceFetcher,
    generator: Arc<GuardedGenerator>,
    extractor: Arc<dyn TermExtractor>,
    composer: Arc<SummaryComposer>,
    query: String,
    language: String,
}

impl UpdateOrchestrator {
    pub fn new(
        db: Arc<Mutex<Database>>,
        fetcher: SourceFetcher,
        generator: Arc<GuardedGenerator>,
        extractor: Arc<dyn TermExtractor>,
        composer: Arc<SummaryComposer>,
        query: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            db,
            fetcher,
            generator,
            extractor,
            composer,
            query: query.into(),
            language: language.into(),
        }
    }

    /// Records a cycle in `mode` would fetch: everything since the cursor
    /// for `Incremental`, the source's default window for `Initial`
    pub async fn count_pending(&self, mode: CycleMode) -> Result<usize, ComposeError> {
        let after = self.window_start(mode).await?;
        Ok(self.fetcher.count(&self.query, after).await)
    }

    async fn window_start(
        &self,
        mode: CycleMode,
    ) -> Result<Option<chrono::NaiveDate>, ComposeError> {
        Ok(match mode {
            CycleMode::Incremental => Some(self.db.lock().await.get_cursor()?),
            CycleMode::Initial => None,
        })
    }

    pub async fn run_cycle(&self, mode: CycleMode) -> Result<CycleReport, ComposeError> {
        let cycle_id = generate_cycle_id();
        let after = self.window_start(mode).await?;
        info!("Cycle {} started ({:?}, after {:?})", cycle_id, mode, after);

        let batch = self.fetcher.fetch_batch(&self.query, after).await;
        if batch.truncated {
            warn!(
                "Cycle {}: source matched {} records, only {} fetched",
                cycle_id,
                batch.total_count,
                batch.records.len()
            );
        }

        let mut report = CycleReport {
            cycle_id,
            mode,
            fetched: batch.records.len(),
            added: 0,
            already_stored: 0,
            skipped: 0,
            failed: 0,
            fetch_complete: batch.complete,
            summary_version: None,
            summary_error: None,
            cursor_advanced: false,
        };

        for record in &batch.records {
            let exists = self.db.lock().await.record_exists(&record.external_id);
            match exists {
                Ok(true) => {
                    report.already_stored += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    error!("Failed to look up record {}: {}", record.external_id, e);
                    report.failed += 1;
                    continue;
                }
            }

            let analysis = self.generator.analyze(record).await;
            if analysis == Analysis::TimedOut {
                report.skipped += 1;
                continue;
            }
            let terms = self.extractor.extract(record).await;

            let stored = self
                .db
                .lock()
                .await
                .ingest_record(record, analysis.stored_text(), &terms);
            match stored {
                Ok(_) => report.added += 1,
                Err(e) => {
                    error!("Failed to store record {}: {}", record.external_id, e);
                    report.failed += 1;
                }
            }
        }

        if report.added > 0 {
            let request = SummaryRequest::for_language(self.language.clone());
            match self.composer.request_summary(&request).await {
                Ok(outcome) => report.summary_version = Some(outcome.summary.version),
                Err(e) => {
                    error!("Cycle {}: summary update failed: {}", report.cycle_id, e);
                    report.summary_error = Some(e.to_string());
                }
            }
        }

        let clean = report.fetch_complete
            && report.skipped == 0
            && report.failed == 0
            && report.summary_error.is_none();

        if clean {
            self.db
                .lock()
                .await
                .set_cursor(Utc::now().date_naive())?;
            report.cursor_advanced = true;
        } else {
            warn!(
                "Cycle {} left work behind (fetch complete: {}, skipped: {}, failed: {}); cursor not advanced",
                report.cycle_id, report.fetch_complete, report.skipped, report.failed
            );
        }

        info!(
            "Cycle {} finished: {} fetched, {} added, {} already stored",
            report.cycle_id, report.fetched, report.added, report.already_stored
        );
        Ok(report)
    }

    /// Run an incremental cycle every `period` until `shutdown` resolves.
    /// A cycle interrupted by shutdown leaves the cursor where it was.
    pub async fn run_periodic<F>(&self, period: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping periodic updates");
                    break;
                }
                _ = ticker.tick() => {
                    tokio::select! {
                        result = self.run_cycle(CycleMode::Incremental) => match result {
                            Ok(report) => info!(
                                "Periodic cycle {} done ({} added)",
                                report.cycle_id, report.added
                            ),
                            Err(e) => error!("Periodic cycle failed: {}", e),
                        },
                        _ = &mut shutdown => {
                            warn!("Shutdown requested mid-cycle; cursor left unchanged");
                            break;
                        }
                    }
                }
            }
        }
    }
}
