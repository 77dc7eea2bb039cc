use litwatch_ingestion::{Database, GuardedGenerator, StoreError};
use litwatch_schemas::{
    Record, SpecializedSummary, SpecializedSummaryDraft, SpecializedSummaryId, Summary,
    SummaryDraft, SummaryOutcome, SummaryRequest, UpdateType, DEFAULT_LANGUAGE,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("no records available for the requested scope")]
    NoRecords,

    #[error("a specialized summary needs at least one term")]
    NoTerms,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Builds and versions the per-language summaries.
///
/// Generation runs without holding the store lock; only reads and the final
/// save touch the database.
pub struct SummaryComposer {
    db: Arc<Mutex<Database>>,
    generator: Arc<GuardedGenerator>,
}

impl SummaryComposer {
    pub fn new(db: Arc<Mutex<Database>>, generator: Arc<GuardedGenerator>) -> Self {
        Self { db, generator }
    }

    /// Return the current summary for the requested language, generating or
    /// updating it first when needed.
    ///
    /// - no summary yet, or `force_regenerate`: full generation over the scope
    /// - any stored record newer than the summary's latest date: incremental merge
    /// - otherwise the existing version is returned unchanged
    pub async fn request_summary(
        &self,
        request: &SummaryRequest,
    ) -> Result<SummaryOutcome, ComposeError> {
        let language = normalize_language(&request.language);

        let (scope, existing) = {
            let db = self.db.lock().await;
            let scope = if request.terms.is_empty() {
                db.get_all_records(None)?
            } else {
                db.get_records_by_terms(&request.terms)?
            };
            (scope, db.latest_summary(&language)?)
        };

        if scope.is_empty() {
            return Err(ComposeError::NoRecords);
        }

        match existing {
            Some(existing) if !request.force_regenerate => {
                self.update_existing(existing, &scope, &language).await
            }
            _ => self.generate_full(&scope, &language).await,
        }
    }

    async fn generate_full(
        &self,
        scope: &[Record],
        language: &str,
    ) -> Result<SummaryOutcome, ComposeError> {
        info!(
            "Generating complete {} summary over {} records",
            language,
            scope.len()
        );

        let content = self.generator.summarize(scope, language).await;
        let trends = self.generator.extract_trends(scope).await;

        let draft = SummaryDraft {
            language: language.to_string(),
            content,
            record_count: scope.len(),
            latest_record_date: latest_date(scope)?,
            trends,
            update_type: UpdateType::Complete,
        };
        let summary = self.db.lock().await.save_summary(&draft)?;

        Ok(SummaryOutcome {
            message: format!(
                "Generated complete summary v{} from {} records",
                summary.version,
                scope.len()
            ),
            new_record_count: scope.len(),
            update_type: UpdateType::Complete,
            summary,
        })
    }

    /// Staleness is judged against every record newer than the summary,
    /// whatever term filter the request carries; the filter only shapes
    /// the scope used for counts and trends.
    async fn update_existing(
        &self,
        existing: Summary,
        scope: &[Record],
        language: &str,
    ) -> Result<SummaryOutcome, ComposeError> {
        let new_records = self
            .db
            .lock()
            .await
            .get_records_after(existing.latest_record_date)?;

        if new_records.is_empty() {
            debug!(
                "{} summary v{} is current",
                language, existing.version
            );
            return Ok(SummaryOutcome {
                message: format!(
                    "No new records since {}; summary v{} is current",
                    existing.latest_record_date, existing.version
                ),
                new_record_count: 0,
                update_type: UpdateType::Unchanged,
                summary: existing,
            });
        }

        info!(
            "Merging {} new records into {} summary v{}",
            new_records.len(),
            language,
            existing.version
        );

        let content = self
            .generator
            .merge_summary(&existing.content, &new_records, language)
            .await;
        let trends = self.generator.extract_trends(scope).await;
        let latest = latest_date(&new_records)?.max(existing.latest_record_date);

        let draft = SummaryDraft {
            language: language.to_string(),
            content,
            record_count: scope.len(),
            latest_record_date: latest,
            trends,
            update_type: UpdateType::Incremental,
        };
        let summary = self.db.lock().await.save_summary(&draft)?;

        Ok(SummaryOutcome {
            message: format!(
                "Merged {} new records into summary v{}",
                new_records.len(),
                summary.version
            ),
            new_record_count: new_records.len(),
            update_type: UpdateType::Incremental,
            summary,
        })
    }

    /// Latest stored summary, read back without any update check
    pub async fn current_summary(&self, language: &str) -> Result<Option<SummaryOutcome>, ComposeError> {
        let language = normalize_language(language);
        let summary = self.db.lock().await.latest_summary(&language)?;

        Ok(summary.map(|summary| SummaryOutcome {
            message: format!("Stored summary v{}", summary.version),
            new_record_count: 0,
            update_type: UpdateType::Existing,
            summary,
        }))
    }

    pub async fn history(&self, language: &str) -> Result<Vec<Summary>, ComposeError> {
        let language = normalize_language(language);
        Ok(self.db.lock().await.summary_history(&language)?)
    }

    pub async fn current_version(&self, language: &str) -> Result<u32, ComposeError> {
        let language = normalize_language(language);
        Ok(self.db.lock().await.current_version(&language)?)
    }

    // ========== SPECIALIZED SUMMARIES ==========

    /// Generate and store a summary restricted to records tagged with any of `terms`
    pub async fn create_specialized(
        &self,
        name: &str,
        terms: &[String],
        language: &str,
    ) -> Result<SpecializedSummary, ComposeError> {
        if terms.iter().all(|t| t.trim().is_empty()) {
            return Err(ComposeError::NoTerms);
        }
        let language = normalize_language(language);

        let records = self.db.lock().await.get_records_by_terms(terms)?;
        if records.is_empty() {
            return Err(ComposeError::NoRecords);
        }

        info!(
            "Generating specialized summary '{}' over {} records",
            name,
            records.len()
        );

        let content = self.generator.summarize(&records, &language).await;
        let trends = self.generator.extract_trends(&records).await;

        let draft = SpecializedSummaryDraft {
            name: name.to_string(),
            language,
            terms: terms.to_vec(),
            record_ids: records.iter().map(|r| r.external_id.clone()).collect(),
            content,
            trends,
        };
        Ok(self.db.lock().await.save_specialized_summary(&draft)?)
    }

    pub async fn list_specialized(&self) -> Result<Vec<SpecializedSummary>, ComposeError> {
        Ok(self.db.lock().await.list_specialized_summaries()?)
    }

    pub async fn get_specialized(
        &self,
        id: SpecializedSummaryId,
    ) -> Result<Option<SpecializedSummary>, ComposeError> {
        Ok(self.db.lock().await.get_specialized_summary(id)?)
    }

    pub async fn delete_specialized(&self, id: SpecializedSummaryId) -> Result<bool, ComposeError> {
        Ok(self.db.lock().await.delete_specialized_summary(id)?)
    }
}

fn normalize_language(language: &str) -> String {
    let language = language.trim().to_lowercase();
    if language.is_empty() {
        DEFAULT_LANGUAGE.to_string()
    } else {
        language
    }
}

fn latest_date(records: &[Record]) -> Result<chrono::NaiveDate, ComposeError> {
    records
        .iter()
        .map(|r| r.published_date)
        .max()
        .ok_or(ComposeError::NoRecords)
}
