use litwatch_schemas::{RawRecord, Record, ResearchTrends};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::LLMConfig;
use crate::error::GenerationError;
use crate::llm_providers::TextGenerator;

/// Stored in place of an analysis the generator failed to produce
pub const ANALYSIS_FAILED: &str = "Analysis failed";

/// Stored in place of a summary the generator failed to produce
pub const SUMMARY_FAILED: &str = "Summary generation failed";

const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Result of analyzing one record
#[derive(Debug, Clone, PartialEq)]
pub enum Analysis {
    Text(String),
    /// The generator answered with an error; the record is stored with
    /// the [`ANALYSIS_FAILED`] placeholder.
    Failed,
    /// Every attempt ran out of time; the record should be left for a later cycle.
    TimedOut,
}

impl Analysis {
    /// Value to persist with the record, `None` when it should not be stored
    pub fn stored_text(&self) -> Option<&str> {
        match self {
            Analysis::Text(text) => Some(text),
            Analysis::Failed => Some(ANALYSIS_FAILED),
            Analysis::TimedOut => None,
        }
    }
}

/// Wraps a [`TextGenerator`] with a per-call timeout, bounded retries with
/// exponential backoff for transient errors, and placeholder fallbacks so
/// callers never abort on a generation failure.
#[derive(Clone)]
pub struct GuardedGenerator {
    inner: Arc<dyn TextGenerator>,
    timeout: Duration,
    max_retries: u32,
}

impl GuardedGenerator {
    pub fn new(inner: Arc<dyn TextGenerator>, timeout: Duration, max_retries: u32) -> Self {
        Self {
            inner,
            timeout,
            max_retries,
        }
    }

    pub fn from_config(inner: Arc<dyn TextGenerator>, config: &LLMConfig) -> Self {
        Self::new(inner, Duration::from_secs(config.timeout_secs), config.max_retries)
    }

    async fn call<T, F, Fut>(&self, operation: &str, f: F) -> Result<T, GenerationError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
    {
        let mut attempt = 0;
        loop {
            let err = match timeout(self.timeout, f()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => GenerationError::Timeout(self.timeout.as_secs()),
            };

            if !err.is_transient() || attempt >= self.max_retries {
                return Err(err);
            }

            let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
            warn!(
                "{} attempt {} failed ({}), retrying in {:?}",
                operation,
                attempt + 1,
                err,
                delay
            );
            sleep(delay).await;
            attempt += 1;
        }
    }

    pub async fn analyze(&self, record: &RawRecord) -> Analysis {
        let inner = &self.inner;
        match self.call("analyze", move || inner.analyze(record)).await {
            Ok(text) => Analysis::Text(text),
            Err(GenerationError::Timeout(secs)) => {
                warn!("Analysis of {} timed out after {}s", record.external_id, secs);
                Analysis::TimedOut
            }
            Err(e) => {
                warn!("Analysis of {} failed: {}", record.external_id, e);
                Analysis::Failed
            }
        }
    }

    /// Generated terms, empty when generation fails
    pub async fn extract_terms(&self, record: &RawRecord) -> Vec<String> {
        let inner = &self.inner;
        match self.call("extract_terms", move || inner.extract_terms(record)).await {
            Ok(terms) => terms,
            Err(e) => {
                warn!("Term generation for {} failed: {}", record.external_id, e);
                Vec::new()
            }
        }
    }

    pub async fn summarize(&self, records: &[Record], language: &str) -> String {
        let inner = &self.inner;
        match self
            .call("summarize", move || inner.summarize(records, language))
            .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!("Summary generation ({}) failed: {}", language, e);
                SUMMARY_FAILED.to_string()
            }
        }
    }

    pub async fn merge_summary(&self, existing: &str, new_records: &[Record], language: &str) -> String {
        let inner = &self.inner;
        match self
            .call("merge_summary", move || {
                inner.merge_summary(existing, new_records, language)
            })
            .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!("Summary merge ({}) failed: {}", language, e);
                SUMMARY_FAILED.to_string()
            }
        }
    }

    /// Trends over `records`, the empty default when extraction fails
    pub async fn extract_trends(&self, records: &[Record]) -> ResearchTrends {
        let inner = &self.inner;
        match self
            .call("extract_trends", move || inner.extract_trends(records))
            .await
        {
            Ok(trends) => {
                debug!("Extracted {} key trends", trends.key_trends.len());
                trends
            }
            Err(e) => {
                warn!("Trend extraction failed: {}", e);
                ResearchTrends::default()
            }
        }
    }
}
