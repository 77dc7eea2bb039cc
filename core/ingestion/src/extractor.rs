use async_trait::async_trait;
use litwatch_schemas::{RawRecord, TermCandidate};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::TermStrategy;
use crate::guarded::GuardedGenerator;
use crate::heuristic::{PatternTermExtractor, MAX_TERMS_PER_RECORD};

/// Pulls candidate index terms out of a record. Never fails: an extractor
/// that cannot produce terms returns an empty list.
#[async_trait]
pub trait TermExtractor: Send + Sync {
    async fn extract(&self, record: &RawRecord) -> Vec<TermCandidate>;
}

#[async_trait]
impl TermExtractor for PatternTermExtractor {
    async fn extract(&self, record: &RawRecord) -> Vec<TermCandidate> {
        PatternTermExtractor::extract(self, record)
    }
}

/// Asks the text generator for terms and falls back to the pattern
/// catalogue when it returns nothing usable
pub struct GenerativeTermExtractor {
    generator: Arc<GuardedGenerator>,
    fallback: PatternTermExtractor,
}

impl GenerativeTermExtractor {
    pub fn new(generator: Arc<GuardedGenerator>) -> Self {
        Self {
            generator,
            fallback: PatternTermExtractor::new(),
        }
    }
}

#[async_trait]
impl TermExtractor for GenerativeTermExtractor {
    async fn extract(&self, record: &RawRecord) -> Vec<TermCandidate> {
        let generated: Vec<TermCandidate> = self
            .generator
            .extract_terms(record)
            .await
            .into_iter()
            .take(MAX_TERMS_PER_RECORD)
            .map(TermCandidate::new)
            .collect();

        if generated.is_empty() {
            warn!(
                "No generated terms for {}, falling back to patterns",
                record.external_id
            );
            return self.fallback.extract(record);
        }

        debug!(
            "Generator produced {} terms for {}",
            generated.len(),
            record.external_id
        );
        generated
    }
}

/// Build the extractor selected by configuration
pub fn build_term_extractor(
    strategy: TermStrategy,
    generator: Arc<GuardedGenerator>,
) -> Arc<dyn TermExtractor> {
    match strategy {
        TermStrategy::Patterns => Arc::new(PatternTermExtractor::new()),
        TermStrategy::Generative => Arc::new(GenerativeTermExtractor::new(generator)),
    }
}
