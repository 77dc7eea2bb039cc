pub mod config;
pub mod database;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod guarded;
pub mod heuristic;
pub mod llm_providers;
pub mod migration;
pub mod pubmed;
pub mod summary_store;
pub mod term_index;

pub use config::{LLMConfig, LLMProvider, PipelineConfig, PubMedConfig, TermStrategy};
pub use database::Database;
pub use error::{ConfigError, FetchError, GenerationError, StoreError, StoreResult};
pub use extractor::{build_term_extractor, GenerativeTermExtractor, TermExtractor};
pub use fetcher::{
    ContinuationToken, FetchBatch, LiteratureSource, RateGate, SearchHandle, SourceFetcher,
};
pub use guarded::{Analysis, GuardedGenerator, ANALYSIS_FAILED, SUMMARY_FAILED};
pub use heuristic::PatternTermExtractor;
pub use llm_providers::{LLMGenerator, TextGenerator};
pub use migration::{apply_migrations, MIGRATIONS};
pub use pubmed::PubMedClient;
pub use term_index::normalize_term;
