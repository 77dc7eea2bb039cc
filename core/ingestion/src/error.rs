use thiserror::Error;

/// Failures of the SQLite-backed store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode or decode stored JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid stored date '{0}'")]
    InvalidDate(String),

    #[error("{0} not found")]
    NotFound(String),
}

/// Failures talking to the literature search service
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("search service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed XML response: {0}")]
    Xml(String),

    #[error("search response carried no continuation token")]
    MissingToken,
}

impl From<quick_xml::Error> for FetchError {
    fn from(err: quick_xml::Error) -> Self {
        FetchError::Xml(err.to_string())
    }
}

/// Failures talking to the text-generation service
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{provider} API error {status}: {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("empty response from {0}")]
    EmptyResponse(&'static str),

    #[error("generation call timed out after {0}s")]
    Timeout(u64),

    #[error("failed to parse generated output: {0}")]
    Parse(String),
}

impl GenerationError {
    /// Whether a retry could plausibly succeed
    pub fn is_transient(&self) -> bool {
        match self {
            GenerationError::Http(_) | GenerationError::Timeout(_) => true,
            GenerationError::Status { status, .. } => *status == 429 || *status >= 500,
            GenerationError::EmptyResponse(_) | GenerationError::Parse(_) => false,
        }
    }
}

/// Invalid or missing configuration, reported at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required for the {1} provider")]
    MissingCredential(&'static str, &'static str),

    #[error("{name} must be a number, got '{value}'")]
    InvalidNumber { name: &'static str, value: String },

    #[error("unknown LLM provider '{0}' (expected 'openai' or 'ollama')")]
    UnknownProvider(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
