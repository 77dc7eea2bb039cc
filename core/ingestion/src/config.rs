use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_QUERY: &str = "(acute myeloid leukemia[Title/Abstract] OR AML[Title/Abstract]) \
AND (TP53[Title/Abstract] OR p53[Title/Abstract])";

/// Configuration for the text-generation service
#[derive(Debug, Clone)]
pub struct LLMConfig {
    pub provider: LLMProvider,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LLMProvider {
    Ollama,
    OpenAI,
}

impl LLMProvider {
    pub fn name(&self) -> &'static str {
        match self {
            LLMProvider::Ollama => "Ollama",
            LLMProvider::OpenAI => "OpenAI",
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            provider: LLMProvider::Ollama,
            api_key: None,
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            timeout_secs: 60,
            max_retries: 2,
        }
    }
}

impl LLMConfig {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    /// Same as [`LLMConfig::from_env`] but reads through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let provider = lookup("LLM_PROVIDER")
            .unwrap_or_else(|| "ollama".to_string())
            .to_lowercase();

        let provider = match provider.as_str() {
            "openai" => LLMProvider::OpenAI,
            "ollama" => LLMProvider::Ollama,
            other => return Err(ConfigError::UnknownProvider(other.to_string())),
        };

        let base_url = match provider {
            LLMProvider::Ollama => {
                lookup("OLLAMA_URL").unwrap_or_else(|| "http://localhost:11434".to_string())
            }
            LLMProvider::OpenAI => {
                lookup("OPENAI_BASE_URL").unwrap_or_else(|| "https://api.openai.com".to_string())
            }
        };

        let model = match provider {
            LLMProvider::Ollama => {
                lookup("OLLAMA_MODEL").unwrap_or_else(|| "llama3.2:3b".to_string())
            }
            LLMProvider::OpenAI => {
                lookup("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string())
            }
        };

        let api_key = if provider == LLMProvider::OpenAI {
            let key = lookup("OPENAI_API_KEY").filter(|k| !k.trim().is_empty());
            Some(key.ok_or(ConfigError::MissingCredential("OPENAI_API_KEY", "OpenAI"))?)
        } else {
            None
        };

        Ok(Self {
            provider,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            timeout_secs: parse_number(&lookup, "LLM_TIMEOUT_SECS", 60)?,
            max_retries: parse_number(&lookup, "LLM_MAX_RETRIES", 2)?,
        })
    }
}

/// Configuration for the PubMed E-utilities client
#[derive(Debug, Clone)]
pub struct PubMedConfig {
    pub base_url: String,
    pub tool: String,
    pub email: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for PubMedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://eutils.ncbi.nlm.nih.gov/entrez/eutils".to_string(),
            tool: "litwatch".to_string(),
            email: None,
            api_key: None,
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

impl PubMedConfig {
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            base_url: lookup("PUBMED_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            tool: lookup("PUBMED_TOOL").unwrap_or(defaults.tool),
            email: lookup("PUBMED_EMAIL").filter(|e| !e.is_empty()),
            api_key: lookup("NCBI_API_KEY").filter(|k| !k.is_empty()),
            timeout_secs: parse_number(&lookup, "PUBMED_TIMEOUT_SECS", defaults.timeout_secs)?,
            max_retries: defaults.max_retries,
        })
    }

    /// Minimum spacing between requests. NCBI allows 3 requests/s without
    /// a key and 10 requests/s with one.
    pub fn request_interval(&self) -> Duration {
        if self.api_key.is_some() {
            Duration::from_millis(100)
        } else {
            Duration::from_millis(340)
        }
    }
}

/// How index terms are pulled out of new records
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TermStrategy {
    Patterns,
    Generative,
}

/// Everything the pipeline binary needs, resolved once at startup
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db_path: PathBuf,
    pub query: String,
    pub language: String,
    pub max_records: usize,
    pub update_interval: Duration,
    pub term_strategy: TermStrategy,
    pub pubmed: PubMedConfig,
    pub llm: LLMConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let term_strategy = match lookup("LITWATCH_TERM_EXTRACTION").as_deref() {
            Some("generative") | Some("llm") => TermStrategy::Generative,
            _ => TermStrategy::Patterns,
        };
        let interval_hours: u64 = parse_number(&lookup, "LITWATCH_UPDATE_INTERVAL_HOURS", 168)?;

        Ok(Self {
            db_path: lookup("LITWATCH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/research.db")),
            query: lookup("LITWATCH_QUERY")
                .filter(|q| !q.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_QUERY.to_string()),
            language: lookup("LITWATCH_LANGUAGE")
                .map(|l| l.to_lowercase())
                .unwrap_or_else(|| litwatch_schemas::DEFAULT_LANGUAGE.to_string()),
            max_records: parse_number(&lookup, "LITWATCH_MAX_RECORDS", 1000)?,
            update_interval: Duration::from_secs(interval_hours.max(1) * 3600),
            term_strategy,
            pubmed: PubMedConfig::from_lookup(&lookup)?,
            llm: LLMConfig::from_lookup(&lookup)?,
        })
    }
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_number<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        None => Ok(default),
    }
}
