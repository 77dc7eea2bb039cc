use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Publication date assigned to records whose source entry carries no usable date.
/// A fixed value keeps date ordering total.
pub fn unknown_publication_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 1).unwrap_or_default()
}

/// Language used when a caller does not name one.
pub const DEFAULT_LANGUAGE: &str = "en";

// ============================================================================
// ID Types
// ============================================================================

/// Surrogate row id of a stored record. Stable across re-ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TermId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpecializedSummaryId(pub i64);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CycleId(pub String);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TermId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SpecializedSummaryId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn generate_cycle_id() -> CycleId {
    CycleId(format!("cyc_{}", ulid::Ulid::new()))
}

// ============================================================================
// Record Schema
// ============================================================================

/// One bibliographic entry as delivered by a literature source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub external_id: String,
    pub title: String,
    pub abstract_text: String,
    pub published_date: NaiveDate,
    pub article_type: String,
    pub authors: Vec<String>,
    pub venue: String,
    pub reference_count: Option<u32>,
}

/// A stored record: the raw fields plus everything the pipeline attached to it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub external_id: String,
    pub title: String,
    pub abstract_text: String,
    pub published_date: NaiveDate,
    pub article_type: String,
    pub authors: Vec<String>,
    pub venue: String,
    pub reference_count: Option<u32>,
    pub analysis: Option<String>,
    pub terms: Vec<String>,
    pub created_at: String, // RFC3339
    pub updated_at: String, // RFC3339
}

// ============================================================================
// Term Schema
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Term {
    pub id: TermId,
    pub term: String,
    /// Number of distinct records currently associated with the term
    pub frequency: u32,
    pub category: Option<String>,
    pub last_seen: Option<NaiveDate>,
}

/// A term proposed by an extractor, before normalization and storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermCandidate {
    pub term: String,
    pub category: Option<String>,
    pub weight: Option<f32>,
}

impl TermCandidate {
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            category: None,
            weight: None,
        }
    }

    pub fn with_category(term: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            category: Some(category.into()),
            weight: None,
        }
    }
}

// ============================================================================
// Summary Schema
// ============================================================================

/// Categorized trend lists extracted over a record set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchTrends {
    #[serde(default)]
    pub key_trends: Vec<String>,
    #[serde(default)]
    pub therapeutic_targets: Vec<String>,
    #[serde(default)]
    pub prognostic_markers: Vec<String>,
    #[serde(default)]
    pub research_gaps: Vec<String>,
    #[serde(default)]
    pub methodology_trends: Vec<String>,
}

impl ResearchTrends {
    pub fn is_empty(&self) -> bool {
        self.key_trends.is_empty()
            && self.therapeutic_targets.is_empty()
            && self.prognostic_markers.is_empty()
            && self.research_gaps.is_empty()
            && self.methodology_trends.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateType {
    /// Generated from scratch over the full record scope
    #[serde(rename = "complete")]
    Complete,
    /// Existing content merged with records newer than its latest date
    #[serde(rename = "incremental")]
    Incremental,
    /// Nothing new since the last version; returned as-is
    #[serde(rename = "unchanged")]
    Unchanged,
    /// Read back without any update check
    #[serde(rename = "existing")]
    Existing,
}

impl UpdateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateType::Complete => "complete",
            UpdateType::Incremental => "incremental",
            UpdateType::Unchanged => "unchanged",
            UpdateType::Existing => "existing",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "complete" => Some(UpdateType::Complete),
            "incremental" => Some(UpdateType::Incremental),
            "unchanged" => Some(UpdateType::Unchanged),
            "existing" => Some(UpdateType::Existing),
            _ => None,
        }
    }
}

/// One version of a per-language summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub language: String,
    pub version: u32,
    pub content: String,
    pub record_count: usize,
    pub latest_record_date: NaiveDate,
    pub trends: ResearchTrends,
    pub update_type: UpdateType,
    pub created_at: String, // RFC3339
}

/// Content ready to be persisted as the next version of a language's summary
#[derive(Debug, Clone)]
pub struct SummaryDraft {
    pub language: String,
    pub content: String,
    pub record_count: usize,
    pub latest_record_date: NaiveDate,
    pub trends: ResearchTrends,
    pub update_type: UpdateType,
}

/// Result of a summary request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryOutcome {
    pub summary: Summary,
    pub update_type: UpdateType,
    pub new_record_count: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRequest {
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub force_regenerate: bool,
    #[serde(default)]
    pub terms: Vec<String>,
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

impl SummaryRequest {
    pub fn for_language(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            force_regenerate: false,
            terms: Vec::new(),
        }
    }
}

// ============================================================================
// Specialized Summary Schema
// ============================================================================

/// Term-scoped summary kept outside the per-language version lineage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecializedSummary {
    pub id: SpecializedSummaryId,
    pub name: String,
    /// Per-name counter, 1 for the first summary stored under a name
    pub revision: u32,
    pub language: String,
    pub terms: Vec<String>,
    pub record_ids: Vec<String>,
    pub content: String,
    pub record_count: usize,
    pub trends: ResearchTrends,
    pub created_at: String, // RFC3339
}

#[derive(Debug, Clone)]
pub struct SpecializedSummaryDraft {
    pub name: String,
    pub language: String,
    pub terms: Vec<String>,
    pub record_ids: Vec<String>,
    pub content: String,
    pub trends: ResearchTrends,
}

// ============================================================================
// Store Statistics
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YearCount {
    pub year: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_records: usize,
    pub records_by_year: Vec<YearCount>,
    pub latest_record_date: Option<NaiveDate>,
    pub last_update: NaiveDate,
    pub total_terms: usize,
}
