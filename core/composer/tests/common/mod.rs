#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as Days, NaiveDate, Utc};
use litwatch_composer::{SummaryComposer, UpdateOrchestrator};
use litwatch_ingestion::{
    ContinuationToken, Database, FetchError, GenerationError, GuardedGenerator, LiteratureSource,
    PatternTermExtractor, SearchHandle, SourceFetcher, TextGenerator,
};
use litwatch_schemas::{RawRecord, Record, ResearchTrends};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub fn days_from_today(days: i64) -> NaiveDate {
    today() + Days::days(days)
}

pub fn date(raw: &str) -> NaiveDate {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
}

pub fn raw(external_id: &str, title: &str, published: NaiveDate) -> RawRecord {
    RawRecord {
        external_id: external_id.to_string(),
        title: title.to_string(),
        abstract_text: format!("{}. Results are reported.", title),
        published_date: published,
        article_type: "Journal Article".to_string(),
        authors: vec!["Smith John".to_string()],
        venue: "Blood".to_string(),
        reference_count: Some(10),
    }
}

/// Search service over an in-memory record list. Filters by publication
/// date the way the real service does.
#[derive(Default)]
pub struct FakeSource {
    pub records: StdMutex<Vec<RawRecord>>,
    pub fail_pages: AtomicBool,
    pub searches: StdMutex<Vec<Option<NaiveDate>>>,
}

impl FakeSource {
    pub fn with(records: Vec<RawRecord>) -> Arc<Self> {
        let source = Self::default();
        *source.records.lock().unwrap() = records;
        Arc::new(source)
    }

    pub fn push(&self, record: RawRecord) {
        self.records.lock().unwrap().push(record);
    }

    fn matching(&self, after: Option<NaiveDate>) -> Vec<RawRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| after.map_or(true, |a| r.published_date >= a))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LiteratureSource for FakeSource {
    async fn search(
        &self,
        _query: &str,
        after: Option<NaiveDate>,
    ) -> Result<SearchHandle, FetchError> {
        self.searches.lock().unwrap().push(after);
        Ok(SearchHandle {
            total_count: self.matching(after).len(),
            token: Some(ContinuationToken(
                after.map(|d| d.to_string()).unwrap_or_default(),
            )),
        })
    }

    async fn fetch_page(
        &self,
        token: &ContinuationToken,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RawRecord>, FetchError> {
        if self.fail_pages.load(Ordering::SeqCst) {
            return Err(FetchError::Status {
                status: 500,
                body: "unavailable".to_string(),
            });
        }
        let after = NaiveDate::parse_from_str(&token.0, "%Y-%m-%d").ok();
        Ok(self
            .matching(after)
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }
}

/// Deterministic generator with switches for failure and hanging
#[derive(Default)]
pub struct FakeGenerator {
    pub fail: AtomicBool,
    pub hang: AtomicBool,
    pub summarize_calls: AtomicUsize,
    pub merge_calls: AtomicUsize,
}

impl FakeGenerator {
    async fn gate(&self) -> Result<(), GenerationError> {
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(GenerationError::Status {
                provider: "fake",
                status: 400,
                body: "rejected".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TextGenerator for FakeGenerator {
    async fn analyze(&self, record: &RawRecord) -> Result<String, GenerationError> {
        self.gate().await?;
        Ok(format!("Analysis of {}", record.title))
    }

    async fn extract_terms(&self, _record: &RawRecord) -> Result<Vec<String>, GenerationError> {
        self.gate().await?;
        Ok(Vec::new())
    }

    async fn summarize(&self, records: &[Record], language: &str) -> Result<String, GenerationError> {
        self.summarize_calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        Ok(format!("[{}] summary of {} records", language, records.len()))
    }

    async fn merge_summary(
        &self,
        existing: &str,
        new_records: &[Record],
        _language: &str,
    ) -> Result<String, GenerationError> {
        self.merge_calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        Ok(format!("{} + {} new", existing, new_records.len()))
    }

    async fn extract_trends(&self, records: &[Record]) -> Result<ResearchTrends, GenerationError> {
        self.gate().await?;
        Ok(ResearchTrends {
            key_trends: vec![format!("{} records", records.len())],
            ..Default::default()
        })
    }
}

pub struct Harness {
    _file: NamedTempFile,
    pub db: Arc<Mutex<Database>>,
    pub source: Arc<FakeSource>,
    pub generator: Arc<FakeGenerator>,
    pub composer: Arc<SummaryComposer>,
    pub orchestrator: UpdateOrchestrator,
}

impl Harness {
    /// Run raw SQL against the database file through a second connection,
    /// for putting the store into states the public API never produces
    pub fn run_sql(&self, sql: &str) {
        let conn = rusqlite::Connection::open(self._file.path()).unwrap();
        conn.execute_batch(sql).unwrap();
    }
}

pub fn harness(records: Vec<RawRecord>) -> Harness {
    let file = NamedTempFile::new().unwrap();
    let db = Arc::new(Mutex::new(Database::new(file.path()).unwrap()));

    let source = FakeSource::with(records);
    let generator = Arc::new(FakeGenerator::default());
    let guarded = Arc::new(GuardedGenerator::new(
        generator.clone(),
        Duration::from_secs(5),
        0,
    ));

    let composer = Arc::new(SummaryComposer::new(db.clone(), guarded.clone()));
    let orchestrator = UpdateOrchestrator::new(
        db.clone(),
        SourceFetcher::new(source.clone()).with_limits(2, 1000),
        guarded,
        Arc::new(PatternTermExtractor::new()),
        composer.clone(),
        "TP53 AND AML",
        "en",
    );

    Harness {
        _file: file,
        db,
        source,
        generator,
        composer,
        orchestrator,
    }
}

/// Three records from early 2025, well before any cursor set today
pub fn seed_records() -> Vec<RawRecord> {
    vec![
        raw("R1", "TP53 mutations and venetoclax response", date("2025-01-10")),
        raw("R2", "FLT3 inhibition with gilteritinib", date("2025-02-10")),
        raw("R3", "MDM2 antagonists restore p53 apoptosis", date("2025-03-10")),
    ]
}
