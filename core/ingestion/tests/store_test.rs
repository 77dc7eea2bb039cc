use chrono::NaiveDate;
use litwatch_ingestion::{Database, PatternTermExtractor};
use litwatch_schemas::{RawRecord, ResearchTrends, SummaryDraft, UpdateType};
use tempfile::NamedTempFile;

fn date(raw: &str) -> NaiveDate {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
}

fn article(external_id: &str, title: &str, abstract_text: &str, published: &str) -> RawRecord {
    RawRecord {
        external_id: external_id.to_string(),
        title: title.to_string(),
        abstract_text: abstract_text.to_string(),
        published_date: date(published),
        article_type: "Journal Article".to_string(),
        authors: vec!["Wei Andrew".to_string()],
        venue: "Leukemia".to_string(),
        reference_count: None,
    }
}

fn corpus() -> Vec<RawRecord> {
    vec![
        article(
            "39000001",
            "Venetoclax and azacitidine in TP53-mutated AML",
            "TP53 mutations limited overall survival after venetoclax.",
            "2024-11-02",
        ),
        article(
            "39000002",
            "Gilteritinib for relapsed FLT3 AML",
            "FLT3 inhibition with gilteritinib improved complete remission rates.",
            "2025-01-20",
        ),
        article(
            "39000003",
            "MDM2 inhibition restores p53 signaling",
            "MDM2 antagonists induce apoptosis in TP53 wild-type blasts.",
            "2025-02-14",
        ),
    ]
}

#[test]
fn test_ingest_index_and_summarize_persist_across_reopen() {
    let temp = NamedTempFile::new().unwrap();
    let extractor = PatternTermExtractor::new();

    {
        let db = Database::new(temp.path()).unwrap();
        for record in corpus() {
            let terms = extractor.extract(&record);
            db.ingest_record(&record, Some("analysis"), &terms).unwrap();
        }

        // Second pass over the same batch changes nothing
        for record in corpus() {
            let terms = extractor.extract(&record);
            db.ingest_record(&record, Some("analysis"), &terms).unwrap();
        }

        let records = db.get_all_records(None).unwrap();
        db.save_summary(&SummaryDraft {
            language: "en".to_string(),
            content: "Three AML papers".to_string(),
            record_count: records.len(),
            latest_record_date: records[0].published_date,
            trends: ResearchTrends::default(),
            update_type: UpdateType::Complete,
        })
        .unwrap();
        db.set_cursor(date("2025-03-01")).unwrap();
    }

    let db = Database::new(temp.path()).unwrap();
    assert_eq!(db.count_records().unwrap(), 3);
    assert_eq!(db.get_cursor().unwrap(), date("2025-03-01"));

    let tp53 = db.get_term("tp53").unwrap().unwrap();
    assert_eq!(tp53.frequency, 2);
    assert_eq!(tp53.category.as_deref(), Some("gene"));

    let flt3 = db.get_records_by_terms(&["FLT3".to_string()]).unwrap();
    assert_eq!(flt3.len(), 1);
    assert_eq!(flt3[0].external_id, "39000002");

    let newer = db.get_records_after(date("2025-01-20")).unwrap();
    assert_eq!(newer.len(), 1);
    assert_eq!(newer[0].external_id, "39000003");

    let summary = db.latest_summary("en").unwrap().unwrap();
    assert_eq!(summary.version, 1);
    assert_eq!(summary.latest_record_date, date("2025-02-14"));

    let stats = db.get_stats().unwrap();
    assert_eq!(stats.total_records, 3);
    assert_eq!(stats.latest_record_date, Some(date("2025-02-14")));
    assert_eq!(stats.records_by_year.len(), 2);
    assert_eq!(stats.records_by_year[0].year, "2025");
    assert_eq!(stats.records_by_year[0].count, 2);
}

#[test]
fn test_recount_is_a_noop_on_consistent_index() {
    let db = Database::open_in_memory().unwrap();
    let extractor = PatternTermExtractor::new();
    for record in corpus() {
        let terms = extractor.extract(&record);
        db.ingest_record(&record, None, &terms).unwrap();
    }

    assert_eq!(db.recount_term_frequencies().unwrap(), 0);
    assert!(db.all_terms().unwrap().iter().all(|t| t.frequency >= 1));
}
