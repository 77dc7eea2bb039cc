mod common;

use common::*;
use litwatch_composer::CycleMode;
use litwatch_ingestion::ANALYSIS_FAILED;
use litwatch_schemas::UpdateType;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn test_first_cycle_stores_indexes_and_summarizes() {
    let h = harness(seed_records());

    let report = h.orchestrator.run_cycle(CycleMode::Initial).await.unwrap();
    assert_eq!(report.fetched, 3);
    assert_eq!(report.added, 3);
    assert_eq!(report.already_stored, 0);
    assert_eq!(report.summary_version, Some(1));
    assert!(report.cursor_advanced);
    assert!(report.cycle_id.0.starts_with("cyc_"));

    let db = h.db.lock().await;
    assert_eq!(db.count_records().unwrap(), 3);
    assert_eq!(db.get_cursor().unwrap(), today());

    let stored = db.get_record("R1").unwrap().unwrap();
    assert_eq!(
        stored.analysis.as_deref(),
        Some("Analysis of TP53 mutations and venetoclax response")
    );
    assert!(stored.terms.contains(&"TP53".to_string()));
    assert!(stored.terms.contains(&"VENETOCLAX".to_string()));

    let summary = db.latest_summary("en").unwrap().unwrap();
    assert_eq!(summary.update_type, UpdateType::Complete);
    assert_eq!(summary.record_count, 3);
    assert_eq!(summary.latest_record_date, date("2025-03-10"));
    assert_eq!(summary.content, "[en] summary of 3 records");
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let h = harness(seed_records());
    h.orchestrator.run_cycle(CycleMode::Initial).await.unwrap();

    let report = h.orchestrator.run_cycle(CycleMode::Initial).await.unwrap();
    assert_eq!(report.fetched, 3);
    assert_eq!(report.added, 0);
    assert_eq!(report.already_stored, 3);
    assert_eq!(report.summary_version, None);

    let db = h.db.lock().await;
    assert_eq!(db.count_records().unwrap(), 3);
    assert_eq!(db.current_version("en").unwrap(), 1);
    assert_eq!(db.get_term("TP53").unwrap().unwrap().frequency, 1);
}

#[tokio::test]
async fn test_incremental_cycle_uses_cursor() {
    let h = harness(seed_records());
    h.orchestrator.run_cycle(CycleMode::Initial).await.unwrap();

    let report = h.orchestrator.run_cycle(CycleMode::Incremental).await.unwrap();
    assert_eq!(report.fetched, 0);
    assert!(report.cursor_advanced);
    assert_eq!(
        h.source.searches.lock().unwrap().last().copied(),
        Some(Some(today()))
    );

    h.source.push(raw("R4", "Menin inhibitors in NPM1 AML", days_from_today(1)));
    let report = h.orchestrator.run_cycle(CycleMode::Incremental).await.unwrap();
    assert_eq!(report.fetched, 1);
    assert_eq!(report.added, 1);
    assert_eq!(report.summary_version, Some(2));

    let summary = h.db.lock().await.latest_summary("en").unwrap().unwrap();
    assert_eq!(summary.update_type, UpdateType::Incremental);
    assert_eq!(summary.content, "[en] summary of 3 records + 1 new");
    assert_eq!(summary.record_count, 4);
    assert_eq!(summary.latest_record_date, days_from_today(1));
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_record_blocks_cursor_and_is_retried() {
    let h = harness(seed_records());
    let before = h.db.lock().await.get_cursor().unwrap();

    h.generator.hang.store(true, Ordering::SeqCst);
    let report = h.orchestrator.run_cycle(CycleMode::Initial).await.unwrap();
    assert_eq!(report.skipped, 3);
    assert_eq!(report.added, 0);
    assert!(!report.cursor_advanced);
    assert_eq!(h.db.lock().await.get_cursor().unwrap(), before);
    assert_eq!(h.db.lock().await.count_records().unwrap(), 0);

    h.generator.hang.store(false, Ordering::SeqCst);
    let report = h.orchestrator.run_cycle(CycleMode::Initial).await.unwrap();
    assert_eq!(report.added, 3);
    assert!(report.cursor_advanced);
}

#[tokio::test]
async fn test_generation_failures_degrade_to_placeholders() {
    let h = harness(seed_records());
    h.generator.fail.store(true, Ordering::SeqCst);

    let report = h.orchestrator.run_cycle(CycleMode::Initial).await.unwrap();
    assert_eq!(report.added, 3);
    assert_eq!(report.summary_version, Some(1));
    assert!(report.cursor_advanced);

    let db = h.db.lock().await;
    let stored = db.get_record("R2").unwrap().unwrap();
    assert_eq!(stored.analysis.as_deref(), Some(ANALYSIS_FAILED));
    assert!(stored.terms.contains(&"FLT3".to_string()));

    let summary = db.latest_summary("en").unwrap().unwrap();
    assert_eq!(summary.content, litwatch_ingestion::SUMMARY_FAILED);
    assert!(summary.trends.is_empty());
}

#[tokio::test]
async fn test_fetch_failure_keeps_cursor() {
    let h = harness(seed_records());
    let before = h.db.lock().await.get_cursor().unwrap();
    h.source.fail_pages.store(true, Ordering::SeqCst);

    let report = h.orchestrator.run_cycle(CycleMode::Incremental).await.unwrap();
    assert!(!report.fetch_complete);
    assert!(!report.cursor_advanced);
    assert_eq!(h.db.lock().await.get_cursor().unwrap(), before);
}

#[tokio::test]
async fn test_store_write_failure_keeps_cursor() {
    let h = harness(seed_records());
    let before = h.db.lock().await.get_cursor().unwrap();
    h.run_sql(
        "CREATE TRIGGER reject_r2 BEFORE INSERT ON records
         WHEN NEW.external_id = 'R2'
         BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
    );

    let report = h.orchestrator.run_cycle(CycleMode::Initial).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.added, 2);
    assert_eq!(report.summary_version, Some(1));
    assert!(!report.cursor_advanced);
    assert_eq!(h.db.lock().await.get_cursor().unwrap(), before);
    assert!(!h.db.lock().await.record_exists("R2").unwrap());

    h.run_sql("DROP TRIGGER reject_r2;");
    let report = h.orchestrator.run_cycle(CycleMode::Initial).await.unwrap();
    assert_eq!(report.failed, 0);
    assert_eq!(report.added, 1);
    assert!(report.cursor_advanced);
}

#[tokio::test]
async fn test_lookup_failure_is_counted_not_fatal() {
    let h = harness(seed_records());
    let before = h.db.lock().await.get_cursor().unwrap();
    h.run_sql("ALTER TABLE records RENAME TO records_offline;");

    let report = h.orchestrator.run_cycle(CycleMode::Initial).await.unwrap();
    assert_eq!(report.fetched, 3);
    assert_eq!(report.failed, 3);
    assert_eq!(report.added, 0);
    assert!(!report.cursor_advanced);
    assert_eq!(h.db.lock().await.get_cursor().unwrap(), before);
}

#[tokio::test]
async fn test_summary_failure_keeps_cursor() {
    let h = harness(seed_records());
    let before = h.db.lock().await.get_cursor().unwrap();
    h.run_sql(
        "CREATE TRIGGER reject_summaries BEFORE INSERT ON summaries
         BEGIN SELECT RAISE(ABORT, 'summaries offline'); END;",
    );

    let report = h.orchestrator.run_cycle(CycleMode::Initial).await.unwrap();
    assert_eq!(report.added, 3);
    assert_eq!(report.summary_version, None);
    assert!(report.summary_error.is_some());
    assert!(!report.cursor_advanced);

    let db = h.db.lock().await;
    assert_eq!(db.get_cursor().unwrap(), before);
    assert_eq!(db.count_records().unwrap(), 3);
    assert_eq!(db.current_version("en").unwrap(), 0);
}

#[tokio::test]
async fn test_count_pending() {
    let h = harness(seed_records());
    assert_eq!(h.orchestrator.count_pending(CycleMode::Initial).await.unwrap(), 3);

    h.orchestrator.run_cycle(CycleMode::Initial).await.unwrap();
    assert_eq!(h.orchestrator.count_pending(CycleMode::Incremental).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_runs_until_shutdown() {
    let h = harness(seed_records());

    h.orchestrator
        .run_periodic(
            Duration::from_secs(3600),
            tokio::time::sleep(Duration::from_secs(5400)),
        )
        .await;

    assert_eq!(h.source.searches.lock().unwrap().len(), 2);
    assert_eq!(h.db.lock().await.count_records().unwrap(), 3);
}
