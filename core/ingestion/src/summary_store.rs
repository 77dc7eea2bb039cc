use chrono::Utc;
use litwatch_schemas::{
    ResearchTrends, SpecializedSummary, SpecializedSummaryDraft, SpecializedSummaryId, Summary,
    SummaryDraft, UpdateType,
};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use tracing::info;

use crate::database::{date_column, format_date, json_error, parse_date, Database};
use crate::error::StoreResult;

const SUMMARY_COLUMNS: &str =
    "language, version, content, record_count, latest_record_date, trends, update_type, created_at";

const SPECIALIZED_COLUMNS: &str =
    "id, name, revision, language, terms, record_ids, content, record_count, trends, created_at";

impl Database {
    // ========== SUMMARY VERSIONS ==========

    /// Persist `draft` as the next version for its language.
    ///
    /// Version allocation and the insert share one transaction. The stored
    /// `latest_record_date` never moves backwards relative to the previous
    /// version of the same language.
    pub fn save_summary(&self, draft: &SummaryDraft) -> StoreResult<Summary> {
        let tx = self.conn.unchecked_transaction()?;

        let previous: Option<(u32, String)> = tx
            .query_row(
                "SELECT version, latest_record_date FROM summaries
                 WHERE language = ?1
                 ORDER BY version DESC LIMIT 1",
                params![draft.language],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (version, latest_record_date) = match previous {
            Some((version, previous_latest)) => {
                let previous_latest = parse_date(&previous_latest)?;
                (version + 1, draft.latest_record_date.max(previous_latest))
            }
            None => (1, draft.latest_record_date),
        };

        let summary = Summary {
            language: draft.language.clone(),
            version,
            content: draft.content.clone(),
            record_count: draft.record_count,
            latest_record_date,
            trends: draft.trends.clone(),
            update_type: draft.update_type,
            created_at: Utc::now().to_rfc3339(),
        };

        tx.execute(
            &format!("INSERT INTO summaries ({SUMMARY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                summary.language,
                summary.version,
                summary.content,
                summary.record_count as i64,
                format_date(summary.latest_record_date),
                serde_json::to_string(&summary.trends)?,
                summary.update_type.as_str(),
                summary.created_at,
            ],
        )?;
        tx.commit()?;

        info!(
            "Saved {} summary v{} ({}, {} records)",
            summary.language,
            summary.version,
            summary.update_type.as_str(),
            summary.record_count
        );
        Ok(summary)
    }

    pub fn latest_summary(&self, language: &str) -> StoreResult<Option<Summary>> {
        let summary = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SUMMARY_COLUMNS} FROM summaries
                     WHERE language = ?1
                     ORDER BY version DESC LIMIT 1"
                ),
                params![language],
                row_to_summary,
            )
            .optional()?;
        Ok(summary)
    }

    /// Every version for `language`, newest first
    pub fn summary_history(&self, language: &str) -> StoreResult<Vec<Summary>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM summaries
             WHERE language = ?1
             ORDER BY version DESC"
        ))?;
        let summaries = stmt
            .query_map(params![language], row_to_summary)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(summaries)
    }

    /// Highest version stored for `language`, 0 when none exists
    pub fn current_version(&self, language: &str) -> StoreResult<u32> {
        let version: Option<u32> = self.conn.query_row(
            "SELECT MAX(version) FROM summaries WHERE language = ?1",
            params![language],
            |row| row.get(0),
        )?;
        Ok(version.unwrap_or(0))
    }

    // ========== SPECIALIZED SUMMARIES ==========

    /// Store a term-scoped summary. Saving under an existing name adds a new
    /// revision instead of replacing the old one.
    pub fn save_specialized_summary(
        &self,
        draft: &SpecializedSummaryDraft,
    ) -> StoreResult<SpecializedSummary> {
        let tx = self.conn.unchecked_transaction()?;

        let revision: u32 = tx.query_row(
            "SELECT COALESCE(MAX(revision), 0) + 1 FROM specialized_summaries WHERE name = ?1",
            params![draft.name],
            |row| row.get(0),
        )?;
        let created_at = Utc::now().to_rfc3339();

        tx.execute(
            "INSERT INTO specialized_summaries
                (name, revision, language, terms, record_ids, content, record_count, trends, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                draft.name,
                revision,
                draft.language,
                serde_json::to_string(&draft.terms)?,
                serde_json::to_string(&draft.record_ids)?,
                draft.content,
                draft.record_ids.len() as i64,
                serde_json::to_string(&draft.trends)?,
                created_at,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        info!(
            "Saved specialized summary '{}' revision {} ({} records)",
            draft.name,
            revision,
            draft.record_ids.len()
        );

        Ok(SpecializedSummary {
            id: SpecializedSummaryId(id),
            name: draft.name.clone(),
            revision,
            language: draft.language.clone(),
            terms: draft.terms.clone(),
            record_ids: draft.record_ids.clone(),
            content: draft.content.clone(),
            record_count: draft.record_ids.len(),
            trends: draft.trends.clone(),
            created_at,
        })
    }

    /// All specialized summaries, newest first
    pub fn list_specialized_summaries(&self) -> StoreResult<Vec<SpecializedSummary>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SPECIALIZED_COLUMNS} FROM specialized_summaries ORDER BY id DESC"
        ))?;
        let summaries = stmt
            .query_map([], row_to_specialized)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(summaries)
    }

    pub fn get_specialized_summary(
        &self,
        id: SpecializedSummaryId,
    ) -> StoreResult<Option<SpecializedSummary>> {
        let summary = self
            .conn
            .query_row(
                &format!("SELECT {SPECIALIZED_COLUMNS} FROM specialized_summaries WHERE id = ?1"),
                params![id.0],
                row_to_specialized,
            )
            .optional()?;
        Ok(summary)
    }

    /// Returns whether a row was removed
    pub fn delete_specialized_summary(&self, id: SpecializedSummaryId) -> StoreResult<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM specialized_summaries WHERE id = ?1",
            params![id.0],
        )?;
        Ok(deleted > 0)
    }
}

fn trends_column(row: &Row, idx: usize) -> rusqlite::Result<ResearchTrends> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(json_error)
}

fn row_to_summary(row: &Row) -> rusqlite::Result<Summary> {
    let update_type: String = row.get(6)?;
    let update_type = UpdateType::parse(&update_type).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            Type::Text,
            format!("unknown update type '{}'", update_type).into(),
        )
    })?;

    Ok(Summary {
        language: row.get(0)?,
        version: row.get(1)?,
        content: row.get(2)?,
        record_count: row.get::<_, i64>(3)? as usize,
        latest_record_date: date_column(row, 4)?,
        trends: trends_column(row, 5)?,
        update_type,
        created_at: row.get(7)?,
    })
}

fn row_to_specialized(row: &Row) -> rusqlite::Result<SpecializedSummary> {
    let terms: String = row.get(4)?;
    let record_ids: String = row.get(5)?;

    Ok(SpecializedSummary {
        id: SpecializedSummaryId(row.get(0)?),
        name: row.get(1)?,
        revision: row.get(2)?,
        language: row.get(3)?,
        terms: serde_json::from_str(&terms).map_err(json_error)?,
        record_ids: serde_json::from_str(&record_ids).map_err(json_error)?,
        content: row.get(6)?,
        record_count: row.get::<_, i64>(7)? as usize,
        trends: trends_column(row, 8)?,
        created_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::date;
    use tempfile::NamedTempFile;

    fn draft(language: &str, content: &str, latest: &str, update_type: UpdateType) -> SummaryDraft {
        SummaryDraft {
            language: language.to_string(),
            content: content.to_string(),
            record_count: 3,
            latest_record_date: date(latest),
            trends: ResearchTrends {
                key_trends: vec!["menin inhibitors".to_string()],
                ..Default::default()
            },
            update_type,
        }
    }

    #[test]
    fn test_versions_increase_per_language() {
        let db = Database::open_in_memory().unwrap();

        let v1 = db
            .save_summary(&draft("en", "S1", "2025-01-10", UpdateType::Complete))
            .unwrap();
        let v2 = db
            .save_summary(&draft("en", "S2", "2025-02-10", UpdateType::Incremental))
            .unwrap();
        let fr = db
            .save_summary(&draft("fr", "S1-fr", "2025-02-10", UpdateType::Complete))
            .unwrap();

        assert_eq!((v1.version, v2.version, fr.version), (1, 2, 1));
        assert_eq!(db.current_version("en").unwrap(), 2);
        assert_eq!(db.current_version("ru").unwrap(), 0);

        let latest = db.latest_summary("en").unwrap().unwrap();
        assert_eq!(latest.content, "S2");
        assert_eq!(latest.update_type, UpdateType::Incremental);
        assert_eq!(latest.trends.key_trends, vec!["menin inhibitors".to_string()]);
    }

    #[test]
    fn test_history_is_newest_first() {
        let db = Database::open_in_memory().unwrap();
        for content in ["a", "b", "c"] {
            db.save_summary(&draft("en", content, "2025-01-01", UpdateType::Complete))
                .unwrap();
        }

        let history = db.summary_history("en").unwrap();
        let versions: Vec<u32> = history.iter().map(|s| s.version).collect();
        assert_eq!(versions, vec![3, 2, 1]);
        assert_eq!(history[0].content, "c");
        assert!(db.summary_history("ru").unwrap().is_empty());
        assert!(db.latest_summary("ru").unwrap().is_none());
    }

    #[test]
    fn test_latest_record_date_never_regresses() {
        let db = Database::open_in_memory().unwrap();
        db.save_summary(&draft("en", "S1", "2025-03-01", UpdateType::Complete))
            .unwrap();

        let regenerated = db
            .save_summary(&draft("en", "S2", "2025-01-15", UpdateType::Complete))
            .unwrap();
        assert_eq!(regenerated.latest_record_date, date("2025-03-01"));
    }

    #[test]
    fn test_summaries_persist_across_reopen() {
        let temp = NamedTempFile::new().unwrap();
        {
            let db = Database::new(temp.path()).unwrap();
            db.save_summary(&draft("ru", "S1", "2025-01-10", UpdateType::Complete))
                .unwrap();
        }

        let db = Database::new(temp.path()).unwrap();
        let summary = db.latest_summary("ru").unwrap().unwrap();
        assert_eq!(summary.version, 1);
        assert_eq!(summary.latest_record_date, date("2025-01-10"));
    }

    #[test]
    fn test_specialized_summary_revisions() {
        let db = Database::open_in_memory().unwrap();
        let make = |content: &str| SpecializedSummaryDraft {
            name: "FLT3 inhibitors".to_string(),
            language: "en".to_string(),
            terms: vec!["FLT3".to_string(), "GILTERITINIB".to_string()],
            record_ids: vec!["R1".to_string(), "R2".to_string()],
            content: content.to_string(),
            trends: ResearchTrends::default(),
        };

        let first = db.save_specialized_summary(&make("first")).unwrap();
        let second = db.save_specialized_summary(&make("second")).unwrap();
        assert_eq!((first.revision, second.revision), (1, 2));
        assert_ne!(first.id, second.id);
        assert_eq!(second.record_count, 2);

        let listed = db.list_specialized_summaries().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].content, "second");

        let fetched = db.get_specialized_summary(first.id).unwrap().unwrap();
        assert_eq!(fetched.terms, vec!["FLT3".to_string(), "GILTERITINIB".to_string()]);

        assert!(db.delete_specialized_summary(first.id).unwrap());
        assert!(!db.delete_specialized_summary(first.id).unwrap());
        assert!(db.get_specialized_summary(first.id).unwrap().is_none());
    }
}
