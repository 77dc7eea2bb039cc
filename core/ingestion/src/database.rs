use chrono::{NaiveDate, Utc};
use litwatch_schemas::{RawRecord, Record, RecordId, StoreStats, TermCandidate, YearCount};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::migration::{apply_migrations, INITIAL_CURSOR};
use crate::term_index::{associate_in, normalize_term};

/// Storage format for every date column
pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";

const CURSOR_KEY: &str = "last_update_date";

const RECORD_COLUMNS: &str = "r.id, r.external_id, r.title, r.abstract, r.published_date,
     r.article_type, r.authors, r.venue, r.reference_count, r.analysis,
     r.created_at, r.updated_at";

/// SQLite-backed store for records, the term index, summaries and the progress cursor
pub struct Database {
    pub(crate) conn: Connection,
}

impl Database {
    /// Open (or create) the database at `path` and bring its schema up to date
    pub fn new<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Self::init(Connection::open(path)?)?;
        info!("Database initialized at {}", path.display());
        Ok(db)
    }

    /// Private in-memory database, mostly for tests and dry runs
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let applied = apply_migrations(&mut conn)?;
        if applied > 0 {
            info!("Schema migrated ({} migrations applied)", applied);
        }

        Ok(Self { conn })
    }

    // ========== RECORD STORE ==========

    /// Insert or replace a record keyed by its external id.
    ///
    /// The write and the read-back of the surrogate id happen in one
    /// transaction, and an existing row is updated in place so its id (and
    /// its term associations) survive re-ingestion.
    pub fn upsert_record(&self, record: &RawRecord, analysis: Option<&str>) -> StoreResult<RecordId> {
        let tx = self.conn.unchecked_transaction()?;
        let id = upsert_record_in(&tx, record, analysis)?;
        tx.commit()?;

        debug!("Upserted record {} as id {}", record.external_id, id);
        Ok(id)
    }

    /// Upsert a record and replace its term associations as a single unit.
    /// Either both land or neither does.
    pub fn ingest_record(
        &self,
        record: &RawRecord,
        analysis: Option<&str>,
        terms: &[TermCandidate],
    ) -> StoreResult<RecordId> {
        let tx = self.conn.unchecked_transaction()?;
        let id = upsert_record_in(&tx, record, analysis)?;
        let associated = associate_in(&tx, id, terms)?;
        tx.commit()?;

        debug!(
            "Ingested record {} as id {} with {} terms",
            record.external_id, id, associated
        );
        Ok(id)
    }

    /// All records, newest publication first
    pub fn get_all_records(&self, limit: Option<usize>) -> StoreResult<Vec<Record>> {
        // SQLite treats a negative LIMIT as "no limit"
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records r
             ORDER BY r.published_date DESC, r.id DESC
             LIMIT ?1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![limit], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;

        self.with_terms(records)
    }

    /// Records associated with at least one of `terms`, each returned once
    pub fn get_records_by_terms(&self, terms: &[String]) -> StoreResult<Vec<Record>> {
        let mut normalized: Vec<String> = terms.iter().filter_map(|t| normalize_term(t)).collect();
        normalized.sort();
        normalized.dedup();

        if normalized.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; normalized.len()].join(", ");
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records r
             WHERE r.id IN (
                SELECT rt.record_id FROM record_terms rt
                JOIN terms t ON t.id = rt.term_id
                WHERE t.term IN ({placeholders})
             )
             ORDER BY r.published_date DESC, r.id DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(normalized.iter()), row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "Found {} records for terms {:?}",
            records.len(),
            normalized
        );
        self.with_terms(records)
    }

    /// Records published strictly after `date`
    pub fn get_records_after(&self, date: NaiveDate) -> StoreResult<Vec<Record>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records r
             WHERE r.published_date > ?1
             ORDER BY r.published_date DESC, r.id DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![format_date(date)], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;

        self.with_terms(records)
    }

    pub fn record_exists(&self, external_id: &str) -> StoreResult<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM records WHERE external_id = ?1)",
            params![external_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn get_record(&self, external_id: &str) -> StoreResult<Option<Record>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM records r WHERE r.external_id = ?1");
        let record = self
            .conn
            .query_row(&sql, params![external_id], row_to_record)
            .optional()?;

        match record {
            Some(record) => Ok(self.with_terms(vec![record])?.pop()),
            None => Ok(None),
        }
    }

    pub fn count_records(&self) -> StoreResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn with_terms(&self, mut records: Vec<Record>) -> StoreResult<Vec<Record>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT t.term FROM record_terms rt
             JOIN terms t ON t.id = rt.term_id
             WHERE rt.record_id = ?1
             ORDER BY t.term",
        )?;

        for record in &mut records {
            record.terms = stmt
                .query_map(params![record.id.0], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
        }

        Ok(records)
    }

    // ========== PROGRESS CURSOR ==========

    /// Date below which ingestion is considered complete
    pub fn get_cursor(&self) -> StoreResult<NaiveDate> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![CURSOR_KEY],
                |row| row.get(0),
            )
            .optional()?;

        parse_date(value.as_deref().unwrap_or(INITIAL_CURSOR))
    }

    pub fn set_cursor(&self, date: NaiveDate) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![CURSOR_KEY, format_date(date), Utc::now().to_rfc3339()],
        )?;

        info!("Progress cursor set to {}", date);
        Ok(())
    }

    // ========== STATISTICS ==========

    pub fn get_stats(&self) -> StoreResult<StoreStats> {
        let total_records = self.count_records()?;

        let mut stmt = self.conn.prepare(
            "SELECT substr(published_date, 1, 4) AS year, COUNT(*)
             FROM records
             GROUP BY year
             ORDER BY year DESC",
        )?;
        let records_by_year = stmt
            .query_map([], |row| {
                Ok(YearCount {
                    year: row.get(0)?,
                    count: row.get::<_, i64>(1)? as usize,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let latest: Option<String> =
            self.conn
                .query_row("SELECT MAX(published_date) FROM records", [], |row| row.get(0))?;
        let latest_record_date = latest.as_deref().map(parse_date).transpose()?;

        let total_terms: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM terms WHERE frequency > 0",
            [],
            |row| row.get(0),
        )?;

        Ok(StoreStats {
            total_records,
            records_by_year,
            latest_record_date,
            last_update: self.get_cursor()?,
            total_terms: total_terms as usize,
        })
    }
}

fn upsert_record_in(
    conn: &Connection,
    record: &RawRecord,
    analysis: Option<&str>,
) -> StoreResult<RecordId> {
    let authors_json = serde_json::to_string(&record.authors)?;
    let now = Utc::now().to_rfc3339();

    let id: i64 = conn.query_row(
        "INSERT INTO records (external_id, title, abstract, published_date, article_type,
                              authors, venue, reference_count, analysis, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
         ON CONFLICT(external_id) DO UPDATE SET
            title = excluded.title,
            abstract = excluded.abstract,
            published_date = excluded.published_date,
            article_type = excluded.article_type,
            authors = excluded.authors,
            venue = excluded.venue,
            reference_count = excluded.reference_count,
            analysis = excluded.analysis,
            updated_at = excluded.updated_at
         RETURNING id",
        params![
            record.external_id,
            record.title,
            record.abstract_text,
            format_date(record.published_date),
            record.article_type,
            authors_json,
            record.venue,
            record.reference_count,
            analysis,
            now,
        ],
        |row| row.get(0),
    )?;

    Ok(RecordId(id))
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub(crate) fn parse_date(raw: &str) -> StoreResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|_| StoreError::InvalidDate(raw.to_string()))
}

/// Date column decoder usable inside rusqlite row closures
pub(crate) fn date_column(row: &Row, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, DATE_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn json_error(err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err))
}

fn row_to_record(row: &Row) -> rusqlite::Result<Record> {
    let authors_json: String = row.get(6)?;
    let authors: Vec<String> = serde_json::from_str(&authors_json).map_err(json_error)?;

    Ok(Record {
        id: RecordId(row.get(0)?),
        external_id: row.get(1)?,
        title: row.get(2)?,
        abstract_text: row.get(3)?,
        published_date: date_column(row, 4)?,
        article_type: row.get(5)?,
        authors,
        venue: row.get(7)?,
        reference_count: row.get(8)?,
        analysis: row.get(9)?,
        terms: Vec::new(),
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}
