use litwatch_schemas::{RecordId, Term, TermCandidate, TermId};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use tracing::debug;

use crate::database::{date_column, Database};
use crate::error::{StoreError, StoreResult};

const MIN_TERM_LEN: usize = 2;

/// Canonical form of a term: trimmed, inner whitespace collapsed, upper-cased.
/// Returns `None` for strings too short to be a useful term.
pub fn normalize_term(raw: &str) -> Option<String> {
    let normalized = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase();

    if normalized.chars().count() < MIN_TERM_LEN {
        None
    } else {
        Some(normalized)
    }
}

impl Database {
    /// Replace every term association of `record_id` with `terms`.
    ///
    /// Runs as one transaction: old associations are cleared, new ones
    /// inserted, and the frequency of every term touched on either side is
    /// recomputed from the association table, so frequencies always equal
    /// the number of distinct associated records. Returns the number of
    /// distinct terms now associated with the record.
    pub fn associate(&self, record_id: RecordId, terms: &[TermCandidate]) -> StoreResult<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let associated = associate_in(&tx, record_id, terms)?;
        tx.commit()?;
        Ok(associated)
    }

    /// Every known term, most frequent first. Terms left without any
    /// association stay listed with frequency 0.
    pub fn all_terms(&self) -> StoreResult<Vec<Term>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, term, frequency, category, last_seen
             FROM terms
             ORDER BY frequency DESC, term ASC",
        )?;
        let terms = stmt
            .query_map([], row_to_term)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(terms)
    }

    /// Look up a single term by any spelling that normalizes to it
    pub fn get_term(&self, term: &str) -> StoreResult<Option<Term>> {
        let Some(normalized) = normalize_term(term) else {
            return Ok(None);
        };

        let term = self
            .conn
            .query_row(
                "SELECT id, term, frequency, category, last_seen FROM terms WHERE term = ?1",
                params![normalized],
                row_to_term,
            )
            .optional()?;
        Ok(term)
    }

    /// Recompute every frequency from the association table.
    /// Returns how many terms carried a stale count.
    pub fn recount_term_frequencies(&self) -> StoreResult<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let corrected = tx.execute(
            "UPDATE terms SET frequency = (
                SELECT COUNT(DISTINCT record_id) FROM record_terms WHERE term_id = terms.id
             )
             WHERE frequency != (
                SELECT COUNT(DISTINCT record_id) FROM record_terms WHERE term_id = terms.id
             )",
            [],
        )?;
        tx.commit()?;
        Ok(corrected)
    }
}

/// Association replacement on an open transaction. See [`Database::associate`].
pub(crate) fn associate_in(
    conn: &Connection,
    record_id: RecordId,
    terms: &[TermCandidate],
) -> StoreResult<usize> {
    let mut seen = HashSet::new();
    let candidates: Vec<(String, &TermCandidate)> = terms
        .iter()
        .filter_map(|candidate| normalize_term(&candidate.term).map(|t| (t, candidate)))
        .filter(|(term, _)| seen.insert(term.clone()))
        .collect();

    let published: String = conn
        .query_row(
            "SELECT published_date FROM records WHERE id = ?1",
            params![record_id.0],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("record {}", record_id)))?;

    let mut affected: HashSet<i64> = {
        let mut stmt = conn.prepare("SELECT term_id FROM record_terms WHERE record_id = ?1")?;
        let ids = stmt
            .query_map(params![record_id.0], |row| row.get::<_, i64>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        ids
    };

    conn.execute(
        "DELETE FROM record_terms WHERE record_id = ?1",
        params![record_id.0],
    )?;

    for (term, candidate) in &candidates {
        let term_id: i64 = conn.query_row(
            "INSERT INTO terms (term, frequency, category, last_seen)
             VALUES (?1, 0, ?2, ?3)
             ON CONFLICT(term) DO UPDATE SET
                category = COALESCE(terms.category, excluded.category),
                last_seen = CASE
                    WHEN terms.last_seen IS NULL OR excluded.last_seen > terms.last_seen
                    THEN excluded.last_seen
                    ELSE terms.last_seen
                END
             RETURNING id",
            params![term, candidate.category, published],
            |row| row.get(0),
        )?;

        conn.execute(
            "INSERT OR IGNORE INTO record_terms (record_id, term_id, weight) VALUES (?1, ?2, ?3)",
            params![record_id.0, term_id, candidate.weight],
        )?;
        affected.insert(term_id);
    }

    let mut stmt = conn.prepare(
        "UPDATE terms SET frequency = (
            SELECT COUNT(DISTINCT record_id) FROM record_terms WHERE term_id = ?1
         ) WHERE id = ?1",
    )?;
    for term_id in &affected {
        stmt.execute(params![term_id])?;
    }

    debug!(
        "Associated record {} with {} terms ({} term frequencies refreshed)",
        record_id,
        candidates.len(),
        affected.len()
    );
    Ok(candidates.len())
}

fn row_to_term(row: &Row) -> rusqlite::Result<Term> {
    let last_seen: Option<String> = row.get(4)?;
    Ok(Term {
        id: TermId(row.get(0)?),
        term: row.get(1)?,
        frequency: row.get(2)?,
        category: row.get(3)?,
        last_seen: match last_seen {
            Some(_) => Some(date_column(row, 4)?),
            None => None,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::{date, raw_record};

    fn frequency(db: &Database, term: &str) -> u32 {
        db.get_term(term).unwrap().map(|t| t.frequency).unwrap_or(0)
    }

    #[test]
    fn test_normalize_term() {
        assert_eq!(normalize_term("  tp53 ").as_deref(), Some("TP53"));
        assert_eq!(
            normalize_term("complete\n  remission").as_deref(),
            Some("COMPLETE REMISSION")
        );
        assert_eq!(normalize_term("p"), None);
        assert_eq!(normalize_term("   "), None);
    }

    #[test]
    fn test_reassociation_drops_stale_terms() {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .upsert_record(&raw_record("R5", "a", "2025-01-01"), None)
            .unwrap();

        db.associate(id, &[TermCandidate::new("TP53"), TermCandidate::new("MDM2")])
            .unwrap();
        assert_eq!(frequency(&db, "MDM2"), 1);

        db.associate(id, &[TermCandidate::new("TP53")]).unwrap();
        assert_eq!(frequency(&db, "TP53"), 1);
        assert_eq!(frequency(&db, "MDM2"), 0);

        let record = db.get_record("R5").unwrap().unwrap();
        assert_eq!(record.terms, vec!["TP53".to_string()]);
    }

    #[test]
    fn test_repeated_association_does_not_inflate() {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .upsert_record(&raw_record("R1", "a", "2025-01-01"), None)
            .unwrap();

        for _ in 0..3 {
            db.associate(id, &[TermCandidate::new("FLT3"), TermCandidate::new("flt3 ")])
                .unwrap();
        }
        assert_eq!(frequency(&db, "FLT3"), 1);
    }

    #[test]
    fn test_frequency_counts_distinct_records() {
        let db = Database::open_in_memory().unwrap();
        let a = db.upsert_record(&raw_record("R1", "a", "2025-01-01"), None).unwrap();
        let b = db.upsert_record(&raw_record("R2", "b", "2025-02-01"), None).unwrap();

        db.associate(a, &[TermCandidate::new("TP53")]).unwrap();
        db.associate(b, &[TermCandidate::new("TP53"), TermCandidate::new("NPM1")])
            .unwrap();

        let terms = db.all_terms().unwrap();
        assert_eq!(terms[0].term, "TP53");
        assert_eq!(terms[0].frequency, 2);
        assert_eq!(terms[0].last_seen, Some(date("2025-02-01")));
        assert_eq!(terms[1].term, "NPM1");
        assert_eq!(terms[1].frequency, 1);

        db.associate(a, &[]).unwrap();
        assert_eq!(frequency(&db, "TP53"), 1);
    }

    #[test]
    fn test_category_is_kept_from_first_sighting() {
        let db = Database::open_in_memory().unwrap();
        let a = db.upsert_record(&raw_record("R1", "a", "2025-01-01"), None).unwrap();
        let b = db.upsert_record(&raw_record("R2", "b", "2025-01-02"), None).unwrap();

        db.associate(a, &[TermCandidate::with_category("venetoclax", "drug")])
            .unwrap();
        db.associate(b, &[TermCandidate::new("VENETOCLAX")]).unwrap();

        let term = db.get_term("Venetoclax").unwrap().unwrap();
        assert_eq!(term.category.as_deref(), Some("drug"));
        assert_eq!(term.frequency, 2);
    }

    #[test]
    fn test_associate_unknown_record_fails() {
        let db = Database::open_in_memory().unwrap();
        let err = db
            .associate(RecordId(42), &[TermCandidate::new("TP53")])
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(db.all_terms().unwrap().is_empty());
    }

    #[test]
    fn test_recount_repairs_drift() {
        let db = Database::open_in_memory().unwrap();
        let id = db.upsert_record(&raw_record("R1", "a", "2025-01-01"), None).unwrap();
        db.associate(id, &[TermCandidate::new("TP53")]).unwrap();

        db.conn
            .execute("UPDATE terms SET frequency = 9 WHERE term = 'TP53'", [])
            .unwrap();
        assert_eq!(db.recount_term_frequencies().unwrap(), 1);
        assert_eq!(frequency(&db, "TP53"), 1);
        assert_eq!(db.recount_term_frequencies().unwrap(), 0);
    }
}
