use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::HashSet;
use tracing::{debug, info};

use crate::error::StoreResult;

/// Cursor value seeded on a fresh database
pub const INITIAL_CURSOR: &str = "2024-08-12";

/// One step of schema evolution. Applied at most once, in `version` order.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Ordered list of every schema change. Append only; never edit a shipped entry.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_records",
        sql: "CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                external_id TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                abstract TEXT NOT NULL,
                published_date TEXT NOT NULL,
                article_type TEXT NOT NULL,
                authors TEXT NOT NULL,
                venue TEXT NOT NULL,
                analysis TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_records_published ON records(published_date DESC);",
    },
    Migration {
        version: 2,
        name: "create_settings",
        sql: "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            INSERT OR IGNORE INTO settings (key, value, updated_at)
            VALUES ('last_update_date', '2024-08-12', strftime('%Y-%m-%dT%H:%M:%SZ', 'now'));",
    },
    Migration {
        version: 3,
        name: "create_term_index",
        sql: "CREATE TABLE IF NOT EXISTS terms (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                term TEXT NOT NULL UNIQUE,
                frequency INTEGER NOT NULL DEFAULT 0,
                category TEXT,
                last_seen TEXT
            );
            CREATE TABLE IF NOT EXISTS record_terms (
                record_id INTEGER NOT NULL REFERENCES records(id) ON DELETE CASCADE,
                term_id INTEGER NOT NULL REFERENCES terms(id) ON DELETE CASCADE,
                weight REAL,
                PRIMARY KEY (record_id, term_id)
            );
            CREATE INDEX IF NOT EXISTS idx_record_terms_term ON record_terms(term_id);
            CREATE INDEX IF NOT EXISTS idx_terms_frequency ON terms(frequency DESC);",
    },
    Migration {
        version: 4,
        name: "create_summaries",
        sql: "CREATE TABLE IF NOT EXISTS summaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                language TEXT NOT NULL,
                version INTEGER NOT NULL,
                content TEXT NOT NULL,
                record_count INTEGER NOT NULL,
                latest_record_date TEXT NOT NULL,
                trends TEXT NOT NULL,
                update_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (language, version)
            );",
    },
    Migration {
        version: 5,
        name: "create_specialized_summaries",
        sql: "CREATE TABLE IF NOT EXISTS specialized_summaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                revision INTEGER NOT NULL,
                language TEXT NOT NULL,
                terms TEXT NOT NULL,
                record_ids TEXT NOT NULL,
                content TEXT NOT NULL,
                record_count INTEGER NOT NULL,
                trends TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (name, revision)
            );",
    },
    Migration {
        version: 6,
        name: "add_records_reference_count",
        sql: "ALTER TABLE records ADD COLUMN reference_count INTEGER;",
    },
];

/// Apply every migration not yet recorded in `schema_migrations`.
///
/// Each migration runs in its own transaction together with the row that
/// records it, so a crash mid-way leaves the schema at a known version.
/// Returns the number of migrations applied by this call.
pub fn apply_migrations(conn: &mut Connection) -> StoreResult<usize> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;

    let applied = applied_versions(conn)?;
    let mut count = 0;

    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            debug!(
                "Migration {} ({}) already applied",
                migration.version, migration.name
            );
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.name, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;

        info!("Applied migration {} ({})", migration.version, migration.name);
        count += 1;
    }

    Ok(count)
}

/// Versions already recorded as applied
pub fn applied_versions(conn: &Connection) -> StoreResult<HashSet<u32>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations")?;
    let versions = stmt
        .query_map([], |row| row.get::<_, u32>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(versions)
}
