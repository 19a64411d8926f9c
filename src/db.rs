use std::path::Path;

use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{Connection, Row};

use crate::error::Result;
use crate::models::Transaction;
use crate::sources::SourceKind;

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY,
    raw_import_id TEXT NOT NULL UNIQUE,
    source TEXT NOT NULL,
    transaction_date TEXT NOT NULL,
    payment_date TEXT,
    description TEXT NOT NULL,
    canonical_description TEXT NOT NULL,
    amount_cents INTEGER NOT NULL,
    currency TEXT NOT NULL DEFAULT 'BRL',
    category TEXT,
    imported_at TEXT DEFAULT (datetime('now')),
    tags TEXT
);

CREATE INDEX IF NOT EXISTS idx_transactions_canonical
    ON transactions (canonical_description);
CREATE INDEX IF NOT EXISTS idx_transactions_category
    ON transactions (category);

CREATE TABLE IF NOT EXISTS categorization_cache (
    id INTEGER PRIMARY KEY,
    canonical_description TEXT NOT NULL UNIQUE,
    category TEXT NOT NULL,
    source_tier TEXT NOT NULL,
    confidence REAL,
    updated_at TEXT NOT NULL,
    tags TEXT
);

CREATE TABLE IF NOT EXISTS cache_conflicts (
    id INTEGER PRIMARY KEY,
    canonical_description TEXT NOT NULL,
    previous_key TEXT NOT NULL,
    category TEXT NOT NULL,
    source_tier TEXT NOT NULL,
    confidence REAL,
    updated_at TEXT NOT NULL,
    parked_at TEXT DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_cache_conflicts_key
    ON cache_conflicts (canonical_description);

CREATE TABLE IF NOT EXISTS imports (
    id INTEGER PRIMARY KEY,
    filename TEXT NOT NULL,
    source TEXT NOT NULL,
    import_date TEXT DEFAULT (datetime('now')),
    record_count INTEGER,
    inserted INTEGER,
    skipped INTEGER,
    failed INTEGER,
    checksum TEXT
);
";

pub fn get_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// UTC timestamp with microseconds; sorts lexicographically.
pub fn timestamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
}

// ---------------------------------------------------------------------------
// Transaction rows
// ---------------------------------------------------------------------------

pub const TRANSACTION_COLUMNS: &str = "id, raw_import_id, source, transaction_date, payment_date, \
     description, canonical_description, amount_cents, currency, category, imported_at, tags";

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn date_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| conversion_error(idx, e))
}

/// Map a row selected with [`TRANSACTION_COLUMNS`].
pub fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let source: String = row.get(2)?;
    let source = source
        .parse::<SourceKind>()
        .map_err(|e| conversion_error(2, e))?;
    let payment_date = match row.get::<_, Option<String>>(4)? {
        Some(_) => Some(date_column(row, 4)?),
        None => None,
    };
    Ok(Transaction {
        id: row.get(0)?,
        raw_import_id: row.get(1)?,
        source,
        transaction_date: date_column(row, 3)?,
        payment_date,
        description: row.get(5)?,
        canonical_description: row.get(6)?,
        amount_cents: row.get(7)?,
        currency: row.get(8)?,
        category: row.get(9)?,
        imported_at: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
        tags: row.get(11)?,
    })
}

/// Stored transactions ordered by date then id, optionally restricted to
/// one source and/or to rows without a category.
pub fn load_transactions(
    conn: &Connection,
    source: Option<SourceKind>,
    uncategorized_only: bool,
) -> Result<Vec<Transaction>> {
    let mut sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE 1 = 1");
    if uncategorized_only {
        sql.push_str(" AND category IS NULL");
    }
    if source.is_some() {
        sql.push_str(" AND source = ?1");
    }
    sql.push_str(" ORDER BY transaction_date, id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = match source {
        Some(kind) => stmt
            .query_map([kind.key()], transaction_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?,
        None => stmt
            .query_map([], transaction_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?,
    };
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = get_connection(&dir.path().join("test.db")).unwrap();
        init_db(&conn).unwrap();
        (dir, conn)
    }

    fn insert(conn: &Connection, raw_id: &str, source: &str, date: &str, category: Option<&str>) {
        conn.execute(
            "INSERT INTO transactions (raw_import_id, source, transaction_date, description, canonical_description, amount_cents, category) \
             VALUES (?1, ?2, ?3, 'IFOOD', 'ifood', -4590, ?4)",
            rusqlite::params![raw_id, source, date, category],
        )
        .unwrap();
    }

    #[test]
    fn test_init_db_creates_tables() {
        let (_dir, conn) = test_db();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        for expected in &["transactions", "categorization_cache", "cache_conflicts", "imports"] {
            assert!(tables.contains(&expected.to_string()), "missing table: {expected}");
        }
    }

    #[test]
    fn test_init_db_is_idempotent() {
        let (_dir, conn) = test_db();
        init_db(&conn).unwrap();
    }

    #[test]
    fn test_raw_import_id_is_unique() {
        let (_dir, conn) = test_db();
        insert(&conn, "2025-03-001", "itau_cc", "2025-02-20", None);
        let dup = conn.execute(
            "INSERT INTO transactions (raw_import_id, source, transaction_date, description, canonical_description, amount_cents) \
             VALUES ('2025-03-001', 'itau_cc', '2025-02-20', 'X', 'x', 1)",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_load_transactions_filters() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        insert(&conn, "a", "itau_cc", "2025-02-20", None);
        insert(&conn, "b", "nubank_cc", "2025-02-01", None);
        insert(&conn, "c", "nubank_cc", "2025-02-02", Some("Food"));

        let all = load_transactions(&conn, None, false).unwrap();
        assert_eq!(all.iter().map(|t| t.raw_import_id.as_str()).collect::<Vec<_>>(), ["b", "c", "a"]);
        assert_eq!(all[0].currency, "BRL");
        assert_eq!(all[0].payment_date, None);

        let pending = load_transactions(&conn, Some(SourceKind::NubankCredit), true).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].raw_import_id, "b");
        assert_eq!(pending[0].source, SourceKind::NubankCredit);
    }

    #[test]
    fn test_timestamp_sorts() {
        let a = timestamp();
        let b = timestamp();
        assert!(a <= b);
        assert!(a.ends_with('Z'));
    }
}
