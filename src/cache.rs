//! Canonical description to category store.
//!
//! Entries are keyed by [`canonicalize`](crate::canonical::canonicalize)
//! output. Writes are last-write-wins upserts; recanonicalization conflicts
//! live in a separate table until an operator resolves them.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Row};

use crate::db::timestamp;
use crate::error::{Result, TallyError};
use crate::models::{CacheConflict, CacheEntry, CategorySource};

fn source_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<CategorySource> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: TallyError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
    Ok(CacheEntry {
        canonical_description: row.get(0)?,
        category: row.get(1)?,
        source: source_column(row, 2)?,
        confidence: row.get(3)?,
        updated_at: row.get(4)?,
        tags: row.get(5)?,
    })
}

fn conflict_from_row(row: &Row<'_>) -> rusqlite::Result<CacheConflict> {
    Ok(CacheConflict {
        canonical_description: row.get(0)?,
        previous_key: row.get(1)?,
        category: row.get(2)?,
        source: source_column(row, 3)?,
        confidence: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

const ENTRY_COLUMNS: &str = "canonical_description, category, source_tier, confidence, updated_at, tags";

/// Handle over the cache tables of an open store.
pub struct CategorizationCache<'a> {
    conn: &'a Connection,
}

impl<'a> CategorizationCache<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn lookup_exact(&self, key: &str) -> Result<Option<CacheEntry>> {
        let entry = self
            .conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM categorization_cache WHERE canonical_description = ?1"),
                [key],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn upsert(
        &self,
        key: &str,
        category: &str,
        source: CategorySource,
        confidence: Option<f64>,
        tags: Option<&str>,
    ) -> Result<()> {
        self.upsert_at(key, category, source, confidence, tags, &timestamp())
    }

    /// Upsert keeping a caller-provided `updated_at`, used when moving
    /// entries between keys.
    pub fn upsert_at(
        &self,
        key: &str,
        category: &str,
        source: CategorySource,
        confidence: Option<f64>,
        tags: Option<&str>,
        updated_at: &str,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO categorization_cache \
             (canonical_description, category, source_tier, confidence, updated_at, tags) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(canonical_description) DO UPDATE SET \
             category = excluded.category, source_tier = excluded.source_tier, \
             confidence = excluded.confidence, updated_at = excluded.updated_at, \
             tags = excluded.tags",
            rusqlite::params![key, category, source.as_str(), confidence, updated_at, tags],
        )?;
        Ok(())
    }

    /// All entries ordered by key.
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM categorization_cache ORDER BY canonical_description"
        ))?;
        let rows = stmt
            .query_map([], entry_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        let n = self.conn.execute(
            "DELETE FROM categorization_cache WHERE canonical_description = ?1",
            [key],
        )?;
        Ok(n > 0)
    }

    pub fn len(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT count(*) FROM categorization_cache", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Distinct categories with the number of cache keys using each.
    pub fn category_counts(&self) -> Result<Vec<(String, usize)>> {
        let mut stmt = self.conn.prepare(
            "SELECT category, count(*) FROM categorization_cache GROUP BY category ORDER BY category",
        )?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as usize)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Conflicts
    // -----------------------------------------------------------------------

    pub fn park_conflict(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO cache_conflicts \
             (canonical_description, previous_key, category, source_tier, confidence, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                key,
                entry.canonical_description,
                entry.category,
                entry.source.as_str(),
                entry.confidence,
                entry.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn conflicts(&self) -> Result<Vec<CacheConflict>> {
        let mut stmt = self.conn.prepare(
            "SELECT canonical_description, previous_key, category, source_tier, confidence, updated_at \
             FROM cache_conflicts ORDER BY canonical_description, previous_key",
        )?;
        let rows = stmt
            .query_map([], conflict_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn has_conflict(&self, key: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM cache_conflicts WHERE canonical_description = ?1")?;
        Ok(stmt.exists([key])?)
    }

    pub fn clear_conflicts(&self, key: &str) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM cache_conflicts WHERE canonical_description = ?1",
            [key],
        )?;
        Ok(n)
    }

    // -----------------------------------------------------------------------
    // CSV exchange
    // -----------------------------------------------------------------------

    /// Write every entry to `path`. Returns the number of rows written.
    pub fn export_csv(&self, path: &Path) -> Result<usize> {
        let entries = self.entries()?;
        let mut wtr = csv::Writer::from_path(path)?;
        for entry in &entries {
            wtr.serialize(entry)?;
        }
        wtr.flush()?;
        Ok(entries.len())
    }

    /// Upsert every row of a CSV written by [`export_csv`](Self::export_csv).
    /// Keys are stored as given; run recanonicalization afterwards when the
    /// file comes from another canonicalizer version.
    pub fn import_csv(&self, path: &Path) -> Result<usize> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut imported = 0usize;
        for result in rdr.deserialize::<CacheEntry>() {
            let entry = result?;
            if entry.canonical_description.trim().is_empty() || entry.category.trim().is_empty() {
                continue;
            }
            let updated_at = if entry.updated_at.is_empty() {
                timestamp()
            } else {
                entry.updated_at.clone()
            };
            self.upsert_at(
                &entry.canonical_description,
                entry.category.trim(),
                entry.source,
                entry.confidence,
                entry.tags.as_deref().filter(|t| !t.trim().is_empty()),
                &updated_at,
            )?;
            imported += 1;
        }
        Ok(imported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        conn
    }

    #[test]
    fn test_lookup_miss_then_hit() {
        let conn = test_conn();
        let cache = CategorizationCache::new(&conn);
        assert!(cache.lookup_exact("ifood").unwrap().is_none());
        cache.upsert("ifood", "Food", CategorySource::Ai, Some(0.92), None).unwrap();
        let entry = cache.lookup_exact("ifood").unwrap().unwrap();
        assert_eq!(entry.category, "Food");
        assert_eq!(entry.source, CategorySource::Ai);
        assert_eq!(entry.confidence, Some(0.92));
    }

    #[test]
    fn test_upsert_is_last_write_wins() {
        let conn = test_conn();
        let cache = CategorizationCache::new(&conn);
        cache.upsert("uber", "Transport", CategorySource::Search, Some(0.85), None).unwrap();
        cache.upsert("uber", "Travel", CategorySource::Manual, None, None).unwrap();
        let entry = cache.lookup_exact("uber").unwrap().unwrap();
        assert_eq!(entry.category, "Travel");
        assert_eq!(entry.source, CategorySource::Manual);
        assert_eq!(entry.confidence, None);
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_remove_and_entries() {
        let conn = test_conn();
        let cache = CategorizationCache::new(&conn);
        cache.upsert("b", "X", CategorySource::Manual, None, None).unwrap();
        cache.upsert("a", "X", CategorySource::Manual, None, None).unwrap();
        let keys: Vec<_> = cache.entries().unwrap().into_iter().map(|e| e.canonical_description).collect();
        assert_eq!(keys, ["a", "b"]);
        assert!(cache.remove("a").unwrap());
        assert!(!cache.remove("a").unwrap());
        assert_eq!(cache.category_counts().unwrap(), vec![("X".to_string(), 1)]);
    }

    #[test]
    fn test_conflict_bookkeeping() {
        let conn = test_conn();
        let cache = CategorizationCache::new(&conn);
        let entry = CacheEntry {
            canonical_description: "acl odonto saud 03".into(),
            category: "Health".into(),
            source: CategorySource::Ai,
            confidence: Some(0.7),
            updated_at: "2025-01-01T00:00:00.000000Z".into(),
            tags: None,
        };
        cache.park_conflict("acl odonto saud", &entry).unwrap();
        assert!(cache.has_conflict("acl odonto saud").unwrap());
        let conflicts = cache.conflicts().unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].previous_key, "acl odonto saud 03");
        assert_eq!(cache.clear_conflicts("acl odonto saud").unwrap(), 1);
        assert!(!cache.has_conflict("acl odonto saud").unwrap());
    }

    #[test]
    fn test_csv_export_import() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.csv");
        let conn = test_conn();
        let cache = CategorizationCache::new(&conn);
        cache.upsert("ifood", "Food", CategorySource::Ai, Some(0.9), Some("delivery, food")).unwrap();
        cache.upsert("netflix", "Streaming", CategorySource::Manual, None, None).unwrap();
        assert_eq!(cache.export_csv(&path).unwrap(), 2);

        let other = test_conn();
        let imported = CategorizationCache::new(&other);
        assert_eq!(imported.import_csv(&path).unwrap(), 2);
        let entry = imported.lookup_exact("netflix").unwrap().unwrap();
        assert_eq!(entry.category, "Streaming");
        assert_eq!(entry.source, CategorySource::Manual);
        assert_eq!(entry.tags, None);
        let ifood = imported.lookup_exact("ifood").unwrap().unwrap();
        assert_eq!(ifood.tags.as_deref(), Some("delivery, food"));
        assert_eq!(
            entry.updated_at,
            cache.lookup_exact("netflix").unwrap().unwrap().updated_at
        );
    }
}
