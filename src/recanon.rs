//! Recanonicalization: re-key stored data after the canonicalizer changes.
//!
//! Cache entries whose keys collapse onto the same new key are merged when
//! they agree on the category (most recent `updated_at` wins, ties broken by
//! the smaller previous key). When they disagree, all of them are moved to
//! `cache_conflicts` and the key stays blocked until an operator resolves it.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::Connection;
use tracing::{info, warn};

use crate::cache::CategorizationCache;
use crate::canonical::canonicalize;
use crate::engine::apply_manual;
use crate::error::{Result, TallyError};
use crate::models::CacheEntry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictGroup {
    pub canonical_description: String,
    pub previous_keys: Vec<String>,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecanonReport {
    pub statements_updated: usize,
    /// Cache entries moved to a new key.
    pub cache_rekeyed: usize,
    /// Cache entries dropped because an agreeing entry won the merge.
    pub cache_merged: usize,
    pub conflicts: Vec<ConflictGroup>,
}

fn recanon_transactions(conn: &Connection) -> Result<usize> {
    let rows: Vec<(i64, String, String)> = conn
        .prepare("SELECT id, description, canonical_description FROM transactions")?
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut update =
        conn.prepare("UPDATE transactions SET canonical_description = ?1 WHERE id = ?2")?;
    let mut updated = 0usize;
    for (id, description, current) in rows {
        let fresh = canonicalize(&description);
        if fresh != current {
            update.execute(rusqlite::params![fresh, id])?;
            updated += 1;
        }
    }
    Ok(updated)
}

fn recanon_parked(conn: &Connection) -> Result<()> {
    let rows: Vec<(i64, String)> = conn
        .prepare("SELECT id, canonical_description FROM cache_conflicts")?
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (id, key) in rows {
        let fresh = canonicalize(&key);
        if fresh != key {
            conn.execute(
                "UPDATE cache_conflicts SET canonical_description = ?1 WHERE id = ?2",
                rusqlite::params![fresh, id],
            )?;
        }
    }
    Ok(())
}

/// Most recent entry; ties go to the smaller previous key.
fn merge_winner(group: &[CacheEntry]) -> Option<&CacheEntry> {
    group.iter().max_by(|a, b| {
        a.updated_at
            .cmp(&b.updated_at)
            .then_with(|| b.canonical_description.cmp(&a.canonical_description))
    })
}

/// Recompute every canonical description and reconcile the cache, in one
/// transaction.
pub fn recanonicalize(conn: &Connection) -> Result<RecanonReport> {
    let tx = conn.unchecked_transaction()?;
    let cache = CategorizationCache::new(&tx);
    let mut report = RecanonReport {
        statements_updated: recanon_transactions(&tx)?,
        ..RecanonReport::default()
    };
    recanon_parked(&tx)?;

    let mut groups: BTreeMap<String, Vec<CacheEntry>> = BTreeMap::new();
    for entry in cache.entries()? {
        groups
            .entry(canonicalize(&entry.canonical_description))
            .or_default()
            .push(entry);
    }

    for (key, group) in &groups {
        if let [only] = group.as_slice() {
            if only.canonical_description == *key {
                continue;
            }
        }
        let categories: BTreeSet<&str> = group.iter().map(|e| e.category.as_str()).collect();

        if categories.len() > 1 {
            for entry in group {
                cache.remove(&entry.canonical_description)?;
                cache.park_conflict(key, entry)?;
            }
            let conflict = ConflictGroup {
                canonical_description: key.clone(),
                previous_keys: group.iter().map(|e| e.canonical_description.clone()).collect(),
                categories: categories.iter().map(|c| c.to_string()).collect(),
            };
            warn!(
                key = %conflict.canonical_description,
                categories = ?conflict.categories,
                "conflicting cache entries parked"
            );
            report.conflicts.push(conflict);
            continue;
        }

        let Some(winner) = merge_winner(group) else {
            continue;
        };
        let winner = winner.clone();
        for entry in group {
            if entry.canonical_description != *key {
                cache.remove(&entry.canonical_description)?;
                report.cache_rekeyed += 1;
            }
        }
        report.cache_merged += group.len() - 1;
        cache.upsert_at(
            key,
            &winner.category,
            winner.source,
            winner.confidence,
            winner.tags.as_deref(),
            &winner.updated_at,
        )?;
    }

    tx.commit()?;
    info!(
        statements = report.statements_updated,
        rekeyed = report.cache_rekeyed,
        merged = report.cache_merged,
        conflicts = report.conflicts.len(),
        "recanonicalization finished"
    );
    Ok(report)
}

/// Settle a parked conflict with an explicit category. The category is
/// written as a manual entry and applied to every transaction with `key`.
pub fn resolve_conflict(conn: &Connection, key: &str, category: &str) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let cache = CategorizationCache::new(&tx);
    if !cache.has_conflict(key)? {
        return Err(TallyError::Other(format!("no parked conflicts for '{key}'")));
    }
    cache.clear_conflicts(key)?;
    let updated = apply_manual(&tx, key, category)?;
    tx.commit()?;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::models::CategorySource;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        conn
    }

    fn put(cache: &CategorizationCache<'_>, key: &str, category: &str, at: &str) {
        cache
            .upsert_at(key, category, CategorySource::Ai, Some(0.8), None, at)
            .unwrap();
    }

    fn insert_txn(conn: &Connection, raw_id: &str, description: &str, stale_key: &str) {
        conn.execute(
            "INSERT INTO transactions (raw_import_id, source, transaction_date, description, canonical_description, amount_cents) \
             VALUES (?1, 'itau_cc', '2025-02-20', ?2, ?3, -1000)",
            rusqlite::params![raw_id, description, stale_key],
        )
        .unwrap();
    }

    #[test]
    fn test_rekeys_transactions() {
        let conn = test_conn();
        insert_txn(&conn, "2025-03-001", "ACL ODONTO SAUD03 04", "acl odonto saud03 04");
        insert_txn(&conn, "2025-03-002", "IFOOD", "ifood");
        let report = recanonicalize(&conn).unwrap();
        assert_eq!(report.statements_updated, 1);
        let key: String = conn
            .query_row("SELECT canonical_description FROM transactions WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(key, "acl odonto saud");
    }

    #[test]
    fn test_agreeing_entries_merge_most_recent_wins() {
        let conn = test_conn();
        let cache = CategorizationCache::new(&conn);
        put(&cache, "IFOOD 02/10", "Food", "2025-01-01T00:00:00.000000Z");
        put(&cache, "ifood 05/10", "Food", "2025-02-01T00:00:00.000000Z");
        cache.upsert_at("netflix", "Streaming", CategorySource::Manual, None, None, "2025-01-01T00:00:00.000000Z").unwrap();

        let report = recanonicalize(&conn).unwrap();
        assert!(report.conflicts.is_empty());
        assert_eq!(report.cache_rekeyed, 2);
        assert_eq!(report.cache_merged, 1);

        let entries = cache.entries().unwrap();
        assert_eq!(entries.len(), 2);
        let ifood = cache.lookup_exact("ifood").unwrap().unwrap();
        assert_eq!(ifood.category, "Food");
        assert_eq!(ifood.updated_at, "2025-02-01T00:00:00.000000Z");
    }

    #[test]
    fn test_tie_goes_to_smaller_previous_key() {
        let group = vec![
            CacheEntry {
                canonical_description: "b".into(),
                category: "X".into(),
                source: CategorySource::Ai,
                confidence: Some(0.2),
                updated_at: "t".into(),
                tags: None,
            },
            CacheEntry {
                canonical_description: "a".into(),
                category: "X".into(),
                source: CategorySource::Manual,
                confidence: None,
                updated_at: "t".into(),
                tags: None,
            },
        ];
        assert_eq!(merge_winner(&group).unwrap().canonical_description, "a");
    }

    #[test]
    fn test_disagreeing_entries_are_parked_until_resolved() {
        let conn = test_conn();
        insert_txn(&conn, "2025-03-001", "ACL ODONTO SAUD04/04", "acl odonto saud04 04");
        let cache = CategorizationCache::new(&conn);
        put(&cache, "acl odonto saud04 04", "Health", "2025-01-01T00:00:00.000000Z");
        put(&cache, "a c l odonto saud", "Dentist", "2025-01-02T00:00:00.000000Z");

        let report = recanonicalize(&conn).unwrap();
        assert_eq!(report.conflicts.len(), 1);
        let conflict = &report.conflicts[0];
        assert_eq!(conflict.canonical_description, "acl odonto saud");
        assert_eq!(conflict.categories, vec!["Dentist", "Health"]);
        assert!(cache.is_empty().unwrap());
        assert!(cache.has_conflict("acl odonto saud").unwrap());

        // second run leaves the parked entries alone
        let again = recanonicalize(&conn).unwrap();
        assert!(again.conflicts.is_empty());
        assert_eq!(cache.conflicts().unwrap().len(), 2);

        assert_eq!(resolve_conflict(&conn, "acl odonto saud", "Health").unwrap(), 1);
        assert!(!cache.has_conflict("acl odonto saud").unwrap());
        let entry = cache.lookup_exact("acl odonto saud").unwrap().unwrap();
        assert_eq!(entry.source, CategorySource::Manual);
        let category: Option<String> = conn
            .query_row("SELECT category FROM transactions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(category.as_deref(), Some("Health"));
    }

    #[test]
    fn test_resolve_without_conflict_fails() {
        let conn = test_conn();
        assert!(resolve_conflict(&conn, "nothing", "X").is_err());
    }
}
