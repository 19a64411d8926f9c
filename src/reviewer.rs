use std::collections::HashMap;

use rusqlite::Connection;

use crate::db::{transaction_from_row, TRANSACTION_COLUMNS};
use crate::error::{Result, TallyError};
use crate::models::Transaction;
use crate::search::similarity;
use crate::sources::SourceKind;

#[derive(Debug, Clone, PartialEq)]
pub struct RankedCategory {
    pub category: String,
    pub score: f64,
    pub count: usize,
}

/// Translate a shell-style glob (`*`, `?`) into a `LIKE` pattern escaped
/// with `\`.
pub fn glob_to_like(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '%' => out.push_str("\\%"),
            '_' => out.push_str("\\_"),
            '*' => out.push('%'),
            '?' => out.push('_'),
            other => out.push(other),
        }
    }
    out
}

/// Look up statements by numeric id, or by a description glob.
pub fn find_statements(
    conn: &Connection,
    query: &str,
    source: Option<SourceKind>,
    limit: usize,
) -> Result<Vec<Transaction>> {
    let query = query.trim();
    if let Ok(id) = query.parse::<i64>() {
        let txn = conn
            .query_row(
                &format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?1"),
                [id],
                transaction_from_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => TallyError::UnknownStatement(query.to_string()),
                other => other.into(),
            })?;
        return Ok(vec![txn]);
    }

    let pattern = glob_to_like(query);
    let source_key = source.map(|s| s.key()).unwrap_or("");
    let mut stmt = conn.prepare(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions \
         WHERE description LIKE ?1 ESCAPE '\\' AND (?2 = '' OR source = ?2) \
         ORDER BY transaction_date, id LIMIT ?3"
    ))?;
    let rows = stmt
        .query_map(
            rusqlite::params![pattern, source_key, limit as i64],
            transaction_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Best similarity per category among `candidates` (canonical description,
/// category), most similar first; ties by usage count, then name.
pub fn rank_categories(
    key: &str,
    candidates: &[(String, String)],
    counts: &HashMap<String, usize>,
    top: usize,
) -> Vec<RankedCategory> {
    let mut best: HashMap<&str, f64> = HashMap::new();
    for (candidate, category) in candidates {
        let score = similarity(key, candidate);
        if score <= 0.0 {
            continue;
        }
        let slot = best.entry(category.as_str()).or_insert(score);
        if score > *slot {
            *slot = score;
        }
    }

    let mut ranked: Vec<RankedCategory> = best
        .into_iter()
        .map(|(category, score)| RankedCategory {
            category: category.to_string(),
            score,
            count: counts.get(category).copied().unwrap_or(0),
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.count.cmp(&a.count))
            .then_with(|| a.category.cmp(&b.category))
    });
    ranked.truncate(top.max(1));
    ranked
}

/// Category usage across stored transactions.
pub fn category_counts(conn: &Connection) -> Result<HashMap<String, usize>> {
    let mut stmt = conn.prepare(
        "SELECT category, count(*) FROM transactions WHERE category IS NOT NULL GROUP BY category",
    )?;
    let counts = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as usize)))?
        .collect::<std::result::Result<HashMap<_, _>, _>>()?;
    Ok(counts)
}
