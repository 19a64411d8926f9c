use std::collections::{HashMap, HashSet};

use rusqlite::Connection;

use crate::cache::CategorizationCache;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub canonical_description: String,
    pub score: f64,
}

/// Similarity search over previously categorized descriptions.
pub trait CategorySearch {
    /// Ranked hits, best first. Scores are in `0.0..=1.0`.
    fn search(&self, query: &str) -> Result<Vec<SearchHit>>;
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

fn token_jaccard(a: &str, b: &str) -> f64 {
    let ta: HashSet<&str> = a.split_whitespace().collect();
    let tb: HashSet<&str> = b.split_whitespace().collect();
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let inter = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    inter / union
}

fn bigrams(s: &str) -> HashMap<(char, char), usize> {
    let chars: Vec<char> = s.chars().filter(|c| !c.is_whitespace()).collect();
    let mut counts = HashMap::new();
    for pair in chars.windows(2) {
        *counts.entry((pair[0], pair[1])).or_insert(0) += 1;
    }
    counts
}

fn bigram_dice(a: &str, b: &str) -> f64 {
    let compact_a: String = a.chars().filter(|c| !c.is_whitespace()).collect();
    let compact_b: String = b.chars().filter(|c| !c.is_whitespace()).collect();
    if compact_a.is_empty() || compact_b.is_empty() {
        return 0.0;
    }
    if compact_a == compact_b {
        return 1.0;
    }
    let ba = bigrams(&compact_a);
    let bb = bigrams(&compact_b);
    let total: usize = ba.values().sum::<usize>() + bb.values().sum::<usize>();
    if total == 0 {
        return 0.0;
    }
    let shared: usize = ba
        .iter()
        .map(|(pair, n)| (*n).min(bb.get(pair).copied().unwrap_or(0)))
        .sum();
    2.0 * shared as f64 / total as f64
}

/// Similarity of two canonical descriptions: the better of token overlap and
/// character-bigram overlap of the space-free strings, so that
/// `amazon marketplace` and `amazonmarketplace` score 1.0.
pub fn similarity(a: &str, b: &str) -> f64 {
    token_jaccard(a, b).max(bigram_dice(a, b))
}

// ---------------------------------------------------------------------------
// Cache-backed search
// ---------------------------------------------------------------------------

/// Scans every cache key. Linear in cache size, which stays in the low
/// thousands for a personal ledger.
pub struct CacheSearch<'a> {
    conn: &'a Connection,
}

impl<'a> CacheSearch<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl CategorySearch for CacheSearch<'_> {
    fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        let entries = CategorizationCache::new(self.conn).entries()?;
        Ok(rank(query, entries.iter().map(|e| e.canonical_description.as_str())))
    }
}

/// Score `candidates` against `query`, dropping zero scores and the query
/// itself. Ties are broken by key.
pub fn rank<'k>(query: &str, candidates: impl IntoIterator<Item = &'k str>) -> Vec<SearchHit> {
    let mut hits: Vec<SearchHit> = candidates
        .into_iter()
        .filter(|key| *key != query)
        .filter_map(|key| {
            let score = similarity(query, key);
            (score > 0.0).then(|| SearchHit {
                canonical_description: key.to_string(),
                score,
            })
        })
        .collect();
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.canonical_description.cmp(&b.canonical_description))
    });
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::models::CategorySource;

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(similarity("ifood", "ifood"), 1.0);
        assert_eq!(similarity("", "ifood"), 0.0);
        assert_eq!(similarity("abc", "xyz"), 0.0);
    }

    #[test]
    fn test_compact_strings_match() {
        assert_eq!(similarity("amazon marketplace", "amazonmarketplace"), 1.0);
        assert_eq!(similarity("acl odonto saud", "aclodonto saud"), 1.0);
    }

    #[test]
    fn test_token_overlap() {
        let s = similarity("uber trip sao paulo", "uber trip");
        assert!(s >= 0.5, "score {s}");
        assert!(s < 1.0);
    }

    #[test]
    fn test_rank_orders_by_score_then_key() {
        let hits = rank("netflix", ["netflix com", "netflixcom", "spotify", "netflix"]);
        let keys: Vec<_> = hits.iter().map(|h| h.canonical_description.as_str()).collect();
        assert_eq!(keys[..2], ["netflix com", "netflixcom"]);
        assert!(!keys.contains(&"netflix"));
        assert!(!keys.contains(&"spotify"));
    }

    #[test]
    fn test_cache_search() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let cache = CategorizationCache::new(&conn);
        cache.upsert("amazonmarketplace", "Shopping", CategorySource::Manual, None, None).unwrap();
        cache.upsert("posto shell", "Fuel", CategorySource::Manual, None, None).unwrap();
        let hits = CacheSearch::new(&conn).search("amazon marketplace").unwrap();
        assert_eq!(hits[0].canonical_description, "amazonmarketplace");
        assert_eq!(hits[0].score, 1.0);
    }
}
