//! Tiered categorization.
//!
//! Each uncategorized description goes through progressively more expensive
//! strategies and stops at the first that produces a category:
//!
//! 1. exact lookup of the canonical description in the cache,
//! 2. similarity search over cached descriptions,
//! 3. a call to the AI suggester.
//!
//! Tiers 2 and 3 write their result back to the cache so the next occurrence
//! is a Tier 1 hit. Store errors propagate; suggester failures become
//! [`Outcome::Unavailable`] for that transaction only.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::ai::{CategorySuggester, Heuristics};
use crate::cache::CategorizationCache;
use crate::db::load_transactions;
use crate::error::Result;
use crate::models::{join_tags, CategorySource, Transaction};
use crate::pareto::prioritize;
use crate::search::CategorySearch;
use crate::sources::SourceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Exact = 1,
    Search = 2,
    Ai = 3,
}

impl Tier {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Self::Exact),
            2 => Some(Self::Search),
            3 => Some(Self::Ai),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Tier 2 adopts a neighbour's category only above this score.
    pub search_threshold: f64,
    /// Highest tier the engine may reach.
    pub max_tier: Tier,
    /// Similar cached descriptions passed to the suggester as examples.
    pub ai_examples: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            search_threshold: 0.8,
            max_tier: Tier::Ai,
            ai_examples: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryResult {
    pub category: String,
    pub source_tier: CategorySource,
    pub confidence: Option<f64>,
    pub tags: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Categorized(CategoryResult),
    /// The suggester failed after its retries.
    Unavailable { reason: String },
    /// No tier produced a category.
    Unresolved,
    /// The key has parked recanonicalization conflicts.
    Conflicted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReport {
    pub groups: usize,
    pub exact: usize,
    pub search: usize,
    pub ai: usize,
    pub unavailable: usize,
    pub unresolved: usize,
    pub conflicted: usize,
    pub transactions_updated: usize,
}

impl BulkReport {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Categorized(result) => match result.source_tier {
                CategorySource::Exact | CategorySource::Manual => self.exact += 1,
                CategorySource::Search => self.search += 1,
                CategorySource::Ai => self.ai += 1,
            },
            Outcome::Unavailable { .. } => self.unavailable += 1,
            Outcome::Unresolved => self.unresolved += 1,
            Outcome::Conflicted => self.conflicted += 1,
        }
    }

    pub fn categorized(&self) -> usize {
        self.exact + self.search + self.ai
    }
}

/// Write a manual cache entry and overwrite the category of every
/// transaction with `key`, clearing its tags. Returns the number of
/// transactions touched.
pub fn apply_manual(conn: &Connection, key: &str, category: &str) -> Result<usize> {
    CategorizationCache::new(conn).upsert(key, category, CategorySource::Manual, None, None)?;
    let n = conn.execute(
        "UPDATE transactions SET category = ?1, tags = NULL WHERE canonical_description = ?2",
        rusqlite::params![category, key],
    )?;
    info!(key, category, transactions = n, "manual category set");
    Ok(n)
}

pub struct CategorizationEngine<'a> {
    conn: &'a Connection,
    cache: CategorizationCache<'a>,
    search: &'a dyn CategorySearch,
    suggester: Option<&'a dyn CategorySuggester>,
    config: EngineConfig,
}

impl<'a> CategorizationEngine<'a> {
    pub fn new(
        conn: &'a Connection,
        search: &'a dyn CategorySearch,
        suggester: Option<&'a dyn CategorySuggester>,
        config: EngineConfig,
    ) -> Self {
        Self {
            conn,
            cache: CategorizationCache::new(conn),
            search,
            suggester,
            config,
        }
    }

    pub fn categorize(&self, txn: &Transaction) -> Result<Outcome> {
        self.categorize_up_to(txn, self.config.max_tier)
    }

    fn categorize_up_to(&self, txn: &Transaction, max_tier: Tier) -> Result<Outcome> {
        let key = txn.canonical_description.as_str();
        if self.cache.has_conflict(key)? {
            debug!(key, "key has parked conflicts");
            return Ok(Outcome::Conflicted);
        }

        // Tier 1
        if let Some(entry) = self.cache.lookup_exact(key)? {
            debug!(key, category = %entry.category, "tier 1 hit");
            return Ok(Outcome::Categorized(CategoryResult {
                category: entry.category,
                source_tier: CategorySource::Exact,
                confidence: entry.confidence,
                tags: entry.tags,
            }));
        }
        if key.is_empty() || max_tier < Tier::Search {
            return Ok(Outcome::Unresolved);
        }

        // Tier 2
        let hits = self.search.search(key)?;
        if let Some(top) = hits.first().filter(|h| h.score > self.config.search_threshold) {
            if let Some(neighbour) = self.cache.lookup_exact(&top.canonical_description)? {
                debug!(key, neighbour = %top.canonical_description, score = top.score, "tier 2 hit");
                self.cache
                    .upsert(
                        key,
                        &neighbour.category,
                        CategorySource::Search,
                        Some(top.score),
                        neighbour.tags.as_deref(),
                    )?;
                return Ok(Outcome::Categorized(CategoryResult {
                    category: neighbour.category,
                    source_tier: CategorySource::Search,
                    confidence: Some(top.score),
                    tags: neighbour.tags,
                }));
            }
        }
        if max_tier < Tier::Ai {
            return Ok(Outcome::Unresolved);
        }

        // Tier 3
        let Some(suggester) = self.suggester else {
            return Ok(Outcome::Unresolved);
        };
        let heuristics = self.heuristics(txn, &hits)?;
        match suggester.suggest_category(&txn.description, &heuristics) {
            Ok(suggestion) => {
                debug!(key, category = %suggestion.category, confidence = ?suggestion.confidence, "tier 3 hit");
                let tags = join_tags(&suggestion.tags);
                self.cache.upsert(
                    key,
                    &suggestion.category,
                    CategorySource::Ai,
                    suggestion.confidence,
                    tags.as_deref(),
                )?;
                Ok(Outcome::Categorized(CategoryResult {
                    category: suggestion.category,
                    source_tier: CategorySource::Ai,
                    confidence: suggestion.confidence,
                    tags,
                }))
            }
            Err(e) => {
                warn!(key, error = %e, "AI categorization unavailable");
                Ok(Outcome::Unavailable {
                    reason: e.to_string(),
                })
            }
        }
    }

    fn heuristics(&self, txn: &Transaction, hits: &[crate::search::SearchHit]) -> Result<Heuristics> {
        let mut counts = self.cache.category_counts()?;
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let mut examples = Vec::new();
        for hit in hits.iter().take(self.config.ai_examples) {
            if let Some(entry) = self.cache.lookup_exact(&hit.canonical_description)? {
                examples.push((entry.canonical_description, entry.category));
            }
        }
        Ok(Heuristics {
            known_categories: counts.into_iter().map(|(c, _)| c).collect(),
            examples,
            amount_cents: Some(txn.amount_cents),
        })
    }

    /// Operator decision: cache `category` for `key` and apply it to every
    /// stored transaction with that key, categorized or not.
    pub fn set_manual(&self, key: &str, category: &str) -> Result<usize> {
        apply_manual(self.conn, key, category)
    }

    fn apply_to_uncategorized(&self, key: &str, result: &CategoryResult, source: Option<SourceKind>) -> Result<usize> {
        let n = self.conn.execute(
            "UPDATE transactions SET category = ?1, tags = ?2 \
             WHERE canonical_description = ?3 AND category IS NULL \
             AND (?4 = '' OR source = ?4)",
            rusqlite::params![
                result.category,
                result.tags,
                key,
                source.map(|s| s.key()).unwrap_or(""),
            ],
        )?;
        Ok(n)
    }

    /// Categorize uncategorized transactions group by group in Pareto order.
    /// `limit` caps the number of groups visited.
    pub fn run_pending(&self, source: Option<SourceKind>, limit: Option<usize>) -> Result<BulkReport> {
        self.run(source, limit, self.config.max_tier)
    }

    /// Tier 1 only: apply cached categories without search or AI.
    pub fn apply_cached(&self, source: Option<SourceKind>) -> Result<BulkReport> {
        self.run(source, None, Tier::Exact)
    }

    fn run(&self, source: Option<SourceKind>, limit: Option<usize>, max_tier: Tier) -> Result<BulkReport> {
        let pending = load_transactions(self.conn, source, true)?;
        let groups = prioritize(&pending);
        let limit = limit.unwrap_or(groups.len());

        let mut report = BulkReport::default();
        for group in groups.iter().take(limit) {
            let outcome = self.categorize_up_to(&group.representative, max_tier)?;
            report.groups += 1;
            report.record(&outcome);
            if let Outcome::Categorized(result) = &outcome {
                report.transactions_updated +=
                    self.apply_to_uncategorized(&group.canonical_description, result, source)?;
            }
        }
        info!(
            groups = report.groups,
            categorized = report.categorized(),
            unavailable = report.unavailable,
            unresolved = report.unresolved,
            conflicted = report.conflicted,
            updated = report.transactions_updated,
            "categorization pass finished"
        );
        Ok(report)
    }
}
