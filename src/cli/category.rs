use std::path::Path;

use colored::Colorize;
use comfy_table::{Cell, Table};
use dialoguer::{Input, Select};
use rusqlite::Connection;

use crate::ai::{CategorySuggester, Heuristics, OpenAiSuggester};
use crate::cache::CategorizationCache;
use crate::canonical::canonicalize;
use crate::db::load_transactions;
use crate::engine::{apply_manual, BulkReport, CategorizationEngine, Tier};
use crate::error::{Result, TallyError};
use crate::fmt::{confidence, money};
use crate::models::Transaction;
use crate::pareto::prioritize;
use crate::recanon::{recanonicalize, resolve_conflict};
use crate::reviewer::{category_counts, find_statements, rank_categories};
use crate::search::CacheSearch;
use crate::settings::{load_settings, Settings};

fn api_key() -> Option<String> {
    std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty())
}

fn build_suggester(settings: &Settings) -> Result<Option<OpenAiSuggester>> {
    match api_key() {
        Some(key) => Ok(Some(OpenAiSuggester::new(settings.ai_config(key)?))),
        None => Ok(None),
    }
}

fn print_report(report: &BulkReport) {
    println!(
        "{} groups: {} exact, {} search, {} AI",
        report.groups, report.exact, report.search, report.ai
    );
    println!("{} transactions categorized", report.transactions_updated);
    if report.unresolved > 0 {
        println!("{}", format!("{} unresolved", report.unresolved).yellow());
    }
    if report.unavailable > 0 {
        println!("{}", format!("{} skipped, AI unavailable", report.unavailable).yellow());
    }
    if report.conflicted > 0 {
        println!(
            "{}",
            format!(
                "{} blocked by cache conflicts; see `tally category conflicts`",
                report.conflicted
            )
            .red()
        );
    }
}

fn interaction_error(e: dialoguer::Error) -> TallyError {
    TallyError::Other(format!("prompt failed: {e}"))
}

// ---------------------------------------------------------------------------
// run / apply / pending
// ---------------------------------------------------------------------------

pub fn run(db: Option<&Path>, source: Option<&str>, limit: Option<usize>, max_tier: u8) -> Result<()> {
    let source = super::parse_source(source)?;
    let max_tier = Tier::from_level(max_tier)
        .ok_or_else(|| TallyError::Other(format!("invalid tier {max_tier}")))?;
    let settings = load_settings();
    let conn = super::open_db(db)?;

    let suggester = if max_tier == Tier::Ai {
        build_suggester(&settings)?
    } else {
        None
    };
    match &suggester {
        Some(s) => println!("AI tier: {}", s.model()),
        None if max_tier == Tier::Ai => {
            eprintln!("{}", "OPENAI_API_KEY is not set; AI tier disabled.".yellow());
        }
        None => {}
    }

    let search = CacheSearch::new(&conn);
    let engine = CategorizationEngine::new(
        &conn,
        &search,
        suggester.as_ref().map(|s| s as &dyn CategorySuggester),
        settings.engine_config(max_tier),
    );
    let report = engine.run_pending(source, limit)?;
    print_report(&report);
    Ok(())
}

pub fn apply(db: Option<&Path>, source: Option<&str>) -> Result<()> {
    let source = super::parse_source(source)?;
    let settings = load_settings();
    let conn = super::open_db(db)?;
    let search = CacheSearch::new(&conn);
    let engine = CategorizationEngine::new(&conn, &search, None, settings.engine_config(Tier::Exact));
    let report = engine.apply_cached(source)?;
    print_report(&report);
    Ok(())
}

pub fn pending(db: Option<&Path>, source: Option<&str>, limit: usize) -> Result<()> {
    let source = super::parse_source(source)?;
    let conn = super::open_db(db)?;
    let uncategorized = load_transactions(&conn, source, true)?;
    if uncategorized.is_empty() {
        println!("{}", "No uncategorized transactions.".green());
        return Ok(());
    }
    let groups = prioritize(&uncategorized);

    let mut table = Table::new();
    table.set_header(vec!["#", "Canonical", "Count", "Example", "Amount"]);
    for (i, group) in groups.iter().take(limit).enumerate() {
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(&group.canonical_description),
            Cell::new(group.count),
            Cell::new(&group.representative.description),
            Cell::new(money(group.representative.amount_cents)),
        ]);
    }
    println!("Uncategorized\n{table}");
    println!(
        "{} transactions in {} groups",
        uncategorized.len(),
        groups.len()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// find
// ---------------------------------------------------------------------------

fn statements_table(statements: &[Transaction]) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["ID", "Date", "Source", "Description", "Amount", "Category"]);
    for txn in statements {
        table.add_row(vec![
            Cell::new(txn.id),
            Cell::new(txn.transaction_date),
            Cell::new(txn.source.key()),
            Cell::new(&txn.description),
            Cell::new(money(txn.amount_cents)),
            Cell::new(txn.category.as_deref().unwrap_or("")),
        ]);
    }
    table
}

fn choose_statement(statements: &[Transaction]) -> Result<Option<&Transaction>> {
    if statements.len() == 1 {
        return Ok(statements.first());
    }
    let items: Vec<String> = statements
        .iter()
        .map(|t| format!("#{} {} {}", t.id, t.transaction_date, t.description))
        .collect();
    let choice = Select::new()
        .with_prompt("Statement")
        .items(&items)
        .default(0)
        .interact_opt()
        .map_err(interaction_error)?;
    Ok(choice.map(|i| &statements[i]))
}

fn suggestions(conn: &Connection, txn: &Transaction, top: usize) -> Result<Vec<String>> {
    let key = &txn.canonical_description;
    let candidates: Vec<(String, String)> = CategorizationCache::new(conn)
        .entries()?
        .into_iter()
        .filter(|e| &e.canonical_description != key)
        .map(|e| (e.canonical_description, e.category))
        .collect();
    let counts = category_counts(conn)?;
    let ranked = rank_categories(key, &candidates, &counts, top);
    if !ranked.is_empty() {
        return Ok(ranked
            .into_iter()
            .map(|r| format!("{} ({:.2})", r.category, r.score))
            .collect());
    }

    let settings = load_settings();
    let Some(suggester) = build_suggester(&settings)? else {
        return Ok(Vec::new());
    };
    let mut known: Vec<(String, usize)> = counts.into_iter().collect();
    known.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let heuristics = Heuristics {
        known_categories: known.into_iter().map(|(c, _)| c).collect(),
        examples: Vec::new(),
        amount_cents: Some(txn.amount_cents),
    };
    match suggester.suggest_categories(&txn.description, &heuristics, top) {
        Ok(categories) => Ok(categories.into_iter().map(|c| format!("{c} (AI)")).collect()),
        Err(e) => {
            eprintln!("{}", format!("AI suggestions unavailable: {e}").yellow());
            Ok(Vec::new())
        }
    }
}

/// Strip the score/AI annotation from a suggestion label.
fn label_category(label: &str) -> &str {
    match label.rfind(" (") {
        Some(idx) if label.ends_with(')') => &label[..idx],
        _ => label,
    }
}

pub fn find(db: Option<&Path>, query: &str, source: Option<&str>, limit: usize, top: usize) -> Result<()> {
    let source = super::parse_source(source)?;
    let conn = super::open_db(db)?;
    let statements = find_statements(&conn, query, source, limit)?;
    if statements.is_empty() {
        println!("No statements match '{query}'.");
        return Ok(());
    }
    println!("{}", statements_table(&statements));

    let Some(txn) = choose_statement(&statements)? else {
        return Ok(());
    };
    let key = txn.canonical_description.as_str();
    let cache = CategorizationCache::new(&conn);
    if cache.has_conflict(key)? {
        return Err(TallyError::CacheInconsistency(key.to_string()));
    }
    println!("Canonical:   {key}");
    match cache.lookup_exact(key)? {
        Some(entry) => {
            println!(
                "Cached:      {} ({}, {})",
                entry.category,
                entry.source,
                confidence(entry.confidence)
            );
            if let Some(tags) = &entry.tags {
                println!("Tags:        {tags}");
            }
        }
        None => println!("Cached:      (none)"),
    }

    let mut options = suggestions(&conn, txn, top)?;
    let new_idx = options.len();
    options.push("Enter a new category".to_string());
    options.push("Skip".to_string());

    let choice = Select::new()
        .with_prompt("Category")
        .items(&options)
        .default(0)
        .interact_opt()
        .map_err(interaction_error)?;
    let category = match choice {
        Some(i) if i < new_idx => label_category(&options[i]).to_string(),
        Some(i) if i == new_idx => Input::<String>::new()
            .with_prompt("Category")
            .interact_text()
            .map_err(interaction_error)?
            .trim()
            .to_string(),
        _ => return Ok(()),
    };
    if category.is_empty() {
        return Ok(());
    }

    let updated = apply_manual(&conn, key, &category)?;
    println!(
        "{}",
        format!("\u{2192} {updated} transactions set to {category}").green()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// set / recanon / conflicts / resolve / cache
// ---------------------------------------------------------------------------

pub fn set(db: Option<&Path>, description: &str, category: &str) -> Result<()> {
    let key = canonicalize(description);
    if key.is_empty() {
        return Err(TallyError::Validation(format!(
            "'{description}' has an empty canonical form"
        )));
    }
    let conn = super::open_db(db)?;
    if CategorizationCache::new(&conn).has_conflict(&key)? {
        return Err(TallyError::CacheInconsistency(key));
    }
    let search = CacheSearch::new(&conn);
    let engine = CategorizationEngine::new(&conn, &search, None, load_settings().engine_config(Tier::Exact));
    let updated = engine.set_manual(&key, category.trim())?;
    println!("'{key}' \u{2192} {} ({updated} transactions)", category.trim());
    Ok(())
}

pub fn recanon(db: Option<&Path>) -> Result<()> {
    let conn = super::open_db(db)?;
    let report = recanonicalize(&conn)?;
    println!("{} statements re-keyed", report.statements_updated);
    println!(
        "{} cache entries re-keyed, {} merged",
        report.cache_rekeyed, report.cache_merged
    );
    for conflict in &report.conflicts {
        println!(
            "{}",
            format!(
                "conflict: '{}' <- {} ({})",
                conflict.canonical_description,
                conflict.previous_keys.join(", "),
                conflict.categories.join(" / ")
            )
            .red()
        );
    }
    if !report.conflicts.is_empty() {
        println!("Resolve with `tally category resolve <key> <category>`.");
    }
    Ok(())
}

pub fn conflicts(db: Option<&Path>) -> Result<()> {
    let conn = super::open_db(db)?;
    let conflicts = CategorizationCache::new(&conn).conflicts()?;
    if conflicts.is_empty() {
        println!("{}", "No cache conflicts.".green());
        return Ok(());
    }
    let mut table = Table::new();
    table.set_header(vec!["Key", "Previous key", "Category", "Source", "Confidence", "Updated"]);
    for c in &conflicts {
        table.add_row(vec![
            Cell::new(&c.canonical_description),
            Cell::new(&c.previous_key),
            Cell::new(&c.category),
            Cell::new(c.source),
            Cell::new(confidence(c.confidence)),
            Cell::new(&c.updated_at),
        ]);
    }
    println!("Cache conflicts\n{table}");
    Ok(())
}

pub fn resolve(db: Option<&Path>, key: &str, category: &str) -> Result<()> {
    let conn = super::open_db(db)?;
    let updated = resolve_conflict(&conn, key, category.trim())?;
    println!(
        "{}",
        format!("Resolved '{key}' \u{2192} {} ({updated} transactions)", category.trim()).green()
    );
    Ok(())
}

pub fn cache_export(db: Option<&Path>, path: &Path) -> Result<()> {
    let conn = super::open_db(db)?;
    let n = CategorizationCache::new(&conn).export_csv(path)?;
    println!("{n} cache entries written to {}", path.display());
    Ok(())
}

pub fn cache_import(db: Option<&Path>, path: &Path) -> Result<()> {
    let conn = super::open_db(db)?;
    let n = CategorizationCache::new(&conn).import_csv(path)?;
    println!("{n} cache entries imported from {}", path.display());
    Ok(())
}
