use std::path::Path;

use comfy_table::{Cell, Table};

use crate::cache::CategorizationCache;
use crate::error::Result;
use crate::fmt::money;
use crate::settings::load_settings;

pub fn run(db: Option<&Path>) -> Result<()> {
    let settings = load_settings();
    let db_path = db.map(Path::to_path_buf).unwrap_or_else(|| settings.db_path());

    println!("Data dir:   {}", settings.data_dir);
    println!("Database:   {}", db_path.display());
    println!("Currency:   {}", settings.currency);

    if !db_path.exists() {
        println!();
        println!("Database not found. Run `tally init` to set up.");
        return Ok(());
    }

    let conn = super::open_db(Some(&db_path))?;
    let cache = CategorizationCache::new(&conn);

    let transactions: i64 = conn.query_row("SELECT count(*) FROM transactions", [], |r| r.get(0))?;
    let uncategorized: i64 = conn.query_row(
        "SELECT count(*) FROM transactions WHERE category IS NULL",
        [],
        |r| r.get(0),
    )?;
    let imports: i64 = conn.query_row("SELECT count(*) FROM imports", [], |r| r.get(0))?;
    let conflicts = cache.conflicts()?;

    println!();
    println!("Transactions:   {transactions}");
    println!("Uncategorized:  {uncategorized}");
    println!("Cache entries:  {}", cache.len()?);
    println!("Conflicts:      {}", conflicts.len());
    println!("Imports:        {imports}");

    let mut stmt = conn.prepare(
        "SELECT source, count(*), sum(category IS NULL), sum(amount_cents) \
         FROM transactions GROUP BY source ORDER BY source",
    )?;
    let rows: Vec<(String, i64, i64, i64)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if !rows.is_empty() {
        let mut table = Table::new();
        table.set_header(vec!["Source", "Transactions", "Uncategorized", "Net"]);
        for (source, count, pending, net) in rows {
            table.add_row(vec![
                Cell::new(source),
                Cell::new(count),
                Cell::new(pending),
                Cell::new(money(net)),
            ]);
        }
        println!("\n{table}");
    }
    Ok(())
}
