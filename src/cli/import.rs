use std::path::{Path, PathBuf};

use colored::Colorize;

use crate::error::Result;
use crate::importer::import_file;
use crate::settings::load_settings;

pub fn run(
    db: Option<&Path>,
    files: &[PathBuf],
    source: Option<&str>,
    currency: Option<&str>,
) -> Result<()> {
    let source = super::parse_source(source)?;
    let currency = match currency {
        Some(c) => c.trim().to_uppercase(),
        None => load_settings().currency,
    };
    let conn = super::open_db(db)?;

    for file in files {
        let report = import_file(&conn, file, source, &currency)?;
        println!(
            "{}: {} inserted, {} skipped (duplicates), {} failed",
            file.display(),
            report.inserted,
            report.skipped_duplicate,
            report.failed.len()
        );
        for failure in &report.failed {
            println!(
                "{}",
                format!("  row {}: {}", failure.position, failure.reason).yellow()
            );
        }
    }
    Ok(())
}
