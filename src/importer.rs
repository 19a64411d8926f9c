use std::collections::BTreeSet;
use std::path::Path;

use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::canonical::canonicalize;
use crate::error::{Result, TallyError};
use crate::models::StandardRow;
use crate::sources::{source_from_file_name, SourceKind};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn compute_checksum(file_path: &Path) -> Result<String> {
    let data = std::fs::read(file_path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(hex::encode(hasher.finalize()))
}

/// Header aliases accepted for each standard column.
const ALIASES: &[(&str, &[&str])] = &[
    ("id", &["id"]),
    ("transaction_date", &["transaction_date", "date", "txn_date"]),
    ("payment_date", &["payment_date", "post_date"]),
    ("description", &["description", "desc", "details"]),
    ("amount", &["amount", "value"]),
    ("account", &["account", "acc", "source"]),
];

fn column_index(header: &csv::StringRecord, column: &str) -> Option<usize> {
    let names = ALIASES
        .iter()
        .find(|(name, _)| *name == column)
        .map(|(_, names)| *names)?;
    header
        .iter()
        .position(|h| names.contains(&h.trim().to_lowercase().as_str()))
}

/// Read a standard-format CSV into unvalidated rows.
pub fn read_standard_csv(file_path: &Path) -> Result<Vec<StandardRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(file_path)?;
    let header = rdr.headers()?.clone();
    let idx: Vec<Option<usize>> = ALIASES
        .iter()
        .map(|(name, _)| column_index(&header, name))
        .collect();
    if idx[1].is_none() || idx[3].is_none() || idx[4].is_none() {
        return Err(TallyError::Validation(format!(
            "{} is not a standard CSV (need transaction_date, description, amount)",
            file_path.display()
        )));
    }

    let field = |record: &csv::StringRecord, i: Option<usize>| -> String {
        i.and_then(|i| record.get(i)).unwrap_or("").to_string()
    };
    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result?;
        rows.push(StandardRow {
            id: field(&record, idx[0]),
            transaction_date: field(&record, idx[1]),
            payment_date: field(&record, idx[2]),
            description: field(&record, idx[3]),
            amount: field(&record, idx[4]),
            account: field(&record, idx[5]),
        });
    }
    Ok(rows)
}

/// Resolve the source of a standard CSV: a single-valued `account` column
/// wins, otherwise the file name decides.
pub fn detect_source(file_path: &Path) -> Result<SourceKind> {
    if let Ok(rows) = read_standard_csv(file_path) {
        let accounts: BTreeSet<&str> = rows
            .iter()
            .map(|r| r.account.trim())
            .filter(|a| !a.is_empty())
            .collect();
        if accounts.len() == 1 {
            if let Some(kind) = accounts.iter().next().and_then(|a| crate::sources::get_by_key(a)) {
                return Ok(kind);
            }
        }
    }
    source_from_file_name(file_path)
        .ok_or_else(|| TallyError::UnknownSource(file_path.display().to_string()))
}

// ---------------------------------------------------------------------------
// import_records / import_file
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportFailure {
    /// 1-based position of the row in the batch.
    pub position: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub inserted: usize,
    pub skipped_duplicate: usize,
    pub failed: Vec<ImportFailure>,
}

impl ImportReport {
    pub fn total(&self) -> usize {
        self.inserted + self.skipped_duplicate + self.failed.len()
    }
}

/// Insert `rows` with `raw_import_id` as the uniqueness key, tagging each with
/// `currency`. Re-running the same rows inserts nothing; invalid rows are
/// reported and skipped.
pub fn import_records(
    conn: &Connection,
    rows: &[StandardRow],
    source: SourceKind,
    currency: &str,
) -> Result<ImportReport> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO transactions \
         (raw_import_id, source, transaction_date, payment_date, description, canonical_description, amount_cents, currency) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
         ON CONFLICT(raw_import_id) DO NOTHING",
    )?;

    let mut report = ImportReport::default();
    for (i, row) in rows.iter().enumerate() {
        let position = i + 1;
        let prepared = row
            .validate(source)
            .and_then(|record| source.generate_id(&record, position).map(|id| (id, record)));
        let (raw_import_id, record) = match prepared {
            Ok(v) => v,
            Err(e @ (TallyError::Validation(_) | TallyError::MissingPaymentDate(_))) => {
                debug!(position, error = %e, "row rejected");
                report.failed.push(ImportFailure {
                    position,
                    reason: e.to_string(),
                });
                continue;
            }
            Err(e) => return Err(e),
        };

        let changed = stmt.execute(rusqlite::params![
            raw_import_id,
            source.key(),
            record.transaction_date.to_string(),
            record.payment_date.map(|d| d.to_string()),
            record.description,
            canonicalize(&record.description),
            record.amount_cents,
            currency,
        ])?;
        if changed == 0 {
            report.skipped_duplicate += 1;
        } else {
            report.inserted += 1;
        }
    }
    Ok(report)
}

/// Import a standard CSV inside one transaction and log the batch.
pub fn import_file(
    conn: &Connection,
    file_path: &Path,
    source: Option<SourceKind>,
    currency: &str,
) -> Result<ImportReport> {
    let source = match source {
        Some(kind) => kind,
        None => detect_source(file_path)?,
    };
    let rows = read_standard_csv(file_path)?;
    let checksum = compute_checksum(file_path)?;

    let tx = conn.unchecked_transaction()?;
    let report = import_records(&tx, &rows, source, currency)?;
    tx.execute(
        "INSERT INTO imports (filename, source, record_count, inserted, skipped, failed, checksum) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            file_path.file_name().and_then(|n| n.to_str()).unwrap_or(""),
            source.key(),
            rows.len() as i64,
            report.inserted as i64,
            report.skipped_duplicate as i64,
            report.failed.len() as i64,
            checksum,
        ],
    )?;
    tx.commit()?;

    info!(
        file = %file_path.display(),
        source = source.key(),
        currency,
        inserted = report.inserted,
        skipped = report.skipped_duplicate,
        failed = report.failed.len(),
        "import finished"
    );
    Ok(report)
}
