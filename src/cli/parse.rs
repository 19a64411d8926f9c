use std::path::{Path, PathBuf};

use colored::Colorize;

use crate::error::{Result, TallyError};
use crate::sources::{get_for_file, write_standard_csv};

pub fn run(files: &[PathBuf], source: Option<&str>, output: &Path) -> Result<()> {
    let forced = super::parse_source(source)?;

    let mut total_written = 0usize;
    for file in files {
        let kind = match forced {
            Some(kind) => kind,
            None => get_for_file(file)
                .ok_or_else(|| TallyError::UnknownSource(file.display().to_string()))?,
        };
        let records = kind.parse(file)?;
        let written = write_standard_csv(output, &records)?;
        total_written += written;
        println!(
            "{}: {} parsed, {} new ({})",
            file.display(),
            records.len(),
            written,
            kind.name()
        );
    }
    println!(
        "{}",
        format!("{total_written} rows written to {}", output.display()).green()
    );
    Ok(())
}
