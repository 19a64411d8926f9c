pub mod category;
pub mod import;
pub mod init;
pub mod parse;
pub mod status;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use rusqlite::Connection;

use crate::db::{get_connection, init_db};
use crate::error::Result;
use crate::settings::load_settings;
use crate::sources::SourceKind;

/// Open the store at `--db`, or at `<data_dir>/tally.db` from settings.
pub(crate) fn open_db(db: Option<&Path>) -> Result<Connection> {
    let path = match db {
        Some(p) => p.to_path_buf(),
        None => load_settings().db_path(),
    };
    let conn = get_connection(&path)?;
    init_db(&conn)?;
    Ok(conn)
}

pub(crate) fn parse_source(key: Option<&str>) -> Result<Option<SourceKind>> {
    key.map(str::parse).transpose()
}

#[derive(Parser)]
#[command(
    name = "tally",
    about = "Import bank statements and categorize transactions.",
    version
)]
pub struct Cli {
    /// Database path (default: <data_dir>/tally.db)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the data directory, settings and database.
    Init {
        /// Path for tally data (default: ~/Documents/tally)
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
    /// Parse raw statements (Itaú PDF, Nubank CSV) into a standard CSV.
    Parse {
        /// Raw statement files
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Source key (itau_cc, nubank_cc, nubank_chk); detected when omitted
        #[arg(long)]
        source: Option<String>,
        /// Standard CSV to append to
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Import standard CSV files into the database.
    Import {
        /// Standard CSV files
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Source key; detected from the account column or file name when omitted
        #[arg(long)]
        source: Option<String>,
        /// Currency code stored on each row; defaults to the configured currency
        #[arg(long)]
        currency: Option<String>,
    },
    /// Categorize transactions and maintain the category cache.
    Category {
        #[command(subcommand)]
        command: CategoryCommands,
    },
    /// Show database location and summary statistics.
    Status,
}

#[derive(Subcommand)]
pub enum CategoryCommands {
    /// Run the tiered engine over uncategorized transactions.
    Run {
        #[arg(long)]
        source: Option<String>,
        /// Maximum number of description groups to process
        #[arg(long)]
        limit: Option<usize>,
        /// Highest tier to use: 1 exact, 2 search, 3 AI
        #[arg(long = "max-tier", default_value_t = 3, value_parser = clap::value_parser!(u8).range(1..=3))]
        max_tier: u8,
    },
    /// Apply cached categories only (no search, no AI).
    Apply {
        #[arg(long)]
        source: Option<String>,
    },
    /// List uncategorized descriptions by frequency.
    Pending {
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Find statements by id or description glob and pick a category.
    Find {
        /// Statement id or glob such as "UBER*"
        query: String,
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Number of category suggestions
        #[arg(long, default_value_t = 5)]
        top: usize,
    },
    /// Set a category manually for a description and all its transactions.
    Set {
        /// Raw or canonical description
        description: String,
        category: String,
    },
    /// Recompute canonical descriptions and reconcile the cache.
    Recanon,
    /// List cache conflicts parked by recanon.
    Conflicts,
    /// Resolve a parked conflict with an explicit category.
    Resolve {
        /// Canonical description with conflicts
        key: String,
        category: String,
    },
    /// Export or import the category cache.
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Write the cache to a CSV file.
    Export { path: PathBuf },
    /// Upsert cache entries from a CSV file.
    Import { path: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_source() {
        assert_eq!(parse_source(None).unwrap(), None);
        assert_eq!(parse_source(Some("nubank_chk")).unwrap(), Some(SourceKind::NubankChecking));
        assert!(parse_source(Some("bofa")).is_err());
    }

    #[test]
    fn test_max_tier_range() {
        assert!(Cli::try_parse_from(["tally", "category", "run", "--max-tier", "4"]).is_err());
        let cli = Cli::try_parse_from(["tally", "--db", "x.db", "category", "run", "--max-tier", "2"]).unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("x.db")));
        match cli.command {
            Commands::Category {
                command: CategoryCommands::Run { max_tier, .. },
            } => assert_eq!(max_tier, 2),
            _ => panic!("wrong command"),
        }
    }
}
