mod ai;
mod cache;
mod canonical;
mod cli;
mod db;
mod engine;
mod error;
mod fmt;
mod importer;
mod itau;
mod models;
mod pareto;
mod recanon;
mod reviewer;
mod search;
mod settings;
mod sources;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{CacheCommands, CategoryCommands, Cli, Commands};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db = cli.db.as_deref();

    let result = match cli.command {
        Commands::Init { data_dir } => cli::init::run(db, data_dir),
        Commands::Parse {
            files,
            source,
            output,
        } => cli::parse::run(&files, source.as_deref(), &output),
        Commands::Import {
            files,
            source,
            currency,
        } => cli::import::run(db, &files, source.as_deref(), currency.as_deref()),
        Commands::Category { command } => match command {
            CategoryCommands::Run {
                source,
                limit,
                max_tier,
            } => cli::category::run(db, source.as_deref(), limit, max_tier),
            CategoryCommands::Apply { source } => cli::category::apply(db, source.as_deref()),
            CategoryCommands::Pending { source, limit } => {
                cli::category::pending(db, source.as_deref(), limit)
            }
            CategoryCommands::Find {
                query,
                source,
                limit,
                top,
            } => cli::category::find(db, &query, source.as_deref(), limit, top),
            CategoryCommands::Set {
                description,
                category,
            } => cli::category::set(db, &description, &category),
            CategoryCommands::Recanon => cli::category::recanon(db),
            CategoryCommands::Conflicts => cli::category::conflicts(db),
            CategoryCommands::Resolve { key, category } => {
                cli::category::resolve(db, &key, &category)
            }
            CategoryCommands::Cache { command } => match command {
                CacheCommands::Export { path } => cli::category::cache_export(db, &path),
                CacheCommands::Import { path } => cli::category::cache_import(db, &path),
            },
        },
        Commands::Status => cli::status::run(db),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
