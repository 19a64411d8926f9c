use std::path::{Path, PathBuf};

use colored::Colorize;

use crate::db::{get_connection, init_db};
use crate::error::Result;
use crate::settings::{load_settings, save_settings, settings_file_exists, shellexpand_path};

pub fn run(db: Option<&Path>, data_dir: Option<String>) -> Result<()> {
    // An explicit database only needs its schema.
    if let Some(path) = db {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = get_connection(path)?;
        init_db(&conn)?;
        println!("Initialized database at {}", path.display());
        return Ok(());
    }

    let mut settings = load_settings();
    let changed = data_dir.is_some();
    if let Some(dir) = data_dir {
        settings.data_dir = shellexpand_path(&dir);
    }
    if changed || !settings_file_exists() {
        save_settings(&settings)?;
    }

    let resolved = PathBuf::from(shellexpand_path(&settings.data_dir));
    std::fs::create_dir_all(&resolved)?;
    std::fs::create_dir_all(resolved.join("statements"))?;

    let conn = get_connection(&settings.db_path())?;
    init_db(&conn)?;

    println!("Initialized tally at {}", resolved.display());
    if std::env::var("OPENAI_API_KEY").map_or(true, |k| k.is_empty()) {
        println!(
            "{}",
            "OPENAI_API_KEY is not set; `category run` will stop at the search tier.".yellow()
        );
    }
    Ok(())
}
