//! SQLite connection management.
//!
//! Ficus talks to two kinds of SQLite databases: the coordination database
//! named in `[db]` (cache entries and claims) and one database per
//! `[sources.<name>]` entry that fact datasources write to. Both use WAL
//! mode so several workers can read while one writes.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::config::{Config, SourceConfig};

/// Connect to the coordination database.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    open_pool(&config.db.path, 5).await
}

/// Connect to a fact-datasource database.
pub async fn connect_source(source: &SourceConfig) -> Result<SqlitePool> {
    open_pool(&source.path, source.max_connections).await
}

async fn open_pool(db_path: &Path, max_connections: u32) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    Ok(pool)
}
