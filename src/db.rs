use std::path::{Path, PathBuf};
use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;

use crate::error::Result;

/// Open (creating if needed) the database and bring the schema up to date.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    if let Some(parent) = database_file(url).and_then(|p| p.parent().map(Path::to_path_buf)) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        // Ensure foreign keys are enabled
        .foreign_keys(true);
    let database = SqlitePoolOptions::new().connect_with(options).await?;
    migrate(&database).await?;
    info!("database {} ready", url);
    Ok(database)
}

/// Single-connection in-memory database; every pooled connection would
/// otherwise see its own empty database.
pub async fn connect_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let database = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    migrate(&database).await?;
    Ok(database)
}

/// File path behind a sqlite url, `None` for in-memory databases.
fn database_file(url: &str) -> Option<PathBuf> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    Some(PathBuf::from(path))
}

pub async fn migrate(database: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(database).await?;
    Ok(())
}
