//! Database initialization
//!
//! Opens (or creates) the SQLite database, applies connection pragmas and
//! makes sure the shared `settings` table exists with built-in defaults.
//! Module-specific tables are created by the module that owns them.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Busy timeout applied to every connection
const BUSY_TIMEOUT_MS: u64 = 5000;

/// Build the connection URL for a database file
pub fn database_url(db_path: &Path) -> String {
    format!("sqlite://{}?mode=rwc", db_path.display())
}

/// Open a pool for `db_url` with the standard pragmas (WAL, foreign keys, busy timeout)
///
/// Also used to re-establish the pool after a connectivity failure.
pub async fn connect_pool(db_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(db_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await?;

    debug!("Connected to database: {}", db_url);
    Ok(pool)
}

/// Initialize database connection and create shared tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let pool = connect_pool(&database_url(db_path)).await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_settings_table(&pool).await?;
    init_default_settings(&pool).await?;

    Ok(pool)
}

/// Create the key/value settings table
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Built-in defaults for every runtime setting
pub const DEFAULT_SETTINGS: &[(&str, &str)] = &[
    ("reconcile_enabled", "true"),
    ("reconcile_interval_secs", "1800"), // 30 minutes
    ("registry_max_attempts", "3"),
    ("registry_retry_backoff_ms", "100"),
    ("store_max_attempts", "3"),
    ("stale_temp_age_secs", "3600"),
    ("include_gaps", "false"),
];

/// Insert defaults for missing or NULL settings
pub async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    for (key, value) in DEFAULT_SETTINGS {
        ensure_setting(pool, key, value).await?;
    }
    Ok(())
}

async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    // INSERT OR IGNORE tolerates two processes initializing concurrently
    let inserted = sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(default_value)
        .execute(pool)
        .await?
        .rows_affected();

    if inserted > 0 {
        info!("Initialized setting '{}' with default value: {}", key, default_value);
        return Ok(());
    }

    let reset = sqlx::query("UPDATE settings SET value = ? WHERE key = ? AND value IS NULL")
        .bind(default_value)
        .bind(key)
        .execute(pool)
        .await?
        .rows_affected();

    if reset > 0 {
        info!("Setting '{}' was NULL, reset to default: {}", key, default_value);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_database_creates_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("sub").join("mscope.db");

        let pool = init_database(&db_path).await.unwrap();
        assert!(db_path.exists());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM settings")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count as usize, DEFAULT_SETTINGS.len());
    }

    #[tokio::test]
    async fn test_init_is_idempotent_and_preserves_values() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("mscope.db");

        let pool = init_database(&db_path).await.unwrap();
        sqlx::query("UPDATE settings SET value = '60' WHERE key = 'reconcile_interval_secs'")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("UPDATE settings SET value = NULL WHERE key = 'store_max_attempts'")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let pool = init_database(&db_path).await.unwrap();
        let interval: String =
            sqlx::query_scalar("SELECT value FROM settings WHERE key = 'reconcile_interval_secs'")
                .fetch_one(&pool)
                .await
                .unwrap();
        let attempts: String =
            sqlx::query_scalar("SELECT value FROM settings WHERE key = 'store_max_attempts'")
                .fetch_one(&pool)
                .await
                .unwrap();

        assert_eq!(interval, "60");
        assert_eq!(attempts, "3");
    }
}
