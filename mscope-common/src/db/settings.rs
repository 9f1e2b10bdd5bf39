//! Settings database operations
//!
//! Typed get/set accessors over the `settings` key-value table.

use crate::{Error, Result};
use sqlx::{Pool, Sqlite};

/// Read a setting and parse it, `None` if absent or NULL
pub async fn get_setting<T>(db: &Pool<Sqlite>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let row: Option<(Option<String>,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await
        .map_err(Error::Database)?;

    match row {
        Some((Some(value),)) => {
            let parsed = value
                .trim()
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Parse setting '{}' failed: {}", key, e)))?;
            Ok(Some(parsed))
        }
        _ => Ok(None),
    }
}

/// Read a setting, falling back to `default` when absent
pub async fn get_setting_or<T>(db: &Pool<Sqlite>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_setting(db, key).await.map(|opt| opt.unwrap_or(default))
}

/// Insert or replace a setting
pub async fn set_setting<T>(db: &Pool<Sqlite>, key: &str, value: T) -> Result<()>
where
    T: std::fmt::Display,
{
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await
    .map_err(Error::Database)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::SqlitePool;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::create_settings_table(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_get_missing_setting() {
        let pool = setup_test_db().await;
        let value: Option<u64> = get_setting(&pool, "reconcile_interval_secs").await.unwrap();
        assert_eq!(value, None);
        assert_eq!(get_setting_or(&pool, "reconcile_interval_secs", 30u64).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let pool = setup_test_db().await;
        set_setting(&pool, "registry_max_attempts", 5u32).await.unwrap();
        set_setting(&pool, "registry_max_attempts", 7u32).await.unwrap();
        let value: Option<u32> = get_setting(&pool, "registry_max_attempts").await.unwrap();
        assert_eq!(value, Some(7));
    }

    #[tokio::test]
    async fn test_unparseable_setting_is_config_error() {
        let pool = setup_test_db().await;
        set_setting(&pool, "store_max_attempts", "lots").await.unwrap();
        let result: Result<Option<u32>> = get_setting(&pool, "store_max_attempts").await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
