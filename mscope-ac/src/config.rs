//! Runtime configuration for mscope-ac
//!
//! Loaded from the `settings` table; any missing or unparseable value falls
//! back to the built-in default with a warning.

use crate::analysis::AnalysisOptions;
use crate::utils::retry::RetryPolicy;
use mscope_common::db::settings::get_setting_or;
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Service and reconciliation configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Run the periodic reconciliation loop (default: true)
    pub reconcile_enabled: bool,

    /// Seconds between reconciliation passes (default: 1800)
    pub reconcile_interval_secs: u64,

    /// Registry attempts per call, including the first (default: 3)
    pub registry_max_attempts: u32,

    /// First registry backoff, doubled per retry (default: 100ms)
    pub registry_retry_backoff_ms: u64,

    /// Artifact I/O attempts per call (default: 3)
    pub store_max_attempts: u32,

    /// Temp files older than this are crash leftovers (default: 3600s)
    pub stale_temp_age_secs: u64,

    /// Count gap symbols as residues (default: false)
    pub include_gaps: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            reconcile_enabled: true,
            reconcile_interval_secs: 1800,
            registry_max_attempts: 3,
            registry_retry_backoff_ms: 100,
            store_max_attempts: 3,
            stale_temp_age_secs: 3600,
            include_gaps: false,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from database settings, falling back to defaults
    pub async fn from_database(db_pool: &Pool<Sqlite>) -> Self {
        let defaults = Self::default();

        Self {
            reconcile_enabled: load(db_pool, "reconcile_enabled", defaults.reconcile_enabled).await,
            reconcile_interval_secs: load(db_pool, "reconcile_interval_secs", defaults.reconcile_interval_secs)
                .await
                .max(1),
            registry_max_attempts: load(db_pool, "registry_max_attempts", defaults.registry_max_attempts)
                .await
                .max(1),
            registry_retry_backoff_ms: load(
                db_pool,
                "registry_retry_backoff_ms",
                defaults.registry_retry_backoff_ms,
            )
            .await,
            store_max_attempts: load(db_pool, "store_max_attempts", defaults.store_max_attempts)
                .await
                .max(1),
            stale_temp_age_secs: load(db_pool, "stale_temp_age_secs", defaults.stale_temp_age_secs).await,
            include_gaps: load(db_pool, "include_gaps", defaults.include_gaps).await,
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn stale_temp_age(&self) -> Duration {
        Duration::from_secs(self.stale_temp_age_secs)
    }

    /// Retry policy for registry calls
    pub fn registry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.registry_max_attempts,
            Duration::from_millis(self.registry_retry_backoff_ms),
        )
    }

    /// Retry policy for artifact I/O; shares the registry backoff
    pub fn store_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.store_max_attempts,
            Duration::from_millis(self.registry_retry_backoff_ms),
        )
    }

    pub fn analysis_options(&self) -> AnalysisOptions {
        AnalysisOptions {
            include_gaps: self.include_gaps,
            ..AnalysisOptions::default()
        }
    }
}

async fn load<T>(db_pool: &Pool<Sqlite>, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Clone,
    T::Err: std::fmt::Display,
{
    match get_setting_or(db_pool, key, default.clone()).await {
        Ok(value) => value,
        Err(e) => {
            warn!(setting = key, error = %e, "Invalid setting, using default {}", default);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mscope_common::db::init_database;
    use mscope_common::db::settings::set_setting;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_defaults_from_fresh_database() {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("mscope.db")).await.unwrap();

        let config = ServiceConfig::from_database(&pool).await;
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.reconcile_interval(), Duration::from_secs(30 * 60));
    }

    #[tokio::test]
    async fn test_overrides_and_bad_values() {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("mscope.db")).await.unwrap();
        set_setting(&pool, "reconcile_interval_secs", 60).await.unwrap();
        set_setting(&pool, "include_gaps", true).await.unwrap();
        set_setting(&pool, "registry_max_attempts", "lots").await.unwrap();

        let config = ServiceConfig::from_database(&pool).await;
        assert_eq!(config.reconcile_interval_secs, 60);
        assert!(config.include_gaps);
        assert!(config.analysis_options().include_gaps);
        assert_eq!(config.registry_max_attempts, 3);
        assert_eq!(config.registry_policy().max_attempts, 3);
    }
}
