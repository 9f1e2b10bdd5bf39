//! Consistency registry
//!
//! The authoritative index of live records, stored in the `records` table of
//! the shared SQLite database. Every call runs through [`Registry::with_retry`]:
//! lock contention backs off, lost connectivity backs off and rebuilds the
//! pool, and anything else fails immediately. Once the attempt budget is spent
//! the caller gets `RegistryUnavailable`.
//!
//! `create` is only called after the referenced artifacts are on disk, and
//! callers clean up artifacts only after `delete` returns.

pub mod models;

pub use models::{Record, RecordPatch, RecordStatus, RecordSummary, RegistryStatistics, Workspace};

use crate::error::{IntegrityError, Result};
use crate::utils::retry::{classify_sqlx, RetryAction, RetryPolicy};
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use mscope_common::db::connect_pool;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::future::Future;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const RECORD_COLUMNS: &str = "guid, workspace, keyword, display_name, created_at, status, \
     total_positions, mutation_count, summary, source_ref, results_ref, export_ref";

/// Create the records table and its scope index
pub async fn create_records_table(pool: &SqlitePool) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            guid TEXT PRIMARY KEY,
            workspace TEXT NOT NULL CHECK (workspace IN ('denv', 'chikv')),
            keyword TEXT NOT NULL,
            display_name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'healthy' CHECK (status IN ('healthy', 'partial')),
            total_positions INTEGER NOT NULL DEFAULT 0,
            mutation_count INTEGER NOT NULL DEFAULT 0,
            summary TEXT NOT NULL,
            source_ref TEXT,
            results_ref TEXT,
            export_ref TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_scope ON records (workspace, keyword, created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// SQLite-backed record registry
pub struct Registry {
    db_url: String,
    pool: RwLock<SqlitePool>,
    policy: RetryPolicy,
}

impl Registry {
    /// Wrap an open pool and make sure the records table exists
    pub async fn new(db_url: impl Into<String>, pool: SqlitePool, policy: RetryPolicy) -> Result<Self> {
        create_records_table(&pool).await?;
        Ok(Self {
            db_url: db_url.into(),
            pool: RwLock::new(pool),
            policy,
        })
    }

    /// Open a fresh pool for `db_url`
    pub async fn connect(db_url: impl Into<String>, policy: RetryPolicy) -> Result<Self> {
        let db_url = db_url.into();
        let pool = connect_pool(&db_url).await?;
        Self::new(db_url, pool, policy).await
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Current pool handle
    pub async fn pool(&self) -> SqlitePool {
        self.pool.read().await.clone()
    }

    /// Close the pool; the next call reconnects
    pub async fn close(&self) {
        self.pool.read().await.close().await;
    }

    pub async fn create(&self, record: &Record) -> Result<()> {
        let summary = serde_json::to_string(&record.summary)?;
        let created_at = format_timestamp(&record.created_at);

        self.with_retry("create", |pool| {
            let summary = summary.as_str();
            let created_at = created_at.as_str();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO records (guid, workspace, keyword, display_name, created_at, status,
                                         total_positions, mutation_count, summary,
                                         source_ref, results_ref, export_ref)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(record.id.to_string())
                .bind(record.workspace.as_str())
                .bind(&record.keyword)
                .bind(&record.display_name)
                .bind(created_at)
                .bind(record.status.as_str())
                .bind(record.summary.total_positions as i64)
                .bind(record.summary.mutation_count as i64)
                .bind(summary)
                .bind(record.source_ref.as_deref())
                .bind(record.results_ref.as_deref())
                .bind(record.export_ref.as_deref())
                .execute(&pool)
                .await?;
                Ok::<_, sqlx::Error>(())
            }
        })
        .await?;

        debug!(record_id = %record.id, workspace = %record.workspace, "Record created");
        Ok(())
    }

    /// Apply `patch` atomically. Returns the updated record, `None` if absent.
    pub async fn update(&self, id: Uuid, patch: &RecordPatch) -> Result<Option<Record>> {
        let updated = self
            .with_retry("update", |pool| async move {
                let mut tx = pool.begin().await?;

                let row = sqlx::query(&format!("SELECT {} FROM records WHERE guid = ?", RECORD_COLUMNS))
                    .bind(id.to_string())
                    .fetch_optional(&mut *tx)
                    .await?;
                let Some(row) = row else {
                    return Ok(None);
                };

                let mut record = record_from_row(&row)?;
                record.apply(patch);
                let summary = serde_json::to_string(&record.summary)
                    .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

                sqlx::query(
                    r#"
                    UPDATE records
                    SET display_name = ?, status = ?, total_positions = ?, mutation_count = ?,
                        summary = ?, source_ref = ?, results_ref = ?, export_ref = ?
                    WHERE guid = ?
                    "#,
                )
                .bind(&record.display_name)
                .bind(record.status.as_str())
                .bind(record.summary.total_positions as i64)
                .bind(record.summary.mutation_count as i64)
                .bind(summary)
                .bind(record.source_ref.as_deref())
                .bind(record.results_ref.as_deref())
                .bind(record.export_ref.as_deref())
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok::<_, sqlx::Error>(Some(record))
            })
            .await?;

        if updated.is_some() {
            debug!(record_id = %id, "Record updated");
        }
        Ok(updated)
    }

    /// Delete a record. Returns it if it existed.
    pub async fn delete(&self, id: Uuid) -> Result<Option<Record>> {
        let deleted = self
            .with_retry("delete", |pool| async move {
                let row = sqlx::query(&format!("DELETE FROM records WHERE guid = ? RETURNING {}", RECORD_COLUMNS))
                    .bind(id.to_string())
                    .fetch_optional(&pool)
                    .await?;
                row.as_ref().map(record_from_row).transpose()
            })
            .await?;

        if deleted.is_some() {
            debug!(record_id = %id, "Record deleted");
        }
        Ok(deleted)
    }

    /// Fetch by id; with a keyword, the record must also carry that keyword
    pub async fn get(&self, id: Uuid, keyword: Option<&str>) -> Result<Option<Record>> {
        self.with_retry("get", |pool| async move {
            let row = sqlx::query(&format!(
                "SELECT {} FROM records WHERE guid = ? AND (? IS NULL OR keyword = ?)",
                RECORD_COLUMNS
            ))
            .bind(id.to_string())
            .bind(keyword)
            .bind(keyword)
            .fetch_optional(&pool)
            .await?;
            row.as_ref().map(record_from_row).transpose()
        })
        .await
    }

    /// Records of one scope, newest first
    pub async fn list(&self, workspace: Workspace, keyword: &str, limit: Option<u32>) -> Result<Vec<Record>> {
        // SQLite treats a negative LIMIT as unbounded
        let limit = limit.map(i64::from).unwrap_or(-1);

        self.with_retry("list", |pool| async move {
            let rows = sqlx::query(&format!(
                "SELECT {} FROM records WHERE workspace = ? AND keyword = ? \
                 ORDER BY created_at DESC, guid LIMIT ?",
                RECORD_COLUMNS
            ))
            .bind(workspace.as_str())
            .bind(keyword)
            .bind(limit)
            .fetch_all(&pool)
            .await?;
            records_from_rows(&rows)
        })
        .await
    }

    /// Every record, oldest first
    pub async fn list_all(&self) -> Result<Vec<Record>> {
        self.with_retry("list_all", |pool| async move {
            let rows = sqlx::query(&format!("SELECT {} FROM records ORDER BY created_at, guid", RECORD_COLUMNS))
                .fetch_all(&pool)
                .await?;
            records_from_rows(&rows)
        })
        .await
    }

    pub async fn ids(&self) -> Result<Vec<Uuid>> {
        self.with_retry("ids", |pool| async move {
            let rows = sqlx::query("SELECT guid FROM records ORDER BY created_at, guid")
                .fetch_all(&pool)
                .await?;
            rows.iter()
                .map(|row| parse_uuid(&row.get::<String, _>("guid")))
                .collect::<std::result::Result<Vec<Uuid>, sqlx::Error>>()
        })
        .await
    }

    pub async fn exists(&self, id: Uuid) -> Result<bool> {
        self.with_retry("exists", |pool| async move {
            let row = sqlx::query("SELECT 1 FROM records WHERE guid = ?")
                .bind(id.to_string())
                .fetch_optional(&pool)
                .await?;
            Ok::<_, sqlx::Error>(row.is_some())
        })
        .await
    }

    /// Delete every record of one scope in a single transaction
    pub async fn delete_scope(&self, workspace: Workspace, keyword: &str) -> Result<Vec<Record>> {
        let deleted = self
            .with_retry("delete_scope", |pool| async move {
                let mut tx = pool.begin().await?;
                let rows = sqlx::query(&format!(
                    "DELETE FROM records WHERE workspace = ? AND keyword = ? RETURNING {}",
                    RECORD_COLUMNS
                ))
                .bind(workspace.as_str())
                .bind(keyword)
                .fetch_all(&mut *tx)
                .await?;
                let records = records_from_rows(&rows)?;
                tx.commit().await?;
                Ok::<_, sqlx::Error>(records)
            })
            .await?;

        info!(workspace = %workspace, deleted = deleted.len(), "Scope cleared");
        Ok(deleted)
    }

    pub async fn statistics(&self) -> Result<RegistryStatistics> {
        let cutoff = format_timestamp(&(Utc::now() - ChronoDuration::days(7)));

        let rows = self
            .with_retry("statistics", |pool| {
                let cutoff = cutoff.as_str();
                async move {
                    sqlx::query(
                        r#"
                        SELECT workspace,
                               COUNT(*) AS records,
                               SUM(CASE WHEN created_at >= ? THEN 1 ELSE 0 END) AS recent,
                               COALESCE(SUM(total_positions), 0) AS positions,
                               COALESCE(SUM(mutation_count), 0) AS mutations
                        FROM records
                        GROUP BY workspace
                        "#,
                    )
                    .bind(cutoff)
                    .fetch_all(&pool)
                    .await
                }
            })
            .await?;

        let mut stats = RegistryStatistics::default();
        for row in rows {
            let workspace: Workspace = row
                .get::<String, _>("workspace")
                .parse()
                .map_err(IntegrityError::InvalidInput)?;
            let records = row.get::<i64, _>("records") as u64;
            stats.per_workspace.insert(workspace, records);
            stats.total_records += records;
            stats.recent_records += row.get::<i64, _>("recent") as u64;
            stats.total_positions += row.get::<i64, _>("positions") as u64;
            stats.total_mutations += row.get::<i64, _>("mutations") as u64;
        }

        Ok(stats)
    }

    /// Run `operation` against the pool, retrying transient failures
    async fn with_retry<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut(SqlitePool) -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let pool = self.pool().await;

            let err = match operation(pool).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = operation_name, attempt, "Registry operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let action = classify_sqlx(&err);
            if action == RetryAction::Fail {
                return Err(err.into());
            }

            if attempt >= self.policy.max_attempts {
                error!(
                    operation = operation_name,
                    attempt,
                    error = %err,
                    "Registry operation failed: retries exhausted"
                );
                return Err(IntegrityError::RegistryUnavailable {
                    attempts: attempt,
                    message: err.to_string(),
                });
            }

            let backoff = self.policy.backoff(attempt);
            warn!(
                operation = operation_name,
                attempt,
                backoff_ms = backoff.as_millis(),
                reconnect = (action == RetryAction::Reconnect),
                error = %err,
                "Registry operation failed, will retry after backoff"
            );
            tokio::time::sleep(backoff).await;

            if action == RetryAction::Reconnect {
                self.reconnect().await;
            }
        }
    }

    async fn reconnect(&self) {
        match connect_pool(&self.db_url).await {
            Ok(fresh) => {
                let stale = std::mem::replace(&mut *self.pool.write().await, fresh);
                stale.close().await;
                info!("Registry reconnected");
            }
            Err(e) => warn!(error = %e, "Registry reconnect failed"),
        }
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::Decode(message.into())
}

fn parse_uuid(value: &str) -> std::result::Result<Uuid, sqlx::Error> {
    Uuid::parse_str(value).map_err(|e| decode_error(format!("invalid record id '{}': {}", value, e)))
}

fn records_from_rows(rows: &[SqliteRow]) -> std::result::Result<Vec<Record>, sqlx::Error> {
    rows.iter().map(record_from_row).collect()
}

fn record_from_row(row: &SqliteRow) -> std::result::Result<Record, sqlx::Error> {
    let created_at: String = row.try_get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| decode_error(format!("invalid created_at '{}': {}", created_at, e)))?
        .with_timezone(&Utc);
    let summary: String = row.try_get("summary")?;

    Ok(Record {
        id: parse_uuid(&row.try_get::<String, _>("guid")?)?,
        workspace: row.try_get::<String, _>("workspace")?.parse().map_err(decode_error)?,
        keyword: row.try_get("keyword")?,
        display_name: row.try_get("display_name")?,
        created_at,
        status: row.try_get::<String, _>("status")?.parse().map_err(decode_error)?,
        summary: serde_json::from_str(&summary).map_err(|e| decode_error(format!("invalid summary: {}", e)))?,
        source_ref: row.try_get("source_ref")?,
        results_ref: row.try_get("results_ref")?,
        export_ref: row.try_get("export_ref")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::SummaryStats;
    use mscope_common::db::database_url;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn open_registry() -> (TempDir, Registry) {
        let dir = TempDir::new().unwrap();
        let url = database_url(&dir.path().join("mscope.db"));
        let registry = Registry::connect(url, RetryPolicy::new(3, Duration::from_millis(1)))
            .await
            .unwrap();
        (dir, registry)
    }

    fn summary(total: u32, mutated: &[u32]) -> SummaryStats {
        SummaryStats {
            total_positions: total,
            mutation_count: mutated.len() as u32,
            low_confidence_count: 0,
            mutated_positions: mutated.to_vec(),
            low_confidence_positions: vec![],
        }
    }

    #[tokio::test]
    async fn test_create_get_round_trip() {
        let (_dir, registry) = open_registry().await;
        let record = Record::new(Uuid::new_v4(), Workspace::Denv, "lab", "sample", summary(10, &[3, 7]));
        registry.create(&record).await.unwrap();

        let fetched = registry.get(record.id, None).await.unwrap().unwrap();
        assert_eq!(fetched, record);
        assert_eq!(registry.get(record.id, Some("lab")).await.unwrap(), Some(record.clone()));
        assert_eq!(registry.get(record.id, Some("other")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_scoped_newest_first() {
        let (_dir, registry) = open_registry().await;
        let mut ids = Vec::new();
        for i in 0..3 {
            let record = Record::new(Uuid::new_v4(), Workspace::Chikv, "k", format!("r{}", i), summary(1, &[]));
            registry.create(&record).await.unwrap();
            ids.push(record.id);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let other = Record::new(Uuid::new_v4(), Workspace::Denv, "k", "x", summary(1, &[]));
        registry.create(&other).await.unwrap();

        let listed: Vec<Uuid> = registry
            .list(Workspace::Chikv, "k", None)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        ids.reverse();
        assert_eq!(listed, ids);

        assert_eq!(registry.list(Workspace::Chikv, "k", Some(2)).await.unwrap().len(), 2);
        assert!(registry.list(Workspace::Chikv, "nope", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let (_dir, registry) = open_registry().await;
        let record = Record::new(Uuid::new_v4(), Workspace::Denv, "k", "x", summary(4, &[1]));
        registry.create(&record).await.unwrap();

        let updated = registry
            .update(record.id, &RecordPatch::status(RecordStatus::Partial))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, RecordStatus::Partial);
        assert_eq!(registry.get(record.id, None).await.unwrap().unwrap().status, RecordStatus::Partial);

        let deleted = registry.delete(record.id).await.unwrap().unwrap();
        assert_eq!(deleted.id, record.id);
        assert!(registry.delete(record.id).await.unwrap().is_none());
        assert!(registry
            .update(record.id, &RecordPatch::status(RecordStatus::Healthy))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delete_scope_and_statistics() {
        let (_dir, registry) = open_registry().await;
        for _ in 0..2 {
            let r = Record::new(Uuid::new_v4(), Workspace::Denv, "a", "x", summary(10, &[1, 2]));
            registry.create(&r).await.unwrap();
        }
        let keep = Record::new(Uuid::new_v4(), Workspace::Chikv, "a", "y", summary(5, &[]));
        registry.create(&keep).await.unwrap();

        let stats = registry.statistics().await.unwrap();
        assert_eq!(stats.total_records, 3);
        assert_eq!(stats.recent_records, 3);
        assert_eq!(stats.per_workspace.get(&Workspace::Denv), Some(&2));
        assert_eq!(stats.total_positions, 25);
        assert_eq!(stats.total_mutations, 4);

        let removed = registry.delete_scope(Workspace::Denv, "a").await.unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.ids().await.unwrap(), vec![keep.id]);
    }

    #[tokio::test]
    async fn test_reconnects_after_pool_closed() {
        let (_dir, registry) = open_registry().await;
        let record = Record::new(Uuid::new_v4(), Workspace::Denv, "k", "x", summary(1, &[]));
        registry.create(&record).await.unwrap();

        registry.close().await;
        assert!(registry.exists(record.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_database_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let db_dir = dir.path().join("db");
        std::fs::create_dir_all(&db_dir).unwrap();
        let url = database_url(&db_dir.join("mscope.db"));
        let registry = Registry::connect(url, RetryPolicy::new(3, Duration::from_millis(1)))
            .await
            .unwrap();

        // Closed pool and nowhere to reconnect to
        registry.close().await;
        std::fs::remove_dir_all(&db_dir).unwrap();

        let err = registry.ids().await.unwrap_err();
        assert!(
            matches!(err, IntegrityError::RegistryUnavailable { attempts: 3, .. }),
            "unexpected error: {}",
            err
        );
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_non_transient_error_fails_fast() {
        let (_dir, registry) = open_registry().await;
        let record = Record::new(Uuid::new_v4(), Workspace::Denv, "k", "x", summary(1, &[]));
        registry.create(&record).await.unwrap();

        // Primary key violation
        let err = registry.create(&record).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
