// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite persistence for [`SyncRecord`]s.
//!
//! Queues live in memory; what each node has acknowledged does not. After a
//! hub restart the tracker compares desired state against these records and
//! resends only the gap instead of replaying every object to every node.
//!
//! # Debounced Writes
//!
//! - [`NodeQueue`](crate::queue::NodeQueue) marks records dirty as sends and acks happen
//! - The coordinator's flush task drains dirty records and calls [`SyncStore::persist`]
//! - Records that fail to persist are handed back to the queue and retried next flush
//! - Shutdown runs one last flush before [`SyncStore::close`]
//!
//! A crash between an ack and the next flush means the record on disk is one
//! flush interval behind, so the node gets a few already-acknowledged
//! versions again. Duplicate delivery is allowed; loss is not.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY / SQLITE_LOCKED are retried with exponential backoff
//! (10ms doubling to 500ms, 5 attempts).

use crate::config::SyncStoreConfig;
use crate::error::{HubError, Result};
use crate::message::{NodeIdentity, ResourcePath};
use crate::queue::SyncRecord;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const IN_MEMORY: &str = ":memory:";

/// SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(operation = operation_name, attempts, delay_ms, "SQLite busy, retrying");
                crate::metrics::sync_store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Outcome of one [`SyncStore::persist`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub flushed: usize,
    /// Records that failed to write; hand these back to the queue.
    pub failed: Vec<SyncRecord>,
    /// Removals that failed to apply.
    pub failed_removals: Vec<ResourcePath>,
}

impl PersistReport {
    pub fn errors(&self) -> usize {
        self.failed.len() + self.failed_removals.len()
    }
}

/// SQLite-backed sync record table.
pub struct SyncStore {
    pool: SqlitePool,
    path: String,
}

impl SyncStore {
    pub async fn open(config: &SyncStoreConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        info!(path = %path, "Opening sync store");

        let (options, max_connections) = if path == IN_MEMORY {
            // Every connection to :memory: is a separate database
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| HubError::Config(format!("invalid SQLite path: {}", e)))?;
            (options, 1)
        } else {
            let journal = if config.wal_mode {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            };
            let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
                .map_err(|e| HubError::Config(format!("invalid SQLite path: {}", e)))?
                .journal_mode(journal)
                .synchronous(SqliteSynchronous::Normal)
                .create_if_missing(true);
            (options, 2)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_records (
                node TEXT NOT NULL,
                resource TEXT NOT NULL,
                last_sent INTEGER NOT NULL,
                last_acked INTEGER NOT NULL,
                deletion_pending INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (node, resource)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Every stored record. Rows with an invalid node name are skipped.
    pub async fn load_all(&self) -> Result<Vec<SyncRecord>> {
        let rows: Vec<(String, String, i64, i64, bool, i64)> = sqlx::query_as(
            "SELECT node, resource, last_sent, last_acked, deletion_pending, updated_at FROM sync_records",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for (node, resource, last_sent, last_acked, deletion_pending, updated_at) in rows {
            let node = match NodeIdentity::new(node.clone()) {
                Ok(node) => node,
                Err(e) => {
                    warn!(node = %node, error = %e, "Skipping sync record with invalid node");
                    continue;
                }
            };
            let last_acked = last_acked.max(0) as u64;
            records.push(SyncRecord {
                node,
                resource: ResourcePath::new(resource),
                last_sent: (last_sent.max(0) as u64).max(last_acked),
                last_acked,
                deletion_pending,
                updated_at,
            });
        }

        if !records.is_empty() {
            info!(count = records.len(), "Restored sync records from previous run");
        }
        Ok(records)
    }

    /// Upsert `records` and delete `removed` for `node`.
    ///
    /// Never fails as a whole; per-row failures are reported back.
    pub async fn persist(&self, node: &NodeIdentity, records: Vec<SyncRecord>, removed: Vec<ResourcePath>) -> PersistReport {
        let mut report = PersistReport::default();
        let pool = &self.pool;

        for record in records {
            let result = execute_with_retry("sync_record_upsert", || async {
                sqlx::query(
                    r#"
                    INSERT INTO sync_records (node, resource, last_sent, last_acked, deletion_pending, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT(node, resource) DO UPDATE SET
                        last_sent = excluded.last_sent,
                        last_acked = excluded.last_acked,
                        deletion_pending = excluded.deletion_pending,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(record.node.as_str())
                .bind(record.resource.as_str())
                .bind(record.last_sent as i64)
                .bind(record.last_acked as i64)
                .bind(record.deletion_pending)
                .bind(record.updated_at)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => report.flushed += 1,
                Err(e) => {
                    warn!(node = %node, resource = %record.resource, error = %e, "Failed to persist sync record");
                    report.failed.push(record);
                }
            }
        }

        for resource in removed {
            let result = execute_with_retry("sync_record_delete", || async {
                sqlx::query("DELETE FROM sync_records WHERE node = ? AND resource = ?")
                    .bind(node.as_str())
                    .bind(resource.as_str())
                    .execute(pool)
                    .await
            })
            .await;

            match result {
                Ok(_) => report.flushed += 1,
                Err(e) => {
                    warn!(node = %node, resource = %resource, error = %e, "Failed to delete sync record");
                    report.failed_removals.push(resource);
                }
            }
        }

        report
    }

    /// Drop every record for a node that no longer exists.
    pub async fn delete_node(&self, node: &NodeIdentity) -> Result<u64> {
        let pool = &self.pool;
        let result = execute_with_retry("sync_node_delete", || async {
            sqlx::query("DELETE FROM sync_records WHERE node = ?")
                .bind(node.as_str())
                .execute(pool)
                .await
        })
        .await?;

        info!(node = %node, rows = result.rows_affected(), "Deleted sync records");
        Ok(result.rows_affected())
    }

    /// Fold the WAL into the main database file.
    pub async fn checkpoint(&self) -> Result<()> {
        if self.path == IN_MEMORY {
            return Ok(());
        }
        let pool = &self.pool;
        execute_with_retry("sync_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint and close. Callers flush dirty records first.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Sync store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn node(name: &str) -> NodeIdentity {
        NodeIdentity::new(name).unwrap()
    }

    fn record(n: &str, resource: &str, sent: u64, acked: u64) -> SyncRecord {
        SyncRecord {
            node: node(n),
            resource: resource.into(),
            last_sent: sent,
            last_acked: acked,
            deletion_pending: false,
            updated_at: 1_700_000_000_000,
        }
    }

    fn file_config(dir: &tempfile::TempDir) -> SyncStoreConfig {
        SyncStoreConfig {
            sqlite_path: dir.path().join("sync.db").to_string_lossy().to_string(),
            wal_mode: true,
        }
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = tempdir().unwrap();
        let config = file_config(&dir);

        {
            let store = SyncStore::open(&config).await.unwrap();
            let report = store
                .persist(&node("edge-1"), vec![record("edge-1", "a", 4, 4), record("edge-1", "b", 2, 1)], vec![])
                .await;
            assert_eq!(report.flushed, 2);
            assert_eq!(report.errors(), 0);
            store.close().await;
        }

        let store = SyncStore::open(&config).await.unwrap();
        let mut loaded = store.load_all().await.unwrap();
        loaded.sort_by(|a, b| a.resource.cmp(&b.resource));
        assert_eq!(loaded, vec![record("edge-1", "a", 4, 4), record("edge-1", "b", 2, 1)]);
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let store = SyncStore::open(&SyncStoreConfig::in_memory()).await.unwrap();
        store.persist(&node("edge-1"), vec![record("edge-1", "a", 1, 0)], vec![]).await;
        store.persist(&node("edge-1"), vec![record("edge-1", "a", 3, 3)], vec![]).await;

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!((loaded[0].last_sent, loaded[0].last_acked), (3, 3));
    }

    #[tokio::test]
    async fn test_removal() {
        let store = SyncStore::open(&SyncStoreConfig::in_memory()).await.unwrap();
        store
            .persist(&node("edge-1"), vec![record("edge-1", "a", 1, 1), record("edge-1", "b", 1, 1)], vec![])
            .await;
        let report = store.persist(&node("edge-1"), vec![], vec!["a".into()]).await;
        assert_eq!(report.flushed, 1);

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].resource.as_str(), "b");
    }

    #[tokio::test]
    async fn test_delete_node_is_scoped() {
        let store = SyncStore::open(&SyncStoreConfig::in_memory()).await.unwrap();
        store.persist(&node("edge-1"), vec![record("edge-1", "a", 1, 1)], vec![]).await;
        store.persist(&node("edge-2"), vec![record("edge-2", "a", 1, 1)], vec![]).await;

        assert_eq!(store.delete_node(&node("edge-1")).await.unwrap(), 1);
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].node.as_str(), "edge-2");
    }

    #[tokio::test]
    async fn test_checkpoint_file_backed() {
        let dir = tempdir().unwrap();
        let store = SyncStore::open(&file_config(&dir)).await.unwrap();
        store.persist(&node("edge-1"), vec![record("edge-1", "a", 1, 1)], vec![]).await;
        assert!(store.checkpoint().await.is_ok());
        store.close().await;
    }

    #[tokio::test]
    async fn test_execute_with_retry_passes_through_other_errors() {
        let mut calls = 0;
        let result: std::result::Result<(), sqlx::Error> = execute_with_retry("test", || {
            calls += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_busy_detection_ignores_non_database_errors() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
        assert!(!is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
    }
}
