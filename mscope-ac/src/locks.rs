//! Per-record mutual exclusion
//!
//! Foreground operations and reconciliation serialize on the record id.
//! Distinct ids never contend. Entries nobody holds or waits on are pruned
//! whenever a new lock is handed out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// Guard for one record id; the lock is released on drop
pub type RecordGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct RecordLocks {
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`
    pub async fn lock(&self, id: Uuid) -> RecordGuard {
        let entry = self.entry(id);
        entry.lock_owned().await
    }

    /// Exclusive access to `id` if nobody else holds it
    pub fn try_lock(&self, id: Uuid) -> Option<RecordGuard> {
        self.entry(id).try_lock_owned().ok()
    }

    /// Number of tracked ids
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut table = self.table();
        // Only the table holds an unused entry
        table.retain(|key, lock| *key == id || Arc::strong_count(lock) > 1);
        Arc::clone(table.entry(id).or_default())
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<AsyncMutex<()>>>> {
        // A panic while holding the table cannot leave it inconsistent
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_id_serializes() {
        let locks = Arc::new(RecordLocks::new());
        let id = Uuid::new_v4();

        let guard = locks.lock(id).await;
        assert!(locks.try_lock(id).is_none());

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.lock(id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_ids_do_not_contend() {
        let locks = RecordLocks::new();
        let _a = locks.lock(Uuid::new_v4()).await;
        assert!(locks.try_lock(Uuid::new_v4()).is_some());
    }

    #[tokio::test]
    async fn test_unused_entries_pruned() {
        let locks = RecordLocks::new();
        for _ in 0..10 {
            let _g = locks.lock(Uuid::new_v4()).await;
        }
        let _held = locks.lock(Uuid::new_v4()).await;
        assert_eq!(locks.len(), 1);
    }
}
