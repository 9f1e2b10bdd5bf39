//! Event types for the mscope event system
//!
//! Consistency repairs and record lifecycle changes are reported on an
//! [`EventBus`]. Emission is lossy: nobody listening is not an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Artifact role as reported in events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Source,
    Results,
    Export,
}

/// mscope event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MscopeEvent {
    /// A new record was registered after its artifacts were written
    RecordCreated {
        record_id: Uuid,
        workspace: String,
        timestamp: DateTime<Utc>,
    },

    /// A record was deleted by a caller
    RecordDeleted {
        record_id: Uuid,
        artifacts_removed: usize,
        timestamp: DateTime<Utc>,
    },

    /// A missing artifact was copied back from its backup
    ArtifactRestored {
        record_id: Uuid,
        kind: ArtifactKind,
        timestamp: DateTime<Utc>,
    },

    /// A missing derived artifact was recomputed
    ArtifactRegenerated {
        record_id: Uuid,
        kind: ArtifactKind,
        timestamp: DateTime<Utc>,
    },

    /// A backup mirror was created for an artifact that lacked one
    BackupCreated {
        record_id: Uuid,
        kind: ArtifactKind,
        timestamp: DateTime<Utc>,
    },

    /// The source artifact is gone for good; results are kept
    RecordPartial {
        record_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// Neither results nor source could be recovered; the record was removed
    RecordIrrecoverable {
        record_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// An artifact with no owning record was removed
    OrphanArtifactRemoved {
        name: String,
        backup: bool,
        timestamp: DateTime<Utc>,
    },

    /// A reconciliation pass finished
    ReconciliationCompleted {
        records_checked: usize,
        issues_found: usize,
        issues_fixed: usize,
        mutations: usize,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast channel for [`MscopeEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MscopeEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus; `capacity` events are buffered before old ones drop
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<MscopeEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring the case where no subscriber is listening
    pub fn emit_lossy(&self, event: MscopeEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Event dropped (no subscribers)");
        }
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();

        bus.emit_lossy(MscopeEvent::RecordPartial {
            record_id: id,
            timestamp: Utc::now(),
        });

        match rx.recv().await.unwrap() {
            MscopeEvent::RecordPartial { record_id, .. } => assert_eq!(record_id, id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit_lossy(MscopeEvent::OrphanArtifactRemoved {
            name: "x".to_string(),
            backup: false,
            timestamp: Utc::now(),
        });
        assert_eq!(bus.capacity(), 4);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = MscopeEvent::ArtifactRestored {
            record_id: Uuid::nil(),
            kind: ArtifactKind::Results,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ArtifactRestored");
        assert_eq!(json["kind"], "results");
    }
}
