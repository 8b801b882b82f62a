use serde::Serialize;
use tokio::sync::broadcast;

use crate::store::types::WorktreeStatus;

/// Push notifications for the UI layer. Request/response calls return their
/// own results; everything that changes asynchronously (poll results, sweep
/// outcomes) arrives here.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorktreeEvent {
    Created { id: String, project_id: String },
    Removed { id: String },
    StatusChanged { id: String, status: WorktreeStatus },
    /// A poll found the directory gone; the record is flagged stale and
    /// waits for an explicit delete.
    Missing { id: String },
    Archived { id: String, unpushed_commits: bool },
    Restored { id: String },
    ArchiveDeleted { id: String },
    /// An expired archive still holds unpushed commits. It is never deleted
    /// without explicit confirmation.
    ArchiveExpiryHeld { id: String, commit_count: u32 },
}

/// Broadcast fan-out to however many UI subscribers exist. Emitting with no
/// subscribers is fine; slow subscribers miss old events rather than
/// blocking the backend.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorktreeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorktreeEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: WorktreeEvent) {
        let _ = self.tx.send(event);
    }
}
