use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-worktree operation locks. Mutating operations against the same
/// worktree (create/delete/archive/restore, and polls racing deletes) must
/// hold the lock for their key; operations against different worktrees run
/// concurrently.
#[derive(Default)]
pub struct AppState {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock for a worktree id, or for a derived path when the worktree does
    /// not exist yet (two creates racing toward the same path share a key).
    pub fn op_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry once a worktree is permanently gone.
    pub fn forget(&self, key: &str) {
        self.locks.lock().remove(key);
    }
}
