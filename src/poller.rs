use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::events::{EventBus, WorktreeEvent};
use crate::git;
use crate::state::AppState;
use crate::store::types::WorktreeStatus;
use crate::store::{StatusWrite, WorktreeStore};

/// Per-worktree poll state: `Idle -> Polling -> Idle`. Git subprocesses
/// against one working tree are not safely concurrent, so triggers arriving
/// mid-poll coalesce into a single follow-up instead of stacking.
#[derive(Debug, Default, Clone, Copy)]
struct PollGate {
    in_flight: bool,
    queued: bool,
}

impl PollGate {
    /// True when the caller should start a poll now; otherwise the trigger
    /// is queued behind the in-flight poll.
    fn try_begin(&mut self) -> bool {
        if self.in_flight {
            self.queued = true;
            false
        } else {
            self.in_flight = true;
            true
        }
    }

    /// Ends the in-flight poll; true when a coalesced trigger wants a
    /// follow-up.
    fn finish(&mut self) -> bool {
        self.in_flight = false;
        std::mem::take(&mut self.queued)
    }
}

/// Recomputes dirty/ahead/behind/conflicted per active worktree and
/// republishes changes through the store and event bus.
pub struct StatusPoller {
    store: Arc<WorktreeStore>,
    state: Arc<AppState>,
    events: EventBus,
    gates: Mutex<HashMap<String, PollGate>>,
    interval: Duration,
    status_timeout: Duration,
}

impl StatusPoller {
    pub fn new(
        store: Arc<WorktreeStore>,
        state: Arc<AppState>,
        events: EventBus,
        interval: Duration,
        status_timeout: Duration,
    ) -> Self {
        Self {
            store,
            state,
            events,
            gates: Mutex::new(HashMap::new()),
            interval,
            status_timeout,
        }
    }

    /// Trigger a poll for one worktree (interval tick, UI refresh, or
    /// post-create). Coalesced while one is already running.
    pub fn request_poll(self: &Arc<Self>, id: &str) {
        let should_start = self.gates.lock().entry(id.to_string()).or_default().try_begin();
        if should_start {
            self.spawn_poll(id.to_string());
        }
    }

    fn spawn_poll(self: &Arc<Self>, id: String) {
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            poller.poll_worktree(&id).await;
            let follow_up = match poller.gates.lock().get_mut(&id) {
                Some(gate) => gate.finish(),
                None => false,
            };
            if follow_up {
                poller.request_poll(&id);
            }
        });
    }

    async fn poll_worktree(&self, id: &str) {
        // Serialize against delete/archive of the same id
        let lock = self.state.op_lock(id);
        let _guard = lock.lock().await;

        let Some(meta) = self.store.find_active(id) else {
            // Deleted or archived since the trigger; drop the gate too
            self.gates.lock().remove(id);
            return;
        };
        if meta.is_stale {
            return;
        }

        let started = Utc::now();
        let path = meta.worktree_path.clone();
        let timeout = self.status_timeout;
        let joined = task::spawn_blocking(move || {
            if !path.exists() {
                return Err(AppError::NotFound(format!(
                    "worktree directory {}",
                    path.display()
                )));
            }
            collect_status_blocking(&path, timeout)
        })
        .await;

        let result = match joined {
            Ok(result) => result,
            Err(e) => {
                warn!(id = %id, err = %e, "Poll task failed");
                return;
            }
        };

        match result {
            Ok(status) => match self.store.update_status(id, status.clone(), started) {
                Ok(StatusWrite::Updated) => {
                    self.events.emit(WorktreeEvent::StatusChanged {
                        id: id.to_string(),
                        status,
                    });
                }
                Ok(_) => {}
                Err(e) => debug!(id = %id, err = %e, "Dropping poll result"),
            },
            Err(AppError::NotFound(_)) => {
                info!(id = %id, "Worktree directory gone, flagging record stale");
                if let Ok(true) = self.store.mark_stale(id) {
                    self.events.emit(WorktreeEvent::Missing { id: id.to_string() });
                }
            }
            // Transient (timeouts and the like): retried on the next tick
            Err(e) => debug!(id = %id, err = %e, "Poll failed, will retry"),
        }
    }

    /// Background tick loop; aborted by the manager on stop.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for meta in self.store.list_active_all() {
                if !meta.is_stale {
                    self.request_poll(&meta.id);
                }
            }
        }
    }
}

/// One complete status computation. Runs on the blocking pool; also used
/// for the synchronous poll during creation.
pub(crate) fn collect_status_blocking(
    worktree_path: &Path,
    timeout: Duration,
) -> Result<WorktreeStatus, AppError> {
    let summary = git::read_status(worktree_path, timeout)?;
    let counts = git::ahead_behind(worktree_path, timeout)?;
    let current_branch = git::current_branch(worktree_path, timeout)?;
    let conflicted =
        summary.conflicted || git::merge_or_rebase_in_progress(worktree_path, timeout);

    Ok(WorktreeStatus {
        dirty: summary.dirty,
        ahead: counts.ahead,
        behind: counts.behind,
        conflicted,
        current_branch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_runs_first_trigger_immediately() {
        let mut gate = PollGate::default();
        assert!(gate.try_begin());
        assert!(!gate.finish());
    }

    #[test]
    fn triggers_during_poll_coalesce_into_one_follow_up() {
        let mut gate = PollGate::default();
        assert!(gate.try_begin());

        // Three triggers land while the poll is running
        assert!(!gate.try_begin());
        assert!(!gate.try_begin());
        assert!(!gate.try_begin());

        // Exactly one follow-up, then idle again
        assert!(gate.finish());
        assert!(gate.try_begin());
        assert!(!gate.finish());
    }
}
