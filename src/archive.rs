use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{error, info, warn};

use crate::error::AppError;
use crate::events::{EventBus, WorktreeEvent};
use crate::git;
use crate::poller;
use crate::state::AppState;
use crate::store::types::{ArchivedWorktree, WorktreeMetadata};
use crate::store::{self, WorktreeStore};

const LOCK_REASON: &str = "archived";

/// Outcome of one retention sweep.
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    pub deleted: Vec<String>,
    /// Expired archives kept because they still hold unpushed commits.
    pub held: Vec<String>,
}

/// Soft delete with a bounded recovery window. An archived worktree keeps
/// its directory (moved aside), its branch, and its uncommitted files; the
/// git registration stays in place, locked, which is what makes restore
/// lossless.
pub struct ArchiveManager {
    store: Arc<WorktreeStore>,
    state: Arc<AppState>,
    events: EventBus,
    status_timeout: Duration,
    command_timeout: Duration,
    sweep_interval: Duration,
    retention: chrono::Duration,
}

impl ArchiveManager {
    pub fn new(
        store: Arc<WorktreeStore>,
        state: Arc<AppState>,
        events: EventBus,
        status_timeout: Duration,
        command_timeout: Duration,
        sweep_interval: Duration,
        retention_days: i64,
    ) -> Self {
        Self {
            store,
            state,
            events,
            status_timeout,
            command_timeout,
            sweep_interval,
            retention: chrono::Duration::days(retention_days),
        }
    }

    /// Move a worktree out of the active set into the retained archive.
    /// Single logical transaction: the directory move and the metadata swap
    /// are ordered so a crash leaves the worktree recoverable as
    /// still-active, never orphaned.
    pub async fn archive(&self, id: &str) -> Result<ArchivedWorktree, AppError> {
        let lock = self.state.op_lock(id);
        let _guard = lock.lock().await;

        // Already-archived ids are not in the active index, so archiving
        // twice is NotFound rather than a duplicate record
        let Some(meta) = self.store.find_active(id) else {
            return Err(AppError::NotFound(format!("worktree {}", id)));
        };
        let Some(project_root) = self.store.project_root(&meta.project_id) else {
            return Err(AppError::NotFound(format!("project {}", meta.project_id)));
        };

        let archive_path = store::archive_dir(&project_root).join(&meta.id);
        info!(
            id = %id,
            branch = %meta.branch_name,
            archive_path = %archive_path.display(),
            "Archiving worktree"
        );

        let root = project_root.clone();
        let branch = meta.branch_name.clone();
        let worktree_path = meta.worktree_path.clone();
        let target = archive_path.clone();
        let timeout = self.command_timeout;
        let (unpushed_commits, commit_count) =
            task::spawn_blocking(move || -> Result<(bool, u32), AppError> {
                let unpushed = git::unpushed_commit_count(&root, &branch, timeout)?;
                let commit_count = git::unique_commit_count(&root, &branch, timeout)?;

                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                git::move_worktree(&root, &worktree_path, &target, timeout)?;
                if let Err(e) = git::lock_worktree(&root, &target, LOCK_REASON, timeout) {
                    error!(err = %e, "Failed to lock archived worktree, rolling the move back");
                    let _ = git::move_worktree(&root, &target, &worktree_path, timeout);
                    return Err(e);
                }
                Ok((unpushed > 0, commit_count))
            })
            .await
            .map_err(|e| AppError::Internal(e.to_string()))??;

        let archived_at = Utc::now();
        let record = ArchivedWorktree {
            id: meta.id.clone(),
            project_id: meta.project_id.clone(),
            branch_name: meta.branch_name.clone(),
            original_path: meta.worktree_path.clone(),
            archive_path: archive_path.clone(),
            archived_at,
            expires_at: archived_at + self.retention,
            unpushed_commits,
            commit_count,
        };

        if let Err(e) = self.store.swap_active_to_archived(id, record.clone()) {
            // Keep the active record truthful: undo the move
            let root = project_root.clone();
            let worktree_path = meta.worktree_path.clone();
            let target = archive_path.clone();
            let timeout = self.command_timeout;
            let _ = task::spawn_blocking(move || {
                git::unlock_worktree(&root, &target, timeout);
                let _ = git::move_worktree(&root, &target, &worktree_path, timeout);
            })
            .await;
            return Err(e);
        }

        info!(id = %id, unpushed_commits, commit_count, "Worktree archived");
        self.events.emit(WorktreeEvent::Archived {
            id: id.to_string(),
            unpushed_commits,
        });
        Ok(record)
    }

    /// Reverse the move. Fails with NotFound when the archive directory is
    /// gone (swept, or garbage-collected externally); nothing is recreated
    /// from scratch.
    pub async fn restore(&self, archive_id: &str) -> Result<WorktreeMetadata, AppError> {
        let lock = self.state.op_lock(archive_id);
        let _guard = lock.lock().await;

        let Some(record) = self.store.find_archived(archive_id) else {
            return Err(AppError::NotFound(format!("archive {}", archive_id)));
        };
        let Some(project_root) = self.store.project_root(&record.project_id) else {
            return Err(AppError::NotFound(format!("project {}", record.project_id)));
        };
        if !record.archive_path.exists() {
            return Err(AppError::NotFound(format!(
                "archive directory {} no longer exists",
                record.archive_path.display()
            )));
        }
        if record.original_path.exists() {
            return Err(AppError::Conflict(format!(
                "path {} already exists",
                record.original_path.display()
            )));
        }

        info!(id = %archive_id, branch = %record.branch_name, "Restoring archived worktree");

        let root = project_root.clone();
        let from = record.archive_path.clone();
        let to = record.original_path.clone();
        let command_timeout = self.command_timeout;
        let status_timeout = self.status_timeout;
        let status = task::spawn_blocking(move || {
            git::unlock_worktree(&root, &from, command_timeout);
            if let Err(e) = git::move_worktree(&root, &from, &to, command_timeout) {
                let _ = git::lock_worktree(&root, &from, LOCK_REASON, command_timeout);
                return Err(e);
            }
            poller::collect_status_blocking(&to, status_timeout)
        })
        .await
        .map_err(|e| AppError::Internal(e.to_string()))??;

        let now = Utc::now();
        let meta = WorktreeMetadata {
            id: record.id.clone(),
            project_id: record.project_id.clone(),
            branch_name: record.branch_name.clone(),
            worktree_path: record.original_path.clone(),
            created_at: now,
            last_accessed_at: now,
            is_archived: false,
            gitignore_profile: None,
            is_stale: false,
            status,
        };

        if let Err(e) = self.store.swap_archived_to_active(archive_id, meta.clone()) {
            let root = project_root.clone();
            let from = record.original_path.clone();
            let to = record.archive_path.clone();
            let timeout = self.command_timeout;
            let _ = task::spawn_blocking(move || {
                if git::move_worktree(&root, &from, &to, timeout).is_ok() {
                    let _ = git::lock_worktree(&root, &to, LOCK_REASON, timeout);
                }
            })
            .await;
            return Err(e);
        }

        self.events.emit(WorktreeEvent::Restored {
            id: archive_id.to_string(),
        });
        Ok(meta)
    }

    /// Reclaim expired archives. Archives flagged with unpushed commits are
    /// never deleted here; they are surfaced for explicit confirmation and
    /// reported as held.
    pub async fn sweep_expired(&self) -> Result<SweepReport, AppError> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        for record in self.store.list_archived_all() {
            if record.expires_at > now {
                continue;
            }
            if record.unpushed_commits {
                warn!(
                    id = %record.id,
                    branch = %record.branch_name,
                    commit_count = record.commit_count,
                    "Expired archive holds unpushed commits, keeping it"
                );
                self.events.emit(WorktreeEvent::ArchiveExpiryHeld {
                    id: record.id.clone(),
                    commit_count: record.commit_count,
                });
                report.held.push(record.id.clone());
                continue;
            }
            match self.delete_archive_inner(&record.id, false).await {
                Ok(true) => report.deleted.push(record.id.clone()),
                Ok(false) => {}
                Err(e) => {
                    warn!(id = %record.id, err = %e, "Failed to reclaim archive, will retry next sweep");
                }
            }
        }

        if !report.deleted.is_empty() || !report.held.is_empty() {
            info!(
                deleted = report.deleted.len(),
                held = report.held.len(),
                "Retention sweep finished"
            );
        }
        Ok(report)
    }

    /// Explicit, user-confirmed deletion of an archive; the only path that
    /// may delete one with unpushed commits.
    pub async fn delete_archived(&self, archive_id: &str) -> Result<(), AppError> {
        match self.delete_archive_inner(archive_id, true).await? {
            true => Ok(()),
            false => Err(AppError::NotFound(format!("archive {}", archive_id))),
        }
    }

    /// Returns false when the archive disappeared before the lock was
    /// taken (a racing restore or delete won).
    async fn delete_archive_inner(&self, archive_id: &str, confirmed: bool) -> Result<bool, AppError> {
        let lock = self.state.op_lock(archive_id);
        let _guard = lock.lock().await;

        let Some(record) = self.store.find_archived(archive_id) else {
            return Ok(false);
        };
        if record.unpushed_commits && !confirmed {
            return Ok(false);
        }
        let Some(project_root) = self.store.project_root(&record.project_id) else {
            return Err(AppError::NotFound(format!("project {}", record.project_id)));
        };

        let root = project_root.clone();
        let path = record.archive_path.clone();
        let timeout = self.command_timeout;
        task::spawn_blocking(move || -> Result<(), AppError> {
            if path.exists() {
                git::unlock_worktree(&root, &path, timeout);
                if git::remove_worktree(&root, &path, timeout).is_err() && path.exists() {
                    std::fs::remove_dir_all(&path)?;
                }
            }
            git::prune_worktrees(&root, timeout);
            Ok(())
        })
        .await
        .map_err(|e| AppError::Internal(e.to_string()))??;

        self.store.remove_archived(archive_id)?;
        self.state.forget(archive_id);
        info!(id = %archive_id, "Archive deleted");
        self.events.emit(WorktreeEvent::ArchiveDeleted {
            id: archive_id.to_string(),
        });
        Ok(true)
    }

    /// Background sweep loop: once at start, then on the configured
    /// interval. Aborted by the manager on stop.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep_expired().await {
                warn!(err = %e, "Retention sweep failed");
            }
        }
    }
}
