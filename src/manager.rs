use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::archive::{ArchiveManager, SweepReport};
use crate::error::AppError;
use crate::events::{EventBus, WorktreeEvent};
use crate::gitignore::{self, ParsedPattern};
use crate::poller::StatusPoller;
use crate::state::AppState;
use crate::store::types::{ArchivedWorktree, WorktreeMetadata};
use crate::store::WorktreeStore;
use crate::worktrees::WorktreeService;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Background poll cadence. 10s sits in the middle of the workable
    /// range; per-worktree coalescing keeps a slow repository from stacking
    /// subprocesses.
    pub poll_interval: Duration,
    /// Timeout for status-style queries.
    pub status_timeout: Duration,
    /// Timeout for mutating commands (worktree add/move/remove do real IO).
    pub command_timeout: Duration,
    pub sweep_interval: Duration,
    pub retention_days: i64,
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            status_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(24 * 60 * 60),
            retention_days: 30,
            event_capacity: 64,
        }
    }
}

/// The worktree lifecycle subsystem: one explicitly constructed instance
/// wiring the store, service, poller, and archive manager together. The UI
/// layer talks to this and to nothing below it.
pub struct WorktreeManager {
    store: Arc<WorktreeStore>,
    events: EventBus,
    service: WorktreeService,
    poller: Arc<StatusPoller>,
    archive: Arc<ArchiveManager>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorktreeManager {
    pub fn new(config: ManagerConfig) -> Self {
        let store = Arc::new(WorktreeStore::new());
        let state = Arc::new(AppState::new());
        let events = EventBus::new(config.event_capacity);

        let service = WorktreeService::new(
            Arc::clone(&store),
            Arc::clone(&state),
            events.clone(),
            config.status_timeout,
            config.command_timeout,
        );
        let poller = Arc::new(StatusPoller::new(
            Arc::clone(&store),
            Arc::clone(&state),
            events.clone(),
            config.poll_interval,
            config.status_timeout,
        ));
        let archive = Arc::new(ArchiveManager::new(
            Arc::clone(&store),
            Arc::clone(&state),
            events.clone(),
            config.status_timeout,
            config.command_timeout,
            config.sweep_interval,
            config.retention_days,
        ));

        Self {
            store,
            events,
            service,
            poller,
            archive,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Load a project's persisted indices. Projects the UI never registers
    /// simply do not take part in polling or sweeps.
    pub fn register_project(&self, project_id: &str, project_root: &Path) -> Result<(), AppError> {
        self.store.register_project(project_id, project_root)
    }

    /// Spawn the background loops (status polling, retention sweep).
    /// Idempotent; `stop` shuts them down again.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        info!("Starting worktree manager background tasks");
        tasks.push(tokio::spawn(Arc::clone(&self.poller).run()));
        tasks.push(tokio::spawn(Arc::clone(&self.archive).run()));
    }

    pub fn stop(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_empty() {
            return;
        }
        info!("Stopping worktree manager background tasks");
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// Event stream for everything that changes asynchronously.
    pub fn subscribe(&self) -> broadcast::Receiver<WorktreeEvent> {
        self.events.subscribe()
    }

    pub async fn create_worktree(
        &self,
        project_id: &str,
        project_path: &Path,
        branch_name: &str,
        gitignore_selections: &[String],
    ) -> Result<WorktreeMetadata, AppError> {
        let meta = self
            .service
            .create(project_id, project_path, branch_name, gitignore_selections)
            .await?;
        // Post-create trigger; coalesces if the initial poll result is fresh
        self.poller.request_poll(&meta.id);
        Ok(meta)
    }

    pub async fn delete_worktree(&self, id: &str, delete_branch: bool) -> Result<(), AppError> {
        self.service.delete(id, delete_branch).await
    }

    pub fn list_worktrees(&self, project_id: &str) -> Vec<WorktreeMetadata> {
        self.service.list(project_id)
    }

    pub fn list_archived(&self, project_id: &str) -> Vec<ArchivedWorktree> {
        self.store.list_archived(project_id)
    }

    pub async fn archive_worktree(&self, id: &str) -> Result<ArchivedWorktree, AppError> {
        self.archive.archive(id).await
    }

    pub async fn restore_worktree(&self, archive_id: &str) -> Result<WorktreeMetadata, AppError> {
        let meta = self.archive.restore(archive_id).await?;
        self.poller.request_poll(&meta.id);
        Ok(meta)
    }

    /// Explicit, confirmed deletion of an archive (the answer to an
    /// `ArchiveExpiryHeld` event).
    pub async fn delete_archived(&self, archive_id: &str) -> Result<(), AppError> {
        self.archive.delete_archived(archive_id).await
    }

    pub async fn sweep_expired(&self) -> Result<SweepReport, AppError> {
        self.archive.sweep_expired().await
    }

    pub fn parse_gitignore(&self, project_root: &Path) -> Result<Vec<ParsedPattern>, AppError> {
        gitignore::parse(project_root)
    }

    /// All patterns safe to copy by default (security-sensitive ones
    /// excluded).
    pub fn default_selection(&self, patterns: &[ParsedPattern]) -> Vec<String> {
        gitignore::default_selection(patterns)
    }

    /// Note that a worktree became the active selection.
    pub fn mark_accessed(&self, id: &str) -> Result<(), AppError> {
        self.service.mark_accessed(id)
    }

    /// On-demand status refresh (UI focus, manual refresh).
    pub fn request_refresh(&self, id: &str) {
        self.poller.request_poll(id);
    }
}

impl Drop for WorktreeManager {
    fn drop(&mut self) {
        self.stop();
    }
}
