use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::AppError;
use crate::events::{EventBus, WorktreeEvent};
use crate::git;
use crate::poller;
use crate::state::AppState;
use crate::store::types::WorktreeMetadata;
use crate::store::{self, WorktreeStore};

const RESERVED_NAMES: &[&str] = &["HEAD", "@"];

/// Validate a branch name against git ref-name rules before anything
/// reaches a subprocess.
pub fn validate_branch_name(name: &str) -> Result<(), AppError> {
    let reject = |reason: &str| {
        Err(AppError::Validation(format!(
            "invalid branch name `{}`: {}",
            name, reason
        )))
    };

    if name.is_empty() {
        return reject("name is empty");
    }
    if RESERVED_NAMES.contains(&name) {
        return reject("name is reserved");
    }
    if name.contains("..") {
        return reject("`..` is not allowed");
    }
    if name.contains("@{") {
        return reject("`@{` is not allowed");
    }
    if let Some(c) = name
        .chars()
        .find(|c| matches!(c, '~' | '^' | ':' | '?' | '*' | '[' | '\\') || c.is_whitespace() || c.is_control())
    {
        if c.is_whitespace() {
            return reject("whitespace is not allowed");
        }
        if c.is_control() {
            return reject("control characters are not allowed");
        }
        return Err(AppError::Validation(format!(
            "invalid branch name `{}`: `{}` is not allowed",
            name, c
        )));
    }
    if name.starts_with('/') || name.ends_with('/') {
        return reject("leading or trailing `/` is not allowed");
    }
    if name.contains("//") {
        return reject("doubled `/` is not allowed");
    }
    if name.ends_with('.') || name.ends_with(".lock") {
        return reject("names may not end with `.` or `.lock`");
    }
    if name.split('/').any(|component| component.starts_with('.')) {
        return reject("path components may not begin with `.`");
    }
    Ok(())
}

/// Deterministic worktree location for a branch.
pub fn worktree_path_for(project_root: &Path, branch: &str) -> PathBuf {
    store::control_dir(project_root).join(branch)
}

/// Creation, hard deletion, and listing of active worktrees.
pub struct WorktreeService {
    store: Arc<WorktreeStore>,
    state: Arc<AppState>,
    events: EventBus,
    status_timeout: Duration,
    command_timeout: Duration,
}

impl WorktreeService {
    pub fn new(
        store: Arc<WorktreeStore>,
        state: Arc<AppState>,
        events: EventBus,
        status_timeout: Duration,
        command_timeout: Duration,
    ) -> Self {
        Self {
            store,
            state,
            events,
            status_timeout,
            command_timeout,
        }
    }

    /// Create a worktree for `branch_name`, copy the selected gitignored
    /// paths over from the source tree, run the initial status poll, and
    /// durably record the result. All-or-nothing: any failure after the
    /// `git worktree add` rolls the registration and directory back.
    pub async fn create(
        &self,
        project_id: &str,
        project_path: &Path,
        branch_name: &str,
        selections: &[String],
    ) -> Result<WorktreeMetadata, AppError> {
        validate_branch_name(branch_name)?;

        if self.store.project_root(project_id).is_none() {
            self.store.register_project(project_id, project_path)?;
        }
        let Some(project_root) = self.store.project_root(project_id) else {
            return Err(AppError::NotFound(format!("project {}", project_id)));
        };

        let worktree_path = worktree_path_for(&project_root, branch_name);
        info!(
            project_id = %project_id,
            branch = %branch_name,
            path = %worktree_path.display(),
            "Creating worktree"
        );

        // Two creates racing toward the same branch share this lock
        let lock = self.state.op_lock(&worktree_path.to_string_lossy());
        let _guard = lock.lock().await;

        self.check_conflicts(project_id, &project_root, branch_name, &worktree_path)
            .await?;

        let root = project_root.clone();
        let branch = branch_name.to_string();
        let path = worktree_path.clone();
        let selected: Vec<String> = selections.to_vec();
        let status_timeout = self.status_timeout;
        let command_timeout = self.command_timeout;

        let status = task::spawn_blocking(move || {
            let branch_created = git::create_worktree(&root, &branch, &path, command_timeout)?;
            let result = copy_selected_patterns(&root, &path, &selected)
                .and_then(|_| poller::collect_status_blocking(&path, status_timeout));
            match result {
                Ok(status) => Ok(status),
                Err(e) => {
                    error!(branch = %branch, err = %e, "Worktree setup failed, rolling back");
                    rollback_create(&root, &path, &branch, branch_created, command_timeout);
                    Err(e)
                }
            }
        })
        .await
        .map_err(|e| AppError::Internal(e.to_string()))??;

        let now = Utc::now();
        let meta = WorktreeMetadata {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            branch_name: branch_name.to_string(),
            worktree_path: worktree_path.clone(),
            created_at: now,
            last_accessed_at: now,
            is_archived: false,
            gitignore_profile: None,
            is_stale: false,
            status,
        };

        // Durable before returning to the caller
        if let Err(e) = self.store.insert_active(meta.clone()) {
            let root = project_root.clone();
            let branch = branch_name.to_string();
            let path = worktree_path.clone();
            let timeout = self.command_timeout;
            let _ = task::spawn_blocking(move || {
                rollback_create(&root, &path, &branch, false, timeout);
            })
            .await;
            return Err(e);
        }

        info!(id = %meta.id, branch = %meta.branch_name, "Worktree created");
        self.events.emit(WorktreeEvent::Created {
            id: meta.id.clone(),
            project_id: project_id.to_string(),
        });
        Ok(meta)
    }

    /// Hard delete: remove the git registration, the directory, and the
    /// record. Only for explicitly confirmed, non-archived deletions.
    pub async fn delete(&self, id: &str, delete_branch: bool) -> Result<(), AppError> {
        let lock = self.state.op_lock(id);
        let _guard = lock.lock().await;

        let Some(meta) = self.store.find_active(id) else {
            return Err(AppError::NotFound(format!("worktree {}", id)));
        };
        let Some(project_root) = self.store.project_root(&meta.project_id) else {
            return Err(AppError::NotFound(format!("project {}", meta.project_id)));
        };

        info!(id = %id, branch = %meta.branch_name, delete_branch, "Deleting worktree");

        let branch = meta.branch_name.clone();
        let path = meta.worktree_path.clone();
        let timeout = self.command_timeout;
        task::spawn_blocking(move || -> Result<(), AppError> {
            if path.exists() {
                if let Err(e) = git::remove_worktree(&project_root, &path, timeout) {
                    // Not registered anymore (e.g. flagged stale after a
                    // manual move); fall back to deleting the directory
                    warn!(path = %path.display(), err = %e, "Worktree removal failed, deleting directory");
                    std::fs::remove_dir_all(&path)?;
                }
            }
            git::prune_worktrees(&project_root, timeout);
            if delete_branch {
                git::delete_branch(&project_root, &branch, timeout);
            }
            Ok(())
        })
        .await
        .map_err(|e| AppError::Internal(e.to_string()))??;

        self.store.remove_active(id)?;
        self.state.forget(id);
        self.events.emit(WorktreeEvent::Removed { id: id.to_string() });
        Ok(())
    }

    pub fn list(&self, project_id: &str) -> Vec<WorktreeMetadata> {
        self.store.list_active(project_id)
    }

    /// Record that a worktree became the active selection.
    pub fn mark_accessed(&self, id: &str) -> Result<(), AppError> {
        self.store.mark_accessed(id, Utc::now())
    }

    /// Conflict detection before any filesystem mutation.
    async fn check_conflicts(
        &self,
        project_id: &str,
        project_root: &Path,
        branch_name: &str,
        worktree_path: &Path,
    ) -> Result<(), AppError> {
        for existing in self.store.list_active(project_id) {
            if existing.branch_name == branch_name {
                return Err(AppError::Conflict(format!(
                    "branch `{}` is already checked out by worktree {}",
                    branch_name, existing.id
                )));
            }
            if existing.worktree_path == worktree_path {
                return Err(AppError::Conflict(format!(
                    "path {} is already in use by worktree {}",
                    worktree_path.display(),
                    existing.id
                )));
            }
        }
        if worktree_path.exists() {
            return Err(AppError::Conflict(format!(
                "path {} already exists",
                worktree_path.display()
            )));
        }

        // Worktrees git knows about that this store does not (including
        // archived ones, which keep their branch checked out)
        let root = project_root.to_path_buf();
        let timeout = self.command_timeout;
        let entries = task::spawn_blocking(move || git::list_worktrees(&root, timeout))
            .await
            .map_err(|e| AppError::Internal(e.to_string()))??;
        if let Some(entry) = entries
            .iter()
            .find(|entry| entry.branch.as_deref() == Some(branch_name))
        {
            return Err(AppError::Conflict(format!(
                "branch `{}` is already checked out at {}",
                branch_name, entry.path
            )));
        }
        Ok(())
    }
}

fn rollback_create(
    project_root: &Path,
    worktree_path: &Path,
    branch: &str,
    branch_created: bool,
    timeout: Duration,
) {
    let _ = git::remove_worktree(project_root, worktree_path, timeout);
    if worktree_path.exists() {
        let _ = std::fs::remove_dir_all(worktree_path);
    }
    git::prune_worktrees(project_root, timeout);
    if branch_created {
        git::delete_branch(project_root, branch, timeout);
    }
}

/// Gitignore-style selection applied to the copy step. A trailing `/`
/// restricts the pattern to directories; a pattern containing `/` is
/// matched against the path relative to the project root; anything else is
/// matched against file names at any depth.
enum SelectionMatcher {
    Name { pattern: glob::Pattern, dir_only: bool },
    Path { pattern: glob::Pattern, dir_only: bool },
}

impl SelectionMatcher {
    fn new(selection: &str) -> Option<Self> {
        let trimmed = selection.trim();
        if trimmed.is_empty() {
            return None;
        }
        let (body, dir_only) = match trimmed.strip_suffix('/') {
            Some(body) => (body, true),
            None => (trimmed, false),
        };
        let body = body.trim_start_matches('/');
        if body.is_empty() {
            return None;
        }
        // Unknown or malformed patterns are ignored, not fatal
        let pattern = glob::Pattern::new(body).ok()?;
        if body.contains('/') {
            Some(SelectionMatcher::Path { pattern, dir_only })
        } else {
            Some(SelectionMatcher::Name { pattern, dir_only })
        }
    }

    fn matches(&self, rel_path: &Path, file_name: &str, is_dir: bool) -> bool {
        match self {
            SelectionMatcher::Name { pattern, dir_only } => {
                (!dir_only || is_dir) && pattern.matches(file_name)
            }
            SelectionMatcher::Path { pattern, dir_only } => {
                (!dir_only || is_dir) && pattern.matches_path(rel_path)
            }
        }
    }
}

/// Copy everything matching the selections from the source tree into the
/// fresh worktree. Matched directories are copied whole and not descended
/// into again; `.git` and the control directory are never considered.
fn copy_selected_patterns(
    source_root: &Path,
    dest_root: &Path,
    selections: &[String],
) -> Result<(), AppError> {
    let matchers: Vec<SelectionMatcher> = selections
        .iter()
        .filter_map(|s| SelectionMatcher::new(s))
        .collect();
    if matchers.is_empty() {
        return Ok(());
    }

    let mut walker = WalkDir::new(source_root).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(err = %e, "Skipping unreadable entry during copy");
                continue;
            }
        };
        let Ok(rel_path) = entry.path().strip_prefix(source_root) else {
            continue;
        };
        let is_dir = entry.file_type().is_dir();

        if let Some(first) = rel_path.components().next() {
            let first = first.as_os_str();
            if first == std::ffi::OsStr::new(".git")
                || first == std::ffi::OsStr::new(store::CONTROL_DIR)
            {
                if is_dir {
                    walker.skip_current_dir();
                }
                continue;
            }
        }

        let file_name = entry.file_name().to_string_lossy();
        if !matchers
            .iter()
            .any(|m| m.matches(rel_path, &file_name, is_dir))
        {
            continue;
        }

        let target = dest_root.join(rel_path);
        if is_dir {
            copy_tree(entry.path(), &target)?;
            walker.skip_current_dir();
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            copy_entry(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn copy_tree(source: &Path, dest: &Path) -> Result<(), AppError> {
    for entry in WalkDir::new(source) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(err = %e, "Skipping unreadable entry during copy");
                continue;
            }
        };
        let Ok(rel_path) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = dest.join(rel_path);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            copy_entry(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Copy one file, recreating symlinks (package managers lean on them for
/// executables) instead of following them.
fn copy_entry(source: &Path, target: &Path) -> Result<(), AppError> {
    let meta = std::fs::symlink_metadata(source)?;
    if meta.file_type().is_symlink() {
        let link = std::fs::read_link(source)?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(&link, target)?;
        #[cfg(windows)]
        {
            let _ = std::os::windows::fs::symlink_file(&link, target);
        }
        return Ok(());
    }
    std::fs::copy(source, target)?;
    Ok(())
}
