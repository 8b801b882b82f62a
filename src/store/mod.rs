pub mod types;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::AppError;
use types::{ArchivedWorktree, WorktreeMetadata, WorktreeStatus};

pub(crate) const CONTROL_DIR: &str = ".worktrees";
const ACTIVE_FILE: &str = "worktrees.json";
const ARCHIVE_FILE: &str = "archive.json";
const ARCHIVE_SUBDIR: &str = ".archive";
const INDEX_VERSION: u32 = 1;

/// Control directory inside a project root; holds the index files and the
/// archive payloads, and is where worktree directories are created.
pub fn control_dir(project_root: &Path) -> PathBuf {
    project_root.join(CONTROL_DIR)
}

/// Directory holding archived worktree payloads, one uuid-named directory
/// per archive. Branch-derived worktree paths can never collide with it:
/// ref components cannot begin with a dot.
pub fn archive_dir(project_root: &Path) -> PathBuf {
    control_dir(project_root).join(ARCHIVE_SUBDIR)
}

#[derive(Serialize, Deserialize)]
struct ActiveIndexFile {
    version: u32,
    worktrees: Vec<WorktreeMetadata>,
}

#[derive(Serialize, Deserialize)]
struct ArchiveIndexFile {
    version: u32,
    archives: Vec<ArchivedWorktree>,
}

#[derive(Clone)]
struct ProjectEntry {
    root: PathBuf,
    active: HashMap<String, WorktreeMetadata>,
    archived: HashMap<String, ArchivedWorktree>,
    /// Start time of the newest poll whose status was accepted, per id.
    /// In-memory only; the single status writer rebuilds it after restart.
    status_watermarks: HashMap<String, DateTime<Utc>>,
}

/// Which index files a mutation must flush, and in what order. Archiving
/// writes the archive index first and restoring writes the active index
/// first, so a crash between the two writes always leaves the id present in
/// the active index (load keeps the active copy when both exist).
enum Persist {
    None,
    Active,
    Archived,
    ArchiveThenActive,
    ActiveThenArchive,
}

/// Outcome of a status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    /// An equal or newer poll already landed; the result was dropped.
    Discarded,
    Unchanged,
    Updated,
}

/// Durable per-project metadata for active and archived worktrees. The
/// single source of truth: every mutation goes through a draft copy that is
/// persisted before it becomes visible, so a failed write leaves both the
/// file and the in-memory view untouched. Mutations are serialized by a
/// dedicated writer lock; readers only contend for the swap that publishes
/// a finished draft.
pub struct WorktreeStore {
    projects: RwLock<HashMap<String, ProjectEntry>>,
    writer: Mutex<()>,
}

impl WorktreeStore {
    pub fn new() -> Self {
        Self {
            projects: RwLock::new(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    /// Load (or create) the indices for a project. Safe to call repeatedly;
    /// re-registering reloads from disk.
    pub fn register_project(&self, project_id: &str, project_root: &Path) -> Result<(), AppError> {
        let _writer = self.writer.lock();
        let dir = control_dir(project_root);
        let mut active = load_index::<ActiveIndexFile>(&dir.join(ACTIVE_FILE))?
            .map(|file| file.worktrees)
            .unwrap_or_default();
        let archived = load_index::<ArchiveIndexFile>(&dir.join(ARCHIVE_FILE))?
            .map(|file| file.archives)
            .unwrap_or_default();

        // Reconcile a crash between the two index writes: an id in both
        // indices stays active (archiving flushes the archive index first).
        let archived: HashMap<String, ArchivedWorktree> = archived
            .into_iter()
            .filter(|record| {
                let duplicated = active.iter().any(|meta| meta.id == record.id);
                if duplicated {
                    warn!(id = %record.id, "Worktree present in both indices, keeping active");
                }
                !duplicated
            })
            .map(|record| (record.id.clone(), record))
            .collect();
        let active: HashMap<String, WorktreeMetadata> = active
            .drain(..)
            .map(|meta| (meta.id.clone(), meta))
            .collect();

        info!(
            project_id = %project_id,
            root = %project_root.display(),
            active = active.len(),
            archived = archived.len(),
            "Registered project"
        );

        self.projects.write().insert(
            project_id.to_string(),
            ProjectEntry {
                root: project_root.to_path_buf(),
                active,
                archived,
                status_watermarks: HashMap::new(),
            },
        );
        Ok(())
    }

    pub fn project_root(&self, project_id: &str) -> Option<PathBuf> {
        self.projects
            .read()
            .get(project_id)
            .map(|entry| entry.root.clone())
    }

    pub fn insert_active(&self, meta: WorktreeMetadata) -> Result<(), AppError> {
        self.mutate(&meta.project_id.clone(), |entry| {
            if entry.active.contains_key(&meta.id) || entry.archived.contains_key(&meta.id) {
                return Err(AppError::Conflict(format!("worktree id {} already exists", meta.id)));
            }
            if entry
                .active
                .values()
                .any(|existing| existing.worktree_path == meta.worktree_path)
            {
                return Err(AppError::Conflict(format!(
                    "worktree path {} already in use",
                    meta.worktree_path.display()
                )));
            }
            entry.active.insert(meta.id.clone(), meta.clone());
            Ok(((), Persist::Active))
        })
    }

    pub fn find_active(&self, id: &str) -> Option<WorktreeMetadata> {
        let projects = self.projects.read();
        projects
            .values()
            .find_map(|entry| entry.active.get(id).cloned())
    }

    pub fn list_active(&self, project_id: &str) -> Vec<WorktreeMetadata> {
        let projects = self.projects.read();
        let mut list: Vec<WorktreeMetadata> = projects
            .get(project_id)
            .map(|entry| entry.active.values().cloned().collect())
            .unwrap_or_default();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Every active worktree across registered projects; the poller's work
    /// list.
    pub fn list_active_all(&self) -> Vec<WorktreeMetadata> {
        let projects = self.projects.read();
        projects
            .values()
            .flat_map(|entry| entry.active.values().cloned())
            .collect()
    }

    pub fn remove_active(&self, id: &str) -> Result<WorktreeMetadata, AppError> {
        self.mutate_by_id(id, |entry| {
            let Some(meta) = entry.active.remove(id) else {
                return Err(AppError::NotFound(format!("worktree {}", id)));
            };
            entry.status_watermarks.remove(id);
            Ok((meta, Persist::Active))
        })
    }

    /// Replace the status of an active worktree, nothing else. Results from
    /// polls older than the newest accepted one are discarded so a slow poll
    /// can never clobber a fresher result.
    pub fn update_status(
        &self,
        id: &str,
        status: WorktreeStatus,
        polled_at: DateTime<Utc>,
    ) -> Result<StatusWrite, AppError> {
        self.mutate_by_id(id, |entry| {
            if let Some(mark) = entry.status_watermarks.get(id) {
                if polled_at <= *mark {
                    return Ok((StatusWrite::Discarded, Persist::None));
                }
            }
            let Some(meta) = entry.active.get_mut(id) else {
                return Err(AppError::NotFound(format!("worktree {}", id)));
            };
            entry.status_watermarks.insert(id.to_string(), polled_at);
            if meta.status == status {
                return Ok((StatusWrite::Unchanged, Persist::None));
            }
            meta.status = status;
            Ok((StatusWrite::Updated, Persist::Active))
        })
    }

    /// Flag a worktree whose directory is gone. Returns false if it was
    /// already flagged.
    pub fn mark_stale(&self, id: &str) -> Result<bool, AppError> {
        self.mutate_by_id(id, |entry| {
            let Some(meta) = entry.active.get_mut(id) else {
                return Err(AppError::NotFound(format!("worktree {}", id)));
            };
            if meta.is_stale {
                return Ok((false, Persist::None));
            }
            meta.is_stale = true;
            Ok((true, Persist::Active))
        })
    }

    pub fn mark_accessed(&self, id: &str, at: DateTime<Utc>) -> Result<(), AppError> {
        self.mutate_by_id(id, |entry| {
            let Some(meta) = entry.active.get_mut(id) else {
                return Err(AppError::NotFound(format!("worktree {}", id)));
            };
            meta.last_accessed_at = at;
            Ok(((), Persist::Active))
        })
    }

    pub fn find_archived(&self, id: &str) -> Option<ArchivedWorktree> {
        let projects = self.projects.read();
        projects
            .values()
            .find_map(|entry| entry.archived.get(id).cloned())
    }

    pub fn list_archived(&self, project_id: &str) -> Vec<ArchivedWorktree> {
        let projects = self.projects.read();
        let mut list: Vec<ArchivedWorktree> = projects
            .get(project_id)
            .map(|entry| entry.archived.values().cloned().collect())
            .unwrap_or_default();
        list.sort_by(|a, b| a.archived_at.cmp(&b.archived_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn list_archived_all(&self) -> Vec<ArchivedWorktree> {
        let projects = self.projects.read();
        projects
            .values()
            .flat_map(|entry| entry.archived.values().cloned())
            .collect()
    }

    /// Move a worktree from the active index into the archive index as one
    /// store transaction.
    pub fn swap_active_to_archived(
        &self,
        id: &str,
        record: ArchivedWorktree,
    ) -> Result<(), AppError> {
        self.mutate_by_id(id, |entry| {
            if entry.active.remove(id).is_none() {
                return Err(AppError::NotFound(format!("worktree {}", id)));
            }
            entry.status_watermarks.remove(id);
            entry.archived.insert(record.id.clone(), record.clone());
            Ok(((), Persist::ArchiveThenActive))
        })
    }

    /// Move an archive back into the active index as one store transaction.
    pub fn swap_archived_to_active(
        &self,
        archive_id: &str,
        meta: WorktreeMetadata,
    ) -> Result<(), AppError> {
        self.mutate_by_id(archive_id, |entry| {
            if entry.archived.remove(archive_id).is_none() {
                return Err(AppError::NotFound(format!("archive {}", archive_id)));
            }
            entry.active.insert(meta.id.clone(), meta.clone());
            Ok(((), Persist::ActiveThenArchive))
        })
    }

    pub fn remove_archived(&self, id: &str) -> Result<ArchivedWorktree, AppError> {
        self.mutate_by_id(id, |entry| {
            let Some(record) = entry.archived.remove(id) else {
                return Err(AppError::NotFound(format!("archive {}", id)));
            };
            Ok((record, Persist::Archived))
        })
    }

    fn mutate<T>(
        &self,
        project_id: &str,
        f: impl FnOnce(&mut ProjectEntry) -> Result<(T, Persist), AppError>,
    ) -> Result<T, AppError> {
        let _writer = self.writer.lock();
        let Some(draft) = self.projects.read().get(project_id).cloned() else {
            return Err(AppError::NotFound(format!("project {}", project_id)));
        };
        self.commit(project_id.to_string(), draft, f)
    }

    fn mutate_by_id<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ProjectEntry) -> Result<(T, Persist), AppError>,
    ) -> Result<T, AppError> {
        let _writer = self.writer.lock();
        let found = {
            let projects = self.projects.read();
            projects
                .iter()
                .find(|(_, entry)| {
                    entry.active.contains_key(id) || entry.archived.contains_key(id)
                })
                .map(|(key, entry)| (key.clone(), entry.clone()))
        };
        let Some((key, draft)) = found else {
            return Err(AppError::NotFound(format!("worktree {}", id)));
        };
        self.commit(key, draft, f)
    }

    /// Draft-commit tail, entered with the writer lock held: mutate the
    /// clone, flush it, then swap it in. The persisted files and the
    /// in-memory view change together or not at all, and readers only wait
    /// for the final swap.
    fn commit<T>(
        &self,
        key: String,
        mut draft: ProjectEntry,
        f: impl FnOnce(&mut ProjectEntry) -> Result<(T, Persist), AppError>,
    ) -> Result<T, AppError> {
        let (out, persist) = f(&mut draft)?;
        match persist {
            Persist::None => {}
            Persist::Active => write_active(&draft)?,
            Persist::Archived => write_archived(&draft)?,
            Persist::ArchiveThenActive => {
                write_archived(&draft)?;
                write_active(&draft)?;
            }
            Persist::ActiveThenArchive => {
                write_active(&draft)?;
                write_archived(&draft)?;
            }
        }
        self.projects.write().insert(key, draft);
        Ok(out)
    }
}

impl Default for WorktreeStore {
    fn default() -> Self {
        Self::new()
    }
}

fn write_active(entry: &ProjectEntry) -> Result<(), AppError> {
    let mut worktrees: Vec<WorktreeMetadata> = entry.active.values().cloned().collect();
    worktrees.sort_by(|a, b| a.id.cmp(&b.id));
    let doc = ActiveIndexFile {
        version: INDEX_VERSION,
        worktrees,
    };
    write_json_atomic(
        &control_dir(&entry.root).join(ACTIVE_FILE),
        &serde_json::to_string_pretty(&doc)?,
    )
}

fn write_archived(entry: &ProjectEntry) -> Result<(), AppError> {
    let mut archives: Vec<ArchivedWorktree> = entry.archived.values().cloned().collect();
    archives.sort_by(|a, b| a.id.cmp(&b.id));
    let doc = ArchiveIndexFile {
        version: INDEX_VERSION,
        archives,
    };
    write_json_atomic(
        &control_dir(&entry.root).join(ARCHIVE_FILE),
        &serde_json::to_string_pretty(&doc)?,
    )
}

/// Atomic write: temp file, keep one backup of the previous state, rename
/// into place (atomic on POSIX).
fn write_json_atomic(path: &Path, json: &str) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, json)?;

    if path.exists() {
        let backup_path = path.with_extension("json.bak");
        let _ = fs::rename(path, &backup_path);
    }

    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Read an index, falling back to the backup if the primary is missing,
/// empty, or unparseable.
fn load_index<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, AppError> {
    if path.exists() {
        let content = fs::read_to_string(path)?;
        if !content.trim().is_empty() {
            match serde_json::from_str(&content) {
                Ok(parsed) => return Ok(Some(parsed)),
                Err(e) => {
                    warn!(path = %path.display(), err = %e, "Index unreadable, trying backup");
                }
            }
        }
    }

    let backup_path = path.with_extension("json.bak");
    if backup_path.exists() {
        let content = fs::read_to_string(&backup_path)?;
        if !content.trim().is_empty() {
            return Ok(Some(serde_json::from_str(&content)?));
        }
    }

    Ok(None)
}
