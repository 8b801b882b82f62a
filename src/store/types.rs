use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Live repository state of a worktree. Replaced wholesale by each completed
/// poll, never field-by-field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeStatus {
    pub dirty: bool,
    pub ahead: u32,
    pub behind: u32,
    pub conflicted: bool,
    /// Branch actually checked out. Diverging from `branch_name` means the
    /// user switched branches inside the worktree; `None` means detached
    /// HEAD. An anomaly to surface, not an error.
    pub current_branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeMetadata {
    pub id: String,
    pub project_id: String,
    pub branch_name: String,
    pub worktree_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub is_archived: bool,
    #[serde(default)]
    pub gitignore_profile: Option<String>,
    /// Set when a poll finds the directory gone. Stale records stop being
    /// polled and wait for an explicit delete.
    #[serde(default)]
    pub is_stale: bool,
    #[serde(default)]
    pub status: WorktreeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedWorktree {
    pub id: String,
    pub project_id: String,
    pub branch_name: String,
    pub original_path: PathBuf,
    pub archive_path: PathBuf,
    pub archived_at: DateTime<Utc>,
    /// Fixed at archive time, never recomputed.
    pub expires_at: DateTime<Utc>,
    pub unpushed_commits: bool,
    pub commit_count: u32,
}
