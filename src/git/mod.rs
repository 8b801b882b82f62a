pub mod runner;
pub mod types;

use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

use crate::error::AppError;
use runner::{run_git, run_git_lenient};
use types::{AheadBehind, StatusSummary, WorktreeListEntry};

/// Create a worktree for `branch` at `worktree_path`.
///
/// Tries `-b` first (new branch); falls back to checking out the branch if it
/// already exists. Returns true when the branch was created here, so a
/// rollback knows whether deleting it is safe.
pub fn create_worktree(
    repo_root: &Path,
    branch: &str,
    worktree_path: &Path,
    timeout: Duration,
) -> Result<bool, AppError> {
    let path = worktree_path.to_string_lossy();
    info!(branch = %branch, path = %path, "Creating worktree");

    let attempt = run_git_lenient(
        repo_root,
        &["worktree", "add", "-b", branch, &path],
        timeout,
    )?;
    if attempt.success {
        return Ok(true);
    }

    // Branch may already exist; retry without -b
    run_git(repo_root, &["worktree", "add", &path, branch], timeout)?;
    Ok(false)
}

pub fn remove_worktree(
    repo_root: &Path,
    worktree_path: &Path,
    timeout: Duration,
) -> Result<(), AppError> {
    let path = worktree_path.to_string_lossy();
    info!(path = %path, "Removing worktree");

    // Nothing to clean up if the repository itself is gone
    if !repo_root.exists() {
        info!(root = %repo_root.display(), "Project directory gone, skipping git cleanup");
        return Ok(());
    }

    run_git(repo_root, &["worktree", "remove", "--force", &path], timeout).map_err(|e| {
        error!(path = %path, err = %e, "Failed to remove worktree");
        e
    })?;
    Ok(())
}

pub fn move_worktree(
    repo_root: &Path,
    from: &Path,
    to: &Path,
    timeout: Duration,
) -> Result<(), AppError> {
    info!(from = %from.display(), to = %to.display(), "Moving worktree");
    run_git(
        repo_root,
        &["worktree", "move", &from.to_string_lossy(), &to.to_string_lossy()],
        timeout,
    )
    .map(|_| ())
}

pub fn lock_worktree(
    repo_root: &Path,
    worktree_path: &Path,
    reason: &str,
    timeout: Duration,
) -> Result<(), AppError> {
    run_git(
        repo_root,
        &[
            "worktree",
            "lock",
            "--reason",
            reason,
            &worktree_path.to_string_lossy(),
        ],
        timeout,
    )
    .map(|_| ())
}

/// Unlock a worktree; already-unlocked is not an error.
pub fn unlock_worktree(repo_root: &Path, worktree_path: &Path, timeout: Duration) {
    let _ = run_git_lenient(
        repo_root,
        &["worktree", "unlock", &worktree_path.to_string_lossy()],
        timeout,
    );
}

pub fn prune_worktrees(repo_root: &Path, timeout: Duration) {
    let _ = run_git_lenient(repo_root, &["worktree", "prune"], timeout);
}

pub fn delete_branch(repo_root: &Path, branch: &str, timeout: Duration) {
    let _ = run_git_lenient(repo_root, &["branch", "-D", "--", branch], timeout);
}

pub fn list_worktrees(
    repo_root: &Path,
    timeout: Duration,
) -> Result<Vec<WorktreeListEntry>, AppError> {
    let output = run_git(repo_root, &["worktree", "list", "--porcelain"], timeout)?;
    Ok(parse_worktree_list(&output.stdout))
}

fn parse_worktree_list(output: &str) -> Vec<WorktreeListEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeListEntry> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeListEntry {
                path: path.to_string(),
                head: None,
                branch: None,
                locked: false,
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = Some(head.to_string());
        } else if let Some(refname) = line.strip_prefix("branch ") {
            entry.branch = Some(
                refname
                    .strip_prefix("refs/heads/")
                    .unwrap_or(refname)
                    .to_string(),
            );
        } else if line == "detached" {
            entry.branch = None;
        } else if line == "locked" || line.starts_with("locked ") {
            entry.locked = true;
        }
    }
    if let Some(entry) = current.take() {
        entries.push(entry);
    }
    entries
}

pub fn read_status(worktree_path: &Path, timeout: Duration) -> Result<StatusSummary, AppError> {
    let output = run_git(worktree_path, &["status", "--porcelain"], timeout)?;
    Ok(parse_porcelain_status(&output.stdout))
}

fn parse_porcelain_status(output: &str) -> StatusSummary {
    let mut summary = StatusSummary::default();
    for line in output.lines() {
        if line.is_empty() {
            continue;
        }
        summary.dirty = true;
        let code = &line[..line.len().min(2)];
        if matches!(code, "DD" | "AU" | "UD" | "UA" | "DU" | "AA" | "UU") {
            summary.conflicted = true;
        }
    }
    summary
}

/// True while a merge or rebase is underway, even with no conflict markers
/// left in the index.
pub fn merge_or_rebase_in_progress(worktree_path: &Path, timeout: Duration) -> bool {
    for pseudo_ref in ["MERGE_HEAD", "REBASE_HEAD"] {
        if let Ok(output) = run_git_lenient(
            worktree_path,
            &["rev-parse", "--verify", "--quiet", pseudo_ref],
            timeout,
        ) {
            if output.success {
                return true;
            }
        }
    }
    false
}

/// Commits ahead of / behind the configured upstream. A branch with no
/// upstream is 0/0.
pub fn ahead_behind(worktree_path: &Path, timeout: Duration) -> Result<AheadBehind, AppError> {
    let output = run_git_lenient(
        worktree_path,
        &["rev-list", "--left-right", "--count", "@{upstream}...HEAD"],
        timeout,
    )?;
    if !output.success {
        return Ok(AheadBehind::default());
    }
    parse_ahead_behind(&output.stdout)
        .ok_or_else(|| AppError::git("git rev-list --left-right --count", "unparseable count output"))
}

fn parse_ahead_behind(output: &str) -> Option<AheadBehind> {
    let mut parts = output.split_whitespace();
    let behind = parts.next()?.parse().ok()?;
    let ahead = parts.next()?.parse().ok()?;
    Some(AheadBehind { ahead, behind })
}

/// Short name of the branch actually checked out, `None` when HEAD is
/// detached.
pub fn current_branch(worktree_path: &Path, timeout: Duration) -> Result<Option<String>, AppError> {
    let output = run_git_lenient(worktree_path, &["symbolic-ref", "--short", "HEAD"], timeout)?;
    if !output.success {
        return Ok(None);
    }
    Ok(Some(output.stdout.trim().to_string()))
}

/// Detect the main branch name. Prefers the remote HEAD reference (handles
/// custom default branch names), then `main`, then `master`.
pub fn detect_main_branch(repo_root: &Path, timeout: Duration) -> Result<Option<String>, AppError> {
    let output = run_git_lenient(
        repo_root,
        &["symbolic-ref", "refs/remotes/origin/HEAD"],
        timeout,
    )?;
    if output.success {
        let refname = output.stdout.trim();
        if let Some(branch) = refname.strip_prefix("refs/remotes/origin/") {
            return Ok(Some(branch.to_string()));
        }
    }

    for candidate in ["main", "master"] {
        let output = run_git_lenient(
            repo_root,
            &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", candidate)],
            timeout,
        )?;
        if output.success {
            return Ok(Some(candidate.to_string()));
        }
    }
    Ok(None)
}

/// Count commits on `branch` not present on any configured remote. In a
/// repository with no remotes every commit counts as unpushed.
pub fn unpushed_commit_count(
    repo_root: &Path,
    branch: &str,
    timeout: Duration,
) -> Result<u32, AppError> {
    let output = run_git(
        repo_root,
        &["rev-list", "--count", branch, "--not", "--remotes"],
        timeout,
    )?;
    parse_count(&output.stdout)
        .ok_or_else(|| AppError::git("git rev-list --count", "unparseable count output"))
}

/// Count commits unique to `branch` relative to the detected main branch;
/// 0 when no main branch exists or `branch` is the main branch.
pub fn unique_commit_count(
    repo_root: &Path,
    branch: &str,
    timeout: Duration,
) -> Result<u32, AppError> {
    let Some(main_branch) = detect_main_branch(repo_root, timeout)? else {
        return Ok(0);
    };
    if main_branch == branch {
        return Ok(0);
    }
    let range = format!("{}..{}", main_branch, branch);
    let output = run_git(repo_root, &["rev-list", "--count", &range], timeout)?;
    parse_count(&output.stdout)
        .ok_or_else(|| AppError::git("git rev-list --count", "unparseable count output"))
}

fn parse_count(output: &str) -> Option<u32> {
    output.trim().parse().ok()
}
