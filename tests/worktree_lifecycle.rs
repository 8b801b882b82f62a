use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tempfile::TempDir;

use worktree_manager::{AppError, ManagerConfig, WorktreeEvent, WorktreeManager};

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Fresh repository with one commit on `main`.
fn init_repo() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let repo = tmp.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    git(&repo, &["init"]);
    git(&repo, &["config", "user.email", "test@example.com"]);
    git(&repo, &["config", "user.name", "Test User"]);
    git(&repo, &["config", "commit.gpgsign", "false"]);
    std::fs::write(repo.join("README.md"), "Initial\n").unwrap();
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-m", "init"]);
    git(&repo, &["branch", "-M", "main"]);
    (tmp, repo)
}

/// Add a bare remote and push `main` so clean branches count as pushed.
fn add_remote(tmp: &TempDir, repo: &Path) {
    let remote = tmp.path().join("remote.git");
    let remote_str = remote.to_str().unwrap().to_string();
    git(tmp.path(), &["init", "--bare", "remote.git"]);
    git(repo, &["remote", "add", "origin", &remote_str]);
    git(repo, &["push", "-u", "origin", "main"]);
}

fn manager() -> WorktreeManager {
    WorktreeManager::new(ManagerConfig::default())
}

#[tokio::test(flavor = "multi_thread")]
async fn create_then_list_returns_record_and_directory() {
    let (_tmp, repo) = init_repo();
    let manager = manager();

    let meta = manager
        .create_worktree("p1", &repo, "feature/auth", &[])
        .await
        .unwrap();

    assert_eq!(meta.branch_name, "feature/auth");
    assert!(meta.worktree_path.exists());
    assert!(!meta.status.dirty);
    assert!(!meta.status.conflicted);
    assert_eq!(meta.status.ahead, 0);
    assert_eq!(meta.status.behind, 0);
    assert_eq!(meta.status.current_branch.as_deref(), Some("feature/auth"));

    let list = manager.list_worktrees("p1");
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].id, meta.id);
    assert_eq!(list[0].branch_name, "feature/auth");
    assert!(!list[0].is_archived);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_branch_names_leave_no_trace() {
    let (_tmp, repo) = init_repo();
    let manager = manager();

    for name in ["bad..name", "bad~name", "with space", "HEAD", "trailing/"] {
        let err = manager
            .create_worktree("p1", &repo, name, &[])
            .await
            .unwrap_err();
        assert!(
            matches!(err, AppError::Validation(_)),
            "{name:?} should fail validation"
        );
    }

    assert!(manager.list_worktrees("p1").is_empty());
    assert!(!repo.join(".worktrees").join("bad..name").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_same_branch_creates_one_success_one_conflict() {
    let (_tmp, repo) = init_repo();
    let manager = manager();

    let (first, second) = tokio::join!(
        manager.create_worktree("p1", &repo, "feature/dup", &[]),
        manager.create_worktree("p1", &repo, "feature/dup", &[]),
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let conflict = results.into_iter().find_map(Result::err).unwrap();
    assert!(matches!(conflict, AppError::Conflict(_)));
    assert_eq!(manager.list_worktrees("p1").len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn archive_then_restore_round_trip() {
    let (_tmp, repo) = init_repo();
    let manager = manager();

    let meta = manager
        .create_worktree("p1", &repo, "feature/x", &[])
        .await
        .unwrap();

    let record = manager.archive_worktree(&meta.id).await.unwrap();
    assert_eq!(record.id, meta.id);
    assert_eq!(record.branch_name, "feature/x");
    assert!(record.archive_path.exists());
    assert!(!meta.worktree_path.exists());
    assert!(manager.list_worktrees("p1").is_empty());
    assert_eq!(manager.list_archived("p1").len(), 1);

    // Archiving an already-archived id is NotFound, not a duplicate
    let again = manager.archive_worktree(&meta.id).await.unwrap_err();
    assert!(matches!(again, AppError::NotFound(_)));

    let restored = manager.restore_worktree(&record.id).await.unwrap();
    assert_eq!(restored.id, meta.id);
    assert_eq!(restored.branch_name, meta.branch_name);
    assert_eq!(restored.worktree_path, meta.worktree_path);
    assert!(restored.worktree_path.exists());
    assert!(manager.list_archived("p1").is_empty());
    assert_eq!(manager.list_worktrees("p1").len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn archive_preserves_uncommitted_files() {
    let (_tmp, repo) = init_repo();
    let manager = manager();

    let meta = manager
        .create_worktree("p1", &repo, "feature/wip", &[])
        .await
        .unwrap();
    std::fs::write(meta.worktree_path.join("draft.txt"), "not committed\n").unwrap();

    let record = manager.archive_worktree(&meta.id).await.unwrap();
    assert!(record.archive_path.join("draft.txt").exists());

    let restored = manager.restore_worktree(&record.id).await.unwrap();
    assert!(restored.worktree_path.join("draft.txt").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn sweep_deletes_expired_clean_archives_and_holds_unpushed() {
    let (tmp, repo) = init_repo();
    add_remote(&tmp, &repo);

    // Zero retention: every archive is expired as soon as it exists
    let manager = WorktreeManager::new(ManagerConfig {
        retention_days: 0,
        ..ManagerConfig::default()
    });

    // Clean branch: tip equals main, which is on the remote
    let clean = manager
        .create_worktree("p1", &repo, "feature/clean", &[])
        .await
        .unwrap();

    // Work branch: one commit that exists on no remote
    let work = manager
        .create_worktree("p1", &repo, "feature/work", &[])
        .await
        .unwrap();
    std::fs::write(work.worktree_path.join("work.txt"), "local only\n").unwrap();
    git(&work.worktree_path, &["add", "."]);
    git(&work.worktree_path, &["commit", "-m", "local work"]);

    let clean_record = manager.archive_worktree(&clean.id).await.unwrap();
    assert!(!clean_record.unpushed_commits);

    let work_record = manager.archive_worktree(&work.id).await.unwrap();
    assert!(work_record.unpushed_commits);
    assert_eq!(work_record.commit_count, 1);

    let mut events = manager.subscribe();
    let report = manager.sweep_expired().await.unwrap();

    assert_eq!(report.deleted, vec![clean_record.id.clone()]);
    assert_eq!(report.held, vec![work_record.id.clone()]);
    assert!(!clean_record.archive_path.exists());
    assert!(work_record.archive_path.exists());

    let remaining = manager.list_archived("p1");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, work_record.id);

    let mut saw_hold = false;
    while let Ok(event) = events.try_recv() {
        if let WorktreeEvent::ArchiveExpiryHeld { id, commit_count } = event {
            assert_eq!(id, work_record.id);
            assert_eq!(commit_count, 1);
            saw_hold = true;
        }
    }
    assert!(saw_hold, "expected an ArchiveExpiryHeld event");

    // A second sweep holds it again; only explicit deletion removes it
    let report = manager.sweep_expired().await.unwrap();
    assert_eq!(report.held, vec![work_record.id.clone()]);
    manager.delete_archived(&work_record.id).await.unwrap();
    assert!(manager.list_archived("p1").is_empty());
    assert!(!work_record.archive_path.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn create_copies_selected_gitignored_paths() {
    let (_tmp, repo) = init_repo();
    std::fs::write(repo.join(".gitignore"), "node_modules/\n*.log\n.env\n").unwrap();
    git(&repo, &["add", ".gitignore"]);
    git(&repo, &["commit", "-m", "ignore rules"]);

    std::fs::create_dir_all(repo.join("node_modules/pkg")).unwrap();
    std::fs::write(repo.join("node_modules/pkg/index.js"), "module\n").unwrap();
    std::fs::write(repo.join("debug.log"), "log\n").unwrap();
    std::fs::write(repo.join(".env"), "SECRET=1\n").unwrap();

    let manager = manager();
    let patterns = manager.parse_gitignore(&repo).unwrap();
    assert_eq!(patterns.len(), 3);
    let selections = manager.default_selection(&patterns);
    assert_eq!(selections, vec!["node_modules/", "*.log"]);

    let meta = manager
        .create_worktree("p1", &repo, "feature/auth", &selections)
        .await
        .unwrap();

    assert!(meta.worktree_path.join("node_modules/pkg/index.js").exists());
    assert!(meta.worktree_path.join("debug.log").exists());
    assert!(!meta.worktree_path.join(".env").exists());
    // Copied paths are themselves gitignored, so the checkout stays clean
    assert!(!meta.status.dirty);
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_removes_worktree_record_and_branch() {
    let (_tmp, repo) = init_repo();
    let manager = manager();

    let meta = manager
        .create_worktree("p1", &repo, "feature/gone", &[])
        .await
        .unwrap();

    manager.delete_worktree(&meta.id, true).await.unwrap();
    assert!(!meta.worktree_path.exists());
    assert!(manager.list_worktrees("p1").is_empty());

    let branches = Command::new("git")
        .args(["branch", "--list", "feature/gone"])
        .current_dir(&repo)
        .output()
        .unwrap();
    assert!(String::from_utf8_lossy(&branches.stdout).trim().is_empty());

    let again = manager.delete_worktree(&meta.id, false).await.unwrap_err();
    assert!(matches!(again, AppError::NotFound(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn restore_is_not_found_after_external_garbage_collection() {
    let (_tmp, repo) = init_repo();
    let manager = manager();

    let meta = manager
        .create_worktree("p1", &repo, "feature/lost", &[])
        .await
        .unwrap();
    let record = manager.archive_worktree(&meta.id).await.unwrap();

    // Someone cleans the archive directory outside the app
    std::fs::remove_dir_all(&record.archive_path).unwrap();

    let err = manager.restore_worktree(&record.id).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    // The record stays inspectable
    assert_eq!(manager.list_archived("p1").len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn refresh_picks_up_dirty_and_missing_worktrees() {
    let (_tmp, repo) = init_repo();
    let manager = manager();

    let meta = manager
        .create_worktree("p1", &repo, "feature/poll", &[])
        .await
        .unwrap();

    std::fs::write(meta.worktree_path.join("scratch.txt"), "wip\n").unwrap();
    manager.request_refresh(&meta.id);
    wait_for(|| manager.list_worktrees("p1")[0].status.dirty).await;

    // Directory removed behind the manager's back: flagged stale, kept
    std::fs::remove_dir_all(&meta.worktree_path).unwrap();
    manager.request_refresh(&meta.id);
    wait_for(|| manager.list_worktrees("p1")[0].is_stale).await;
    assert_eq!(manager.list_worktrees("p1").len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn records_survive_a_restart() {
    let (_tmp, repo) = init_repo();
    {
        let manager = manager();
        manager
            .create_worktree("p1", &repo, "feature/durable", &[])
            .await
            .unwrap();
    }

    let manager = manager();
    manager.register_project("p1", &repo).unwrap();
    let list = manager.list_worktrees("p1");
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].branch_name, "feature/durable");
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within 5s");
}
