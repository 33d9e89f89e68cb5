#![allow(dead_code)]

use patch_status::patch::PatchEvaluator;
use patch_status::protection::{MatcherCache, ProtectedBranchRule};
use patch_status::state::{NewPullRequest, PullStore, SharedStore, lock_store};
use patch_status::{PullRequest, PullRequestFlow};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

/// Run git in `dir` and return trimmed stdout, failing the test on error.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

pub fn configure_identity(dir: &Path) {
    git(dir, &["config", "user.name", "Test"]);
    git(dir, &["config", "user.email", "test@example.com"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
}

/// Commit `content` as `name` on the current branch and return the new commit id.
pub fn commit_file(dir: &Path, name: &str, content: &str) -> String {
    fs::write(dir.join(name), content).unwrap();
    git(dir, &["add", name]);
    git(dir, &["commit", "-q", "-m", &format!("update {}", name)]);
    git(dir, &["rev-parse", "HEAD"])
}

/// A set of repositories on disk plus the store that tracks them.
pub struct Forge {
    root: TempDir,
    pub store: SharedStore,
    pub evaluator: Arc<PatchEvaluator>,
}

impl Forge {
    pub fn new() -> Self {
        Self::with_limit(10)
    }

    pub fn with_limit(protected_files_limit: usize) -> Self {
        let root = tempfile::tempdir().unwrap();
        let store = PullStore::open(&root.path().join("patch-status.db"))
            .unwrap()
            .into_shared();
        let evaluator = Arc::new(PatchEvaluator::new(
            Arc::clone(&store),
            Arc::new(MatcherCache::new()),
            protected_files_limit,
        ));
        Self {
            root,
            store,
            evaluator,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    /// Create `owner/name` with `main` holding a single `.spokeperson` commit.
    pub fn create_repo(&self, owner: &str, name: &str) -> (i64, PathBuf) {
        let dir = self.path(&format!("{}-{}", owner, name));
        fs::create_dir_all(&dir).unwrap();
        git(&dir, &["init", "-q", "-b", "main"]);
        configure_identity(&dir);
        commit_file(&dir, ".spokeperson", "n0toose");

        let id = lock_store(&self.store)
            .add_repository(owner, name, &dir)
            .unwrap();
        (id, dir)
    }

    /// Clone `source` as `owner/name`.
    pub fn fork_repo(&self, source: &Path, owner: &str, name: &str) -> (i64, PathBuf) {
        let dir = self.path(&format!("{}-{}", owner, name));
        let status = Command::new("git")
            .arg("clone")
            .arg("-q")
            .arg(source)
            .arg(&dir)
            .status()
            .unwrap();
        assert!(status.success());
        configure_identity(&dir);

        let id = lock_store(&self.store)
            .add_repository(owner, name, &dir)
            .unwrap();
        (id, dir)
    }

    pub fn open_pull(&self, base_repo: i64, base: &str, head_repo: i64, head: &str) -> PullRequest {
        lock_store(&self.store)
            .create_pull_request(&NewPullRequest {
                base_repo_id: base_repo,
                head_repo_id: head_repo,
                base_branch: base.to_string(),
                head_branch: head.to_string(),
                flow: PullRequestFlow::Regular,
                head_commit_id: None,
            })
            .unwrap()
    }

    pub fn protect(&self, repo_id: i64, rule: &str, protected: &str) -> i64 {
        lock_store(&self.store)
            .upsert_protected_branch(&ProtectedBranchRule {
                id: 0,
                repo_id,
                rule_name: rule.to_string(),
                protected_file_patterns: protected.to_string(),
                unprotected_file_patterns: String::new(),
                priority: 0,
            })
            .unwrap()
    }

    pub fn pull(&self, id: i64) -> PullRequest {
        lock_store(&self.store).get_pull_request(id).unwrap()
    }
}

/// Commit on a throwaway branch, return to `main` and drop the branch, leaving
/// only the objects behind (what a push to refs/for/main delivers).
pub fn dangling_commit(dir: &Path, name: &str, content: &str) -> String {
    git(dir, &["switch", "-q", "-c", "agit-work"]);
    let commit = commit_file(dir, name, content);
    git(dir, &["switch", "-q", "main"]);
    git(dir, &["branch", "-q", "-D", "agit-work"]);
    commit
}
