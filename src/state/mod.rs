use crate::protection::ProtectedBranchRule;
use crate::{PatchOutcome, PatchStatus, PullRequest, PullRequestFlow};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Errors that can occur during state operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("invalid patch status: {0}")]
    InvalidStatus(String),
    #[error("invalid pull request flow: {0}")]
    InvalidFlow(i64),
    #[error("invalid file list: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0} not found")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Store shared between the CLI, the evaluator and checker workers.
pub type SharedStore = Arc<Mutex<PullStore>>;

/// Lock the shared store. Every write is a single statement or transaction,
/// so a poisoned lock is recovered rather than propagated.
pub fn lock_store(store: &SharedStore) -> MutexGuard<'_, PullStore> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS repositories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner TEXT NOT NULL,
    name TEXT NOT NULL,
    path TEXT NOT NULL,
    UNIQUE(owner, name)
);
CREATE TABLE IF NOT EXISTS pull_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pr_index INTEGER NOT NULL,
    base_repo_id INTEGER NOT NULL REFERENCES repositories(id),
    head_repo_id INTEGER NOT NULL REFERENCES repositories(id),
    base_branch TEXT NOT NULL,
    head_branch TEXT NOT NULL,
    flow INTEGER NOT NULL DEFAULT 0,
    head_commit_id TEXT,
    merge_base TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    commits_ahead INTEGER NOT NULL DEFAULT 0,
    commits_behind INTEGER NOT NULL DEFAULT 0,
    conflicted_files TEXT NOT NULL DEFAULT '[]',
    changed_protected_files TEXT NOT NULL DEFAULT '[]',
    UNIQUE(base_repo_id, pr_index)
);
CREATE INDEX IF NOT EXISTS pull_requests_base ON pull_requests(base_repo_id, base_branch);
CREATE INDEX IF NOT EXISTS pull_requests_head ON pull_requests(head_repo_id, head_branch);
CREATE TABLE IF NOT EXISTS protected_branches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_id INTEGER NOT NULL REFERENCES repositories(id),
    rule_name TEXT NOT NULL,
    protected_file_patterns TEXT NOT NULL DEFAULT '',
    unprotected_file_patterns TEXT NOT NULL DEFAULT '',
    priority INTEGER NOT NULL DEFAULT 0,
    UNIQUE(repo_id, rule_name)
);
";

const PULL_COLUMNS: &str = "id, pr_index, base_repo_id, head_repo_id, base_branch, head_branch, flow,
    head_commit_id, merge_base, status, commits_ahead, commits_behind,
    conflicted_files, changed_protected_files";

/// A repository hosted on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRecord {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub path: PathBuf,
}

impl RepositoryRecord {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Fields supplied when a pull request is opened.
#[derive(Debug, Clone)]
pub struct NewPullRequest {
    pub base_repo_id: i64,
    pub head_repo_id: i64,
    pub base_branch: String,
    pub head_branch: String,
    pub flow: PullRequestFlow,
    pub head_commit_id: Option<String>,
}

/// Row as read from SQLite, before enum and JSON decoding.
struct PullRow {
    id: i64,
    index: i64,
    base_repo_id: i64,
    head_repo_id: i64,
    base_branch: String,
    head_branch: String,
    flow: i64,
    head_commit_id: Option<String>,
    merge_base: Option<String>,
    status: String,
    commits_ahead: u32,
    commits_behind: u32,
    conflicted_files: String,
    changed_protected_files: String,
}

impl PullRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            index: row.get(1)?,
            base_repo_id: row.get(2)?,
            head_repo_id: row.get(3)?,
            base_branch: row.get(4)?,
            head_branch: row.get(5)?,
            flow: row.get(6)?,
            head_commit_id: row.get(7)?,
            merge_base: row.get(8)?,
            status: row.get(9)?,
            commits_ahead: row.get(10)?,
            commits_behind: row.get(11)?,
            conflicted_files: row.get(12)?,
            changed_protected_files: row.get(13)?,
        })
    }

    fn decode(self) -> Result<PullRequest> {
        let status = self
            .status
            .parse::<PatchStatus>()
            .map_err(StateError::InvalidStatus)?;
        let flow = PullRequestFlow::from_i64(self.flow).ok_or(StateError::InvalidFlow(self.flow))?;

        Ok(PullRequest {
            id: self.id,
            index: self.index,
            base_repo_id: self.base_repo_id,
            head_repo_id: self.head_repo_id,
            base_branch: self.base_branch,
            head_branch: self.head_branch,
            flow,
            head_commit_id: self.head_commit_id,
            merge_base: self.merge_base,
            status,
            commits_ahead: self.commits_ahead,
            commits_behind: self.commits_behind,
            conflicted_files: serde_json::from_str(&self.conflicted_files)?,
            changed_protected_files: serde_json::from_str(&self.changed_protected_files)?,
        })
    }
}

/// SQLite-backed store for repositories, pull requests and protection rules.
///
/// The patch checker only ever writes through [`PullStore::save_patch_outcome`].
pub struct PullStore {
    conn: Connection,
}

impl PullStore {
    /// Open or create the database at the given path.
    ///
    /// Creates the necessary tables if they don't exist.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    pub fn add_repository(&mut self, owner: &str, name: &str, path: &Path) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO repositories (owner, name, path) VALUES (?1, ?2, ?3)",
            params![owner, name, path.to_string_lossy()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_repository(&self, id: i64) -> Result<RepositoryRecord> {
        self.conn
            .query_row(
                "SELECT id, owner, name, path FROM repositories WHERE id = ?1",
                params![id],
                repository_from_row,
            )
            .optional()?
            .ok_or_else(|| StateError::NotFound(format!("repository {}", id)))
    }

    pub fn find_repository(&self, owner: &str, name: &str) -> Result<Option<RepositoryRecord>> {
        let found = self
            .conn
            .query_row(
                "SELECT id, owner, name, path FROM repositories WHERE owner = ?1 AND name = ?2",
                params![owner, name],
                repository_from_row,
            )
            .optional()?;
        Ok(found)
    }

    /// Insert a pull request with the next index of its base repository and a pending status.
    pub fn create_pull_request(&mut self, new: &NewPullRequest) -> Result<PullRequest> {
        let tx = self.conn.transaction()?;

        let index: i64 = tx.query_row(
            "SELECT COALESCE(MAX(pr_index), 0) + 1 FROM pull_requests WHERE base_repo_id = ?1",
            params![new.base_repo_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO pull_requests
                (pr_index, base_repo_id, head_repo_id, base_branch, head_branch, flow, head_commit_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                index,
                new.base_repo_id,
                new.head_repo_id,
                new.base_branch,
                new.head_branch,
                new.flow.as_i64(),
                new.head_commit_id,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        self.get_pull_request(id)
    }

    pub fn get_pull_request(&self, id: i64) -> Result<PullRequest> {
        let sql = format!("SELECT {} FROM pull_requests WHERE id = ?1", PULL_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], PullRow::from_row)
            .optional()?
            .ok_or_else(|| StateError::NotFound(format!("pull request {}", id)))?;
        row.decode()
    }

    /// The pull request merging `head_branch` into `base_branch`, if one exists.
    pub fn find_pull_request(
        &self,
        base_repo_id: i64,
        base_branch: &str,
        head_repo_id: i64,
        head_branch: &str,
        flow: PullRequestFlow,
    ) -> Result<Option<PullRequest>> {
        let sql = format!(
            "SELECT {} FROM pull_requests
             WHERE base_repo_id = ?1 AND base_branch = ?2 AND head_repo_id = ?3
               AND head_branch = ?4 AND flow = ?5
             ORDER BY id LIMIT 1",
            PULL_COLUMNS
        );
        let row = self
            .conn
            .query_row(
                &sql,
                params![base_repo_id, base_branch, head_repo_id, head_branch, flow.as_i64()],
                PullRow::from_row,
            )
            .optional()?;
        row.map(PullRow::decode).transpose()
    }

    /// Pull requests that target `branch` of a repository.
    pub fn pull_requests_by_base(&self, repo_id: i64, branch: &str) -> Result<Vec<PullRequest>> {
        self.query_pulls(
            "WHERE base_repo_id = ?1 AND base_branch = ?2 ORDER BY id",
            params![repo_id, branch],
        )
    }

    /// Regular-flow pull requests whose head is `branch` of a repository.
    pub fn pull_requests_by_head(&self, repo_id: i64, branch: &str) -> Result<Vec<PullRequest>> {
        self.query_pulls(
            "WHERE head_repo_id = ?1 AND head_branch = ?2 AND flow = 0 ORDER BY id",
            params![repo_id, branch],
        )
    }

    /// Every pull request targeting the repository.
    pub fn pull_requests_by_repo(&self, repo_id: i64) -> Result<Vec<PullRequest>> {
        self.query_pulls("WHERE base_repo_id = ?1 ORDER BY id", params![repo_id])
    }

    fn query_pulls(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<PullRequest>> {
        let sql = format!("SELECT {} FROM pull_requests {}", PULL_COLUMNS, filter);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(args, PullRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter().map(PullRow::decode).collect()
    }

    /// Record a newly pushed head commit (AGit flow).
    pub fn set_head_commit(&mut self, id: i64, commit: &str) -> Result<()> {
        let count = self.conn.execute(
            "UPDATE pull_requests SET head_commit_id = ?2 WHERE id = ?1",
            params![id, commit],
        )?;
        if count == 0 {
            return Err(StateError::NotFound(format!("pull request {}", id)));
        }
        Ok(())
    }

    /// Persist every field computed by one evaluation in a single update.
    ///
    /// The head commit of AGit pull requests belongs to the push path and is kept.
    pub fn save_patch_outcome(&mut self, id: i64, outcome: &PatchOutcome) -> Result<()> {
        let conflicted = serde_json::to_string(&outcome.conflicted_files)?;
        let protected = serde_json::to_string(&outcome.changed_protected_files)?;

        let tx = self.conn.transaction()?;
        let count = tx.execute(
            "UPDATE pull_requests SET
                status = ?2,
                merge_base = ?3,
                head_commit_id = CASE WHEN flow = 1 THEN head_commit_id ELSE ?4 END,
                commits_ahead = ?5,
                commits_behind = ?6,
                conflicted_files = ?7,
                changed_protected_files = ?8
             WHERE id = ?1",
            params![
                id,
                outcome.status.as_str(),
                outcome.merge_base,
                outcome.head_commit_id,
                outcome.commits_ahead,
                outcome.commits_behind,
                conflicted,
                protected,
            ],
        )?;
        if count == 0 {
            return Err(StateError::NotFound(format!("pull request {}", id)));
        }
        tx.commit()?;

        Ok(())
    }

    /// Insert a rule, or replace the patterns and priority of the rule with the same name.
    pub fn upsert_protected_branch(&mut self, rule: &ProtectedBranchRule) -> Result<i64> {
        let id = self.conn.query_row(
            "INSERT INTO protected_branches
                (repo_id, rule_name, protected_file_patterns, unprotected_file_patterns, priority)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(repo_id, rule_name) DO UPDATE SET
                protected_file_patterns = ?3,
                unprotected_file_patterns = ?4,
                priority = ?5
             RETURNING id",
            params![
                rule.repo_id,
                rule.rule_name,
                rule.protected_file_patterns,
                rule.unprotected_file_patterns,
                rule.priority,
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Rules of a repository, ordered by priority then id.
    pub fn protected_branches(&self, repo_id: i64) -> Result<Vec<ProtectedBranchRule>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, repo_id, rule_name, protected_file_patterns, unprotected_file_patterns, priority
             FROM protected_branches WHERE repo_id = ?1 ORDER BY priority, id",
        )?;

        let rules = stmt
            .query_map(params![repo_id], |row| {
                Ok(ProtectedBranchRule {
                    id: row.get(0)?,
                    repo_id: row.get(1)?,
                    rule_name: row.get(2)?,
                    protected_file_patterns: row.get(3)?,
                    unprotected_file_patterns: row.get(4)?,
                    priority: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rules)
    }

    /// Delete a rule; returns the repository it belonged to, if it existed.
    pub fn delete_protected_branch(&mut self, id: i64) -> Result<Option<i64>> {
        let repo_id = self
            .conn
            .query_row(
                "DELETE FROM protected_branches WHERE id = ?1 RETURNING repo_id",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(repo_id)
    }
}

fn repository_from_row(row: &Row<'_>) -> rusqlite::Result<RepositoryRecord> {
    let path: String = row.get(3)?;
    Ok(RepositoryRecord {
        id: row.get(0)?,
        owner: row.get(1)?,
        name: row.get(2)?,
        path: PathBuf::from(path),
    })
}
