pub mod agit;
pub mod checker;
pub mod cli;
pub mod config;
pub mod git;
pub mod patch;
pub mod protection;
pub mod state;
pub mod telemetry;

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Mergeability of a pull request as last computed by the patch checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchStatus {
    /// Not evaluated yet.
    Pending,
    Mergeable,
    Conflict,
    /// Merges cleanly but changes nothing on the base branch.
    Empty,
    /// Head is already contained in base.
    Ancestor,
}

impl PatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PatchStatus::Pending => "pending",
            PatchStatus::Mergeable => "mergeable",
            PatchStatus::Conflict => "conflict",
            PatchStatus::Empty => "empty",
            PatchStatus::Ancestor => "ancestor",
        }
    }

    /// Whether merging the pull request is currently allowed.
    pub fn is_mergeable(self) -> bool {
        matches!(
            self,
            PatchStatus::Mergeable | PatchStatus::Empty | PatchStatus::Ancestor
        )
    }
}

impl fmt::Display for PatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for PatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PatchStatus::Pending),
            "mergeable" => Ok(PatchStatus::Mergeable),
            "conflict" => Ok(PatchStatus::Conflict),
            "empty" => Ok(PatchStatus::Empty),
            "ancestor" => Ok(PatchStatus::Ancestor),
            other => Err(other.to_owned()),
        }
    }
}

/// How the head of a pull request is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PullRequestFlow {
    /// Head is a branch in the base or a forked repository.
    Regular,
    /// Head was pushed to `refs/for/<branch>` and lives under a synthetic `user/topic` name.
    AGit,
}

impl PullRequestFlow {
    pub fn as_i64(self) -> i64 {
        match self {
            PullRequestFlow::Regular => 0,
            PullRequestFlow::AGit => 1,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(PullRequestFlow::Regular),
            1 => Some(PullRequestFlow::AGit),
            _ => None,
        }
    }
}

/// A pull request record, restricted to the fields the patch checker reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequest {
    pub id: i64,
    pub index: i64,
    pub base_repo_id: i64,
    pub head_repo_id: i64,
    pub base_branch: String,
    pub head_branch: String,
    pub flow: PullRequestFlow,
    pub head_commit_id: Option<String>,
    pub merge_base: Option<String>,
    pub status: PatchStatus,
    pub commits_ahead: u32,
    pub commits_behind: u32,
    pub conflicted_files: Vec<String>,
    pub changed_protected_files: Vec<String>,
}

impl PullRequest {
    /// The server-side ref that always points at the head of this pull request.
    pub fn git_ref_name(&self) -> String {
        format!("refs/pull/{}/head", self.index)
    }

    pub fn head_branch_ref(&self) -> String {
        format!("refs/heads/{}", self.head_branch)
    }

    pub fn base_branch_ref(&self) -> String {
        format!("refs/heads/{}", self.base_branch)
    }

    pub fn is_same_repo(&self) -> bool {
        self.base_repo_id == self.head_repo_id
    }

    pub fn mergeable(&self) -> bool {
        self.status.is_mergeable()
    }
}

/// Result of one evaluation, persisted as a single update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchOutcome {
    pub status: PatchStatus,
    pub merge_base: String,
    pub head_commit_id: String,
    pub commits_ahead: u32,
    pub commits_behind: u32,
    pub conflicted_files: Vec<String>,
    pub changed_protected_files: Vec<String>,
}
