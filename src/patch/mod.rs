use crate::git::{GitError, Repository};
use crate::protection::{FilePatterns, MatcherCache, first_matching_rule};
use crate::state::{PullStore, SharedStore, StateError, lock_store};
use crate::{PatchOutcome, PatchStatus, PullRequest, PullRequestFlow};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum PatchError {
    /// A ref or commit needed for the check cannot be resolved. The record is left as is.
    #[error("could not resolve refs of pull request {pr_id}: {source}")]
    RefResolution { pr_id: i64, source: GitError },
    /// Git failed for another reason (I/O, corruption, unexpected output).
    #[error("merge check of pull request {pr_id} failed: {source}")]
    MergeEngine { pr_id: i64, source: GitError },
    #[error("state error: {0}")]
    State(#[from] StateError),
}

impl PatchError {
    fn from_git(pr_id: i64, source: GitError) -> Self {
        if source.is_ref_resolution() {
            PatchError::RefResolution { pr_id, source }
        } else {
            PatchError::MergeEngine { pr_id, source }
        }
    }

    /// Whether running the check again may succeed. A missing record or a
    /// branch name git can never resolve will not.
    pub fn is_retryable(&self) -> bool {
        match self {
            PatchError::State(StateError::NotFound(_)) => false,
            PatchError::RefResolution { source, .. } => !source.is_malformed_ref(),
            _ => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, PatchError>;

/// Everything needed to run git for one pull request, resolved from the store.
#[derive(Debug)]
struct PatchInputs {
    pr: PullRequest,
    base_path: std::path::PathBuf,
    head_path: Option<std::path::PathBuf>,
    patterns: Arc<FilePatterns>,
}

/// Computes and persists the patch status of pull requests.
pub struct PatchEvaluator {
    store: SharedStore,
    matchers: Arc<MatcherCache>,
    protected_files_limit: usize,
}

impl PatchEvaluator {
    pub fn new(store: SharedStore, matchers: Arc<MatcherCache>, protected_files_limit: usize) -> Self {
        Self {
            store,
            matchers,
            protected_files_limit,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn matchers(&self) -> &Arc<MatcherCache> {
        &self.matchers
    }

    /// Evaluate the pull request and persist the outcome in one update.
    ///
    /// Nothing is written when any step fails.
    #[instrument(skip(self))]
    pub fn check(&self, pr_id: i64) -> Result<PatchOutcome> {
        let inputs = {
            let store = lock_store(&self.store);
            self.load_inputs(&store, pr_id)?
        };

        let outcome = match self.evaluate_inputs(&inputs) {
            Ok(outcome) => outcome,
            Err(err @ PatchError::RefResolution { .. }) => {
                warn!(error = %err, "could not compute patch status");
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        lock_store(&self.store).save_patch_outcome(pr_id, &outcome)?;

        info!(
            status = %outcome.status,
            ahead = outcome.commits_ahead,
            behind = outcome.commits_behind,
            conflicts = outcome.conflicted_files.len(),
            protected = outcome.changed_protected_files.len(),
            "patch status updated"
        );

        Ok(outcome)
    }

    /// Compute the outcome for a pull request without persisting it.
    pub fn evaluate(&self, pr: &PullRequest) -> Result<PatchOutcome> {
        let inputs = {
            let store = lock_store(&self.store);
            self.load_inputs_for(&store, pr.clone())?
        };
        self.evaluate_inputs(&inputs)
    }

    fn load_inputs(&self, store: &PullStore, pr_id: i64) -> Result<PatchInputs> {
        let pr = store.get_pull_request(pr_id)?;
        self.load_inputs_for(store, pr)
    }

    fn load_inputs_for(&self, store: &PullStore, pr: PullRequest) -> Result<PatchInputs> {
        let base_path = store.get_repository(pr.base_repo_id)?.path;
        let head_path = if pr.is_same_repo() {
            None
        } else {
            Some(store.get_repository(pr.head_repo_id)?.path)
        };

        let patterns = self
            .matchers
            .get_or_load(pr.base_repo_id, &pr.base_branch, || {
                let rules = store.protected_branches(pr.base_repo_id)?;
                Ok::<_, StateError>(
                    first_matching_rule(&rules, &pr.base_branch)
                        .map(|rule| rule.protected_files())
                        .unwrap_or_default(),
                )
            })?;

        Ok(PatchInputs {
            pr,
            base_path,
            head_path,
            patterns,
        })
    }

    fn evaluate_inputs(&self, inputs: &PatchInputs) -> Result<PatchOutcome> {
        let pr = &inputs.pr;
        let git_err = |e| PatchError::from_git(pr.id, e);

        let base = Repository::open(&inputs.base_path).map_err(git_err)?;
        let (repo, head_rev) = resolve_head(base, pr, inputs.head_path.as_deref()).map_err(git_err)?;

        evaluate_refs(
            &repo,
            &pr.base_branch_ref(),
            &head_rev,
            &inputs.patterns,
            self.protected_files_limit,
        )
        .map_err(git_err)
    }
}

/// Pick the repository handle and revision that name the head of `pr`.
fn resolve_head(
    base: Repository,
    pr: &PullRequest,
    head_path: Option<&std::path::Path>,
) -> crate::git::Result<(Repository, String)> {
    match (pr.flow, head_path) {
        (PullRequestFlow::AGit, _) => {
            let rev = pr
                .head_commit_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| pr.git_ref_name());
            Ok((base, rev))
        }
        (PullRequestFlow::Regular, None) => Ok((base, pr.head_branch_ref())),
        (PullRequestFlow::Regular, Some(path)) => {
            // Fork: pin the head commit, then read its objects from the fork.
            let head_repo = Repository::open(path)?;
            let head_commit = head_repo.rev_parse(&pr.head_branch_ref())?;
            Ok((base.with_alternate_objects(&head_repo), head_commit))
        }
    }
}

/// The patch-status state machine over two revisions of `repo`.
///
/// Only reads the repository: merge results go to a throwaway object directory.
pub fn evaluate_refs(
    repo: &Repository,
    base_rev: &str,
    head_rev: &str,
    patterns: &FilePatterns,
    protected_files_limit: usize,
) -> crate::git::Result<PatchOutcome> {
    let base_commit = repo.rev_parse(base_rev)?;
    let head_commit = repo.rev_parse(head_rev)?;
    let merge_base = repo.merge_base(&base_commit, &head_commit)?;
    let (commits_ahead, commits_behind) = repo.ahead_behind(&base_commit, &head_commit)?;

    let mut outcome = PatchOutcome {
        status: PatchStatus::Ancestor,
        merge_base,
        head_commit_id: head_commit,
        commits_ahead,
        commits_behind,
        conflicted_files: Vec::new(),
        changed_protected_files: Vec::new(),
    };

    if commits_ahead == 0 {
        return Ok(outcome);
    }

    let scratch = tempfile::Builder::new()
        .prefix("patch-status-")
        .tempdir()?;
    let scratch_repo = repo.clone().with_scratch_objects(scratch.path());

    let merged = scratch_repo.merge_tree(&outcome.merge_base, &base_commit, &outcome.head_commit_id)?;

    if merged.has_conflicts() {
        outcome.status = PatchStatus::Conflict;
        outcome.conflicted_files = merged.conflicted_files;

        // Conflict wins; protected files are reported only if the diff can still be read.
        if !patterns.is_empty() {
            match scratch_repo.changed_files(&base_commit, &merged.tree) {
                Ok(changed) => {
                    outcome.changed_protected_files =
                        patterns.changed_protected_files(changed, protected_files_limit);
                }
                Err(err) => debug!(error = %err, "no diff for conflicted merge"),
            }
        }
        return Ok(outcome);
    }

    outcome.status = if scratch_repo.tree_matches(&merged.tree, &base_commit)? {
        PatchStatus::Empty
    } else {
        PatchStatus::Mergeable
    };

    if !patterns.is_empty() {
        let changed = scratch_repo.changed_files(&base_commit, &merged.tree)?;
        outcome.changed_protected_files = patterns.changed_protected_files(changed, protected_files_limit);
    }

    Ok(outcome)
}
