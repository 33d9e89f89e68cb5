use crate::git::{self, GitError, Repository};
use crate::state::{NewPullRequest, SharedStore, StateError, lock_store};
use crate::PullRequestFlow;
use thiserror::Error;
use tracing::info;

const FOR_PREFIX: &str = "refs/for/";

#[derive(Debug, Error)]
pub enum AgitError {
    #[error("not an AGit target ref: {0}")]
    NotAgitRef(String),
    #[error("missing or invalid topic: {0}")]
    InvalidTopic(String),
    #[error("pushed commit {commit} is already contained in {base_branch}")]
    HeadIsAncestor { commit: String, base_branch: String },
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("state error: {0}")]
    State(#[from] StateError),
}

pub type Result<T> = std::result::Result<T, AgitError>;

/// A push to `refs/for/<base_branch>` carrying a topic.
#[derive(Debug, Clone)]
pub struct AgitPush {
    pub repo_id: i64,
    pub base_branch: String,
    pub topic: String,
    pub pusher: String,
    pub commit: String,
}

impl AgitPush {
    /// Build from the raw push: target ref (`refs/for/main`) and `-o key=value` push options.
    pub fn from_push(
        repo_id: i64,
        pusher: &str,
        target_ref: &str,
        push_options: &[String],
        commit: &str,
    ) -> Result<Self> {
        let base_branch = target_ref
            .strip_prefix(FOR_PREFIX)
            .filter(|branch| !branch.is_empty())
            .ok_or_else(|| AgitError::NotAgitRef(target_ref.to_string()))?;

        let topic = push_options
            .iter()
            .find_map(|opt| opt.strip_prefix("topic="))
            .ok_or_else(|| AgitError::InvalidTopic("no topic push option".to_string()))?;

        Ok(Self {
            repo_id,
            base_branch: base_branch.to_string(),
            topic: topic.to_string(),
            pusher: pusher.to_string(),
            commit: commit.to_string(),
        })
    }

    /// The synthetic head branch name, `<pusher>/<topic>`.
    pub fn head_branch(&self) -> String {
        format!("{}/{}", self.pusher, self.topic)
    }
}

/// What an accepted push did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgitOutcome {
    pub pr_id: i64,
    pub created: bool,
    pub head_commit_id: String,
}

/// Create or update the pull request for an AGit push.
///
/// A head that is already contained in the base branch is rejected before any
/// record or ref is written, so AGit pull requests never reach the ancestor state.
pub fn process_push(store: &SharedStore, push: &AgitPush) -> Result<AgitOutcome> {
    if push.topic.contains("..")
        || push.topic.contains(['~', '^', ':', '?', '*', '[', '\\'])
        || git::validate_git_ref(&push.topic).is_err()
    {
        return Err(AgitError::InvalidTopic(push.topic.clone()));
    }
    git::validate_git_ref(&push.pusher)
        .map_err(|_| AgitError::InvalidTopic(push.head_branch()))?;

    let repo_path = lock_store(store).get_repository(push.repo_id)?.path;
    let repo = Repository::open(&repo_path)?;

    let commit = repo.rev_parse(&push.commit)?;
    let base_tip = repo.rev_parse(&format!("refs/heads/{}", push.base_branch))?;

    // Checked without the store lock; a base push landing in between queues its own recheck.
    if repo.is_ancestor(&commit, &base_tip)? {
        return Err(AgitError::HeadIsAncestor {
            commit,
            base_branch: push.base_branch.clone(),
        });
    }

    let head_branch = push.head_branch();
    let (pr, created) = {
        let mut store = lock_store(store);
        match store.find_pull_request(
            push.repo_id,
            &push.base_branch,
            push.repo_id,
            &head_branch,
            PullRequestFlow::AGit,
        )? {
            Some(existing) => {
                store.set_head_commit(existing.id, &commit)?;
                (existing, false)
            }
            None => {
                let pr = store.create_pull_request(&NewPullRequest {
                    base_repo_id: push.repo_id,
                    head_repo_id: push.repo_id,
                    base_branch: push.base_branch.clone(),
                    head_branch: head_branch.clone(),
                    flow: PullRequestFlow::AGit,
                    head_commit_id: Some(commit.clone()),
                })?;
                (pr, true)
            }
        }
    };

    repo.update_ref(&pr.git_ref_name(), &commit)?;

    info!(pr_id = pr.id, head_branch = %head_branch, created, "accepted AGit push");

    Ok(AgitOutcome {
        pr_id: pr.id,
        created,
        head_commit_id: commit,
    })
}
