use crate::config::RetryPolicy;
use crate::patch::{PatchError, PatchEvaluator};
use crate::state::{SharedStore, StateError, lock_store};
use crate::{PatchOutcome, PullRequest};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Semaphore, broadcast, watch};
use tracing::{debug, error, info, instrument, warn};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("evaluation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("worker pool is closed")]
    Closed,
    #[error("timed out waiting for pull request {0}")]
    Timeout(i64),
}

impl CheckError {
    fn is_retryable(&self) -> bool {
        match self {
            CheckError::Patch(err) => err.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CheckError>;

/// Published after every finished run for a pull request.
#[derive(Debug, Clone)]
pub struct CheckEvent {
    pub pr_id: i64,
    /// Evaluations this run took, the first try included.
    pub attempts: u32,
    /// The persisted outcome, or the final error message once retries are exhausted.
    pub result: std::result::Result<PatchOutcome, String>,
}

#[derive(Debug, Default)]
struct Slot {
    /// Set by triggers that arrive while the pull request is queued or running.
    dirty: bool,
}

struct Inner {
    evaluator: Arc<PatchEvaluator>,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    slots: Mutex<HashMap<i64, Slot>>,
    active: watch::Sender<usize>,
    events: broadcast::Sender<CheckEvent>,
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<i64, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Clear the dirty flag and report whether another run is owed; otherwise release the slot.
    fn take_rerun(&self, pr_id: i64) -> bool {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(&pr_id) {
            if slot.dirty {
                slot.dirty = false;
                return true;
            }
        }
        slots.remove(&pr_id);
        self.active.send_replace(slots.len());
        false
    }
}

/// Background queue running patch checks.
///
/// A pull request has at most one run in flight. Triggers that arrive during a
/// run collapse into a single follow-up run.
#[derive(Clone)]
pub struct PatchChecker {
    inner: Arc<Inner>,
}

impl PatchChecker {
    pub fn new(evaluator: Arc<PatchEvaluator>, retry: RetryPolicy, workers: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (active, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                evaluator,
                retry,
                permits: Arc::new(Semaphore::new(workers.max(1))),
                slots: Mutex::new(HashMap::new()),
                active,
                events,
            }),
        }
    }

    pub fn store(&self) -> &SharedStore {
        self.inner.evaluator.store()
    }

    /// Queue a check of `pr_id`. Must be called from within a tokio runtime.
    pub fn trigger(&self, pr_id: i64) {
        {
            let mut slots = self.inner.slots();
            if let Some(slot) = slots.get_mut(&pr_id) {
                slot.dirty = true;
                debug!(pr_id, "check already queued, marked for rerun");
                return;
            }
            slots.insert(pr_id, Slot::default());
            self.inner.active.send_replace(slots.len());
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { run_pull_request(inner, pr_id).await });
    }

    /// A branch was pushed: recheck regular pull requests whose head it is.
    pub fn on_head_push(&self, repo_id: i64, branch: &str) -> Result<usize> {
        let prs = lock_store(self.store()).pull_requests_by_head(repo_id, branch)?;
        Ok(self.trigger_all(&prs))
    }

    /// A branch was pushed: recheck every pull request targeting it.
    pub fn on_base_push(&self, repo_id: i64, branch: &str) -> Result<usize> {
        let prs = lock_store(self.store()).pull_requests_by_base(repo_id, branch)?;
        Ok(self.trigger_all(&prs))
    }

    pub fn on_pull_request_created(&self, pr_id: i64) {
        self.trigger(pr_id);
    }

    /// Protection rules of a repository changed: drop compiled matchers and
    /// recheck its open pull requests.
    pub fn on_protection_changed(&self, repo_id: i64) -> Result<usize> {
        self.inner.evaluator.matchers().invalidate_repo(repo_id);
        let prs = lock_store(self.store()).pull_requests_by_repo(repo_id)?;
        Ok(self.trigger_all(&prs))
    }

    fn trigger_all(&self, prs: &[PullRequest]) -> usize {
        for pr in prs {
            self.trigger(pr.id);
        }
        prs.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CheckEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_idle(&self) -> bool {
        *self.inner.active.borrow() == 0
    }

    /// Resolve once no pull request is queued or running.
    pub async fn wait_idle(&self) {
        let mut active = self.inner.active.subscribe();
        // The sender lives in `inner`, so the channel cannot close while we hold `self`.
        let _ = active.wait_for(|count| *count == 0).await;
    }
}

async fn run_pull_request(inner: Arc<Inner>, pr_id: i64) {
    loop {
        let (attempts, result) = run_with_retry(&inner, pr_id).await;
        let _ = inner.events.send(CheckEvent {
            pr_id,
            attempts,
            result: result.map_err(|err| err.to_string()),
        });

        if !inner.take_rerun(pr_id) {
            return;
        }
        debug!(pr_id, "rerunning check after new trigger");
    }
}

#[instrument(skip(inner))]
async fn run_with_retry(inner: &Inner, pr_id: i64) -> (u32, Result<PatchOutcome>) {
    let mut attempt = 0;

    loop {
        match run_once(inner, pr_id).await {
            Ok(outcome) => {
                if attempt > 0 {
                    info!(attempt, "patch check succeeded after retry");
                }
                return (attempt + 1, Ok(outcome));
            }
            Err(err) if err.is_retryable() && attempt < inner.retry.max_retries => {
                attempt += 1;
                let delay = inner.retry.delay(attempt);
                warn!(
                    attempt,
                    max_retries = inner.retry.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "patch check failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                error!(attempt, error = %err, "patch check failed, status left unchanged");
                return (attempt + 1, Err(err));
            }
        }
    }
}

async fn run_once(inner: &Inner, pr_id: i64) -> Result<PatchOutcome> {
    let _permit = Arc::clone(&inner.permits)
        .acquire_owned()
        .await
        .map_err(|_| CheckError::Closed)?;

    let evaluator = Arc::clone(&inner.evaluator);
    let outcome = tokio::task::spawn_blocking(move || evaluator.check(pr_id)).await??;
    Ok(outcome)
}

/// Poll the persisted record until `predicate` holds or `timeout` elapses.
pub async fn wait_for_status<F>(
    store: &SharedStore,
    pr_id: i64,
    predicate: F,
    timeout: Duration,
    interval: Duration,
) -> Result<PullRequest>
where
    F: Fn(&PullRequest) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let pr = lock_store(store).get_pull_request(pr_id)?;
        if predicate(&pr) {
            return Ok(pr);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(CheckError::Timeout(pr_id));
        }
        tokio::time::sleep(interval).await;
    }
}
