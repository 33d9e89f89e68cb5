mod common;

use common::{Forge, commit_file, dangling_commit, git};
use patch_status::agit::{AgitError, AgitPush, process_push};
use patch_status::state::lock_store;
use patch_status::{PatchStatus, PullRequestFlow};

fn push(repo: i64, topic: &str, commit: &str) -> AgitPush {
    AgitPush::from_push(
        repo,
        "user2",
        "refs/for/main",
        &[format!("topic={}", topic)],
        commit,
    )
    .unwrap()
}

#[test]
fn agit_push_opens_a_pull_request_that_tracks_conflicts() {
    let forge = Forge::new();
    let (repo, dir) = forge.create_repo("user2", "repo1");
    let commit = dangling_commit(&dir, "CONTACT", "n0toose@example.com");

    let outcome = process_push(&forge.store, &push(repo, "normal", &commit)).unwrap();
    assert!(outcome.created);
    assert_eq!(outcome.head_commit_id, commit);

    let pr = forge.pull(outcome.pr_id);
    assert_eq!(pr.flow, PullRequestFlow::AGit);
    assert_eq!(pr.head_branch, "user2/normal");
    assert_eq!(git(&dir, &["rev-parse", &pr.git_ref_name()]), commit);

    forge.evaluator.check(pr.id).unwrap();
    let pr = forge.pull(pr.id);
    assert_eq!(pr.status, PatchStatus::Mergeable);
    assert_eq!((pr.commits_ahead, pr.commits_behind), (1, 0));

    commit_file(&dir, "CONTACT", "gusted@example.com");

    forge.evaluator.check(pr.id).unwrap();
    let pr = forge.pull(pr.id);
    assert_eq!(pr.status, PatchStatus::Conflict);
    assert_eq!(pr.conflicted_files, vec!["CONTACT"]);
    assert_eq!((pr.commits_ahead, pr.commits_behind), (1, 1));
}

#[test]
fn pushing_the_same_topic_updates_the_pull_request() {
    let forge = Forge::new();
    let (repo, dir) = forge.create_repo("user2", "repo1");
    let first = dangling_commit(&dir, "CONTACT", "v1");
    let second = dangling_commit(&dir, "CONTACT", "v2");

    let opened = process_push(&forge.store, &push(repo, "normal", &first)).unwrap();
    let updated = process_push(&forge.store, &push(repo, "normal", &second)).unwrap();

    assert!(!updated.created);
    assert_eq!(updated.pr_id, opened.pr_id);

    let pr = forge.pull(opened.pr_id);
    assert_eq!(pr.head_commit_id.as_deref(), Some(second.as_str()));
    assert_eq!(git(&dir, &["rev-parse", &pr.git_ref_name()]), second);
}

#[test]
fn same_topic_for_another_base_opens_its_own_pull_request() {
    let forge = Forge::new();
    let (repo, dir) = forge.create_repo("user2", "repo1");
    git(&dir, &["branch", "dev"]);
    let commit = dangling_commit(&dir, "CONTACT", "n0toose@example.com");
    let to_main = process_push(&forge.store, &push(repo, "normal", &commit)).unwrap();

    let main_tip = commit_file(&dir, "README", "moved on");
    let to_dev = AgitPush::from_push(
        repo,
        "user2",
        "refs/for/dev",
        &["topic=normal".to_string()],
        &main_tip,
    )
    .unwrap();
    let to_dev = process_push(&forge.store, &to_dev).unwrap();

    assert!(to_dev.created);
    assert_ne!(to_dev.pr_id, to_main.pr_id);

    let main_pr = forge.pull(to_main.pr_id);
    assert_eq!(main_pr.base_branch, "main");
    assert_eq!(main_pr.head_commit_id.as_deref(), Some(commit.as_str()));
    assert_eq!(git(&dir, &["rev-parse", &main_pr.git_ref_name()]), commit);
    assert_eq!(forge.evaluator.check(main_pr.id).unwrap().status, PatchStatus::Mergeable);

    let dev_pr = forge.pull(to_dev.pr_id);
    assert_eq!(dev_pr.base_branch, "dev");
    let outcome = forge.evaluator.check(dev_pr.id).unwrap();
    assert_eq!(outcome.status, PatchStatus::Mergeable);
    assert_eq!((outcome.commits_ahead, outcome.commits_behind), (1, 0));
}

#[test]
fn push_of_a_commit_already_in_base_is_rejected() {
    let forge = Forge::new();
    let (repo, dir) = forge.create_repo("user2", "repo1");
    let tip = git(&dir, &["rev-parse", "main"]);

    let err = process_push(&forge.store, &push(repo, "ancestor", &tip)).unwrap_err();
    assert!(matches!(err, AgitError::HeadIsAncestor { .. }));

    assert!(lock_store(&forge.store)
        .pull_requests_by_repo(repo)
        .unwrap()
        .is_empty());
    let refs = git(&dir, &["for-each-ref", "refs/pull/"]);
    assert!(refs.is_empty());
}

#[test]
fn update_that_falls_behind_base_is_rejected_and_keeps_the_old_head() {
    let forge = Forge::new();
    let (repo, dir) = forge.create_repo("user2", "repo1");
    let old_tip = git(&dir, &["rev-parse", "main"]);
    let commit = dangling_commit(&dir, "CONTACT", "n0toose@example.com");

    let opened = process_push(&forge.store, &push(repo, "normal", &commit)).unwrap();
    commit_file(&dir, "LICENSE", "mit");

    let err = process_push(&forge.store, &push(repo, "normal", &old_tip)).unwrap_err();
    assert!(matches!(err, AgitError::HeadIsAncestor { .. }));

    let pr = forge.pull(opened.pr_id);
    assert_eq!(pr.head_commit_id.as_deref(), Some(commit.as_str()));

    // Base moved on, the head did not: still one commit ahead, never an ancestor.
    let outcome = forge.evaluator.check(pr.id).unwrap();
    assert_eq!(outcome.status, PatchStatus::Mergeable);
    assert_eq!((outcome.commits_ahead, outcome.commits_behind), (1, 1));
}

#[test]
fn unknown_commit_is_a_git_error() {
    let forge = Forge::new();
    let (repo, _dir) = forge.create_repo("user2", "repo1");

    let err = process_push(
        &forge.store,
        &push(repo, "normal", "0123456789abcdef0123456789abcdef01234567"),
    )
    .unwrap_err();
    assert!(matches!(err, AgitError::Git(_)));
}

#[test]
fn topic_with_path_traversal_is_rejected() {
    let forge = Forge::new();
    let (repo, dir) = forge.create_repo("user2", "repo1");
    let commit = dangling_commit(&dir, "CONTACT", "x");

    let err = process_push(&forge.store, &push(repo, "../main", &commit)).unwrap_err();
    assert!(matches!(err, AgitError::InvalidTopic(_)));
}

#[test]
fn topic_with_revision_syntax_is_rejected() {
    let forge = Forge::new();
    let (repo, dir) = forge.create_repo("user2", "repo1");
    let commit = dangling_commit(&dir, "CONTACT", "x");

    for topic in ["main~1", "fix:dev", "a b"] {
        let err = process_push(&forge.store, &push(repo, topic, &commit)).unwrap_err();
        assert!(matches!(err, AgitError::InvalidTopic(_)), "{}", topic);
    }
    assert_eq!(git(&dir, &["for-each-ref", "refs/pull/"]), "");
}
