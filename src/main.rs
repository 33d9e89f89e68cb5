use anyhow::{Context, Result, bail};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use patch_status::agit::{self, AgitPush};
use patch_status::checker::PatchChecker;
use patch_status::cli::{
    self, AgitAction, AgitPushArgs, Commands, PrAction, PrOpenArgs, ProtectArgs, RepoAction,
};
use patch_status::config::Settings;
use patch_status::git::Repository;
use patch_status::patch::PatchEvaluator;
use patch_status::protection::{MatcherCache, ProtectedBranchRule};
use patch_status::state::{NewPullRequest, PullStore, SharedStore, lock_store};
use patch_status::{PatchStatus, PullRequest, PullRequestFlow, telemetry};

fn main() -> Result<()> {
    let args = cli::parse_args();
    let settings =
        Settings::load(args.config.as_deref()).context("Failed to load configuration")?;
    telemetry::init(&settings).context("Failed to initialise logging")?;

    let store = open_store(&settings.database_path)?;
    let evaluator = Arc::new(PatchEvaluator::new(
        Arc::clone(&store),
        Arc::new(MatcherCache::new()),
        settings.protected_files_limit,
    ));

    match args.command {
        Commands::Repo {
            action: RepoAction::Add(args),
        } => handle_repo_add(&store, &args.owner, &args.name, &args.path)?,
        Commands::Pr {
            action: PrAction::Open(args),
        } => handle_pr_open(&settings, evaluator, &args)?,
        Commands::Pr {
            action: PrAction::Show(args),
        } => handle_pr_show(&store, args.id, args.json)?,
        Commands::Agit {
            action: AgitAction::Push(args),
        } => handle_agit_push(&settings, evaluator, &args)?,
        Commands::Protect(args) => handle_protect(&settings, evaluator, &args)?,
        Commands::Unprotect(args) => handle_unprotect(&settings, evaluator, args.id)?,
        Commands::Check(args) => handle_check(&evaluator, args.id, args.dry_run)?,
        Commands::NotifyPush(args) => {
            handle_notify_push(&settings, evaluator, args.repo, &args.branch)?
        }
    }

    Ok(())
}

/// Open the database, creating its directory on first use.
fn open_store(path: &Path) -> Result<SharedStore> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = PullStore::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    Ok(store.into_shared())
}

/// Run `f` against a fresh checker and wait until every check it queued has finished.
fn with_checker<T>(
    settings: &Settings,
    evaluator: Arc<PatchEvaluator>,
    f: impl FnOnce(&PatchChecker) -> Result<T>,
) -> Result<T> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.workers)
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async {
        let checker = PatchChecker::new(evaluator, settings.retry_policy(), settings.workers);
        let value = f(&checker)?;
        checker.wait_idle().await;
        Ok(value)
    })
}

fn handle_repo_add(store: &SharedStore, owner: &str, name: &str, path: &Path) -> Result<()> {
    let path = std::fs::canonicalize(path)
        .with_context(|| format!("Repository path {} does not exist", path.display()))?;
    Repository::open(&path).with_context(|| format!("{} is not a git repository", path.display()))?;

    let mut store = lock_store(store);
    if let Some(existing) = store.find_repository(owner, name)? {
        bail!(
            "Repository {} is already registered (id {})",
            existing.full_name(),
            existing.id
        );
    }
    let id = store.add_repository(owner, name, &path)?;

    println!("✓ Added repository {}/{} (id {})", owner, name, id);
    Ok(())
}

fn handle_pr_open(
    settings: &Settings,
    evaluator: Arc<PatchEvaluator>,
    args: &PrOpenArgs,
) -> Result<()> {
    let store = Arc::clone(evaluator.store());
    let head_repo_id = args.head_repo.unwrap_or(args.base_repo);

    let pr = {
        let mut store = lock_store(&store);
        let base_repo = store.get_repository(args.base_repo)?;
        let head_repo = store.get_repository(head_repo_id)?;

        Repository::open(&base_repo.path)?
            .rev_parse(&format!("refs/heads/{}", args.base))
            .with_context(|| format!("Base branch {} not found in {}", args.base, base_repo.full_name()))?;
        Repository::open(&head_repo.path)?
            .rev_parse(&format!("refs/heads/{}", args.head))
            .with_context(|| format!("Head branch {} not found in {}", args.head, head_repo.full_name()))?;

        if let Some(existing) = store.find_pull_request(
            args.base_repo,
            &args.base,
            head_repo_id,
            &args.head,
            PullRequestFlow::Regular,
        )? {
            bail!(
                "A pull request for {} already exists (#{}, id {})",
                args.head,
                existing.index,
                existing.id
            );
        }

        store.create_pull_request(&NewPullRequest {
            base_repo_id: args.base_repo,
            head_repo_id,
            base_branch: args.base.clone(),
            head_branch: args.head.clone(),
            flow: PullRequestFlow::Regular,
            head_commit_id: None,
        })?
    };

    with_checker(settings, evaluator, |checker| {
        checker.on_pull_request_created(pr.id);
        Ok(())
    })?;

    println!("✓ Opened pull request #{} (id {})", pr.index, pr.id);
    print_pull_request(&lock_store(&store).get_pull_request(pr.id)?);
    Ok(())
}

fn handle_pr_show(store: &SharedStore, id: i64, json: bool) -> Result<()> {
    let pr = lock_store(store).get_pull_request(id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&pr)?);
    } else {
        print_pull_request(&pr);
    }
    Ok(())
}

fn handle_agit_push(
    settings: &Settings,
    evaluator: Arc<PatchEvaluator>,
    args: &AgitPushArgs,
) -> Result<()> {
    let store = Arc::clone(evaluator.store());
    let push = AgitPush::from_push(
        args.repo,
        &args.user,
        &format!("refs/for/{}", args.base),
        &[format!("topic={}", args.topic)],
        &args.commit,
    )?;
    let outcome = agit::process_push(&store, &push).context("Push rejected")?;

    with_checker(settings, evaluator, |checker| {
        checker.trigger(outcome.pr_id);
        Ok(())
    })?;

    let pr = lock_store(&store).get_pull_request(outcome.pr_id)?;
    if outcome.created {
        println!("✓ Created pull request #{} for {}", pr.index, push.head_branch());
    } else {
        println!("✓ Updated pull request #{} for {}", pr.index, push.head_branch());
    }
    print_pull_request(&pr);
    Ok(())
}

fn handle_protect(
    settings: &Settings,
    evaluator: Arc<PatchEvaluator>,
    args: &ProtectArgs,
) -> Result<()> {
    let store = Arc::clone(evaluator.store());
    let id = {
        let mut store = lock_store(&store);
        store.get_repository(args.repo)?;
        store.upsert_protected_branch(&ProtectedBranchRule {
            id: 0,
            repo_id: args.repo,
            rule_name: args.rule.clone(),
            protected_file_patterns: args.protected.clone(),
            unprotected_file_patterns: args.unprotected.clone(),
            priority: args.priority,
        })?
    };

    let rechecked = with_checker(settings, evaluator, |checker| {
        Ok(checker.on_protection_changed(args.repo)?)
    })?;

    println!(
        "✓ Saved protection rule {} (id {}), rechecked {} pull requests",
        args.rule, id, rechecked
    );
    Ok(())
}

fn handle_unprotect(settings: &Settings, evaluator: Arc<PatchEvaluator>, id: i64) -> Result<()> {
    let Some(repo_id) = lock_store(evaluator.store()).delete_protected_branch(id)? else {
        bail!("No protection rule with id {}", id);
    };

    let rechecked = with_checker(settings, evaluator, |checker| {
        Ok(checker.on_protection_changed(repo_id)?)
    })?;

    println!(
        "✓ Removed protection rule {}, rechecked {} pull requests",
        id, rechecked
    );
    Ok(())
}

fn handle_check(evaluator: &PatchEvaluator, id: i64, dry_run: bool) -> Result<()> {
    if dry_run {
        let pr = lock_store(evaluator.store()).get_pull_request(id)?;
        let outcome = evaluator
            .evaluate(&pr)
            .with_context(|| format!("Could not compute status of pull request {}", id))?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    evaluator
        .check(id)
        .with_context(|| format!("Could not compute status of pull request {}", id))?;
    print_pull_request(&lock_store(evaluator.store()).get_pull_request(id)?);
    Ok(())
}

fn handle_notify_push(
    settings: &Settings,
    evaluator: Arc<PatchEvaluator>,
    repo_id: i64,
    branch: &str,
) -> Result<()> {
    let store = Arc::clone(evaluator.store());
    lock_store(&store).get_repository(repo_id)?;

    with_checker(settings, evaluator, |checker| {
        checker.on_head_push(repo_id, branch)?;
        checker.on_base_push(repo_id, branch)?;
        Ok(())
    })?;

    let affected: BTreeMap<i64, PullRequest> = {
        let store = lock_store(&store);
        store
            .pull_requests_by_head(repo_id, branch)?
            .into_iter()
            .chain(store.pull_requests_by_base(repo_id, branch)?)
            .map(|pr| (pr.id, pr))
            .collect()
    };

    if affected.is_empty() {
        println!("No pull requests affected by {}", branch);
        return Ok(());
    }

    println!("Rechecked {} pull requests", affected.len());
    for pr in affected.values() {
        println!(
            "  #{:<4} {:<10} {} <- {} (+{} -{})",
            pr.index, pr.status, pr.base_branch, pr.head_branch, pr.commits_ahead, pr.commits_behind
        );
    }
    Ok(())
}

fn print_pull_request(pr: &PullRequest) {
    println!("Pull request #{} (id {})", pr.index, pr.id);
    println!("─────────────────────────────────────");
    println!("  Branches:  {} <- {} ({:?})", pr.base_branch, pr.head_branch, pr.flow);
    println!("  Status:    {}", pr.status);
    println!("  Ahead:     {}", pr.commits_ahead);
    println!("  Behind:    {}", pr.commits_behind);
    if !pr.conflicted_files.is_empty() {
        println!("  Conflicts: {}", pr.conflicted_files.join(", "));
    }
    if !pr.changed_protected_files.is_empty() {
        println!("  Protected: {}", pr.changed_protected_files.join(", "));
    }

    if pr.status == PatchStatus::Pending {
        eprintln!("⚠ Status unknown: the last check did not complete");
    }
}
