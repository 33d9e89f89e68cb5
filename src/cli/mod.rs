use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "patch-status",
    about = "Mergeability and protected-file checks for pull requests"
)]
pub struct Cli {
    /// Configuration file (defaults to ./patch-status.toml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register repositories.
    Repo {
        #[command(subcommand)]
        action: RepoAction,
    },
    /// Open and inspect pull requests.
    Pr {
        #[command(subcommand)]
        action: PrAction,
    },
    /// Handle pushes to refs/for/<branch>.
    Agit {
        #[command(subcommand)]
        action: AgitAction,
    },
    /// Add or update a branch protection rule and recheck affected pull requests.
    Protect(ProtectArgs),
    /// Remove a branch protection rule and recheck affected pull requests.
    Unprotect(UnprotectArgs),
    /// Evaluate one pull request now and store the result.
    Check(CheckArgs),
    /// Recheck every pull request affected by a push to a branch.
    NotifyPush(NotifyPushArgs),
}

#[derive(Subcommand, Debug)]
pub enum RepoAction {
    /// Register a git repository on disk.
    Add(RepoAddArgs),
}

#[derive(Args, Debug)]
pub struct RepoAddArgs {
    pub owner: String,
    pub name: String,
    /// Path to the repository (bare or with a working tree).
    pub path: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum PrAction {
    /// Open a pull request and run its first check.
    Open(PrOpenArgs),
    /// Print the stored state of a pull request.
    Show(PrShowArgs),
}

#[derive(Args, Debug)]
pub struct PrOpenArgs {
    /// Id of the repository receiving the changes.
    #[arg(long)]
    pub base_repo: i64,
    /// Target branch.
    #[arg(long)]
    pub base: String,
    /// Id of the repository holding the head branch (defaults to the base repository).
    #[arg(long)]
    pub head_repo: Option<i64>,
    /// Source branch.
    #[arg(long)]
    pub head: String,
}

#[derive(Args, Debug)]
pub struct PrShowArgs {
    pub id: i64,
    /// Print the record as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum AgitAction {
    /// Create or update the pull request for a pushed commit.
    Push(AgitPushArgs),
}

#[derive(Args, Debug)]
pub struct AgitPushArgs {
    #[arg(long)]
    pub repo: i64,
    /// Target branch, as in refs/for/<base>.
    #[arg(long)]
    pub base: String,
    #[arg(long)]
    pub topic: String,
    /// Name of the pushing user.
    #[arg(long)]
    pub user: String,
    /// Pushed commit (any revision the repository can resolve).
    #[arg(long)]
    pub commit: String,
}

#[derive(Args, Debug)]
pub struct ProtectArgs {
    #[arg(long)]
    pub repo: i64,
    /// Branch name or glob the rule applies to.
    #[arg(long)]
    pub rule: String,
    /// `;`-separated globs of protected files.
    #[arg(long, default_value = "")]
    pub protected: String,
    /// `;`-separated globs of files exempt from protection.
    #[arg(long, default_value = "")]
    pub unprotected: String,
    /// Lower values win when several rules match a branch.
    #[arg(long, default_value = "0")]
    pub priority: i64,
}

#[derive(Args, Debug)]
pub struct UnprotectArgs {
    /// Rule id, as printed by `protect`.
    pub id: i64,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    pub id: i64,
    /// Print the computed result without storing it.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct NotifyPushArgs {
    #[arg(long)]
    pub repo: i64,
    #[arg(long)]
    pub branch: String,
}

/// Parse CLI arguments.
pub fn parse_args() -> Cli {
    Cli::parse()
}
