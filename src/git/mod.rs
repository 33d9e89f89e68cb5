use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("not a git repository: {0}")]
    NotARepo(PathBuf),
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("invalid git ref: {0}")]
    InvalidRef(String),
    /// Rejected before git ran. Resolving it again can never succeed.
    #[error("malformed git ref: {0}")]
    MalformedRef(String),
    #[error("no merge base between {0} and {1}")]
    NoMergeBase(String, String),
    #[error("utf-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// Whether the failure comes from a ref or commit that cannot be resolved,
    /// as opposed to git itself misbehaving.
    pub fn is_ref_resolution(&self) -> bool {
        matches!(
            self,
            GitError::InvalidRef(_) | GitError::MalformedRef(_) | GitError::NoMergeBase(..)
        )
    }

    pub fn is_malformed_ref(&self) -> bool {
        matches!(self, GitError::MalformedRef(_))
    }
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Tree produced by a work-tree-less three-way merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeTree {
    pub tree: String,
    /// Paths that could not be merged, in the order git reported them, without duplicates.
    pub conflicted_files: Vec<String>,
}

impl MergeTree {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicted_files.is_empty()
    }
}

/// Handle on an on-disk repository driven through the `git` binary.
///
/// Nothing here touches a work tree or the index, so handles are safe to use on
/// the shared bare repositories while pushes happen concurrently.
#[derive(Debug, Clone)]
pub struct Repository {
    path: PathBuf,
    git_dir: PathBuf,
    alternates: Vec<PathBuf>,
    scratch_objects: Option<PathBuf>,
}

impl Repository {
    /// Open the repository at `path` (bare or with a work tree).
    pub fn open(path: &Path) -> Result<Self> {
        let output = Command::new("git")
            .arg("-C")
            .arg(path)
            .arg("rev-parse")
            .arg("--absolute-git-dir")
            .output()?;

        if !output.status.success() {
            return Err(GitError::NotARepo(path.to_path_buf()));
        }

        let git_dir = String::from_utf8(output.stdout)?.trim().to_string();

        Ok(Self {
            path: path.to_path_buf(),
            git_dir: PathBuf::from(git_dir),
            alternates: Vec::new(),
            scratch_objects: None,
        })
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.git_dir.join("objects")
    }

    /// Make the objects of `other` visible to every command run through this handle.
    pub fn with_alternate_objects(mut self, other: &Repository) -> Self {
        self.alternates.push(other.objects_dir());
        self
    }

    /// Send every object written through this handle to `dir` instead of the
    /// repository's own object database, which stays readable as an alternate.
    pub fn with_scratch_objects(mut self, dir: &Path) -> Self {
        self.scratch_objects = Some(dir.to_path_buf());
        self
    }

    fn command(&self) -> Result<Command> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.path);

        let mut alternates = self.alternates.clone();
        if let Some(scratch) = &self.scratch_objects {
            cmd.env("GIT_OBJECT_DIRECTORY", scratch);
            alternates.insert(0, self.objects_dir());
        }
        if !alternates.is_empty() {
            let joined = std::env::join_paths(&alternates).map_err(|e| {
                GitError::CommandFailed(format!("invalid alternate object path: {}", e))
            })?;
            cmd.env("GIT_ALTERNATE_OBJECT_DIRECTORIES", joined);
        }

        Ok(cmd)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Ok(self.command()?.args(args).output()?)
    }

    fn run_stdout(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitError::CommandFailed(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8(output.stdout)?)
    }

    /// Resolve a revision to a full commit id.
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        validate_git_ref(rev)?;

        let spec = format!("{}^{{commit}}", rev);
        let output = self.run(&["rev-parse", "--verify", "--quiet", &spec])?;

        if !output.status.success() {
            return Err(GitError::InvalidRef(rev.to_string()));
        }

        Ok(String::from_utf8(output.stdout)?.trim().to_string())
    }

    /// Nearest common ancestor of two revisions.
    pub fn merge_base(&self, a: &str, b: &str) -> Result<String> {
        validate_git_ref(a)?;
        validate_git_ref(b)?;

        let output = self.run(&["merge-base", a, b])?;

        match output.status.code() {
            Some(0) => Ok(String::from_utf8(output.stdout)?.trim().to_string()),
            // Exit 1 without output means the histories share nothing.
            Some(1) if output.stderr.is_empty() => {
                Err(GitError::NoMergeBase(a.to_string(), b.to_string()))
            }
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if stderr.contains("Not a valid") || stderr.contains("unknown revision") {
                    return Err(GitError::InvalidRef(stderr.trim().to_string()));
                }
                Err(GitError::CommandFailed(format!(
                    "git merge-base failed: {}",
                    stderr.trim()
                )))
            }
        }
    }

    /// Count commits unique to each side: `(ahead, behind)` of `head` relative to `base`.
    pub fn ahead_behind(&self, base: &str, head: &str) -> Result<(u32, u32)> {
        validate_git_ref(base)?;
        validate_git_ref(head)?;

        let range = format!("{}...{}", base, head);
        let stdout = self.run_stdout(&["rev-list", "--count", "--left-right", &range])?;

        let parts: Vec<&str> = stdout.trim().split('\t').collect();
        if parts.len() != 2 {
            return Err(GitError::CommandFailed(format!(
                "unexpected rev-list output: {:?}",
                stdout
            )));
        }

        let parse = |s: &str| {
            s.parse::<u32>().map_err(|_| {
                GitError::CommandFailed(format!("unexpected rev-list count: {:?}", s))
            })
        };
        let behind = parse(parts[0])?;
        let ahead = parse(parts[1])?;

        Ok((ahead, behind))
    }

    /// Whether `ancestor` is reachable from `descendant` (a commit is its own ancestor).
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        validate_git_ref(ancestor)?;
        validate_git_ref(descendant)?;

        let output = self.run(&["merge-base", "--is-ancestor", ancestor, descendant])?;

        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(GitError::CommandFailed(format!(
                    "git merge-base --is-ancestor failed: {}",
                    stderr.trim()
                )))
            }
        }
    }

    /// Three-way merge of `theirs` into `ours` without a work tree.
    ///
    /// The resulting tree is written but never referenced; pair this with
    /// [`Repository::with_scratch_objects`] to keep the shared object database untouched.
    pub fn merge_tree(&self, merge_base: &str, ours: &str, theirs: &str) -> Result<MergeTree> {
        validate_git_ref(merge_base)?;
        validate_git_ref(ours)?;
        validate_git_ref(theirs)?;

        let base_arg = format!("--merge-base={}", merge_base);
        let output = self.run(&[
            "merge-tree",
            "--write-tree",
            "-z",
            "--name-only",
            "--no-messages",
            &base_arg,
            ours,
            theirs,
        ])?;

        let exit = output.status.code();
        if exit != Some(0) && exit != Some(1) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitError::CommandFailed(format!(
                "git merge-tree failed: {}",
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8(output.stdout)?;
        let merge_tree = parse_merge_tree_output(&stdout);

        // Exit 1 is a conflict even when git reported no per-file info.
        if exit == Some(1) && !merge_tree.has_conflicts() {
            return Err(GitError::CommandFailed(
                "git merge-tree reported a conflict without conflicted files".to_string(),
            ));
        }

        Ok(merge_tree)
    }

    /// Whether `tree` has exactly the content of `commit`'s tree.
    pub fn tree_matches(&self, tree: &str, commit: &str) -> Result<bool> {
        validate_git_ref(tree)?;
        validate_git_ref(commit)?;

        let output = self.run(&["diff-tree", "--quiet", tree, commit])?;

        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(GitError::CommandFailed(format!(
                    "git diff-tree --quiet failed: {}",
                    stderr.trim()
                )))
            }
        }
    }

    /// Paths that differ between two trees or commits, in git's diff order.
    pub fn changed_files(&self, old: &str, new: &str) -> Result<Vec<String>> {
        validate_git_ref(old)?;
        validate_git_ref(new)?;

        let stdout =
            self.run_stdout(&["diff-tree", "-r", "-z", "--name-only", "--no-renames", old, new])?;

        Ok(stdout
            .split('\0')
            .filter(|path| !path.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Point `name` at `commit`, creating the ref if needed.
    pub fn update_ref(&self, name: &str, commit: &str) -> Result<()> {
        validate_git_ref(name)?;
        validate_git_ref(commit)?;

        self.run_stdout(&["update-ref", name, commit])?;
        Ok(())
    }
}

/// Split `merge-tree -z --name-only` output into the tree id and conflicted paths.
fn parse_merge_tree_output(stdout: &str) -> MergeTree {
    let (tree, rest) = stdout.split_once('\0').unwrap_or((stdout, ""));

    let mut conflicted_files: Vec<String> = Vec::new();
    for path in rest.split('\0').filter(|p| !p.is_empty()) {
        if !conflicted_files.iter().any(|seen| seen == path) {
            conflicted_files.push(path.to_string());
        }
    }

    MergeTree {
        tree: tree.trim().to_string(),
        conflicted_files,
    }
}

/// Validate a ref or revision before handing it to git as an argument.
/// Only values git would read as an option, or that can never name a ref, are refused.
pub fn validate_git_ref(ref_str: &str) -> Result<()> {
    if ref_str.is_empty() {
        return Err(GitError::MalformedRef("Empty git ref".to_string()));
    }

    if ref_str.starts_with('-') {
        return Err(GitError::MalformedRef(format!(
            "git ref may not start with '-': {}",
            ref_str
        )));
    }

    if let Some(ch) = ref_str
        .chars()
        .find(|ch| ch.is_control() || ch.is_whitespace())
    {
        return Err(GitError::MalformedRef(format!(
            "Invalid character in git ref: {:?}",
            ch
        )));
    }

    Ok(())
}
