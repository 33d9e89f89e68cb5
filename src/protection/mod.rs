use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Default cap on how many changed protected files are recorded per pull request.
pub const DEFAULT_PROTECTED_FILES_LIMIT: usize = 10;

/// A branch protection rule as stored for a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedBranchRule {
    pub id: i64,
    pub repo_id: i64,
    /// Branch name or glob over branch names.
    pub rule_name: String,
    /// `;`-separated globs of files whose changes must be flagged.
    pub protected_file_patterns: String,
    /// `;`-separated globs of files that may be pushed even when the branch is protected.
    pub unprotected_file_patterns: String,
    /// Lower values win when several rules match a branch.
    pub priority: i64,
}

impl ProtectedBranchRule {
    /// Whether this rule applies to `branch`.
    pub fn matches_branch(&self, branch: &str) -> bool {
        if self.rule_name == branch {
            return true;
        }

        match GlobBuilder::new(&self.rule_name)
            .literal_separator(true)
            .build()
        {
            Ok(glob) => glob.compile_matcher().is_match(branch),
            Err(err) => {
                warn!(rule_id = self.id, rule = %self.rule_name, error = %err, "invalid branch rule glob");
                false
            }
        }
    }

    pub fn protected_files(&self) -> FilePatterns {
        FilePatterns::parse(&self.protected_file_patterns)
    }
}

/// Pick the rule governing `branch`: the matching rule with the lowest priority, then lowest id.
pub fn first_matching_rule<'a>(
    rules: &'a [ProtectedBranchRule],
    branch: &str,
) -> Option<&'a ProtectedBranchRule> {
    rules
        .iter()
        .filter(|rule| rule.matches_branch(branch))
        .min_by_key(|rule| (rule.priority, rule.id))
}

/// Compiled, case-insensitive set of file globs.
#[derive(Debug, Clone)]
pub struct FilePatterns {
    set: GlobSet,
    patterns: Vec<String>,
}

impl Default for FilePatterns {
    fn default() -> Self {
        Self {
            set: GlobSet::empty(),
            patterns: Vec::new(),
        }
    }
}

impl FilePatterns {
    /// Parse a `;`-separated pattern list.
    ///
    /// Entries are trimmed and lower-cased; empty and malformed entries are skipped.
    pub fn parse(raw: &str) -> Self {
        let mut builder = GlobSetBuilder::new();
        let mut patterns = Vec::new();

        for entry in raw.split(';') {
            let pattern = entry.trim().to_lowercase();
            if pattern.is_empty() {
                continue;
            }

            match GlobBuilder::new(&pattern).literal_separator(true).build() {
                Ok(glob) => {
                    builder.add(glob);
                    patterns.push(pattern);
                }
                Err(err) => {
                    warn!(pattern = %pattern, error = %err, "skipping invalid file pattern");
                }
            }
        }

        match builder.build() {
            Ok(set) => Self { set, patterns },
            Err(err) => {
                warn!(error = %err, "failed to build file pattern set");
                Self::default()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Match a repository path, ignoring case.
    pub fn is_match(&self, path: &str) -> bool {
        self.set.is_match(path.to_lowercase())
    }

    /// Lower-cased `paths` that match, in input order, at most `limit` of them.
    pub fn changed_protected_files<I, S>(&self, paths: I, limit: usize) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.is_empty() {
            return Vec::new();
        }

        let mut matched = Vec::new();
        for path in paths {
            if matched.len() >= limit {
                break;
            }
            let lower = path.as_ref().to_lowercase();
            if self.set.is_match(&lower) {
                matched.push(lower);
            }
        }
        matched
    }
}

/// Compiled protected-file patterns per `(repo_id, base_branch)`.
///
/// Entries live until the repository's protection rules change.
#[derive(Debug, Default)]
pub struct MatcherCache {
    inner: Mutex<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    /// Bumped on every invalidation; loads started under an older generation are not cached.
    generation: u64,
    entries: HashMap<(i64, String), Arc<FilePatterns>>,
}

impl MatcherCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached patterns for the branch or build them with `load`.
    ///
    /// `load` runs without the cache lock held; a failed load caches nothing.
    pub fn get_or_load<E, F>(&self, repo_id: i64, branch: &str, load: F) -> Result<Arc<FilePatterns>, E>
    where
        F: FnOnce() -> Result<FilePatterns, E>,
    {
        let key = (repo_id, branch.to_string());
        let generation = {
            let inner = self.lock();
            if let Some(found) = inner.entries.get(&key) {
                return Ok(Arc::clone(found));
            }
            inner.generation
        };

        let patterns = Arc::new(load()?);

        let mut inner = self.lock();
        if inner.generation == generation {
            inner
                .entries
                .entry(key)
                .or_insert_with(|| Arc::clone(&patterns));
        }
        Ok(patterns)
    }

    /// Drop every compiled entry for a repository.
    pub fn invalidate_repo(&self, repo_id: i64) {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.entries.retain(|(id, _), _| *id != repo_id);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: i64, name: &str, protected: &str, priority: i64) -> ProtectedBranchRule {
        ProtectedBranchRule {
            id,
            repo_id: 1,
            rule_name: name.to_string(),
            protected_file_patterns: protected.to_string(),
            unprotected_file_patterns: String::new(),
            priority,
        }
    }

    #[test]
    fn parse_splits_trims_and_lowercases() {
        let patterns = FilePatterns::parse(" LICENSE ;; docs/*.MD;");
        assert_eq!(patterns.patterns(), ["license", "docs/*.md"]);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let patterns = FilePatterns::parse("LICENSE");
        assert!(patterns.is_match("LICENSE"));
        assert!(patterns.is_match("license"));
        assert!(!patterns.is_match("LICENSE.txt"));
    }

    #[test]
    fn star_does_not_cross_directories() {
        let patterns = FilePatterns::parse("*.go");
        assert!(patterns.is_match("main.go"));
        assert!(!patterns.is_match("cmd/main.go"));

        let deep = FilePatterns::parse("**/*.go");
        assert!(deep.is_match("cmd/main.go"));
    }

    #[test]
    fn invalid_pattern_is_skipped() {
        let patterns = FilePatterns::parse("[unclosed;LICENSE");
        assert_eq!(patterns.patterns(), ["license"]);
        assert!(patterns.is_match("LICENSE"));
    }

    #[test]
    fn changed_protected_files_preserves_order_and_limit() {
        let patterns = FilePatterns::parse("*.lock;LICENSE");
        let changed = ["README.md", "LICENSE", "Cargo.lock", "yarn.lock"];

        assert_eq!(
            patterns.changed_protected_files(changed, 10),
            vec!["license", "cargo.lock", "yarn.lock"]
        );
        assert_eq!(
            patterns.changed_protected_files(changed, 2),
            vec!["license", "cargo.lock"]
        );
    }

    #[test]
    fn empty_patterns_match_nothing() {
        let patterns = FilePatterns::parse("");
        assert!(patterns.is_empty());
        assert!(patterns.changed_protected_files(["LICENSE"], 10).is_empty());
    }

    #[test]
    fn double_star_crosses_directories() {
        let patterns = FilePatterns::parse("docs/**");
        assert!(patterns.is_match("docs/a.md"));
        assert!(patterns.is_match("docs/b/c.md"));
        assert!(!patterns.is_match("src/lib.rs"));
    }

    #[test]
    fn first_matching_rule_prefers_priority_then_id() {
        let rules = vec![
            rule(3, "release/*", "a", 5),
            rule(1, "main", "b", 10),
            rule(2, "*", "c", 10),
        ];

        assert_eq!(first_matching_rule(&rules, "main").map(|r| r.id), Some(1));
        assert_eq!(
            first_matching_rule(&rules, "release/v1").map(|r| r.id),
            Some(3)
        );
        assert_eq!(
            first_matching_rule(&rules, "release/v1/hotfix").map(|r| r.id),
            None
        );
    }

    #[test]
    fn cache_loads_once_and_invalidates_per_repo() {
        let cache = MatcherCache::new();
        let mut loads = 0;

        for _ in 0..3 {
            cache
                .get_or_load::<(), _>(1, "main", || {
                    loads += 1;
                    Ok(FilePatterns::parse("LICENSE"))
                })
                .unwrap();
        }
        cache
            .get_or_load::<(), _>(2, "main", || Ok(FilePatterns::default()))
            .unwrap();

        assert_eq!(loads, 1);
        assert_eq!(cache.len(), 2);

        cache.invalidate_repo(1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn load_racing_an_invalidation_is_not_cached() {
        let cache = MatcherCache::new();
        let patterns = cache
            .get_or_load::<(), _>(1, "main", || {
                cache.invalidate_repo(1);
                Ok(FilePatterns::parse("LICENSE"))
            })
            .unwrap();

        assert!(patterns.is_match("LICENSE"));
        assert!(cache.is_empty());
    }

    #[test]
    fn cache_does_not_store_failed_loads() {
        let cache = MatcherCache::new();
        let result = cache.get_or_load(1, "main", || Err("boom"));
        assert!(result.is_err());
        assert!(cache.is_empty());
    }
}
