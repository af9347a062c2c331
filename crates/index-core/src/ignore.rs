//! Ignore rules with gitignore semantics and atomic reload.
//!
//! The active rule set is an immutable [`IgnoreSnapshot`]. A reload compiles
//! a complete replacement and swaps it in only if every line compiles, so a
//! reconciliation pass that pinned the previous snapshot is never affected.

use ::ignore::Match;
use ::ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Prefix that makes a single pattern case-insensitive.
const CASE_INSENSITIVE_PREFIX: &str = "(?i)";

#[derive(Debug, Error)]
pub enum IgnoreError {
    #[error("Invalid ignore pattern on line {line} ({pattern:?}): {reason}")]
    InvalidPattern {
        /// 1-based position in the supplied rule list
        line: usize,
        pattern: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, IgnoreError>;

/// Outcome of evaluating a path against the rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    NotMatched,
    Excluded,
    /// Explicitly re-included by a `!` pattern
    Included,
}

impl MatchResult {
    pub fn is_ignored(self) -> bool {
        self == MatchResult::Excluded
    }
}

/// One compiled, immutable generation of ignore rules.
#[derive(Debug)]
pub struct IgnoreSnapshot {
    revision: u64,
    patterns: Vec<String>,
    matcher: Gitignore,
}

impl IgnoreSnapshot {
    fn empty() -> Self {
        Self {
            revision: 0,
            patterns: Vec::new(),
            matcher: Gitignore::empty(),
        }
    }

    /// Strictly increasing per matcher; 0 is the initial empty rule set.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Rule lines exactly as supplied to the reload that produced this snapshot.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn matches(&self, path: &str) -> MatchResult {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return MatchResult::NotMatched;
        }
        match self.matcher.matched_path_or_any_parents(path, false) {
            Match::None => MatchResult::NotMatched,
            Match::Ignore(_) => MatchResult::Excluded,
            Match::Whitelist(_) => MatchResult::Included,
        }
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        self.matches(path).is_ignored()
    }
}

fn compile(lines: &[String]) -> Result<Gitignore> {
    let invalid = |line: usize, pattern: &str, err: ::ignore::Error| IgnoreError::InvalidPattern {
        line,
        pattern: pattern.to_string(),
        reason: err.to_string(),
    };

    let mut builder = GitignoreBuilder::new("");
    for (i, raw) in lines.iter().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        let (pattern, fold_case) = match line.strip_prefix(CASE_INSENSITIVE_PREFIX) {
            Some(rest) => (rest, true),
            None => (line, false),
        };
        builder
            .case_insensitive(fold_case)
            .map_err(|e| invalid(i + 1, raw.as_str(), e))?;
        builder
            .add_line(None, pattern)
            .map_err(|e| invalid(i + 1, raw.as_str(), e))?;
    }
    builder.build().map_err(|e| IgnoreError::InvalidPattern {
        line: 0,
        pattern: String::new(),
        reason: e.to_string(),
    })
}

/// Reloadable ignore rules for one folder.
pub struct IgnoreMatcher {
    current: RwLock<Arc<IgnoreSnapshot>>,
}

impl Default for IgnoreMatcher {
    fn default() -> Self {
        Self {
            current: RwLock::new(Arc::new(IgnoreSnapshot::empty())),
        }
    }
}

impl IgnoreMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split the text of a rule file into lines.
    pub fn parse_rules(text: &str) -> Vec<String> {
        text.lines()
            .map(|l| l.trim_end_matches('\r').to_string())
            .collect()
    }

    /// Pin the active rule set.
    pub fn snapshot(&self) -> Arc<IgnoreSnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Compile `lines` and install them as the active rule set.
    ///
    /// On error the previous snapshot stays active.
    pub fn reload<I, S>(&self, lines: I) -> Result<Arc<IgnoreSnapshot>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = lines.into_iter().map(Into::into).collect();
        let matcher = compile(&patterns)?;

        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        let snapshot = Arc::new(IgnoreSnapshot {
            revision: current.revision + 1,
            patterns,
            matcher,
        });
        *current = Arc::clone(&snapshot);
        Ok(snapshot)
    }

    pub fn matches(&self, path: &str) -> MatchResult {
        self.snapshot().matches(path)
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        self.snapshot().is_ignored(path)
    }
}
