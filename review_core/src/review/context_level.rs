//! The canonical context-level vocabulary shared across every layer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How much surrounding code a reviewer should see for a given unit.
///
/// Ordered: `DiffOnly < Function < FileContext < FullFile`. Legacy synonyms
/// (`local`, `file`) are accepted on parse and normalized to the canonical
/// member; unknown strings round-trip through [`ContextLevel::rank`] as -1
/// rather than being promoted to any valid level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextLevel {
    DiffOnly,
    Function,
    FileContext,
    FullFile,
}

impl ContextLevel {
    pub fn default_level() -> Self {
        ContextLevel::Function
    }

    /// Parses a level, accepting the legacy synonyms `local` (-> DiffOnly)
    /// and `file` (-> FileContext). Returns `None` for anything else.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "diff_only" | "local" => Some(ContextLevel::DiffOnly),
            "function" => Some(ContextLevel::Function),
            "file_context" | "file" => Some(ContextLevel::FileContext),
            "full_file" => Some(ContextLevel::FullFile),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextLevel::DiffOnly => "diff_only",
            ContextLevel::Function => "function",
            ContextLevel::FileContext => "file_context",
            ContextLevel::FullFile => "full_file",
        }
    }

    /// Rank used for ordering comparisons. Higher means richer context.
    pub fn rank_of(level: Option<ContextLevel>) -> i32 {
        match level {
            None => -1,
            Some(ContextLevel::DiffOnly) => 0,
            Some(ContextLevel::Function) => 1,
            Some(ContextLevel::FileContext) => 2,
            Some(ContextLevel::FullFile) => 3,
        }
    }

    pub fn rank(&self) -> i32 {
        Self::rank_of(Some(*self))
    }
}

impl fmt::Display for ContextLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses a raw string (possibly a legacy synonym, possibly garbage) the way
/// rule/planner output arrives off the wire: unknown strings rank -1 without
/// panicking or silently promoting to a valid level.
pub fn ctx_rank(raw: Option<&str>) -> i32 {
    match raw {
        None => -1,
        Some(s) => ContextLevel::rank_of(ContextLevel::parse(s)),
    }
}

/// Diff acquisition mode, named in the mode selector of the DiffCollector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffMode {
    Working,
    Staged,
    Pr,
    Commit,
    Auto,
}

impl fmt::Display for DiffMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiffMode::Working => "working",
            DiffMode::Staged => "staged",
            DiffMode::Pr => "pr",
            DiffMode::Commit => "commit",
            DiffMode::Auto => "auto",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_is_monotone_for_canonical_levels() {
        assert!(ContextLevel::DiffOnly.rank() < ContextLevel::Function.rank());
        assert!(ContextLevel::Function.rank() < ContextLevel::FileContext.rank());
        assert!(ContextLevel::FileContext.rank() < ContextLevel::FullFile.rank());
    }

    #[test]
    fn legacy_synonyms_collapse_to_canonical_rank() {
        assert_eq!(ctx_rank(Some("local")), ctx_rank(Some("diff_only")));
        assert_eq!(ctx_rank(Some("file")), ctx_rank(Some("file_context")));
    }

    #[test]
    fn unknown_level_ranks_below_diff_only() {
        assert_eq!(ctx_rank(Some("bogus")), -1);
        assert!(ctx_rank(Some("bogus")) < ContextLevel::DiffOnly.rank());
        assert_eq!(ctx_rank(None), -1);
    }
}
