//! The scanner driver contract (spec §6): every static-analysis tool the
//! pipeline can fan out to implements [`Scanner`]. Individual scanner
//! binaries (pylint, eslint, semgrep, ...) are out of scope; this module
//! only fixes the interface [`super::static_scan::StaticScanService`] drives
//! them through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    // Ord derive ranks info < warning < error; severity_rank in aggregation
    // sorting (spec §4.6 step 8) wants error first, so callers sort by
    // `Reverse(severity)` or use `Severity::rank()` directly.
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Rank used by the aggregation sort (spec §4.6 step 8): errors first.
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Error => 0,
            Severity::Warning => 1,
            Severity::Info => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "error" | "err" | "fatal" => Some(Severity::Error),
            "warning" | "warn" => Some(Severity::Warning),
            "info" | "note" | "convention" | "refactor" => Some(Severity::Info),
            _ => None,
        }
    }
}

/// One normalized finding from a scanner (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerIssue {
    pub file: String,
    pub line: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerInfo {
    pub name: String,
    pub enabled: bool,
    pub languages: Vec<String>,
}

/// Why a scanner is or isn't usable right now, returned by
/// `check_availability_with_reason` so callers can report it in the
/// per-file "skipped" counters (spec §4.6 step 4) without re-probing.
#[derive(Debug, Clone)]
pub struct Availability {
    pub available: bool,
    pub reason: Option<String>,
}

impl Availability {
    pub fn available() -> Self {
        Self {
            available: true,
            reason: None,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
        }
    }
}

/// Driver contract each static-analysis scanner implements (spec §6).
/// `scan` receives already-read file content (UTF-8, lossily decoded) so the
/// scanner itself never touches the filesystem.
#[async_trait]
pub trait Scanner: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool;

    fn languages(&self) -> &[String];

    /// Probes whether the underlying binary/service is reachable. Cheap
    /// enough to call once per run and cache (spec §4.6 step 4); callers are
    /// expected to memoize this behind [`super::scanner_registry::ScannerRegistry`].
    async fn check_availability_with_reason(&self) -> Availability;

    async fn scan(&self, file_path: &str, content: &str) -> Vec<ScannerIssue>;

    fn get_scanner_info(&self) -> ScannerInfo {
        ScannerInfo {
            name: self.name().to_string(),
            enabled: self.enabled(),
            languages: self.languages().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_rank_puts_error_first() {
        let mut ranks = vec![Severity::Info.rank(), Severity::Error.rank(), Severity::Warning.rank()];
        ranks.sort();
        assert_eq!(ranks, vec![0, 1, 2]);
    }

    #[test]
    fn severity_parse_normalizes_scanner_specific_spellings() {
        assert_eq!(Severity::parse("FATAL"), Some(Severity::Error));
        assert_eq!(Severity::parse("convention"), Some(Severity::Info));
        assert_eq!(Severity::parse("bogus"), None);
    }
}
