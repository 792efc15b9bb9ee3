//! Every tunable the pipeline exposes, collected into one serde-backed struct.
//!
//! Mirrors the teacher's pattern of a single config type loaded once at process
//! start rather than scattering environment-variable reads through the code.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::context_level::DiffMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleAnalyzerThresholds {
    pub min_occurrences: usize,
    pub min_consistency: f64,
    pub min_common_tags: usize,
    pub min_unique_files: usize,
    pub tag_presence_threshold: f64,
}

impl Default for RuleAnalyzerThresholds {
    fn default() -> Self {
        Self {
            min_occurrences: 5,
            min_consistency: 0.90,
            min_common_tags: 2,
            min_unique_files: 2,
            tag_presence_threshold: 0.80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub diff_mode: DiffMode,
    pub base_branch: Option<String>,
    pub context_radius: usize,
    pub scanner_concurrency: usize,
    pub scanner_timeout_secs: u64,
    pub scanner_enabled: HashMap<String, bool>,
    pub scanner_cache_ttl_secs: u64,
    pub scanner_cache_max_entries: usize,
    pub conflict_max_age_days: u64,
    pub conflict_max_count: Option<usize>,
    pub trend_window_days: u32,
    pub max_cached_issues_per_severity: usize,
    pub rule_analyzer: RuleAnalyzerThresholds,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            diff_mode: DiffMode::Auto,
            base_branch: None,
            context_radius: 20,
            scanner_concurrency: 2,
            scanner_timeout_secs: 30,
            scanner_enabled: HashMap::new(),
            scanner_cache_ttl_secs: 3600,
            scanner_cache_max_entries: 1000,
            conflict_max_age_days: 30,
            conflict_max_count: None,
            trend_window_days: 7,
            max_cached_issues_per_severity: 20_000,
            rule_analyzer: RuleAnalyzerThresholds::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn scanner_is_enabled(&self, scanner_name: &str) -> bool {
        self.scanner_enabled.get(scanner_name).copied().unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.context_radius, 20);
        assert_eq!(cfg.scanner_concurrency, 2);
        assert_eq!(cfg.scanner_cache_ttl_secs, 3600);
        assert_eq!(cfg.scanner_cache_max_entries, 1000);
        assert_eq!(cfg.conflict_max_age_days, 30);
        assert_eq!(cfg.trend_window_days, 7);
        assert_eq!(cfg.max_cached_issues_per_severity, 20_000);
        assert_eq!(cfg.rule_analyzer.min_occurrences, 5);
    }

    #[test]
    fn from_toml_str_overrides_defaults() {
        let cfg = PipelineConfig::from_toml_str(
            r#"
            context_radius = 40
            scanner_concurrency = 4
            "#,
        )
        .expect("valid toml");
        assert_eq!(cfg.context_radius, 40);
        assert_eq!(cfg.scanner_concurrency, 4);
        // untouched fields keep their defaults
        assert_eq!(cfg.scanner_cache_ttl_secs, 3600);
    }

    #[test]
    fn scanner_enabled_defaults_to_true_for_unknown_scanner() {
        let cfg = PipelineConfig::default();
        assert!(cfg.scanner_is_enabled("pylint"));
    }
}
