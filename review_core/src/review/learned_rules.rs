//! `learned_rules.json`: tag-rules promoted out of [`super::rule_analyzer`],
//! or added by hand, that [`super::rule_engine`] consults on every unit
//! (spec §4.3, §4.5.1). The Rust counterpart of the original
//! `RuleConfigManager`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use super::context_level::ContextLevel;
use super::error::RuleError;

pub const SOURCE_CONFLICT_LEARNING: &str = "conflict_learning";
pub const SOURCE_MANUAL_PROMOTION: &str = "manual_promotion";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedRule {
    pub rule_id: String,
    pub required_tags: Vec<String>,
    pub context_level: ContextLevel,
    pub base_confidence: f64,
    pub source: String,
    pub sample_count: usize,
    pub created_at: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LearnedRuleFile {
    #[serde(default)]
    by_language: HashMap<String, Vec<LearnedRule>>,
}

#[derive(Debug, Default, Serialize)]
pub struct LearnedRuleStats {
    pub total: usize,
    pub per_language: HashMap<String, usize>,
    pub per_source: HashMap<String, usize>,
}

pub struct LearnedRuleStore {
    path: Option<PathBuf>,
    rules: RwLock<HashMap<String, Vec<LearnedRule>>>,
}

impl LearnedRuleStore {
    /// An in-memory-only store, never persisted. Used by callers (tests,
    /// one-off pipeline runs without a data directory) that don't need
    /// durable learned rules.
    pub fn empty() -> Self {
        Self {
            path: None,
            rules: RwLock::new(HashMap::new()),
        }
    }

    /// Loads `path` if it exists, otherwise starts empty; `path` becomes the
    /// save target for subsequent mutations.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RuleError> {
        let path = path.into();
        let rules = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let file: LearnedRuleFile = serde_json::from_str(&raw)?;
            file.by_language
        } else {
            HashMap::new()
        };

        Ok(Self {
            path: Some(path),
            rules: RwLock::new(rules),
        })
    }

    fn persist(&self) -> Result<(), RuleError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let snapshot = LearnedRuleFile {
            by_language: self.rules.read().unwrap().clone(),
        };
        let body = serde_json::to_string_pretty(&snapshot)?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        fs::write(tmp.path(), body)?;
        tmp.persist(path)
            .map_err(|e| RuleError::Io(e.error))?;
        Ok(())
    }

    pub fn rules_for_language(&self, language: &str) -> Vec<LearnedRule> {
        self.rules
            .read()
            .unwrap()
            .get(language)
            .cloned()
            .unwrap_or_default()
    }

    /// Upserts `rule` by `rule_id` within `language`'s rule list.
    pub fn add_tag_rule(&self, language: &str, rule: LearnedRule) -> Result<(), RuleError> {
        {
            let mut guard = self.rules.write().unwrap();
            let entry = guard.entry(language.to_string()).or_default();
            if let Some(existing) = entry.iter_mut().find(|r| r.rule_id == rule.rule_id) {
                *existing = rule;
            } else {
                entry.push(rule);
            }
        }
        self.persist()
    }

    /// Removes a rule by id from `language`'s list. Returns whether anything
    /// was removed.
    pub fn remove_learned_rule(&self, language: &str, rule_id: &str) -> Result<bool, RuleError> {
        let removed = {
            let mut guard = self.rules.write().unwrap();
            match guard.get_mut(language) {
                Some(entry) => {
                    let before = entry.len();
                    entry.retain(|r| r.rule_id != rule_id);
                    entry.len() != before
                }
                None => false,
            }
        };
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn get_stats(&self) -> LearnedRuleStats {
        let guard = self.rules.read().unwrap();
        let mut stats = LearnedRuleStats::default();
        for (language, rules) in guard.iter() {
            stats.per_language.insert(language.clone(), rules.len());
            stats.total += rules.len();
            for rule in rules {
                *stats.per_source.entry(rule.source.clone()).or_insert(0) += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_rule(id: &str) -> LearnedRule {
        LearnedRule {
            rule_id: id.to_string(),
            required_tags: vec!["security_sensitive".to_string(), "config_file".to_string()],
            context_level: ContextLevel::FileContext,
            base_confidence: 0.9,
            source: SOURCE_CONFLICT_LEARNING.to_string(),
            sample_count: 6,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn upsert_replaces_existing_rule_id() {
        let store = LearnedRuleStore::empty();
        store.add_tag_rule("python", sample_rule("r1")).unwrap();
        let mut updated = sample_rule("r1");
        updated.base_confidence = 0.95;
        store.add_tag_rule("python", updated).unwrap();

        let rules = store.rules_for_language("python");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].base_confidence, 0.95);
    }

    #[test]
    fn remove_learned_rule_reports_whether_anything_changed() {
        let store = LearnedRuleStore::empty();
        store.add_tag_rule("python", sample_rule("r1")).unwrap();
        assert!(store.remove_learned_rule("python", "r1").unwrap());
        assert!(!store.remove_learned_rule("python", "r1").unwrap());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("learned_rules.json");
        let store = LearnedRuleStore::load(&path).unwrap();
        store.add_tag_rule("go", sample_rule("r2")).unwrap();

        let reloaded = LearnedRuleStore::load(&path).unwrap();
        assert_eq!(reloaded.rules_for_language("go").len(), 1);
    }

    #[test]
    fn get_stats_breaks_down_by_language_and_source() {
        let store = LearnedRuleStore::empty();
        store.add_tag_rule("python", sample_rule("r1")).unwrap();
        store.add_tag_rule("go", sample_rule("r2")).unwrap();
        let stats = store.get_stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.per_language.get("python"), Some(&1));
        assert_eq!(stats.per_source.get(SOURCE_CONFLICT_LEARNING), Some(&2));
    }
}
