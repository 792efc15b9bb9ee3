//! Detects rule/planner disagreements after fusion and persists them as the
//! raw material the learning loop ([`super::rule_analyzer`]) mines for new
//! rules (spec §4.5).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context_level::ContextLevel;
use super::error::ConflictError;
use super::model::PlanItem;
use super::rule_engine::{HIGH_CONFIDENCE, LOW_CONFIDENCE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    RuleHighLlmExpand,
    RuleHighLlmSkip,
    RuleLowLlmConsistent,
    ContextLevelMismatch,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::RuleHighLlmExpand => "rule_high_llm_expand",
            ConflictType::RuleHighLlmSkip => "rule_high_llm_skip",
            ConflictType::RuleLowLlmConsistent => "rule_low_llm_consistent",
            ConflictType::ContextLevelMismatch => "context_level_mismatch",
        }
    }

    /// Fixed priority used by [`ConflictTracker::get_high_priority_conflicts`].
    fn priority(&self) -> u8 {
        match self {
            ConflictType::RuleHighLlmSkip => 0,
            ConflictType::RuleHighLlmExpand => 1,
            ConflictType::RuleLowLlmConsistent => 2,
            ConflictType::ContextLevelMismatch => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub conflict_type: ConflictType,
    pub unit_id: String,
    pub file_path: String,
    pub language: String,
    pub rule_context_level: ContextLevel,
    pub rule_confidence: f64,
    pub llm_context_level: Option<ContextLevel>,
    pub tags: Vec<String>,
    pub rule_notes: String,
    pub timestamp: DateTime<Utc>,
}

/// Evaluates the four conflict rules in priority order and returns the
/// first that fires, or `None` (spec §4.5: "exactly one type fires").
pub fn detect_conflict(
    item: &PlanItem,
    file_path: &str,
    language: &str,
    tags: &[String],
    rule_notes: &str,
) -> Option<ConflictType> {
    let rule_rank = item.rule_context_level.rank();
    let llm_rank = ContextLevel::rank_of(item.llm_context_level);

    if item.rule_confidence >= HIGH_CONFIDENCE && llm_rank > rule_rank && llm_rank >= 0 {
        return Some(ConflictType::RuleHighLlmExpand);
    }
    if item.rule_confidence >= HIGH_CONFIDENCE
        && item.skip_review
        && !matches!(item.rule_context_level, ContextLevel::DiffOnly)
    {
        return Some(ConflictType::RuleHighLlmSkip);
    }
    if item.rule_confidence < LOW_CONFIDENCE && llm_rank >= 0 {
        return Some(ConflictType::RuleLowLlmConsistent);
    }
    if item.rule_confidence >= LOW_CONFIDENCE
        && item.rule_confidence < HIGH_CONFIDENCE
        && (llm_rank - rule_rank).abs() > 1
    {
        return Some(ConflictType::ContextLevelMismatch);
    }

    let _ = (file_path, language, tags, rule_notes);
    None
}

#[derive(Debug, Serialize)]
pub struct ConflictSummary {
    pub total: usize,
    pub by_type: HashMap<String, usize>,
    pub by_language: HashMap<String, usize>,
    pub by_notes_prefix: HashMap<String, usize>,
}

#[derive(Debug, Serialize)]
pub struct TrendAnalysis {
    pub window_days: u32,
    pub average_daily: f64,
    pub latest_day_percent_change: f64,
    pub modal_type: Option<String>,
    pub modal_language: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PatternGroup {
    pub language: String,
    pub file_basename: String,
    pub llm_context_level: Option<ContextLevel>,
    pub member_count: usize,
    pub common_tags: Vec<String>,
    pub sample_files: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RuleSuggestion {
    pub kind: String,
    pub confidence: f64,
    pub description: String,
}

pub struct ConflictTracker {
    store_dir: Option<PathBuf>,
    records: RwLock<Vec<ConflictRecord>>,
}

impl ConflictTracker {
    pub fn in_memory() -> Self {
        Self {
            store_dir: None,
            records: RwLock::new(Vec::new()),
        }
    }

    /// Loads every `*.json` conflict file already under `store_dir` (if any)
    /// and uses it as the save target for future records.
    pub fn load(store_dir: impl Into<PathBuf>) -> Result<Self, ConflictError> {
        let store_dir = store_dir.into();
        let mut records = Vec::new();
        if store_dir.exists() {
            for entry in fs::read_dir(&store_dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let raw = fs::read_to_string(&path)?;
                if let Ok(record) = serde_json::from_str::<ConflictRecord>(&raw) {
                    records.push(record);
                }
            }
        }
        Ok(Self {
            store_dir: Some(store_dir),
            records: RwLock::new(records),
        })
    }

    /// Appends `record` to the in-memory list and, if backed by a directory,
    /// writes it as its own file named `YYYYMMDD_HHMMSS_ffffff_<type>.json`
    /// so aging can be recovered from the filename alone.
    pub fn record(&self, record: ConflictRecord) -> Result<(), ConflictError> {
        if let Some(dir) = &self.store_dir {
            fs::create_dir_all(dir)?;
            let filename = format!(
                "{}_{}.json",
                record.timestamp.format("%Y%m%d_%H%M%S_%6f"),
                record.conflict_type.as_str()
            );
            let body = serde_json::to_string_pretty(&record)?;
            let tmp = tempfile::NamedTempFile::new_in(dir)?;
            fs::write(tmp.path(), body)?;
            tmp.persist(dir.join(filename))
                .map_err(|e| ConflictError::Io(e.error))?;
        }
        self.records.write().unwrap().push(record);
        Ok(())
    }

    pub fn get_summary(&self) -> ConflictSummary {
        let records = self.records.read().unwrap();
        let mut by_type = HashMap::new();
        let mut by_language = HashMap::new();
        let mut by_notes_prefix = HashMap::new();

        for r in records.iter() {
            *by_type.entry(r.conflict_type.as_str().to_string()).or_insert(0) += 1;
            *by_language.entry(r.language.clone()).or_insert(0) += 1;
            let prefix: String = r.rule_notes.chars().take(2).collect();
            *by_notes_prefix.entry(prefix).or_insert(0) += 1;
        }

        ConflictSummary {
            total: records.len(),
            by_type,
            by_language,
            by_notes_prefix,
        }
    }

    pub fn get_conflicts_by_type(&self, conflict_type: ConflictType) -> Vec<ConflictRecord> {
        self.records
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.conflict_type == conflict_type)
            .cloned()
            .collect()
    }

    /// Newest-first within each type, types ordered by fixed priority (spec
    /// §4.5.1).
    pub fn get_high_priority_conflicts(&self, limit: usize) -> Vec<ConflictRecord> {
        let mut records: Vec<ConflictRecord> = self.records.read().unwrap().clone();
        records.sort_by(|a, b| {
            a.conflict_type
                .priority()
                .cmp(&b.conflict_type.priority())
                .then(b.timestamp.cmp(&a.timestamp))
        });
        records.truncate(limit);
        records
    }

    /// Buckets conflicts by day over the trailing `window_days` and reports
    /// the mean, the latest day's percent change against that mean, and the
    /// modal type/language (spec §4.5).
    pub fn get_trend_analysis(&self, window_days: u32) -> TrendAnalysis {
        let records = self.records.read().unwrap();
        let now = records.iter().map(|r| r.timestamp).max().unwrap_or_else(Utc::now);
        let window_start = now - chrono::Duration::days(window_days as i64);

        let mut per_day: HashMap<chrono::NaiveDate, usize> = HashMap::new();
        let mut type_counts: HashMap<&str, usize> = HashMap::new();
        let mut language_counts: HashMap<&str, usize> = HashMap::new();

        for r in records.iter().filter(|r| r.timestamp >= window_start) {
            *per_day.entry(r.timestamp.date_naive()).or_insert(0) += 1;
            *type_counts.entry(r.conflict_type.as_str()).or_insert(0) += 1;
            *language_counts.entry(r.language.as_str()).or_insert(0) += 1;
        }

        let days_elapsed = window_days.max(1) as f64;
        let total_in_window: usize = per_day.values().sum();
        let average_daily = total_in_window as f64 / days_elapsed;

        let latest_day_count = per_day.get(&now.date_naive()).copied().unwrap_or(0) as f64;
        let latest_day_percent_change = if average_daily > 0.0 {
            ((latest_day_count - average_daily) / average_daily) * 100.0
        } else {
            0.0
        };

        let modal_type = type_counts
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(t, _)| t.to_string());
        let modal_language = language_counts
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(l, _)| l.to_string());

        TrendAnalysis {
            window_days,
            average_daily,
            latest_day_percent_change,
            modal_type,
            modal_language,
        }
    }

    /// Deletes conflict files older than `max_age_days`, then evicts
    /// oldest-first until `max_count` holds, if given. Filenames are parsed
    /// for their timestamp first; file mtime is the fallback.
    pub fn cleanup_old_conflicts(
        &self,
        max_age_days: u32,
        max_count: Option<usize>,
    ) -> Result<usize, ConflictError> {
        let Some(dir) = &self.store_dir else {
            return Ok(0);
        };
        if !dir.exists() {
            return Ok(0);
        }

        let cutoff = Utc::now() - chrono::Duration::days(max_age_days as i64);
        let mut entries: Vec<(PathBuf, DateTime<Utc>)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let stamp = filename_timestamp(&path).or_else(|| mtime_timestamp(&path));
            if let Some(stamp) = stamp {
                entries.push((path, stamp));
            }
        }

        let mut removed = 0;
        entries.retain(|(path, stamp)| {
            if *stamp < cutoff {
                let _ = fs::remove_file(path);
                removed += 1;
                false
            } else {
                true
            }
        });

        if let Some(max_count) = max_count {
            entries.sort_by_key(|(_, stamp)| *stamp);
            while entries.len() > max_count {
                let (path, _) = entries.remove(0);
                let _ = fs::remove_file(path);
                removed += 1;
            }
        }

        self.records
            .write()
            .unwrap()
            .retain(|r| r.timestamp >= cutoff);
        Ok(removed)
    }

    /// File-path-based cousin of [`super::rule_analyzer`]'s semantic
    /// grouping: groups `rule_low_llm_consistent` conflicts by `(language,
    /// file_basename, llm_context_level)` and reports groups with >= 3
    /// members.
    pub fn export_patterns(&self) -> Vec<PatternGroup> {
        let records = self.records.read().unwrap();
        let mut groups: HashMap<(String, String, Option<ContextLevel>), Vec<&ConflictRecord>> =
            HashMap::new();

        for r in records
            .iter()
            .filter(|r| r.conflict_type == ConflictType::RuleLowLlmConsistent)
        {
            let basename = r
                .file_path
                .rsplit('/')
                .next()
                .unwrap_or(&r.file_path)
                .to_string();
            groups
                .entry((r.language.clone(), basename, r.llm_context_level))
                .or_default()
                .push(r);
        }

        let mut patterns = Vec::new();
        for ((language, file_basename, llm_context_level), members) in groups {
            if members.len() < 3 {
                continue;
            }
            let common_tags = common_tags_by_ratio(
                &members.iter().map(|m| m.tags.clone()).collect::<Vec<_>>(),
                0.8,
            );
            let mut sample_files: Vec<String> =
                members.iter().map(|m| m.file_path.clone()).collect();
            sample_files.sort();
            sample_files.dedup();
            sample_files.truncate(5);

            patterns.push(PatternGroup {
                language,
                file_basename,
                llm_context_level,
                member_count: members.len(),
                common_tags,
                sample_files,
            });
        }
        patterns
    }

    /// Advisory, confidence-scored suggestions; never mutates learned rules
    /// itself (spec §4.5.1).
    pub fn generate_rule_suggestions(&self) -> Vec<RuleSuggestion> {
        let records = self.records.read().unwrap();
        let mut suggestions = Vec::new();

        let expand_count = records
            .iter()
            .filter(|r| r.conflict_type == ConflictType::RuleHighLlmExpand)
            .count();
        if expand_count > 0 {
            suggestions.push(RuleSuggestion {
                kind: "upgrade_context_level".to_string(),
                confidence: (expand_count as f64 / 10.0).min(0.95),
                description: format!(
                    "{expand_count} units where the planner consistently asked for more context than the rule layer granted; consider raising the matching rule's level"
                ),
            });
        }

        let skip_count = records
            .iter()
            .filter(|r| r.conflict_type == ConflictType::RuleHighLlmSkip)
            .count();
        if skip_count > 0 {
            suggestions.push(RuleSuggestion {
                kind: "add_noise_detection".to_string(),
                confidence: (skip_count as f64 / 10.0).min(0.95),
                description: format!(
                    "{skip_count} high-confidence units the planner chose to skip; consider a noise-detection rule to pre-empt them"
                ),
            });
        }

        let consistent_count = records
            .iter()
            .filter(|r| r.conflict_type == ConflictType::RuleLowLlmConsistent)
            .count();
        if consistent_count > 0 {
            suggestions.push(RuleSuggestion {
                kind: "new_rule".to_string(),
                confidence: (consistent_count as f64 / 10.0).min(0.95),
                description: format!(
                    "{consistent_count} low-confidence units where the planner nonetheless landed on a consistent level; consider promoting a new rule"
                ),
            });
        }

        suggestions.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap());
        suggestions
    }

    /// A single timestamped JSON document bundling the other reporting
    /// methods, written under the store's sibling `patterns/` directory.
    pub fn export_report(&self, path: Option<&Path>) -> Result<PathBuf, ConflictError> {
        let report = serde_json::json!({
            "summary": self.get_summary(),
            "trend": self.get_trend_analysis(7),
            "patterns": self.export_patterns(),
            "suggestions": self.generate_rule_suggestions(),
        });
        let body = serde_json::to_string_pretty(&report)?;

        let target = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let base = self
                    .store_dir
                    .as_ref()
                    .map(|d| d.join("patterns"))
                    .unwrap_or_else(|| PathBuf::from("patterns"));
                fs::create_dir_all(&base)?;
                base.join(format!("{}.json", Utc::now().format("%Y%m%d_%H%M%S")))
            }
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, body)?;
        Ok(target)
    }
}

fn common_tags_by_ratio(tag_sets: &[Vec<String>], ratio: f64) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for tags in tag_sets {
        for tag in tags {
            *counts.entry(tag.as_str()).or_insert(0) += 1;
        }
    }
    let threshold = (tag_sets.len() as f64 * ratio).ceil() as usize;
    let mut common: Vec<String> = counts
        .into_iter()
        .filter(|(_, count)| *count >= threshold)
        .map(|(tag, _)| tag.to_string())
        .collect();
    common.sort();
    common
}

fn filename_timestamp(path: &Path) -> Option<DateTime<Utc>> {
    let stem = path.file_stem()?.to_str()?;
    let mut parts = stem.splitn(4, '_');
    let date = parts.next()?;
    let time = parts.next()?;
    let micros = parts.next()?;
    let combined = format!("{date}_{time}.{micros}");
    DateTime::parse_from_str(&format!("{combined} +0000"), "%Y%m%d_%H%M%S.%6f %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn mtime_timestamp(path: &Path) -> Option<DateTime<Utc>> {
    let metadata = fs::metadata(path).ok()?;
    let modified = metadata.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}
