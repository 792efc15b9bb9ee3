//! Mines conflicts for new rule candidates (spec §4.5). Groups
//! [`ConflictRecord`]s by `(language, sorted_tags, conflict_type)` and
//! either promotes the group to an [`ApplicableRule`] or explains, via a
//! [`ReferenceHint`], exactly which promotion threshold it missed.

use std::collections::HashMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::conflict::{ConflictRecord, ConflictType};
use super::config::RuleAnalyzerThresholds;
use super::context_level::ContextLevel;
use super::learned_rules::{LearnedRule, SOURCE_MANUAL_PROMOTION};

/// Groups conflicts by language, tag set, and conflict type (spec §4.5).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SemanticFeatureKey {
    pub language: String,
    pub sorted_tags: String,
    pub conflict_type: ConflictType,
}

impl SemanticFeatureKey {
    fn from_record(record: &ConflictRecord) -> Self {
        let mut tags = record.tags.clone();
        tags.sort();
        tags.dedup();
        Self {
            language: record.language.clone(),
            sorted_tags: tags.join("+"),
            conflict_type: record.conflict_type,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplicableRule {
    pub rule_id: String,
    pub language: String,
    pub required_tags: Vec<String>,
    pub suggested_context_level: ContextLevel,
    pub confidence: f64,
    pub sample_count: usize,
    pub consistency: f64,
    pub unique_files: usize,
    pub conflict_type: ConflictType,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReferenceHint {
    pub language: String,
    pub required_tags: Vec<String>,
    pub suggested_context_level: Option<ContextLevel>,
    pub confidence: f64,
    pub sample_count: usize,
    pub consistency: f64,
    pub unique_files: usize,
    pub conflict_type: ConflictType,
    pub reason: String,
}

/// Either outcome of evaluating one group against the promotion predicate
/// (spec §8: exactly `(samples≥5) ∧ (consistency≥0.9) ∧ (common_tags≥2) ∧
/// (unique_files≥2) ∧ (modal_decision present)`).
#[derive(Debug, Clone)]
pub enum Applicability {
    Rule(ApplicableRule),
    Hint(ReferenceHint),
}

/// `rule_id` is a stable hash over `language + sorted_tags + conflict_type`
/// (spec §3) so re-evaluating the same group twice yields the same id.
fn rule_id(language: &str, required_tags: &[String], conflict_type: ConflictType) -> String {
    let mut hasher = Sha256::new();
    hasher.update(language.as_bytes());
    hasher.update(b"|");
    hasher.update(required_tags.join(",").as_bytes());
    hasher.update(b"|");
    hasher.update(conflict_type.as_str().as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

fn common_tags(members: &[&ConflictRecord], presence_threshold: f64) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for m in members {
        for tag in &m.tags {
            *counts.entry(tag.as_str()).or_insert(0) += 1;
        }
    }
    let threshold = (members.len() as f64 * presence_threshold).ceil() as usize;
    let mut tags: Vec<String> = counts
        .into_iter()
        .filter(|(_, count)| *count >= threshold)
        .map(|(t, _)| t.to_string())
        .collect();
    tags.sort();
    tags
}

fn modal_level(members: &[&ConflictRecord]) -> Option<(ContextLevel, f64)> {
    let mut counts: HashMap<ContextLevel, usize> = HashMap::new();
    let mut with_level = 0usize;
    for m in members {
        if let Some(level) = m.llm_context_level {
            *counts.entry(level).or_insert(0) += 1;
            with_level += 1;
        }
    }
    if with_level == 0 {
        return None;
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(level, count)| (level, count as f64 / with_level as f64))
}

/// Evaluates one group against the promotion predicate (spec §4.5, §8).
pub fn evaluate_group(
    key: &SemanticFeatureKey,
    members: &[&ConflictRecord],
    thresholds: &RuleAnalyzerThresholds,
) -> Applicability {
    let sample_count = members.len();
    let unique_files: usize = {
        let mut files: Vec<&str> = members.iter().map(|m| m.file_path.as_str()).collect();
        files.sort();
        files.dedup();
        files.len()
    };
    let tags = common_tags(members, thresholds.tag_presence_threshold);
    let modal = modal_level(members);
    let (suggested_level, consistency) = match modal {
        Some((level, consistency)) => (Some(level), consistency),
        None => (None, 0.0),
    };

    let meets_samples = sample_count >= thresholds.min_occurrences;
    let meets_consistency = consistency >= thresholds.min_consistency;
    let meets_tags = tags.len() >= thresholds.min_common_tags;
    let meets_files = unique_files >= thresholds.min_unique_files;
    let has_modal = modal.is_some();

    if meets_samples && meets_consistency && meets_tags && meets_files && has_modal {
        let confidence = (consistency * (1.0 + 0.01 * (sample_count.saturating_sub(5)).min(10) as f64)).min(0.95);
        return Applicability::Rule(ApplicableRule {
            rule_id: rule_id(&key.language, &tags, key.conflict_type),
            language: key.language.clone(),
            required_tags: tags,
            suggested_context_level: suggested_level.unwrap(),
            confidence,
            sample_count,
            consistency,
            unique_files,
            conflict_type: key.conflict_type,
        });
    }

    let mut failed = Vec::new();
    if !meets_samples {
        failed.push(format!("sample_count {sample_count} < {}", thresholds.min_occurrences));
    }
    if !meets_consistency {
        failed.push(format!("consistency {consistency:.2} < {:.2}", thresholds.min_consistency));
    }
    if !meets_tags {
        failed.push(format!("common_tags {} < {}", tags.len(), thresholds.min_common_tags));
    }
    if !meets_files {
        failed.push(format!("unique_files {unique_files} < {}", thresholds.min_unique_files));
    }
    if !has_modal {
        failed.push("no modal llm_context_level present".to_string());
    }

    Applicability::Hint(ReferenceHint {
        language: key.language.clone(),
        required_tags: tags,
        suggested_context_level: suggested_level,
        confidence: consistency,
        sample_count,
        consistency,
        unique_files,
        conflict_type: key.conflict_type,
        reason: failed.join("; "),
    })
}

/// Groups `conflicts` by [`SemanticFeatureKey`] and evaluates each group
/// against `thresholds`, returning one [`Applicability`] per group.
pub fn analyze(
    conflicts: &[ConflictRecord],
    thresholds: &RuleAnalyzerThresholds,
) -> Vec<Applicability> {
    let mut groups: HashMap<SemanticFeatureKey, Vec<&ConflictRecord>> = HashMap::new();
    for record in conflicts {
        groups
            .entry(SemanticFeatureKey::from_record(record))
            .or_default()
            .push(record);
    }

    groups
        .iter()
        .map(|(key, members)| evaluate_group(key, members, thresholds))
        .collect()
}

/// Forces a [`ReferenceHint`] into a [`LearnedRule`] at a lower base
/// confidence than automatic promotion would use (spec §4.5: `≤0.85`,
/// `0.9·consistency` if `consistency>0` else `0.70`).
pub fn manual_promotion(hint: &ReferenceHint, created_at: &str) -> LearnedRule {
    let base_confidence = if hint.consistency > 0.0 {
        (0.9 * hint.consistency).min(0.85)
    } else {
        0.70
    };
    LearnedRule {
        rule_id: rule_id(&hint.language, &hint.required_tags, hint.conflict_type),
        required_tags: hint.required_tags.clone(),
        context_level: hint.suggested_context_level.unwrap_or(ContextLevel::Function),
        base_confidence,
        source: SOURCE_MANUAL_PROMOTION.to_string(),
        sample_count: hint.sample_count,
        created_at: created_at.to_string(),
    }
}

pub fn from_applicable_rule(rule: &ApplicableRule, created_at: &str) -> LearnedRule {
    LearnedRule {
        rule_id: rule.rule_id.clone(),
        required_tags: rule.required_tags.clone(),
        context_level: rule.suggested_context_level,
        base_confidence: rule.confidence,
        source: super::learned_rules::SOURCE_CONFLICT_LEARNING.to_string(),
        sample_count: rule.sample_count,
        created_at: created_at.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn conflict(file: &str, tags: &[&str], level: ContextLevel) -> ConflictRecord {
        ConflictRecord {
            conflict_type: ConflictType::RuleLowLlmConsistent,
            unit_id: "u".to_string(),
            file_path: file.to_string(),
            language: "python".to_string(),
            rule_context_level: ContextLevel::DiffOnly,
            rule_confidence: 0.1,
            llm_context_level: Some(level),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            rule_notes: "py:decorator:cosmetic".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn five_consistent_conflicts_across_three_files_promote() {
        let thresholds = RuleAnalyzerThresholds::default();
        let conflicts = vec![
            conflict("a.py", &["api_endpoint", "function_change"], ContextLevel::FileContext),
            conflict("a.py", &["api_endpoint", "function_change"], ContextLevel::FileContext),
            conflict("b.py", &["api_endpoint", "function_change"], ContextLevel::FileContext),
            conflict("b.py", &["api_endpoint", "function_change"], ContextLevel::FileContext),
            conflict("c.py", &["api_endpoint", "function_change"], ContextLevel::FileContext),
        ];
        let results = analyze(&conflicts, &thresholds);
        assert_eq!(results.len(), 1);
        match &results[0] {
            Applicability::Rule(rule) => {
                assert!(rule.confidence >= 0.90 && rule.confidence <= 0.95);
                assert_eq!(rule.required_tags, vec!["api_endpoint", "function_change"]);
            }
            Applicability::Hint(_) => panic!("expected promotion"),
        }
    }

    #[test]
    fn too_few_samples_yields_hint_naming_the_failed_threshold() {
        let thresholds = RuleAnalyzerThresholds::default();
        let conflicts = vec![
            conflict("a.py", &["api_endpoint", "function_change"], ContextLevel::FileContext),
            conflict("b.py", &["api_endpoint", "function_change"], ContextLevel::FileContext),
        ];
        let results = analyze(&conflicts, &thresholds);
        match &results[0] {
            Applicability::Hint(hint) => {
                assert!(hint.reason.contains("sample_count"));
            }
            Applicability::Rule(_) => panic!("expected a hint, not a promotion"),
        }
    }

    #[test]
    fn single_unique_file_fails_the_unique_files_threshold() {
        let thresholds = RuleAnalyzerThresholds::default();
        let conflicts: Vec<ConflictRecord> = (0..6)
            .map(|_| conflict("a.py", &["api_endpoint", "function_change"], ContextLevel::FileContext))
            .collect();
        let results = analyze(&conflicts, &thresholds);
        match &results[0] {
            Applicability::Hint(hint) => assert!(hint.reason.contains("unique_files")),
            Applicability::Rule(_) => panic!("single file must not promote"),
        }
    }

    #[test]
    fn manual_promotion_caps_confidence_below_automatic_rule() {
        let hint = ReferenceHint {
            language: "python".to_string(),
            required_tags: vec!["api_endpoint".to_string(), "function_change".to_string()],
            suggested_context_level: Some(ContextLevel::FileContext),
            confidence: 0.6,
            sample_count: 3,
            consistency: 0.6,
            unique_files: 2,
            conflict_type: ConflictType::RuleLowLlmConsistent,
            reason: "sample_count 3 < 5".to_string(),
        };
        let rule = manual_promotion(&hint, "2026-01-01T00:00:00Z");
        assert!(rule.base_confidence <= 0.85);
        assert_eq!(rule.source, SOURCE_MANUAL_PROMOTION);
    }

    #[test]
    fn manual_promotion_falls_back_to_070_when_consistency_is_zero() {
        let hint = ReferenceHint {
            language: "python".to_string(),
            required_tags: vec!["api_endpoint".to_string(), "function_change".to_string()],
            suggested_context_level: None,
            confidence: 0.0,
            sample_count: 2,
            consistency: 0.0,
            unique_files: 1,
            conflict_type: ConflictType::RuleLowLlmConsistent,
            reason: "no modal llm_context_level present".to_string(),
        };
        let rule = manual_promotion(&hint, "2026-01-01T00:00:00Z");
        assert_eq!(rule.base_confidence, 0.70);
    }
}
