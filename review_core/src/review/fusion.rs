//! Combines rule-engine output with a (possibly partial, possibly absent)
//! planner response into a final per-unit decision (spec §4.4).

use std::collections::HashSet;

use super::context_level::ContextLevel;
use super::model::{ExtraRequest, FusionOutput, PlanItem, PlannerOutput, ReviewUnit};
use super::rule_engine::{HIGH_CONFIDENCE, LOW_CONFIDENCE};

const RISK_TAGS: [&str; 3] = ["security_sensitive", "config_file", "routing_file"];
const SHAPE_TAGS: [&str; 2] = ["in_single_function", "complete_function"];

fn has_high_or_medium_risk_tag(tags: &[String]) -> bool {
    tags.iter().any(|t| RISK_TAGS.contains(&t.as_str()) || SHAPE_TAGS.contains(&t.as_str()))
}

/// The high/medium-risk predicate used both to seed the selected set when
/// the planner mentions no units, and to augment it when the planner does.
fn is_selected_by_risk(unit: &ReviewUnit) -> bool {
    unit.rule_confidence >= HIGH_CONFIDENCE
        || (unit.rule_confidence >= super::rule_engine::MEDIUM_CONFIDENCE
            && unit.rule_confidence < HIGH_CONFIDENCE)
        || has_high_or_medium_risk_tag(&unit.tags)
}

/// Fuses rule output with planner output into one [`PlanItem`] per unit, in
/// input order (spec §4.4 invariant: `len(output.plan) == len(units)`, no
/// duplicates, order preserved).
pub fn fuse_plan(units: &[ReviewUnit], planner: Option<&PlannerOutput>) -> FusionOutput {
    let planner_by_unit: std::collections::HashMap<&str, &super::model::PlannerDecision> = planner
        .map(|p| p.plan.iter().map(|d| (d.unit_id.as_str(), d)).collect())
        .unwrap_or_default();

    let planner_mentioned_any = !planner_by_unit.is_empty();

    let mut selected: HashSet<&str> = HashSet::new();
    for unit in units {
        if unit.unit_id.is_empty() {
            continue;
        }
        let planner_mentions_this = planner_by_unit.contains_key(unit.unit_id.as_str());
        if !planner_mentioned_any {
            if is_selected_by_risk(unit) {
                selected.insert(unit.unit_id.as_str());
            }
        } else if planner_mentions_this || is_selected_by_risk(unit) {
            selected.insert(unit.unit_id.as_str());
        }
    }

    let mut plan = Vec::with_capacity(units.len());
    for unit in units {
        if unit.unit_id.is_empty() {
            plan.push(PlanItem {
                unit_id: None,
                rule_context_level: unit.rule_level_or_diff_only(),
                rule_confidence: unit.rule_confidence,
                llm_context_level: None,
                final_context_level: unit.rule_level_or_diff_only(),
                extra_requests: Vec::new(),
                skip_review: true,
                reason: Some("dropped_missing_unit_id".to_string()),
            });
            continue;
        }

        let rule_level = unit.rule_level_or_diff_only();
        if !selected.contains(unit.unit_id.as_str()) {
            plan.push(PlanItem {
                unit_id: Some(unit.unit_id.clone()),
                rule_context_level: rule_level,
                rule_confidence: unit.rule_confidence,
                llm_context_level: None,
                final_context_level: rule_level,
                extra_requests: Vec::new(),
                skip_review: true,
                reason: Some("dropped_by_fusion_low_confidence".to_string()),
            });
            continue;
        }

        let decision = planner_by_unit.get(unit.unit_id.as_str()).copied();
        let llm_level = decision.and_then(|d| d.llm_context_level);
        let llm_rank = ContextLevel::rank_of(llm_level);
        let rule_rank = rule_level.rank();

        let final_level = if unit.rule_confidence >= HIGH_CONFIDENCE {
            if llm_rank > rule_rank {
                llm_level.unwrap_or(rule_level)
            } else {
                rule_level
            }
        } else if unit.rule_confidence <= LOW_CONFIDENCE {
            llm_level.unwrap_or(rule_level)
        } else if llm_rank > rule_rank {
            llm_level.unwrap_or(rule_level)
        } else if rule_rank > llm_rank {
            rule_level
        } else {
            llm_level.unwrap_or(rule_level)
        };

        let extra_requests: Vec<ExtraRequest> = decision
            .map(|d| d.extra_requests.clone())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| unit.rule_extra_requests.clone());

        let skip_review = decision.map(|d| d.skip_review).unwrap_or(false);

        let reason = match decision.and_then(|d| d.reason.clone()) {
            Some(r) => Some(r),
            None if decision.is_none() => Some(fallback_reason(unit.rule_confidence)),
            None => None,
        };

        plan.push(PlanItem {
            unit_id: Some(unit.unit_id.clone()),
            rule_context_level: rule_level,
            rule_confidence: unit.rule_confidence,
            llm_context_level: llm_level,
            final_context_level: final_level,
            extra_requests,
            skip_review,
            reason,
        });
    }

    FusionOutput { plan }
}

fn fallback_reason(rule_confidence: f64) -> String {
    if rule_confidence >= HIGH_CONFIDENCE {
        "rule_high_confidence_fallback".to_string()
    } else if rule_confidence <= LOW_CONFIDENCE {
        "rule_low_confidence_fallback".to_string()
    } else {
        "rule_medium_confidence_fallback".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::model::{ChangeType, CodeSnippets, HunkRange, Metrics, PlannerDecision};

    fn unit(id: &str, level: ContextLevel, confidence: f64, tags: &[&str]) -> ReviewUnit {
        ReviewUnit {
            unit_id: id.to_string(),
            file_path: "src/app.py".to_string(),
            language: "python".to_string(),
            change_type: ChangeType::Modify,
            hunk_range: HunkRange::default(),
            code_snippets: CodeSnippets::default(),
            metrics: Metrics::default(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            rule_context_level: Some(level),
            rule_confidence: confidence,
            rule_notes: String::new(),
            rule_extra_requests: Vec::new(),
            symbol: None,
        }
    }

    #[test]
    fn missing_unit_id_is_dropped_with_fixed_reason() {
        let u = unit("", ContextLevel::Function, 0.9, &[]);
        let out = fuse_plan(&[u], None);
        assert_eq!(out.plan.len(), 1);
        assert!(out.plan[0].skip_review);
        assert_eq!(out.plan[0].reason.as_deref(), Some("dropped_missing_unit_id"));
    }

    #[test]
    fn low_confidence_untagged_unit_is_dropped_when_planner_silent() {
        let u = unit("u1", ContextLevel::DiffOnly, 0.1, &[]);
        let out = fuse_plan(&[u], None);
        assert!(out.plan[0].skip_review);
        assert_eq!(
            out.plan[0].reason.as_deref(),
            Some("dropped_by_fusion_low_confidence")
        );
    }

    #[test]
    fn high_confidence_rule_never_demoted_by_lower_llm_level() {
        let u = unit("u1", ContextLevel::FileContext, 0.9, &["security_sensitive"]);
        let mut planner = PlannerOutput::default();
        planner.plan.push(PlannerDecision {
            unit_id: "u1".to_string(),
            llm_context_level: Some(ContextLevel::DiffOnly),
            ..Default::default()
        });
        let out = fuse_plan(&[u], Some(&planner));
        assert_eq!(out.plan[0].final_context_level, ContextLevel::FileContext);
        assert!(!out.plan[0].skip_review);
    }

    #[test]
    fn high_confidence_rule_expands_to_higher_llm_level() {
        let u = unit("u1", ContextLevel::Function, 0.9, &["security_sensitive"]);
        let mut planner = PlannerOutput::default();
        planner.plan.push(PlannerDecision {
            unit_id: "u1".to_string(),
            llm_context_level: Some(ContextLevel::FullFile),
            ..Default::default()
        });
        let out = fuse_plan(&[u], Some(&planner));
        assert_eq!(out.plan[0].final_context_level, ContextLevel::FullFile);
    }

    #[test]
    fn low_confidence_defers_entirely_to_llm_when_present() {
        let u = unit("u1", ContextLevel::FullFile, 0.1, &["security_sensitive"]);
        let mut planner = PlannerOutput::default();
        planner.plan.push(PlannerDecision {
            unit_id: "u1".to_string(),
            llm_context_level: Some(ContextLevel::DiffOnly),
            ..Default::default()
        });
        let out = fuse_plan(&[u], Some(&planner));
        assert_eq!(out.plan[0].final_context_level, ContextLevel::DiffOnly);
    }

    #[test]
    fn plan_length_matches_unit_count_and_preserves_order() {
        let units = vec![
            unit("a", ContextLevel::Function, 0.9, &["security_sensitive"]),
            unit("b", ContextLevel::DiffOnly, 0.1, &[]),
            unit("c", ContextLevel::Function, 0.6, &[]),
        ];
        let out = fuse_plan(&units, None);
        assert_eq!(out.plan.len(), 3);
        assert_eq!(out.plan[0].unit_id.as_deref(), Some("a"));
        assert_eq!(out.plan[1].unit_id.as_deref(), Some("b"));
        assert_eq!(out.plan[2].unit_id.as_deref(), Some("c"));
    }
}
