//! Shared data model: [`ReviewUnit`], planner/fusion wire types, and the
//! small value types they're built from. These are the tagged-record
//! replacement for the original's free-form dicts (spec §9): the JSON shape
//! here *is* the wire contract in spec §6, not an incidental in-memory form.

use serde::{Deserialize, Serialize};

use super::context_level::ContextLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Add,
    Modify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HunkRange {
    pub old_start: usize,
    pub old_lines: usize,
    pub new_start: usize,
    pub new_lines: usize,
}

impl HunkRange {
    /// Inclusive new-file line range a unit covers (spec §4.6 step 9):
    /// `[new_start, new_start + max(new_lines, 1) - 1]`.
    pub fn new_line_range(&self) -> Option<(usize, usize)> {
        if self.new_start == 0 {
            return None;
        }
        let end = self.new_start + self.new_lines.max(1) - 1;
        Some((self.new_start, end))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeSnippets {
    pub before: String,
    pub after: String,
    pub context: String,
    pub context_start: usize,
    pub context_end: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub added_lines: usize,
    pub removed_lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub kind: String,
    pub start_line: usize,
    pub end_line: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// One hunk of one file, enriched by the rule layer. `unit_id` is immutable
/// once assigned and is never reused within a run (spec §3 invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewUnit {
    pub unit_id: String,
    pub file_path: String,
    pub language: String,
    pub change_type: ChangeType,
    pub hunk_range: HunkRange,
    pub code_snippets: CodeSnippets,
    pub metrics: Metrics,
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub rule_context_level: Option<ContextLevel>,
    #[serde(default)]
    pub rule_confidence: f64,
    #[serde(default)]
    pub rule_notes: String,
    #[serde(default)]
    pub rule_extra_requests: Vec<ExtraRequest>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<Symbol>,
}

impl ReviewUnit {
    /// The level the rest of the pipeline treats as "the rule layer's
    /// answer", collapsing an absent/unknown level to `diff_only` the way
    /// the fusion layer does at every emission point (spec §4.4).
    pub fn rule_level_or_diff_only(&self) -> ContextLevel {
        self.rule_context_level.unwrap_or(ContextLevel::DiffOnly)
    }
}

/// One unit's worth of planner output, as received over the wire (spec §6).
/// Unknown `unit_id`s are ignored by the fusion layer; malformed entries are
/// treated as missing, never as an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlannerDecision {
    pub unit_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_context_level: Option<ContextLevel>,
    #[serde(default)]
    pub extra_requests: Vec<ExtraRequest>,
    #[serde(default)]
    pub skip_review: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlannerOutput {
    #[serde(default)]
    pub plan: Vec<PlannerDecision>,
}

/// One fusion result per input unit, in input order (spec §3 invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanItem {
    pub unit_id: Option<String>,
    pub rule_context_level: ContextLevel,
    pub rule_confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_context_level: Option<ContextLevel>,
    pub final_context_level: ContextLevel,
    pub extra_requests: Vec<ExtraRequest>,
    pub skip_review: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FusionOutput {
    pub plan: Vec<PlanItem>,
}
