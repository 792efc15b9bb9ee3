//! Heuristic, language-dispatched tagging of [`ReviewUnit`]s (spec §4.3).
//!
//! Handlers run in a fixed order — cross-language path rules, cross-language
//! shape rules, then the language-dispatched catalogue, then a fallback —
//! each only ever raising the unit's confidence/level relative to whatever
//! ran before it. Notes are taken from whichever single handler produced the
//! highest confidence, ties broken by registration order, because
//! [`super::conflict::ConflictTracker`] groups on that one string.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

use super::context_level::ContextLevel;
use super::learned_rules::LearnedRuleStore;
use super::model::ReviewUnit;

pub const HIGH_CONFIDENCE: f64 = 0.8;
pub const MEDIUM_CONFIDENCE: f64 = 0.5;
pub const LOW_CONFIDENCE: f64 = 0.3;
const LEARNED_RULE_CAP: f64 = 0.95;

static SECURITY_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(auth|security|crypto|secret|token|jwt|oauth|password)").unwrap());
static FASTAPI_ROUTE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@(app|router)\.(route|get|post|put|delete)\(").unwrap());
static DJANGO_VIEW_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"class\s+\w+\([^)]*\b(View|APIView)\b").unwrap());
static JS_ROUTE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(app|router)\.(get|post|put|delete)\(").unwrap());
static JS_COMPONENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"export default (function|const)\s+\w+").unwrap());
static JSX_HINT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"return\s*\(?\s*<\w+").unwrap());
static JAVA_ANNOTATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"@(RestController|RequestMapping|GetMapping|PostMapping|PutMapping|DeleteMapping)")
        .unwrap()
});
static GO_HANDLER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"func\s+\w*\s*\([^)]*http\.ResponseWriter[^)]*\)|mux\.HandleFunc\(").unwrap()
});
static RUBY_ROUTES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"resources\s+:\w+").unwrap());
static TOP_LEVEL_DEF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(def |class |function |func |public |private |export )").unwrap());

/// Mutable accumulator a handler pass folds its findings into. Confidence and
/// level only ever move up; `notes` is overwritten only on a strictly higher
/// confidence than whatever set it before (first-registered handler wins
/// ties).
#[derive(Default)]
struct Accum {
    tags: Vec<String>,
    level: Option<ContextLevel>,
    confidence: f64,
    notes: String,
}

impl Accum {
    fn add_tag(&mut self, tag: &str) {
        if !self.tags.iter().any(|t| t == tag) {
            self.tags.push(tag.to_string());
        }
    }

    fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// A "setting" handler contribution: raises level to at least `level`
    /// and, if `confidence` strictly beats the current one, takes over
    /// `notes` too.
    fn apply(&mut self, level: ContextLevel, confidence: f64, notes: &str) {
        self.level = Some(match self.level {
            Some(current) if current.rank() >= level.rank() => current,
            _ => level,
        });
        if confidence > self.confidence {
            self.confidence = confidence;
            self.notes = notes.to_string();
        }
    }

    /// A "bump" handler contribution: nudges confidence without claiming the
    /// notes slot or forcing a level.
    fn bump(&mut self, delta: f64, cap: f64) {
        self.confidence = (self.confidence + delta).min(cap);
    }
}

fn basename(file_path: &str) -> &str {
    file_path.rsplit('/').next().unwrap_or(file_path)
}

fn apply_path_handlers(unit: &ReviewUnit, accum: &mut Accum) {
    let path = &unit.file_path;
    let base = basename(path).to_ascii_lowercase();

    if SECURITY_PATH_RE.is_match(path) {
        accum.add_tag("security_sensitive");
        accum.apply(ContextLevel::FileContext, HIGH_CONFIDENCE, "path:security_keyword");
    }

    let is_config = base.starts_with("config")
        || base.starts_with("settings")
        || base.ends_with(".env")
        || base.ends_with(".yaml")
        || base.ends_with(".yml")
        || base.ends_with(".toml")
        || base.ends_with(".ini");
    if is_config {
        accum.add_tag("config_file");
        accum.apply(ContextLevel::Function, MEDIUM_CONFIDENCE, "path:config_file");
    }

    let is_routing =
        base.contains("route") || base.contains("router") || base.contains("urls") || base.contains("endpoints");
    if is_routing {
        accum.add_tag("routing_file");
        accum.apply(ContextLevel::Function, MEDIUM_CONFIDENCE, "path:routing_file");
    }
}

/// `before`/`after` line multisets used by the decorator-only-change and
/// complete-function-added heuristics.
struct HunkLines<'a> {
    before: Vec<&'a str>,
    after: Vec<&'a str>,
}

impl<'a> HunkLines<'a> {
    fn from_unit(unit: &'a ReviewUnit) -> Self {
        Self {
            before: unit.code_snippets.before.lines().collect(),
            after: unit.code_snippets.after.lines().collect(),
        }
    }

    fn changed_lines(&self) -> Vec<&'a str> {
        let before_set: HashSet<&str> = self.before.iter().copied().collect();
        let after_set: HashSet<&str> = self.after.iter().copied().collect();
        self.before
            .iter()
            .copied()
            .filter(|l| !after_set.contains(l))
            .chain(self.after.iter().copied().filter(|l| !before_set.contains(l)))
            .collect()
    }
}

fn apply_shape_handlers(unit: &ReviewUnit, accum: &mut Accum) {
    let lines = HunkLines::from_unit(unit);

    let bounded = match lines.after.len() {
        0 | 1 => true,
        n => lines.after[1..n - 1]
            .iter()
            .all(|l| l.is_empty() || l.starts_with(' ') || l.starts_with('\t')),
    };
    if bounded {
        accum.add_tag("in_single_function");
        accum.bump(0.1, HIGH_CONFIDENCE);
    }

    let before_set: HashSet<&str> = lines.before.iter().copied().collect();
    let adds_new_def = lines
        .after
        .iter()
        .any(|l| TOP_LEVEL_DEF_RE.is_match(l) && !before_set.contains(l));
    if adds_new_def {
        accum.add_tag("complete_function");
    }
}

fn apply_python_handlers(unit: &ReviewUnit, accum: &mut Accum) {
    let surrounding = format!(
        "{}\n{}\n{}",
        unit.code_snippets.before, unit.code_snippets.after, unit.code_snippets.context
    );
    let is_fastapi = FASTAPI_ROUTE_RE.is_match(&surrounding);
    let is_django = DJANGO_VIEW_RE.is_match(&surrounding);
    if !is_fastapi && !is_django {
        return;
    }

    accum.add_tag("api_endpoint");
    let lines = HunkLines::from_unit(unit);
    let changed = lines.changed_lines();
    let decorator_only = !changed.is_empty() && changed.iter().all(|l| l.trim_start().starts_with('@'));

    if decorator_only {
        accum.apply(ContextLevel::Function, LOW_CONFIDENCE, "py:decorator:cosmetic");
    } else if is_django {
        accum.apply(ContextLevel::Function, HIGH_CONFIDENCE, "py:decorator:django_view");
    } else {
        accum.apply(ContextLevel::Function, HIGH_CONFIDENCE, "py:decorator:fastapi_route");
    }
}

fn apply_javascript_handlers(unit: &ReviewUnit, accum: &mut Accum) {
    let after = &unit.code_snippets.after;
    if JS_ROUTE_RE.is_match(after) {
        accum.add_tag("api_endpoint");
        accum.apply(ContextLevel::Function, HIGH_CONFIDENCE, "js:route_handler");
    }
    if JS_COMPONENT_RE.is_match(after) && JSX_HINT_RE.is_match(after) {
        accum.add_tag("ui_component");
        accum.apply(ContextLevel::Function, MEDIUM_CONFIDENCE, "js:ui_component");
    }
}

fn apply_java_handlers(unit: &ReviewUnit, accum: &mut Accum) {
    if JAVA_ANNOTATION_RE.is_match(&unit.code_snippets.after) {
        accum.add_tag("api_endpoint");
        accum.apply(ContextLevel::Function, HIGH_CONFIDENCE, "java:annotation:spring_route");
    }
}

fn apply_go_handlers(unit: &ReviewUnit, accum: &mut Accum) {
    if GO_HANDLER_RE.is_match(&unit.code_snippets.after) {
        accum.add_tag("api_endpoint");
        accum.apply(ContextLevel::Function, HIGH_CONFIDENCE, "go:handler");
    }
}

fn apply_ruby_handlers(unit: &ReviewUnit, accum: &mut Accum) {
    let base = basename(&unit.file_path).to_ascii_lowercase();
    let surrounding = format!("{}\n{}", unit.code_snippets.before, unit.code_snippets.after);
    if base == "routes.rb" || RUBY_ROUTES_RE.is_match(&surrounding) {
        accum.add_tag("routing_file");
        accum.add_tag("api_endpoint");
        accum.apply(ContextLevel::Function, MEDIUM_CONFIDENCE, "rb:routes");
    }
}

/// Applies the full handler catalogue, then consults `learned` for the
/// unit's language, mutating `unit`'s `tags`/`rule_context_level`/
/// `rule_confidence`/`rule_notes` in place.
pub fn apply_rules(unit: &mut ReviewUnit, learned: &LearnedRuleStore) {
    let mut accum = Accum::default();

    apply_path_handlers(unit, &mut accum);
    apply_shape_handlers(unit, &mut accum);

    match unit.language.as_str() {
        "python" => apply_python_handlers(unit, &mut accum),
        "javascript" => apply_javascript_handlers(unit, &mut accum),
        "java" => apply_java_handlers(unit, &mut accum),
        "go" => apply_go_handlers(unit, &mut accum),
        "ruby" => apply_ruby_handlers(unit, &mut accum),
        _ => {}
    }

    if accum.level.is_none() {
        accum.apply(ContextLevel::Function, MEDIUM_CONFIDENCE, "generic:fallback");
    }

    for rule in learned.rules_for_language(&unit.language) {
        if rule.required_tags.iter().all(|t| accum.has_tag(t)) {
            let notes = format!("learned:{}", rule.required_tags.join("+"));
            accum.apply(rule.context_level, rule.base_confidence.min(LEARNED_RULE_CAP), &notes);
        }
    }

    unit.tags = accum.tags;
    unit.rule_context_level = accum.level;
    unit.rule_confidence = accum.confidence;
    unit.rule_notes = accum.notes;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::model::{ChangeType, CodeSnippets, HunkRange, Metrics};

    fn unit(file_path: &str, language: &str, before: &str, after: &str) -> ReviewUnit {
        ReviewUnit {
            unit_id: "u1".to_string(),
            file_path: file_path.to_string(),
            language: language.to_string(),
            change_type: ChangeType::Modify,
            hunk_range: HunkRange::default(),
            code_snippets: CodeSnippets {
                before: before.to_string(),
                after: after.to_string(),
                context: String::new(),
                context_start: 1,
                context_end: 1,
            },
            metrics: Metrics::default(),
            tags: Vec::new(),
            rule_context_level: None,
            rule_confidence: 0.0,
            rule_notes: String::new(),
            rule_extra_requests: Vec::new(),
            symbol: None,
        }
    }

    #[test]
    fn security_path_wins_over_fallback() {
        let store = LearnedRuleStore::empty();
        let mut u = unit("src/auth/token_service.py", "python", "x = 1", "x = 2");
        apply_rules(&mut u, &store);
        assert!(u.tags.contains(&"security_sensitive".to_string()));
        assert_eq!(u.rule_context_level, Some(ContextLevel::FileContext));
        assert_eq!(u.rule_confidence, HIGH_CONFIDENCE);
        assert_eq!(u.rule_notes, "path:security_keyword");
    }

    #[test]
    fn decorator_only_change_is_low_confidence() {
        let store = LearnedRuleStore::empty();
        let mut u = unit(
            "app/views.py",
            "python",
            "@app.route(\"/old\")",
            "@app.route(\"/new\")",
        );
        apply_rules(&mut u, &store);
        assert!(u.tags.contains(&"api_endpoint".to_string()));
        assert_eq!(u.rule_confidence, LOW_CONFIDENCE);
        assert_eq!(u.rule_notes, "py:decorator:cosmetic");
    }

    #[test]
    fn unknown_language_falls_back_to_generic() {
        let store = LearnedRuleStore::empty();
        let mut u = unit("docs/notes.xyz", "unknown", "a", "b");
        apply_rules(&mut u, &store);
        assert_eq!(u.rule_context_level, Some(ContextLevel::Function));
        assert_eq!(u.rule_confidence, MEDIUM_CONFIDENCE);
        assert_eq!(u.rule_notes, "generic:fallback");
    }
}
