//! Top-level orchestration (spec §2.1): one `Pipeline` per process, owning
//! every stateful component behind an `Arc` and exposing a single
//! `run(PipelineRequest) -> PipelineOutcome` entry point that drives the
//! stage sequence in spec §5 — `DiffCollector -> UnitBuilder -> RuleEngine ->
//! (PlannerClient || StaticScanService) -> FusionLayer -> persistence`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::config::PipelineConfig;
use super::conflict::{detect_conflict, ConflictRecord, ConflictTracker};
use super::context_level::DiffMode;
use super::diff_collector::{warn_non_fatal_diff_error, DiffCollector};
use super::error::{PipelineError, RuleError, SessionError};
use super::fusion::fuse_plan;
use super::learned_rules::LearnedRuleStore;
use super::model::{FusionOutput, PlannerOutput, ReviewUnit};
use super::rule_analyzer::{self, Applicability};
use super::rule_engine::apply_rules;
use super::scanner::Scanner;
use super::scanner_cache::ScannerCache;
use super::scanner_registry::ScannerRegistry;
use super::session::{Session, SessionStore, WorkflowEvent};
use super::static_scan::{ScanCallback, StaticScanResult, StaticScanService};
use super::unit_builder::build_review_units;

/// External collaborator interface (spec §2 table "PlannerClient
/// (external)"): only the request/response contract matters here, the LLM
/// client itself is out of scope. Mirrors the `async_trait` shape of
/// [`super::scanner::Scanner`] so both external seams look the same to a
/// reader.
#[async_trait]
pub trait PlannerClient: Send + Sync {
    async fn plan(&self, units: &[ReviewUnit]) -> Option<PlannerOutput>;
}

/// A planner that never returns a decision; fusion then falls back to
/// rule-only selection (spec §7 "PlannerError ... fusion falls back").
pub struct NoopPlannerClient;

#[async_trait]
impl PlannerClient for NoopPlannerClient {
    async fn plan(&self, _units: &[ReviewUnit]) -> Option<PlannerOutput> {
        None
    }
}

pub struct PipelineRequest {
    pub session_id: String,
    pub diff_mode: Option<DiffMode>,
    pub base_branch: Option<String>,
    pub commit_from: Option<String>,
    pub commit_to: Option<String>,
    pub project_root: Option<String>,
    pub session_name: Option<String>,
    pub current_file_content: std::collections::HashMap<String, String>,
    pub scan_callback: Option<ScanCallback>,
    pub cancel: Option<CancellationToken>,
}

impl PipelineRequest {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            diff_mode: None,
            base_branch: None,
            commit_from: None,
            commit_to: None,
            project_root: None,
            session_name: None,
            current_file_content: std::collections::HashMap::new(),
            scan_callback: None,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub session_id: String,
    pub resolved_mode: String,
    pub base_ref: Option<String>,
    pub unit_count: usize,
    pub fusion: FusionOutput,
    pub conflicts_recorded: usize,
    pub scanners_used: Vec<String>,
    pub scanners_skipped_unknown_language: usize,
    pub scanners_skipped_no_scanner: usize,
}

/// A bounded ring buffer of recent run summaries (spec §2.1 "PipelineLog ...
/// a bounded ring buffer of recent pipeline runs, used by the trend/summary
/// reporting"). Mirrors the cap-then-evict shape of
/// [`super::scanner_cache::ScannerCache`]'s LRU policy but keyed by
/// insertion order rather than last-use.
pub struct PipelineLog {
    capacity: usize,
    entries: Mutex<VecDeque<PipelineOutcome>>,
}

impl PipelineLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn push(&self, outcome: PipelineOutcome) {
        let mut guard = self.entries.lock().await;
        guard.push_back(outcome);
        while guard.len() > self.capacity {
            guard.pop_front();
        }
    }

    pub async fn recent(&self, limit: usize) -> Vec<PipelineOutcome> {
        let guard = self.entries.lock().await;
        guard.iter().rev().take(limit).cloned().collect()
    }
}

/// Intent-cache bookkeeping referenced by spec §2.1 ("`CacheManager` (intent
/// cache bookkeeping)"): a small namespaced key-value cache distinct from
/// [`ScannerCache`], used by higher-level callers (e.g. a planner prompt
/// cache) that don't belong to any one pipeline stage.
pub struct CacheManager {
    entries: Mutex<std::collections::HashMap<String, (String, std::time::Instant)>>,
    ttl: Duration,
}

impl CacheManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(std::collections::HashMap::new()),
            ttl,
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let guard = self.entries.lock().await;
        let (value, inserted_at) = guard.get(key)?;
        if inserted_at.elapsed() >= self.ttl {
            return None;
        }
        Some(value.clone())
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut guard = self.entries.lock().await;
        guard.insert(key.into(), (value.into(), std::time::Instant::now()));
    }
}

/// Owns every stateful handle a review run needs (spec §2.1), constructed
/// once per process and passed around as `Arc<Pipeline>` by callers that
/// need concurrent access to its components.
pub struct Pipeline {
    config: PipelineConfig,
    diff_collector: DiffCollector,
    session_store: Arc<SessionStore>,
    conflict_tracker: Arc<ConflictTracker>,
    learned_rules: Arc<LearnedRuleStore>,
    scanner_cache: Arc<ScannerCache>,
    scanner_registry: Arc<ScannerRegistry>,
    planner: Arc<dyn PlannerClient>,
    pipeline_log: Arc<PipelineLog>,
    cache_manager: Arc<CacheManager>,
}

impl Pipeline {
    /// Constructs every stateful component under `agent_root` (spec §2.1):
    /// `<agent_root>/data/sessions`, `<agent_root>/data/conflicts`,
    /// `<agent_root>/data/learned_rules.json`.
    pub fn new(
        agent_root: impl Into<PathBuf>,
        config: PipelineConfig,
        scanners: Vec<Box<dyn Scanner>>,
        planner: Arc<dyn PlannerClient>,
    ) -> Result<Self, RuleError> {
        let agent_root = agent_root.into();
        let learned_rules = LearnedRuleStore::load(agent_root.join("data").join("learned_rules.json"))?;
        let conflict_tracker = ConflictTracker::load(agent_root.join("data").join("conflicts"))
            .map_err(|_| RuleError::Io(std::io::Error::new(std::io::ErrorKind::Other, "conflict store load failed")))?;

        Ok(Self {
            diff_collector: DiffCollector::new(None),
            session_store: Arc::new(SessionStore::new(agent_root.clone())),
            conflict_tracker: Arc::new(conflict_tracker),
            learned_rules: Arc::new(learned_rules),
            scanner_cache: Arc::new(ScannerCache::new(
                Duration::from_secs(config.scanner_cache_ttl_secs),
                config.scanner_cache_max_entries,
            )),
            scanner_registry: Arc::new(ScannerRegistry::with_config(scanners, config.scanner_enabled.clone())),
            planner,
            pipeline_log: Arc::new(PipelineLog::new(50)),
            cache_manager: Arc::new(CacheManager::new(Duration::from_secs(300))),
            config,
        })
    }

    /// An in-memory variant (no filesystem root) for tests and one-off runs
    /// that don't need durable learned rules/conflicts/sessions.
    pub fn in_memory(config: PipelineConfig, scanners: Vec<Box<dyn Scanner>>, planner: Arc<dyn PlannerClient>) -> Self {
        Self {
            diff_collector: DiffCollector::new(None),
            session_store: Arc::new(SessionStore::new(std::env::temp_dir().join("review_core_inmemory"))),
            conflict_tracker: Arc::new(ConflictTracker::in_memory()),
            learned_rules: Arc::new(LearnedRuleStore::empty()),
            scanner_cache: Arc::new(ScannerCache::new(
                Duration::from_secs(config.scanner_cache_ttl_secs),
                config.scanner_cache_max_entries,
            )),
            scanner_registry: Arc::new(ScannerRegistry::with_config(scanners, config.scanner_enabled.clone())),
            planner,
            pipeline_log: Arc::new(PipelineLog::new(50)),
            cache_manager: Arc::new(CacheManager::new(Duration::from_secs(300))),
            config,
        }
    }

    pub fn conflict_tracker(&self) -> &Arc<ConflictTracker> {
        &self.conflict_tracker
    }

    pub fn learned_rules(&self) -> &Arc<LearnedRuleStore> {
        &self.learned_rules
    }

    pub fn session_store(&self) -> &Arc<SessionStore> {
        &self.session_store
    }

    pub fn pipeline_log(&self) -> &Arc<PipelineLog> {
        &self.pipeline_log
    }

    pub fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.cache_manager
    }

    /// Runs the full stage sequence for one request (spec §5): only
    /// `PipelineError::Input`/`PipelineError::Vcs` abort; every other
    /// failure degrades into partial output plus a `tracing` event.
    pub async fn run(&self, request: PipelineRequest) -> Result<PipelineOutcome, PipelineError> {
        let session = self
            .session_store
            .load_or_create(&request.session_id, request.session_name.clone(), request.project_root.clone())
            .await;

        let mode = request.diff_mode.unwrap_or(self.config.diff_mode);
        let (diff_text, resolved_mode, base_ref) = self
            .diff_collector
            .get_diff_text(
                mode,
                request.base_branch.as_deref(),
                request.commit_from.as_deref(),
                request.commit_to.as_deref(),
            )
            .await
            .map_err(PipelineError::from_diff_error)?;

        let mut file_content = request.current_file_content.clone();
        let mut units = build_review_units(&diff_text, self.config.context_radius, |path| file_content.remove(path));

        for unit in units.iter_mut() {
            apply_rules(unit, &self.learned_rules);
        }

        let static_scan = StaticScanService::new(
            self.scanner_registry.clone(),
            self.scanner_cache.clone(),
            self.config.scanner_concurrency,
            Duration::from_secs(self.config.scanner_timeout_secs),
            self.config.max_cached_issues_per_severity,
        );

        let (planner_output, scan_result) = tokio::join!(
            self.planner.plan(&units),
            static_scan.run(&units, request.scan_callback.clone(), request.project_root.as_deref(), request.cancel.clone())
        );

        let fusion = fuse_plan(&units, planner_output.as_ref());
        let conflicts_recorded = self.record_conflicts(&units, &fusion).await;

        {
            let mut guard = session.write().await;
            let file_paths: Vec<String> = units.iter().map(|u| u.file_path.clone()).collect();
            guard.set_diff_units(dedup_preserve_order(file_paths), units);
            guard.set_static_scan_linked(scan_result.linked.clone());
            guard.push_workflow_event(WorkflowEvent {
                event_type: "pipeline_run".to_string(),
                stage: "complete".to_string(),
                content: format!("mode={resolved_mode}"),
                timestamp: Utc::now(),
            });
        }

        if let Err(err) = self.session_store.save(&request.session_id).await {
            warn!(session_id = %request.session_id, error = %err, "session persistence failed");
        }

        let outcome = PipelineOutcome {
            session_id: request.session_id.clone(),
            resolved_mode: resolved_mode.to_string(),
            base_ref,
            unit_count: fusion.plan.len(),
            fusion,
            conflicts_recorded,
            scanners_used: scan_result.scanners_used,
            scanners_skipped_unknown_language: scan_result.skipped.unknown_language,
            scanners_skipped_no_scanner: scan_result.skipped.no_scanner_available,
        };

        self.pipeline_log.push(outcome.clone()).await;
        info!(session_id = %request.session_id, unit_count = outcome.unit_count, "pipeline run complete");
        Ok(outcome)
    }

    /// Evaluates the conflict rules over fusion output (spec §4.5) and
    /// persists any that fire; failures here are logged, never fatal.
    async fn record_conflicts(&self, units: &[ReviewUnit], fusion: &FusionOutput) -> usize {
        let mut recorded = 0;
        for (unit, item) in units.iter().zip(fusion.plan.iter()) {
            let Some(conflict_type) = detect_conflict(item, &unit.file_path, &unit.language, &unit.tags, &unit.rule_notes) else {
                continue;
            };
            let record = ConflictRecord {
                conflict_type,
                unit_id: unit.unit_id.clone(),
                file_path: unit.file_path.clone(),
                language: unit.language.clone(),
                rule_context_level: item.rule_context_level,
                rule_confidence: item.rule_confidence,
                llm_context_level: item.llm_context_level,
                tags: unit.tags.clone(),
                rule_notes: unit.rule_notes.clone(),
                timestamp: Utc::now(),
            };
            match self.conflict_tracker.record(record) {
                Ok(()) => recorded += 1,
                Err(err) => warn!(unit_id = %unit.unit_id, error = %err, "conflict record persistence failed"),
            }
        }
        recorded
    }

    /// Runs the periodic learning loop (spec §4.5): mines accumulated
    /// conflicts for promotable rules and writes them into
    /// `LearnedRuleStore`. Intended to be called on a schedule, independent
    /// of any single `run`.
    pub async fn run_rule_analysis(&self, conflict_type_limit: usize) -> Result<usize, RuleError> {
        let conflicts = self.conflict_tracker.get_high_priority_conflicts(conflict_type_limit.max(1000));
        let thresholds = self.config.rule_analyzer.clone();
        let created_at = Utc::now().to_rfc3339();

        let mut promoted = 0;
        for applicability in rule_analyzer::analyze(&conflicts, &thresholds) {
            if let Applicability::Rule(rule) = applicability {
                let learned = rule_analyzer::from_applicable_rule(&rule, &created_at);
                self.learned_rules.add_tag_rule(&rule.language, learned)?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Runs the periodic retention sweep over conflict storage (spec §4.5
    /// cleanup). Safe to call even against an in-memory tracker (a no-op).
    pub fn cleanup_conflicts(&self) -> usize {
        self.conflict_tracker
            .cleanup_old_conflicts(self.config.conflict_max_age_days as u32, self.config.conflict_max_count)
            .unwrap_or(0)
    }

    pub async fn get_issues_page(
        &self,
        scan_result: &StaticScanResult,
        severity: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> super::static_scan::IssuePage {
        super::static_scan::get_issues_page(scan_result, severity, offset, limit)
    }

    pub async fn archive_session(&self, session_id: &str) -> Result<(), SessionError> {
        self.session_store.archive(session_id).await
    }
}

fn dedup_preserve_order(mut items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
    items
}

pub fn non_fatal_diff_warning(stage: &str, err: &super::error::DiffError) {
    warn_non_fatal_diff_error(stage, err);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::context_level::ContextLevel;
    use crate::review::model::PlannerDecision;

    struct StubPlanner {
        decisions: Vec<PlannerDecision>,
    }

    #[async_trait]
    impl PlannerClient for StubPlanner {
        async fn plan(&self, _units: &[ReviewUnit]) -> Option<PlannerOutput> {
            Some(PlannerOutput {
                plan: self.decisions.clone(),
            })
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig::default()
    }

    #[tokio::test]
    async fn run_with_noop_planner_falls_back_to_rule_only_plan() {
        let pipeline = Pipeline::in_memory(config(), Vec::new(), Arc::new(NoopPlannerClient));
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("auth.py"), "def login():\n    pass\n").await.unwrap();

        let diff = "diff --git a/auth.py b/auth.py\nindex 111..222 100644\n--- a/auth.py\n+++ b/auth.py\n@@ -1,2 +1,2 @@\n def login():\n-    passs\n+    pass\n";
        let mut file_content = std::collections::HashMap::new();
        file_content.insert("auth.py".to_string(), "def login():\n    pass\n".to_string());

        let units = build_review_units(diff, 20, |path| file_content.get(path).cloned());
        assert_eq!(units.len(), 1);

        let mut unit = units.into_iter().next().unwrap();
        apply_rules(&mut unit, &pipeline.learned_rules);
        assert_eq!(unit.rule_context_level, Some(ContextLevel::FileContext));

        let fusion = fuse_plan(&[unit], None);
        assert!(!fusion.plan[0].skip_review);
    }

    #[tokio::test]
    async fn pipeline_log_caps_at_capacity() {
        let log = PipelineLog::new(2);
        for i in 0..5 {
            log.push(PipelineOutcome {
                session_id: format!("s{i}"),
                resolved_mode: "working".to_string(),
                base_ref: None,
                unit_count: 0,
                fusion: FusionOutput::default(),
                conflicts_recorded: 0,
                scanners_used: Vec::new(),
                scanners_skipped_unknown_language: 0,
                scanners_skipped_no_scanner: 0,
            })
            .await;
        }
        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].session_id, "s4");
    }

    #[tokio::test]
    async fn cache_manager_respects_ttl() {
        let cache = CacheManager::new(Duration::from_millis(1));
        cache.set("k", "v").await;
        assert_eq!(cache.get("k").await, Some("v".to_string()));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get("k").await, None);
    }
}
