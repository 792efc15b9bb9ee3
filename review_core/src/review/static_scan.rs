//! Parallel fan-out scanner pipeline: runs available scanners across a
//! deduplicated file list without blocking the main pipeline, then maps
//! results back onto review units (spec §4.6).

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::model::ReviewUnit;
use super::scanner::{ScannerIssue, Severity};
use super::scanner_cache::{normalize_path, ScannerCache};
use super::scanner_registry::ScannerRegistry;

const SECURITY_PATH_KEYWORDS: [&str; 6] = ["auth", "security", "crypto", "token", "secret", "credential"];
const CONFIG_PATH_KEYWORDS: [&str; 4] = ["config", "settings", "env", "yaml"];

/// Free-form event stream emitted during a scan (spec §4.6 "Events emitted
/// via `callback`"). All variants carry a wall-clock timestamp; delivery is
/// best-effort and callback failures never abort the scan.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ScanEvent {
    StaticScanStart {
        files_total: usize,
        skipped_unknown_language: usize,
        skipped_no_scanner: usize,
        timestamp: DateTime<Utc>,
    },
    StaticScanFileStart {
        file: String,
        timestamp: DateTime<Utc>,
    },
    StaticScanFileDone {
        file: String,
        issues_found: usize,
        progress: f64,
        timestamp: DateTime<Utc>,
    },
    StaticScanComplete {
        files_scanned: usize,
        total_issues: usize,
        top_issues: Vec<ScannerIssue>,
        truncated: bool,
        timestamp: DateTime<Utc>,
    },
}

pub type ScanCallback = Arc<dyn Fn(ScanEvent) + Send + Sync>;

fn emit(callback: &Option<ScanCallback>, event: ScanEvent) {
    if let Some(cb) = callback {
        cb(event);
    }
}

/// Per-unit issue linkage persisted alongside the session (spec §3
/// `static_scan_linked`, §4.6 step 9-10).
#[derive(Debug, Clone, Default, Serialize)]
pub struct StaticScanLinked {
    pub diff_units: Vec<String>,
    pub unit_issues: HashMap<String, Vec<ScannerIssue>>,
    pub mapped_count: usize,
    pub unmapped_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SkippedBreakdown {
    pub unknown_language: usize,
    pub no_scanner_available: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StaticScanResult {
    pub files_scanned: usize,
    pub scanners_used: Vec<String>,
    pub scanners_skipped: HashMap<String, String>,
    pub skipped: SkippedBreakdown,
    pub issues_by_severity: HashMap<String, Vec<ScannerIssue>>,
    pub linked: StaticScanLinked,
}

fn risk_score(file_path: &str, tags: &[String]) -> i64 {
    let lower = file_path.to_ascii_lowercase();
    let mut score = 0i64;
    for kw in SECURITY_PATH_KEYWORDS {
        if lower.contains(kw) {
            score += 100;
        }
    }
    for kw in CONFIG_PATH_KEYWORDS {
        if lower.contains(kw) || lower.ends_with(".toml") || lower.ends_with(".ini") {
            score += 50;
            break;
        }
    }
    if tags.iter().any(|t| t == "security_sensitive") {
        score += 80;
    }
    if tags.iter().any(|t| t == "config_file") {
        score += 40;
    }
    if tags.iter().any(|t| t == "routing_file") {
        score += 30;
    }
    score
}

struct FilePlan {
    path: String,
    language: String,
    tags: Vec<String>,
    score: i64,
}

fn build_file_plan(units: &[ReviewUnit]) -> (Vec<FilePlan>, SkippedBreakdown) {
    let mut tags_by_file: HashMap<String, (String, HashSet<String>)> = HashMap::new();
    for unit in units {
        let path = normalize_path(&unit.file_path);
        let entry = tags_by_file
            .entry(path)
            .or_insert_with(|| (unit.language.clone(), HashSet::new()));
        entry.1.extend(unit.tags.iter().cloned());
    }

    let mut skipped = SkippedBreakdown::default();
    let mut plans: Vec<FilePlan> = Vec::new();
    for (path, (language, tag_set)) in tags_by_file {
        if language == "text" || language == "unknown" {
            skipped.unknown_language += 1;
            continue;
        }
        let tags: Vec<String> = tag_set.into_iter().collect();
        let score = risk_score(&path, &tags);
        plans.push(FilePlan {
            path,
            language,
            tags,
            score,
        });
    }
    plans.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
    (plans, skipped)
}

/// Reads `path` under `project_root` (if given), decoding UTF-8 lossily
/// (spec §4.6 step 5: "UTF-8, `replace` on decode errors").
async fn read_file_lossy(project_root: Option<&str>, path: &str) -> Option<String> {
    let full = match project_root {
        Some(root) => Path::new(root).join(path),
        None => Path::new(path).to_path_buf(),
    };
    fs::read(&full).await.ok().map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

async fn scan_one_file(
    registry: &ScannerRegistry,
    cache: &ScannerCache,
    timeout: Duration,
    path: &str,
    language: &str,
    content: &str,
) -> Vec<ScannerIssue> {
    let scanners = registry.available_scanners_for_language(language).await;
    let mut issues = Vec::new();

    for scanner in scanners {
        if let Some(cached) = cache.get(path, scanner.name(), content) {
            issues.extend(cached);
            continue;
        }

        let result = tokio::time::timeout(timeout, scanner.scan(path, content)).await;
        match result {
            Ok(found) => {
                cache.set(path, scanner.name(), content, found.clone());
                issues.extend(found);
            }
            Err(_) => {
                registry.mark_unavailable(scanner.name(), &format!("timed out after {}s", timeout.as_secs()));
                warn!(scanner = scanner.name(), file = path, "scanner invocation timed out");
            }
        }
    }

    issues
}

/// Maps scanner issues onto the units covering each file (spec §4.6 step 9):
/// an issue's line falls in at most one unit per file, first match wins
/// after sorting units by `new_start`.
fn link_issues_to_units(
    units: &[ReviewUnit],
    issues_by_file: &HashMap<String, Vec<ScannerIssue>>,
) -> StaticScanLinked {
    let mut units_by_file: HashMap<String, Vec<&ReviewUnit>> = HashMap::new();
    for unit in units {
        units_by_file
            .entry(normalize_path(&unit.file_path))
            .or_default()
            .push(unit);
    }
    for list in units_by_file.values_mut() {
        list.sort_by_key(|u| u.hunk_range.new_start);
    }

    let mut unit_issues: HashMap<String, Vec<ScannerIssue>> = HashMap::new();
    let mut mapped_count = 0usize;
    let mut unmapped_count = 0usize;

    for (file, issues) in issues_by_file {
        let Some(file_units) = units_by_file.get(file) else {
            unmapped_count += issues.len();
            continue;
        };
        for issue in issues {
            let matched = file_units.iter().find(|u| match u.hunk_range.new_line_range() {
                Some((start, end)) => issue.line >= start && issue.line <= end,
                None => false,
            });
            match matched {
                Some(unit) => {
                    unit_issues.entry(unit.unit_id.clone()).or_default().push(issue.clone());
                    mapped_count += 1;
                }
                None => unmapped_count += 1,
            }
        }
    }

    StaticScanLinked {
        diff_units: units.iter().map(|u| u.unit_id.clone()).collect(),
        unit_issues,
        mapped_count,
        unmapped_count,
    }
}

fn sort_issues_globally(issues: &mut [ScannerIssue]) {
    issues.sort_by(|a, b| {
        a.severity
            .rank()
            .cmp(&b.severity.rank())
            .then_with(|| a.file.cmp(&b.file))
            .then_with(|| a.line.cmp(&b.line))
            .then_with(|| a.column.cmp(&b.column))
            .then_with(|| a.rule_id.cmp(&b.rule_id))
    });
}

/// Runs every available scanner across the files referenced by `units`
/// (spec §4.6 contract: `run(files, units, callback?, project_root?,
/// session_id?)`). `files` may be a superset of files referenced by units;
/// only files with a known language and at least one available scanner are
/// actually scanned.
pub struct StaticScanService {
    registry: Arc<ScannerRegistry>,
    cache: Arc<ScannerCache>,
    concurrency: usize,
    scanner_timeout: Duration,
    max_cached_issues_per_severity: usize,
}

impl StaticScanService {
    pub fn new(
        registry: Arc<ScannerRegistry>,
        cache: Arc<ScannerCache>,
        concurrency: usize,
        scanner_timeout: Duration,
        max_cached_issues_per_severity: usize,
    ) -> Self {
        Self {
            registry,
            cache,
            concurrency: concurrency.max(1),
            scanner_timeout,
            max_cached_issues_per_severity,
        }
    }

    pub async fn run(
        &self,
        units: &[ReviewUnit],
        callback: Option<ScanCallback>,
        project_root: Option<&str>,
        cancel: Option<CancellationToken>,
    ) -> StaticScanResult {
        let (plans, skipped) = build_file_plan(units);
        let total = plans.len();

        // Resolve scanner availability per file up front so the start event's
        // skipped breakdown is accurate rather than a running total (spec
        // §4.6 step 4/step 7).
        let mut scannable = Vec::with_capacity(plans.len());
        let mut no_scanner_count = 0usize;
        let mut scanners_used: HashSet<String> = HashSet::new();
        for plan in plans {
            let available = self.registry.available_scanners_for_language(&plan.language).await;
            if available.is_empty() {
                no_scanner_count += 1;
                continue;
            }
            for s in &available {
                scanners_used.insert(s.name().to_string());
            }
            scannable.push(plan);
        }

        emit(
            &callback,
            ScanEvent::StaticScanStart {
                files_total: total,
                skipped_unknown_language: skipped.unknown_language,
                skipped_no_scanner: no_scanner_count,
                timestamp: Utc::now(),
            },
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let registry = self.registry.clone();
        let cache = self.cache.clone();
        let project_root = project_root.map(|s| s.to_string());
        let timeout = self.scanner_timeout;

        let mut handles = Vec::with_capacity(scannable.len());
        let scannable_total = scannable.len();

        for (idx, plan) in scannable.into_iter().enumerate() {
            if let Some(token) = &cancel {
                if token.is_cancelled() {
                    break;
                }
            }

            let permit_semaphore = semaphore.clone();
            let registry = registry.clone();
            let cache = cache.clone();
            let project_root = project_root.clone();
            let callback = callback.clone();
            let path = plan.path.clone();
            let language = plan.language.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit_semaphore.acquire_owned().await.expect("semaphore not closed");
                emit(
                    &callback,
                    ScanEvent::StaticScanFileStart {
                        file: path.clone(),
                        timestamp: Utc::now(),
                    },
                );

                let content = read_file_lossy(project_root.as_deref(), &path).await.unwrap_or_default();
                let issues = scan_one_file(&registry, &cache, timeout, &path, &language, &content).await;

                emit(
                    &callback,
                    ScanEvent::StaticScanFileDone {
                        file: path.clone(),
                        issues_found: issues.len(),
                        progress: (idx + 1) as f64 / scannable_total.max(1) as f64,
                        timestamp: Utc::now(),
                    },
                );

                (path, issues)
            });
            handles.push(handle);
        }

        let mut issues_by_file: HashMap<String, Vec<ScannerIssue>> = HashMap::new();
        let mut files_scanned = 0usize;
        let truncated_by_cancel = cancel.as_ref().map(|t| t.is_cancelled()).unwrap_or(false);

        for handle in handles {
            if let Ok((path, issues)) = handle.await {
                files_scanned += 1;
                issues_by_file.entry(path).or_default().extend(issues);
            }
        }

        let mut all_issues: Vec<ScannerIssue> = issues_by_file.values().flatten().cloned().collect();
        sort_issues_globally(&mut all_issues);

        let mut issues_by_severity: HashMap<String, Vec<ScannerIssue>> = HashMap::new();
        for issue in &all_issues {
            let bucket = issues_by_severity.entry(issue.severity.as_str().to_string()).or_default();
            if bucket.len() < self.max_cached_issues_per_severity {
                bucket.push(issue.clone());
            }
        }

        let linked = link_issues_to_units(units, &issues_by_file);

        // Collected after the fan-out completes so it also reflects scanners
        // that timed out mid-run (`scan_one_file` marks those unavailable as
        // they happen), not just the pre-scan probe failures.
        let scanners_skipped = self.registry.unavailable_reasons();

        let top_issues: Vec<ScannerIssue> = all_issues.iter().take(50).cloned().collect();
        emit(
            &callback,
            ScanEvent::StaticScanComplete {
                files_scanned,
                total_issues: all_issues.len(),
                top_issues,
                truncated: truncated_by_cancel,
                timestamp: Utc::now(),
            },
        );

        StaticScanResult {
            files_scanned,
            scanners_used: {
                let mut v: Vec<String> = scanners_used.into_iter().collect();
                v.sort();
                v
            },
            scanners_skipped,
            skipped: SkippedBreakdown {
                unknown_language: skipped.unknown_language,
                no_scanner_available: no_scanner_count,
            },
            issues_by_severity,
            linked,
        }
    }
}

/// Serves a slice of `issues_by_severity[severity]` for one cached scan
/// result (spec §4.6.1). Clamps `severity` to the three valid values,
/// `offset` to `>=0`, and `limit` to `(0, 200]` with a default of 50.
#[derive(Debug, Clone, Serialize)]
pub struct IssuePage {
    pub severity: String,
    pub offset: usize,
    pub limit: usize,
    pub total: usize,
    pub has_more: bool,
    pub issues: Vec<ScannerIssue>,
}

pub fn get_issues_page(
    result: &StaticScanResult,
    severity: Option<&str>,
    offset: usize,
    limit: usize,
) -> IssuePage {
    let severity = severity
        .and_then(Severity::parse)
        .unwrap_or(Severity::Error)
        .as_str()
        .to_string();
    let limit = limit.clamp(1, 200);

    let bucket = result.issues_by_severity.get(&severity).cloned().unwrap_or_default();
    let total = bucket.len();
    let offset = offset.min(total);
    let end = (offset + limit).min(total);
    let issues = bucket[offset..end].to_vec();
    let has_more = end < total;

    IssuePage {
        severity,
        offset,
        limit,
        total,
        has_more,
        issues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::model::{ChangeType, CodeSnippets, HunkRange, Metrics};
    use crate::review::scanner::{Availability, Scanner};
    use async_trait::async_trait;

    fn unit(id: &str, file: &str, new_start: usize, new_lines: usize) -> ReviewUnit {
        ReviewUnit {
            unit_id: id.to_string(),
            file_path: file.to_string(),
            language: "python".to_string(),
            change_type: ChangeType::Modify,
            hunk_range: HunkRange {
                old_start: new_start,
                old_lines: new_lines,
                new_start,
                new_lines,
            },
            code_snippets: CodeSnippets::default(),
            metrics: Metrics::default(),
            tags: Vec::new(),
            rule_context_level: None,
            rule_confidence: 0.0,
            rule_notes: String::new(),
            rule_extra_requests: Vec::new(),
            symbol: None,
        }
    }

    fn issue(file: &str, line: usize) -> ScannerIssue {
        ScannerIssue {
            file: file.to_string(),
            line,
            column: None,
            severity: Severity::Warning,
            rule_id: None,
            message: None,
            source: "pylint".to_string(),
        }
    }

    #[test]
    fn risk_score_weighs_security_paths_highest() {
        assert!(risk_score("src/auth/login.py", &[]) > risk_score("src/config/settings.py", &[]));
        assert!(risk_score("src/config/settings.py", &[]) > risk_score("src/widgets.py", &[]));
    }

    #[test]
    fn issue_mapping_picks_first_containing_unit() {
        let units = vec![unit("u1", "a.py", 10, 5)];
        let mut issues_by_file = HashMap::new();
        issues_by_file.insert(
            "a.py".to_string(),
            vec![issue("a.py", 12), issue("a.py", 20)],
        );
        let linked = link_issues_to_units(&units, &issues_by_file);
        assert_eq!(linked.mapped_count, 1);
        assert_eq!(linked.unmapped_count, 1);
        assert_eq!(linked.unit_issues.get("u1").unwrap().len(), 1);
        assert_eq!(linked.unit_issues.get("u1").unwrap()[0].line, 12);
    }

    #[test]
    fn sort_issues_globally_orders_by_severity_then_location() {
        let mut issues = vec![
            ScannerIssue {
                file: "b.py".to_string(),
                line: 1,
                column: None,
                severity: Severity::Info,
                rule_id: None,
                message: None,
                source: "x".to_string(),
            },
            ScannerIssue {
                file: "a.py".to_string(),
                line: 2,
                column: None,
                severity: Severity::Error,
                rule_id: None,
                message: None,
                source: "x".to_string(),
            },
        ];
        sort_issues_globally(&mut issues);
        assert_eq!(issues[0].severity, Severity::Error);
    }

    #[test]
    fn get_issues_page_clamps_limit_and_reports_has_more() {
        let mut result = StaticScanResult::default();
        result
            .issues_by_severity
            .insert("error".to_string(), (0..10).map(|i| issue("a.py", i)).collect());
        let page = get_issues_page(&result, Some("error"), 0, 1000);
        assert_eq!(page.limit, 200);
        assert_eq!(page.total, 10);
        assert!(!page.has_more);

        let page = get_issues_page(&result, Some("error"), 0, 3);
        assert_eq!(page.issues.len(), 3);
        assert!(page.has_more);
    }

    struct StubScanner {
        langs: Vec<String>,
    }

    #[async_trait]
    impl Scanner for StubScanner {
        fn name(&self) -> &str {
            "stub"
        }
        fn enabled(&self) -> bool {
            true
        }
        fn languages(&self) -> &[String] {
            &self.langs
        }
        async fn check_availability_with_reason(&self) -> Availability {
            Availability::available()
        }
        async fn scan(&self, file_path: &str, _content: &str) -> Vec<ScannerIssue> {
            vec![ScannerIssue {
                file: file_path.to_string(),
                line: 1,
                column: None,
                severity: Severity::Warning,
                rule_id: Some("stub-rule".to_string()),
                message: Some("stub finding".to_string()),
                source: "stub".to_string(),
            }]
        }
    }

    struct UnavailableScanner {
        langs: Vec<String>,
    }

    #[async_trait]
    impl Scanner for UnavailableScanner {
        fn name(&self) -> &str {
            "ghost"
        }
        fn enabled(&self) -> bool {
            true
        }
        fn languages(&self) -> &[String] {
            &self.langs
        }
        async fn check_availability_with_reason(&self) -> Availability {
            Availability::unavailable("binary not on PATH")
        }
        async fn scan(&self, _file_path: &str, _content: &str) -> Vec<ScannerIssue> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn run_reports_probed_unavailable_scanners_with_reasons() {
        let registry = Arc::new(ScannerRegistry::new(vec![Box::new(UnavailableScanner {
            langs: vec!["python".to_string()],
        })]));
        let cache = Arc::new(ScannerCache::new(Duration::from_secs(3600), 1000));
        let service = StaticScanService::new(registry, cache, 2, Duration::from_secs(5), 20_000);

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "print(1)\n").unwrap();

        let units = vec![unit("u1", "a.py", 1, 1)];
        let result = service.run(&units, None, dir.path().to_str(), None).await;

        assert_eq!(result.skipped.no_scanner_available, 1);
        assert_eq!(
            result.scanners_skipped.get("ghost").map(String::as_str),
            Some("binary not on PATH")
        );
    }

    #[tokio::test]
    async fn run_scans_files_and_caches_per_content_hash() {
        let registry = Arc::new(ScannerRegistry::new(vec![Box::new(StubScanner {
            langs: vec!["python".to_string()],
        })]));
        let cache = Arc::new(ScannerCache::new(Duration::from_secs(3600), 1000));
        let service = StaticScanService::new(registry, cache, 2, Duration::from_secs(5), 20_000);

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "print(1)\n").unwrap();

        let units = vec![unit("u1", "a.py", 1, 1)];
        let result = service.run(&units, None, dir.path().to_str(), None).await;

        assert_eq!(result.files_scanned, 1);
        assert_eq!(result.linked.mapped_count, 1);
        assert!(result.issues_by_severity.get("warning").unwrap().len() == 1);
    }
}
