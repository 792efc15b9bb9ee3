//! Lookup of available scanners per language (spec §4.6 step 4, §5 "Shared
//! state"). Registration is static per process (scanner binary presence is a
//! process property, spec §9), but availability is probed lazily and cached
//! behind a read-mostly lock so a flapping binary doesn't get re-probed on
//! every file.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::warn;

use super::scanner::{Availability, Scanner};

/// Minimum gap between repeated "scanner unavailable" log lines for the same
/// scanner (spec §4.6 step 4: "logged at most once per N seconds").
const UNAVAILABLE_LOG_INTERVAL: Duration = Duration::from_secs(60);

struct AvailabilityEntry {
    availability: Availability,
    last_logged: Option<Instant>,
}

/// Holds every registered [`Scanner`] plus a copy-on-write availability
/// cache. Construction happens once at pipeline entry; `reload` exists so
/// tests (and long-running processes reacting to config changes) can reset
/// the cache without rebuilding the registry.
pub struct ScannerRegistry {
    scanners: Vec<Box<dyn Scanner>>,
    config_enabled: HashMap<String, bool>,
    availability: RwLock<HashMap<String, AvailabilityEntry>>,
}

impl ScannerRegistry {
    pub fn new(scanners: Vec<Box<dyn Scanner>>) -> Self {
        Self::with_config(scanners, HashMap::new())
    }

    /// `config_enabled` is `PipelineConfig::scanner_enabled` (spec §6: scanner
    /// enable/disable is a documented config setting, on top of whatever each
    /// [`Scanner`] reports via `enabled()`). Missing entries default to
    /// enabled, matching `PipelineConfig::scanner_is_enabled`.
    pub fn with_config(scanners: Vec<Box<dyn Scanner>>, config_enabled: HashMap<String, bool>) -> Self {
        Self {
            scanners,
            config_enabled,
            availability: RwLock::new(HashMap::new()),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    fn config_enabled(&self, name: &str) -> bool {
        self.config_enabled.get(name).copied().unwrap_or(true)
    }

    /// All scanners (enabled or not) registered for `language`.
    pub fn scanners_for_language(&self, language: &str) -> Vec<&dyn Scanner> {
        self.scanners
            .iter()
            .filter(|s| s.languages().iter().any(|l| l == language))
            .map(|s| s.as_ref())
            .collect()
    }

    /// Scanners that are enabled (both by their own `enabled()` and by
    /// config), and whose availability probe last succeeded (probing and
    /// caching the result on first ask, spec §4.6 step 4).
    pub async fn available_scanners_for_language(&self, language: &str) -> Vec<&dyn Scanner> {
        let mut out = Vec::new();
        for scanner in self.scanners_for_language(language) {
            if !scanner.enabled() || !self.config_enabled(scanner.name()) {
                continue;
            }
            if self.is_available(scanner).await {
                out.push(scanner);
            }
        }
        out
    }

    async fn is_available(&self, scanner: &dyn Scanner) -> bool {
        if let Some(cached) = self.cached_availability(scanner.name()) {
            return cached;
        }

        let availability = scanner.check_availability_with_reason().await;
        let available = availability.available;
        if !available {
            self.log_unavailable(scanner.name(), availability.reason.as_deref());
        }

        let mut guard = self.availability.write().unwrap();
        guard.insert(
            scanner.name().to_string(),
            AvailabilityEntry {
                availability,
                last_logged: (!available).then(Instant::now),
            },
        );
        available
    }

    fn cached_availability(&self, name: &str) -> Option<bool> {
        self.availability.read().unwrap().get(name).map(|e| e.availability.available)
    }

    fn log_unavailable(&self, name: &str, reason: Option<&str>) {
        let should_log = {
            let guard = self.availability.read().unwrap();
            match guard.get(name) {
                Some(entry) => match entry.last_logged {
                    Some(last) => last.elapsed() >= UNAVAILABLE_LOG_INTERVAL,
                    None => true,
                },
                None => true,
            }
        };
        if should_log {
            warn!(scanner = name, reason = reason.unwrap_or("unknown"), "scanner unavailable");
        }
    }

    /// Invalidates every cached availability result, forcing the next
    /// `available_scanners_for_language` call to re-probe.
    pub fn reload(&self) {
        self.availability.write().unwrap().clear();
    }

    pub fn names(&self) -> Vec<String> {
        self.scanners.iter().map(|s| s.name().to_string()).collect()
    }

    /// Forces `name` unavailable for the rest of the process's cached state,
    /// bypassing a fresh probe. Used when a scanner invocation times out
    /// (spec §4.6 step 4/§7): a scanner that just timed out shouldn't be
    /// retried against every remaining file in the same run.
    pub fn mark_unavailable(&self, name: &str, reason: &str) {
        self.availability.write().unwrap().insert(
            name.to_string(),
            AvailabilityEntry {
                availability: Availability::unavailable(reason.to_string()),
                last_logged: Some(Instant::now()),
            },
        );
        warn!(scanner = name, reason, "scanner marked unavailable for remainder of run");
    }

    /// Snapshot of every scanner whose last probe (or `mark_unavailable`
    /// call) came back unavailable, keyed by name with its reason.
    pub fn unavailable_reasons(&self) -> HashMap<String, String> {
        self.availability
            .read()
            .unwrap()
            .iter()
            .filter(|(_, entry)| !entry.availability.available)
            .map(|(name, entry)| {
                let reason = entry.availability.reason.clone().unwrap_or_else(|| "unknown".to_string());
                (name.clone(), reason)
            })
            .collect()
    }
}
