//! Content-hash-keyed memoization of scanner output per file (spec §3, §4.6
//! step 5, §8 "ScannerCache returns cached issues iff
//! `SHA256(current_content) == stored_hash ∧ age < TTL`").
//!
//! Keyed by `(normalized_path, scanner_name)`, one mutex around the whole
//! map (spec §5 lock discipline: "scanner cache uses a single mutex around
//! its map").

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use super::scanner::ScannerIssue;

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

struct CacheEntry {
    content_hash: String,
    issues: Vec<ScannerIssue>,
    inserted_at: Instant,
    last_used: Instant,
}

pub struct ScannerCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<(String, String), CacheEntry>>,
}

impl ScannerCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn key(path: &str, scanner_name: &str) -> (String, String) {
        (normalize_path(path), scanner_name.to_string())
    }

    /// Returns cached issues iff the stored hash matches `current_content`'s
    /// hash and the entry hasn't aged past the TTL; touches `last_used` on a
    /// hit for the LRU eviction policy.
    pub fn get(&self, path: &str, scanner_name: &str, current_content: &str) -> Option<Vec<ScannerIssue>> {
        let key = Self::key(path, scanner_name);
        let mut guard = self.entries.lock().unwrap();
        let entry = guard.get_mut(&key)?;

        if entry.inserted_at.elapsed() >= self.ttl {
            return None;
        }
        if entry.content_hash != content_hash(current_content) {
            return None;
        }
        entry.last_used = Instant::now();
        Some(entry.issues.clone())
    }

    /// Inserts or replaces the cached result for `(path, scanner_name)`,
    /// evicting the least-recently-used entry if this would exceed
    /// `max_entries`.
    pub fn set(&self, path: &str, scanner_name: &str, content: &str, issues: Vec<ScannerIssue>) {
        let key = Self::key(path, scanner_name);
        let now = Instant::now();
        let mut guard = self.entries.lock().unwrap();

        guard.insert(
            key,
            CacheEntry {
                content_hash: content_hash(content),
                issues,
                inserted_at: now,
                last_used: now,
            },
        );

        while guard.len() > self.max_entries {
            if let Some(lru_key) = guard
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                guard.remove(&lru_key);
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// Strips `rename from/to`, `a/`/`b/` diff prefixes and leading `./`/`/`,
/// and normalizes backslashes (spec §4.6 "File-path normalization"). Shared
/// by the cache key and by unit/issue linkage so both sides agree.
pub fn normalize_path(path: &str) -> String {
    let mut p = path.replace('\\', "/");
    for prefix in ["rename from ", "rename to "] {
        if let Some(rest) = p.strip_prefix(prefix) {
            p = rest.to_string();
        }
    }
    if let Some(rest) = p.strip_prefix("a/") {
        p = rest.to_string();
    } else if let Some(rest) = p.strip_prefix("b/") {
        p = rest.to_string();
    }
    while let Some(rest) = p.strip_prefix("./") {
        p = rest.to_string();
    }
    while let Some(rest) = p.strip_prefix('/') {
        p = rest.to_string();
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::scanner::Severity;

    fn issue(line: usize) -> ScannerIssue {
        ScannerIssue {
            file: "a.py".to_string(),
            line,
            column: None,
            severity: Severity::Warning,
            rule_id: None,
            message: None,
            source: "pylint".to_string(),
        }
    }

    #[test]
    fn hit_requires_matching_content_hash() {
        let cache = ScannerCache::new(Duration::from_secs(3600), 1000);
        cache.set("a.py", "pylint", "contentA", vec![issue(1), issue(2)]);
        assert_eq!(cache.get("a.py", "pylint", "contentA").unwrap().len(), 2);
        assert!(cache.get("a.py", "pylint", "contentB").is_none());
    }

    #[test]
    fn set_after_invalidation_leaves_one_entry() {
        let cache = ScannerCache::new(Duration::from_secs(3600), 1000);
        cache.set("a.py", "pylint", "contentA", vec![issue(1)]);
        assert!(cache.get("a.py", "pylint", "contentB").is_none());
        cache.set("a.py", "pylint", "contentB", vec![issue(5)]);
        assert_eq!(cache.len(), 1);
        let hit = cache.get("a.py", "pylint", "contentB").unwrap();
        assert_eq!(hit[0].line, 5);
    }

    #[test]
    fn ttl_expiry_evicts_on_read() {
        let cache = ScannerCache::new(Duration::from_millis(1), 1000);
        cache.set("a.py", "pylint", "x", vec![issue(1)]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("a.py", "pylint", "x").is_none());
    }

    #[test]
    fn lru_eviction_caps_at_max_entries() {
        let cache = ScannerCache::new(Duration::from_secs(3600), 2);
        cache.set("a.py", "pylint", "a", vec![]);
        cache.set("b.py", "pylint", "b", vec![]);
        // touch a.py so b.py becomes LRU
        cache.get("a.py", "pylint", "a");
        cache.set("c.py", "pylint", "c", vec![]);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("b.py", "pylint", "b").is_none());
        assert!(cache.get("a.py", "pylint", "a").is_some());
        assert!(cache.get("c.py", "pylint", "c").is_some());
    }

    #[test]
    fn normalize_path_strips_diff_prefixes_and_rename_markers() {
        assert_eq!(normalize_path("a/src/lib.rs"), "src/lib.rs");
        assert_eq!(normalize_path("b/src/lib.rs"), "src/lib.rs");
        assert_eq!(normalize_path("rename to src/new.rs"), "src/new.rs");
        assert_eq!(normalize_path("./src\\lib.rs"), "src/lib.rs");
        assert_eq!(normalize_path("/abs/path.py"), "abs/path.py");
    }
}
