//! Turns raw unified-diff text into [`ReviewUnit`] records: one per hunk,
//! per non-binary, non-pure-delete file (spec §4.2).
//!
//! Hunk headers and line prefixes are parsed directly rather than through a
//! general-purpose patch-apply crate: this module only ever needs to read a
//! diff, never apply one, and the line-by-line classification below mirrors
//! the original `extract_before_after_from_hunk` exactly.

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use super::context_level::ContextLevel;
use super::model::{ChangeType, CodeSnippets, HunkRange, Metrics, ReviewUnit};

static HUNK_HEADER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").unwrap());

const CONTEXT_RADIUS_DEFAULT: usize = 20;

/// Guesses a language from a file extension (spec §4.2). Markdown/plaintext
/// extensions and anything unrecognized both yield `"text"`/`"unknown"`, the
/// two buckets the rule engine and static scanner skip.
pub fn guess_language(file_path: &str) -> String {
    let ext = file_path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "py" => "python",
        "js" | "jsx" | "ts" | "tsx" => "javascript",
        "java" => "java",
        "go" => "go",
        "rb" => "ruby",
        "rs" => "rust",
        "md" | "txt" | "rst" => "text",
        _ => "unknown",
    }
    .to_string()
}

struct RawHunk {
    range: HunkRange,
    before_lines: Vec<String>,
    after_lines: Vec<String>,
    added_lines: usize,
    removed_lines: usize,
}

fn parse_hunks(body: &str) -> Vec<RawHunk> {
    let lines: Vec<&str> = body.lines().collect();
    let mut hunks = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let Some(caps) = HUNK_HEADER_RE.captures(lines[i]) else {
            i += 1;
            continue;
        };

        let old_start: usize = caps.get(1).unwrap().as_str().parse().unwrap_or(0);
        let old_lines: usize = caps
            .get(2)
            .map(|m| m.as_str().parse().unwrap_or(1))
            .unwrap_or(1);
        let mut new_start: usize = caps.get(3).unwrap().as_str().parse().unwrap_or(0);
        let new_lines: usize = caps
            .get(4)
            .map(|m| m.as_str().parse().unwrap_or(1))
            .unwrap_or(1);
        if new_start == 0 {
            new_start = 1;
        }

        i += 1;
        let mut before_lines = Vec::new();
        let mut after_lines = Vec::new();
        let mut added_lines = 0;
        let mut removed_lines = 0;

        while i < lines.len() && !HUNK_HEADER_RE.is_match(lines[i]) {
            let line = lines[i];
            if let Some(rest) = line.strip_prefix('+') {
                after_lines.push(rest.to_string());
                added_lines += 1;
            } else if let Some(rest) = line.strip_prefix('-') {
                before_lines.push(rest.to_string());
                removed_lines += 1;
            } else if let Some(rest) = line.strip_prefix(' ') {
                before_lines.push(rest.to_string());
                after_lines.push(rest.to_string());
            } else if line.starts_with('\\') {
                // "\ No newline at end of file" - not part of either side.
            } else {
                before_lines.push(line.to_string());
                after_lines.push(line.to_string());
            }
            i += 1;
        }

        hunks.push(RawHunk {
            range: HunkRange {
                old_start,
                old_lines,
                new_start,
                new_lines,
            },
            before_lines,
            after_lines,
            added_lines,
            removed_lines,
        });
    }

    hunks
}

struct FileSection<'a> {
    file_path: String,
    change_type: ChangeType,
    body: &'a str,
}

fn split_file_sections(diff_text: &str) -> Vec<FileSection<'_>> {
    let mut boundaries = Vec::new();
    let mut offset = 0;
    for line in diff_text.split_inclusive('\n') {
        if line.starts_with("diff --git ") {
            boundaries.push(offset);
        }
        offset += line.len();
    }
    boundaries.push(diff_text.len());

    let mut sections = Vec::new();
    for window in boundaries.windows(2) {
        let (start, end) = (window[0], window[1]);
        let chunk = &diff_text[start..end];
        if let Some(section) = parse_file_section(chunk) {
            sections.push(section);
        }
    }
    sections
}

fn parse_file_section(chunk: &str) -> Option<FileSection<'_>> {
    if chunk.contains("\nBinary files") || chunk.starts_with("Binary files") {
        return None;
    }
    if chunk.lines().any(|l| l.starts_with("deleted file mode")) {
        return None;
    }

    let change_type = if chunk.lines().any(|l| l.starts_with("new file mode")) {
        ChangeType::Add
    } else {
        ChangeType::Modify
    };

    let file_path = chunk
        .lines()
        .find(|l| l.starts_with("+++ "))
        .and_then(|l| l.strip_prefix("+++ "))
        .map(|p| p.trim())
        .and_then(|p| p.strip_prefix("b/").or(Some(p)))
        .map(|p| p.to_string())?;

    let body_start = chunk.find("\n--- ").map(|idx| idx + 1)?;
    let body = &chunk[body_start..];

    Some(FileSection {
        file_path,
        change_type,
        body,
    })
}

/// Clamps an inclusive [1, len] window of `new_start - radius ..= new_end +
/// radius` around a hunk's new-file range (spec §4.2). Returns empty context
/// when the current file content isn't available.
fn extract_context(
    current_file_content: Option<&str>,
    hunk_range: &HunkRange,
    radius: usize,
) -> (String, usize, usize) {
    let (range_start, range_end) = hunk_range
        .new_line_range()
        .unwrap_or((hunk_range.new_start.max(1), hunk_range.new_start.max(1)));

    let Some(content) = current_file_content else {
        return (String::new(), range_start, range_end);
    };

    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();
    if total == 0 {
        return (String::new(), range_start, range_end);
    }

    let start = range_start.saturating_sub(radius).max(1);
    let end = (range_end + radius).min(total);
    if start > end {
        return (String::new(), start, end);
    }

    let context = lines[(start - 1)..end].join("\n");
    (context, start, end)
}

/// Builds one [`ReviewUnit`] per hunk across every non-binary, non-pure-delete
/// file section of `diff_text`. `current_file_content` supplies the post-diff
/// content of a given file path, used for surrounding-context extraction;
/// files absent from it (deleted upstream of this call, or simply not
/// provided by the caller) yield empty context with a correct hunk-derived
/// range.
pub fn build_review_units<F>(
    diff_text: &str,
    context_radius: usize,
    mut current_file_content: F,
) -> Vec<ReviewUnit>
where
    F: FnMut(&str) -> Option<String>,
{
    let radius = if context_radius == 0 {
        CONTEXT_RADIUS_DEFAULT
    } else {
        context_radius
    };

    let mut units = Vec::new();
    for section in split_file_sections(diff_text) {
        let language = guess_language(&section.file_path);
        let content = current_file_content(&section.file_path);

        for hunk in parse_hunks(section.body) {
            let (context, context_start, context_end) =
                extract_context(content.as_deref(), &hunk.range, radius);

            units.push(ReviewUnit {
                unit_id: Uuid::new_v4().to_string(),
                file_path: section.file_path.clone(),
                language: language.clone(),
                change_type: section.change_type,
                hunk_range: hunk.range,
                code_snippets: CodeSnippets {
                    before: hunk.before_lines.join("\n"),
                    after: hunk.after_lines.join("\n"),
                    context,
                    context_start,
                    context_end,
                },
                metrics: Metrics {
                    added_lines: hunk.added_lines,
                    removed_lines: hunk.removed_lines,
                },
                tags: Vec::new(),
                rule_context_level: None,
                rule_confidence: 0.0,
                rule_notes: String::new(),
                rule_extra_requests: Vec::new(),
                symbol: None,
            });
        }
    }

    units
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_DIFF: &str = "diff --git a/src/lib.rs b/src/lib.rs\nindex 111..222 100644\n--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1,3 +1,4 @@\n fn main() {\n-    println!(\"old\");\n+    println!(\"new\");\n+    println!(\"added\");\n }\n";

    #[test]
    fn splits_single_hunk_into_before_and_after() {
        let units = build_review_units(SAMPLE_DIFF, 20, |_| None);
        assert_eq!(units.len(), 1);
        let unit = &units[0];
        assert_eq!(unit.file_path, "src/lib.rs");
        assert_eq!(unit.language, "rust");
        assert_eq!(unit.change_type, ChangeType::Modify);
        assert!(unit.code_snippets.before.contains("old"));
        assert!(unit.code_snippets.after.contains("new"));
        assert!(unit.code_snippets.after.contains("added"));
        assert_eq!(unit.metrics.added_lines, 2);
        assert_eq!(unit.metrics.removed_lines, 1);
        assert_eq!(unit.rule_context_level, None);
    }

    #[test]
    fn pure_delete_sections_are_dropped() {
        let diff = "diff --git a/old.txt b/old.txt\ndeleted file mode 100644\nindex 111..000\n--- a/old.txt\n+++ /dev/null\n@@ -1,2 +0,0 @@\n-line one\n-line two\n";
        let units = build_review_units(diff, 20, |_| None);
        assert!(units.is_empty());
    }

    #[test]
    fn binary_sections_are_dropped() {
        let diff = "diff --git a/img.png b/img.png\nindex 111..222 100644\nBinary files a/img.png and b/img.png differ\n";
        let units = build_review_units(diff, 20, |_| None);
        assert!(units.is_empty());
    }

    #[test]
    fn added_files_are_tagged_add_and_use_default_radius() {
        let diff = "diff --git a/new.py b/new.py\nnew file mode 100644\nindex 000..111\n--- /dev/null\n+++ b/new.py\n@@ -0,0 +1,2 @@\n+import os\n+print(os.getcwd())\n";
        let content = "import os\nprint(os.getcwd())\n";
        let units = build_review_units(diff, 0, |path| {
            (path == "new.py").then(|| content.to_string())
        });
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].change_type, ChangeType::Add);
        assert_eq!(units[0].language, "python");
        assert_eq!(units[0].code_snippets.context_start, 1);
        assert_eq!(units[0].code_snippets.context_end, 2);
    }

    #[test]
    fn context_window_clamps_to_file_bounds() {
        let mut body_lines: Vec<String> = (1..=100).map(|n| format!("line{n}")).collect();
        let file_content = body_lines.join("\n");
        body_lines.insert(49, "+inserted".to_string());
        let diff = "diff --git a/big.rs b/big.rs\nindex 111..222 100644\n--- a/big.rs\n+++ b/big.rs\n@@ -50,1 +50,2 @@\n line50\n+inserted\n";
        let units = build_review_units(diff, 20, |_| Some(file_content.clone()));
        assert_eq!(units.len(), 1);
        let snippets = &units[0].code_snippets;
        assert_eq!(snippets.context_start, 30);
        assert_eq!(snippets.context_end, 71);
    }

    #[test]
    fn language_guessing_matches_known_extensions() {
        assert_eq!(guess_language("a/b.rb"), "ruby");
        assert_eq!(guess_language("a/b.go"), "go");
        assert_eq!(guess_language("README.md"), "text");
        assert_eq!(guess_language("Makefile"), "unknown");
    }
}
