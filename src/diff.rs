//! Unified diff validation
//!
//! Decides whether a blob of (usually LLM-produced) text is plausibly a git
//! style unified diff and extracts the files it touches. Hunk correctness is
//! not checked here; `git apply` is the source of truth for that.

use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

/// `diff --git a/<old> b/<new>` at the start of a line.
const GIT_HEADER_PATTERN: &str = r"(?m)^diff --git a/(?P<old>\S+) b/(?P<new>\S+)";
/// `+++ ` new-file marker at the start of a line.
const NEW_FILE_PATTERN: &str = r"(?m)^\+\+\+[ \t]";
/// `--- ` old-file marker at the start of a line.
const OLD_FILE_PATTERN: &str = r"(?m)^---[ \t]";
/// `@@ -a[,b] +c[,d] @@` hunk header; omitted counts default to 1.
const HUNK_HEADER_PATTERN: &str = r"^@@ -\d+(?:,(?P<old>\d+))? \+\d+(?:,(?P<new>\d+))? @@";

fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn git_header_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, GIT_HEADER_PATTERN)
}

fn new_file_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, NEW_FILE_PATTERN)
}

fn old_file_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, OLD_FILE_PATTERN)
}

fn hunk_header_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, HUNK_HEADER_PATTERN)
}

fn matches(re: Option<&Regex>, text: &str) -> bool {
    re.map(|re| re.is_match(text)).unwrap_or(false)
}

/// Structural markers every accepted diff must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffMarker {
    GitHeader,
    NewFileHeader,
    OldFileHeader,
}

impl DiffMarker {
    pub fn describe(&self) -> &'static str {
        match self {
            DiffMarker::GitHeader => "'diff --git a/<path> b/<path>' header",
            DiffMarker::NewFileHeader => "'+++ ' new-file header",
            DiffMarker::OldFileHeader => "'--- ' old-file header",
        }
    }
}

impl fmt::Display for DiffMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// The text failed the structural check. `missing` is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("not a valid unified diff: missing {}", describe_missing(.missing))]
pub struct MalformedDiff {
    pub missing: Vec<DiffMarker>,
}

fn describe_missing(missing: &[DiffMarker]) -> String {
    missing
        .iter()
        .map(DiffMarker::describe)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Per-file counts gathered while scanning a diff (reporting only).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileDiffStat {
    pub old_path: String,
    pub new_path: String,
    pub hunks: usize,
    pub additions: usize,
    pub deletions: usize,
}

/// A diff that passed the structural check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedDiff {
    files: BTreeSet<String>,
    stats: Vec<FileDiffStat>,
}

impl ValidatedDiff {
    /// Every path any file section touches, pre- and post-image,
    /// deduplicated. Sections without a `diff --git` header count too.
    pub fn files(&self) -> &BTreeSet<String> {
        &self.files
    }

    pub fn stats(&self) -> &[FileDiffStat] {
        &self.stats
    }

    /// Total additions and deletions across every file section.
    pub fn totals(&self) -> (usize, usize) {
        self.stats
            .iter()
            .fold((0, 0), |acc, s| (acc.0 + s.additions, acc.1 + s.deletions))
    }
}

/// Which required markers are absent from `text`.
pub fn missing_markers(text: &str) -> Vec<DiffMarker> {
    let mut missing = Vec::new();
    if !matches(git_header_re(), text) {
        missing.push(DiffMarker::GitHeader);
    }
    if !matches(new_file_re(), text) {
        missing.push(DiffMarker::NewFileHeader);
    }
    if !matches(old_file_re(), text) {
        missing.push(DiffMarker::OldFileHeader);
    }
    missing
}

/// Basic checks for unified diff structure.
pub fn looks_like_unified_diff(text: &str) -> bool {
    missing_markers(text).is_empty()
}

/// Return every path the diff touches.
///
/// `git apply` applies any `--- `/`+++ ` section, so paths come from those
/// headers and from `rename`/`copy` lines as well as from `diff --git`.
pub fn extract_changed_files(text: &str) -> BTreeSet<String> {
    scan_sections(text).touched
}

/// Validate structure and extract touched files and per-file stats.
pub fn validate_unified_diff(text: &str) -> Result<ValidatedDiff, MalformedDiff> {
    let missing = missing_markers(text);
    if !missing.is_empty() {
        return Err(MalformedDiff { missing });
    }

    let scan = scan_sections(text);
    Ok(ValidatedDiff {
        files: scan.touched,
        stats: scan.stats,
    })
}

/// Lines a hunk still expects, from its `@@ -a,b +c,d @@` header.
/// `None` when the header could not be read; such a hunk runs until the
/// first line that is not a hunk line.
#[derive(Debug, Clone, Copy)]
struct HunkRemaining(Option<(usize, usize)>);

impl HunkRemaining {
    fn from_header(line: &str) -> Self {
        let counts = hunk_header_re()
            .and_then(|re| re.captures(line))
            .map(|caps| {
                let count = |name: &str| {
                    caps.name(name)
                        .map_or(Some(1), |m| m.as_str().parse::<usize>().ok())
                };
                (count("old"), count("new"))
            });
        match counts {
            Some((Some(old), Some(new))) => HunkRemaining(Some((old, new))),
            _ => HunkRemaining(None),
        }
    }

    fn consume(&mut self, old: usize, new: usize) {
        if let Some((o, n)) = self.0.as_mut() {
            *o = o.saturating_sub(old);
            *n = n.saturating_sub(new);
        }
    }

    fn exhausted(&self) -> bool {
        matches!(self.0, Some((0, 0)))
    }
}

#[derive(Debug, Default)]
struct Scan {
    touched: BTreeSet<String>,
    stats: Vec<FileDiffStat>,
}

impl Scan {
    fn touch(&mut self, path: &str) {
        if !path.is_empty() && path != DEV_NULL {
            self.touched.insert(path.to_string());
        }
    }
}

const DEV_NULL: &str = "/dev/null";

/// Path of a `--- `/`+++ ` header line: timestamp dropped, `a/` or `b/`
/// prefix stripped.
fn header_path(rest: &str) -> &str {
    let path = rest.split('\t').next().unwrap_or_default().trim();
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
}

fn scan_sections(text: &str) -> Scan {
    let mut scan = Scan::default();
    let mut hunk: Option<HunkRemaining> = None;
    // A `diff --git` section whose `--- ` line has not been seen yet.
    let mut git_section_open = false;

    for line in text.lines() {
        if let Some(remaining) = hunk.as_mut() {
            let current = scan.stats.last_mut();
            let consumed = match (line.as_bytes().first().copied(), current) {
                (Some(b'+'), Some(stat)) => {
                    stat.additions += 1;
                    remaining.consume(0, 1);
                    true
                }
                (Some(b'-'), Some(stat)) => {
                    stat.deletions += 1;
                    remaining.consume(1, 0);
                    true
                }
                (Some(b' ') | None, _) => {
                    remaining.consume(1, 1);
                    true
                }
                (Some(b'\\'), _) => true,
                _ => false,
            };
            if consumed {
                if remaining.exhausted() {
                    hunk = None;
                }
                continue;
            }
            hunk = None;
        }

        if let Some(caps) = git_header_re().and_then(|re| re.captures(line)) {
            let (old, new) = (caps["old"].to_string(), caps["new"].to_string());
            scan.touch(&old);
            scan.touch(&new);
            scan.stats.push(FileDiffStat {
                old_path: old,
                new_path: new,
                ..Default::default()
            });
            git_section_open = true;
        } else if let Some(rest) = line.strip_prefix("--- ") {
            let path = header_path(rest);
            scan.touch(path);
            if !git_section_open {
                scan.stats.push(FileDiffStat {
                    old_path: path.to_string(),
                    ..Default::default()
                });
            }
            git_section_open = false;
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            let path = header_path(rest);
            scan.touch(path);
            match scan.stats.last_mut() {
                Some(stat) if stat.new_path.is_empty() => stat.new_path = path.to_string(),
                Some(_) => {}
                None => scan.stats.push(FileDiffStat {
                    new_path: path.to_string(),
                    ..Default::default()
                }),
            }
            git_section_open = false;
        } else if let Some(path) = ["rename from ", "rename to ", "copy from ", "copy to "]
            .iter()
            .find_map(|prefix| line.strip_prefix(*prefix))
        {
            scan.touch(path.trim());
        } else if line.starts_with("@@") {
            if let Some(stat) = scan.stats.last_mut() {
                stat.hunks += 1;
                let remaining = HunkRemaining::from_header(line);
                hunk = (!remaining.exhausted()).then_some(remaining);
            }
            git_section_open = false;
        }
    }

    scan
}

/// Reduce an LLM response to its patch: drop prose before the first
/// `diff --git` header and markdown fence lines anywhere after it.
///
/// Only fences at column 0 are dropped; a hunk line always starts with
/// ` `, `+` or `-`, so an indented run of backticks is patch content.
/// Returns `None` when no header is present.
pub fn extract_patch_text(response: &str) -> Option<String> {
    let re = git_header_re()?;
    let start = re.find(response)?.start();

    let mut out = String::new();
    for line in response[start..].lines() {
        if line.starts_with("```") {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }

    let trimmed = out.trim_end_matches('\n');
    if trimmed.trim().is_empty() {
        None
    } else {
        Some(format!("{}\n", trimmed))
    }
}
