//! Allow-list extraction from analyzer reports
//!
//! A patch may only touch files an analyzer actually flagged. Reports are
//! opaque text; the only structure relied on is `<path>.<ext>:<line>:`.

use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;

/// Extensions recognized when none are configured (C/C++ and Python).
pub const DEFAULT_EXTENSIONS: &[&str] = &["c", "cc", "cpp", "cxx", "h", "hh", "hpp", "hxx", "py"];

/// One `path:line:` occurrence in a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportLocation {
    pub path: String,
    pub line: u32,
}

/// Rewrite backslash separators to forward slashes.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

fn location_regex(extensions: &[String]) -> Option<Regex> {
    let alternatives = extensions
        .iter()
        .map(|ext| ext.trim_start_matches('.'))
        .filter(|ext| !ext.is_empty())
        .map(regex::escape)
        .collect::<Vec<_>>();
    if alternatives.is_empty() {
        return None;
    }
    let pattern = format!(
        r"(?P<path>[^\s:]+\.(?:{})):(?P<line>\d+):",
        alternatives.join("|")
    );
    Regex::new(&pattern).ok()
}

/// Every `path:line:` occurrence in report order, duplicates kept.
pub fn extract_locations(report: &str, extensions: &[String]) -> Vec<ReportLocation> {
    let Some(re) = location_regex(extensions) else {
        return Vec::new();
    };

    re.captures_iter(report)
        .filter_map(|caps| {
            let path = normalize_path(caps.name("path")?.as_str());
            let line = caps.name("line")?.as_str().parse::<u32>().ok()?;
            Some(ReportLocation { path, line })
        })
        .collect()
}

/// Files the pipeline is permitted to patch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AllowList {
    paths: BTreeSet<String>,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from one report using [`DEFAULT_EXTENSIONS`].
    pub fn from_report(report: &str) -> Self {
        Self::from_report_with_extensions(report, &default_extensions())
    }

    pub fn from_report_with_extensions(report: &str, extensions: &[String]) -> Self {
        let mut list = Self::new();
        list.extend_from_report(report, extensions);
        list
    }

    /// Merge the matches of another report into this list.
    pub fn extend_from_report(&mut self, report: &str, extensions: &[String]) {
        self.paths.extend(
            extract_locations(report, extensions)
                .into_iter()
                .map(|loc| loc.path),
        );
    }

    /// Read and merge each report file.
    pub fn from_report_files<P: AsRef<Path>>(
        reports: &[P],
        extensions: &[String],
    ) -> anyhow::Result<Self> {
        use anyhow::Context;

        let mut list = Self::new();
        for report in reports {
            let path = report.as_ref();
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read analysis report '{}'", path.display()))?;
            list.extend_from_report(&text, extensions);
        }
        Ok(list)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

pub fn default_extensions() -> Vec<String> {
    DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_single_cpp_finding() {
        let list = AllowList::from_report("cpp_project/sample.cpp:1: warning");
        assert_eq!(list.iter().collect::<Vec<_>>(), vec!["cpp_project/sample.cpp"]);
    }

    #[test]
    fn no_findings_is_an_empty_list() {
        let list = AllowList::from_report("Dummy analysis report");
        assert!(list.is_empty());
    }

    #[test]
    fn mixed_analyzer_output() {
        let report = "\
src/util.py:12:4: E0602: Undefined variable 'x' (undefined-variable)
./lib/io.py:3:1: F821 undefined name 'open_file'
   Location: ./lib/io.py:3:1
[src\\engine\\core.cpp:44]: (error) Null pointer dereference
src\\engine\\core.cpp:44:7: error: nullPointer
";
        let list = AllowList::from_report(report);
        assert!(list.contains("src/util.py"));
        assert!(list.contains("./lib/io.py"));
        assert!(list.contains("src/engine/core.cpp"));
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn unrecognized_extensions_are_ignored() {
        let report = "README.md:3: style\nbuild.rs:1: note\nmain.cpp.orig:2: x";
        assert!(AllowList::from_report(report).is_empty());
    }

    #[test]
    fn custom_extensions_replace_defaults() {
        let exts = vec![".rs".to_string()];
        let list = AllowList::from_report_with_extensions("src/lib.rs:9: warning\na.cpp:1: x", &exts);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec!["src/lib.rs"]);
    }

    #[test]
    fn locations_keep_order_and_duplicates() {
        let report = "b.py:2: x\na.py:10: y\nb.py:2: z\n";
        let locations = extract_locations(report, &default_extensions());
        assert_eq!(
            locations,
            vec![
                ReportLocation { path: "b.py".into(), line: 2 },
                ReportLocation { path: "a.py".into(), line: 10 },
                ReportLocation { path: "b.py".into(), line: 2 },
            ]
        );
    }

    #[test]
    fn line_number_must_be_followed_by_colon() {
        let locations = extract_locations("sample.cpp:12 warning", &default_extensions());
        assert!(locations.is_empty());
    }

    #[test]
    fn reads_and_merges_report_files() {
        let dir = tempfile::tempdir().unwrap();
        let cpp = dir.path().join("analysis_report_cpp.txt");
        let py = dir.path().join("analysis_report_py.txt");
        std::fs::write(&cpp, "sample.cpp:1: warning: fake warning").unwrap();
        std::fs::write(&py, "sample.py:1:0: note: fake").unwrap();

        let list = AllowList::from_report_files(&[cpp, py], &default_extensions()).unwrap();
        assert!(list.contains("sample.cpp"));
        assert!(list.contains("sample.py"));
    }

    #[test]
    fn missing_report_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = AllowList::from_report_files(&[dir.path().join("nope.txt")], &default_extensions())
            .unwrap_err();
        assert!(err.to_string().contains("nope.txt"));
    }
}
