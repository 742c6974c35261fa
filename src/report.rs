//! Batch result rendering: markdown for people, JSON for tooling.

use crate::apply::{PatchReport, PatchStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;

pub const REPORT_TITLE: &str = "# Dynamic Analysis Report";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub rejected: usize,
    pub corrupted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub generated_at: DateTime<Utc>,
    pub summary: Summary,
    pub patches: Vec<PatchReport>,
    /// Working copies left in an unknown state.
    pub quarantined: Vec<String>,
}

impl BatchReport {
    pub fn new(patches: Vec<PatchReport>, quarantined: Vec<String>) -> Self {
        Self {
            generated_at: Utc::now(),
            summary: summarize(&patches),
            patches,
            quarantined,
        }
    }

    pub fn has_corruption(&self) -> bool {
        self.summary.corrupted > 0
    }

    pub fn to_markdown(&self) -> String {
        let mut out = format!("{}\n\n", REPORT_TITLE);
        for patch in &self.patches {
            let log = patch.status.log();
            let fence = fence_for(&log);
            out.push_str(&format!(
                "## Patch {}: {}\n{fence}\n{}\n{fence}\n\n",
                patch.index,
                patch.status.label(),
                log
            ));
        }
        out
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize batch report")
    }

    pub fn write_markdown(&self, path: &Path) -> Result<()> {
        write_file(path, &self.to_markdown())
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        write_file(path, &self.to_json()?)
    }

    /// One line per patch plus totals, for the terminal.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .patches
            .iter()
            .map(|p| {
                let target = match &p.status {
                    PatchStatus::Passed { working_copy, .. }
                    | PatchStatus::Corrupted { working_copy, .. } => format!(" ({})", working_copy),
                    _ => String::new(),
                };
                format!("  Patch {}: {}{}", p.index, p.status.label(), target)
            })
            .collect();
        let s = &self.summary;
        lines.push(format!(
            "  {} patches: {} passed, {} failed, {} rejected, {} corrupted",
            s.total, s.passed, s.failed, s.rejected, s.corrupted
        ));
        if !self.quarantined.is_empty() {
            lines.push(format!(
                "  Needs manual repair: {}",
                self.quarantined.join(", ")
            ));
        }
        lines
    }
}

fn summarize(patches: &[PatchReport]) -> Summary {
    let mut summary = Summary {
        total: patches.len(),
        ..Summary::default()
    };
    for patch in patches {
        match patch.status {
            PatchStatus::Rejected { .. } => summary.rejected += 1,
            PatchStatus::Passed { .. } => summary.passed += 1,
            PatchStatus::Failed { .. } => summary.failed += 1,
            PatchStatus::Corrupted { .. } => summary.corrupted += 1,
        }
    }
    summary
}

/// A backtick fence longer than any backtick run inside `log`.
fn fence_for(log: &str) -> String {
    let mut longest = 0;
    let mut run = 0;
    for c in log.chars() {
        if c == '`' {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    "`".repeat((longest + 1).max(3))
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory '{}'", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("Failed to write '{}'", path.display()))
}
