use super::tool::PatchTool;
use super::working_copy::{CopyLock, WorkingCopy};
use crate::batch::PatchBlock;
use crate::diff::ValidatedDiff;
use crate::gate::{GateRejection, PatchGate};
use crate::util::truncate_log;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Maximum characters of command output kept per reported log.
pub const DEFAULT_LOG_LIMIT: usize = 500;

const SCRATCH_DIR: &str = "patchloop";

/// Where a patch stands against one working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchState {
    Pending,
    Applied,
    ApplyFailed,
    Passed,
    Failed,
    Reverted,
    Corrupted,
}

impl PatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchState::Pending => "pending",
            PatchState::Applied => "applied",
            PatchState::ApplyFailed => "apply_failed",
            PatchState::Passed => "passed",
            PatchState::Failed => "failed",
            PatchState::Reverted => "reverted",
            PatchState::Corrupted => "corrupted",
        }
    }
}

/// Terminal result of trying one patch on one working copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The copy was not touched (missing, quarantined, or not snapshottable).
    Skipped { reason: String },
    ApplyFailed { log: String },
    Passed { log: String },
    /// Verification failed and the patch was backed out.
    Reverted { log: String },
    /// Verification failed and backing out did not restore the copy.
    Corrupted { log: String },
}

impl AttemptOutcome {
    pub fn state(&self) -> PatchState {
        match self {
            AttemptOutcome::Skipped { .. } => PatchState::Pending,
            AttemptOutcome::ApplyFailed { .. } => PatchState::ApplyFailed,
            AttemptOutcome::Passed { .. } => PatchState::Passed,
            AttemptOutcome::Reverted { .. } => PatchState::Reverted,
            AttemptOutcome::Corrupted { .. } => PatchState::Corrupted,
        }
    }

    pub fn log(&self) -> &str {
        match self {
            AttemptOutcome::Skipped { reason } => reason,
            AttemptOutcome::ApplyFailed { log }
            | AttemptOutcome::Passed { log }
            | AttemptOutcome::Reverted { log }
            | AttemptOutcome::Corrupted { log } => log,
        }
    }

    /// Whether the patch got past `apply` on this copy.
    pub fn applied(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::Passed { .. }
                | AttemptOutcome::Reverted { .. }
                | AttemptOutcome::Corrupted { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetAttempt {
    pub working_copy: String,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ApplyFailed,
    VerifyFailed,
}

/// Overall result for one patch of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PatchStatus {
    Rejected { reason: GateRejection },
    Passed { working_copy: String, log: String },
    Failed { kind: FailureKind, log: String },
    Corrupted { working_copy: String, log: String },
}

impl PatchStatus {
    pub fn label(&self) -> &'static str {
        match self {
            PatchStatus::Rejected { .. } => "Rejected",
            PatchStatus::Passed { .. } => "Success",
            PatchStatus::Failed { .. } => "Failed",
            PatchStatus::Corrupted { .. } => "Corrupted",
        }
    }

    pub fn log(&self) -> String {
        match self {
            PatchStatus::Rejected { reason } => reason.to_string(),
            PatchStatus::Passed { log, .. }
            | PatchStatus::Failed { log, .. }
            | PatchStatus::Corrupted { log, .. } => log.clone(),
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, PatchStatus::Passed { .. })
    }

    pub fn is_corrupted(&self) -> bool {
        matches!(self, PatchStatus::Corrupted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchReport {
    pub index: usize,
    pub files: Vec<String>,
    pub additions: usize,
    pub deletions: usize,
    #[serde(flatten)]
    pub status: PatchStatus,
    pub attempts: Vec<TargetAttempt>,
}

struct CopySlot {
    copy: WorkingCopy,
    /// Index of the patch whose revert left this copy untrusted.
    quarantined_by: Option<usize>,
}

/// Patch text staged on disk for the tool; removed on drop.
struct ScratchPatch {
    path: PathBuf,
}

impl ScratchPatch {
    fn write(dir: &Path, index: usize, text: &str) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create scratch directory '{}'", dir.display()))?;
        let path = dir.join(format!("patch-{}-{}.diff", index, Uuid::new_v4()));
        let mut body = text.to_string();
        if !body.ends_with('\n') {
            body.push('\n');
        }
        fs::write(&path, body)
            .with_context(|| format!("Failed to write scratch patch '{}'", path.display()))?;
        Ok(Self { path })
    }
}

impl Drop for ScratchPatch {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Sequential apply/verify/revert over an ordered list of working copies.
pub struct Runner<T: PatchTool> {
    tool: T,
    copies: Vec<CopySlot>,
    scratch_dir: PathBuf,
    log_limit: usize,
}

impl<T: PatchTool> Runner<T> {
    pub fn new(tool: T, copies: Vec<WorkingCopy>) -> Self {
        Self {
            tool,
            copies: copies
                .into_iter()
                .map(|copy| CopySlot {
                    copy,
                    quarantined_by: None,
                })
                .collect(),
            scratch_dir: std::env::temp_dir().join(SCRATCH_DIR),
            log_limit: DEFAULT_LOG_LIMIT,
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn with_log_limit(mut self, limit: usize) -> Self {
        self.log_limit = limit;
        self
    }

    pub fn tool(&self) -> &T {
        &self.tool
    }

    pub fn copies(&self) -> impl Iterator<Item = &WorkingCopy> {
        self.copies.iter().map(|slot| &slot.copy)
    }

    /// Names of copies that must be repaired by hand.
    pub fn quarantined(&self) -> Vec<&str> {
        self.copies
            .iter()
            .filter(|slot| slot.quarantined_by.is_some())
            .map(|slot| slot.copy.name.as_str())
            .collect()
    }

    /// Lock every existing copy for the lifetime of the returned guards.
    pub fn lock_all(&self) -> Result<Vec<CopyLock>> {
        self.copies()
            .filter(|copy| copy.exists())
            .map(WorkingCopy::lock)
            .collect()
    }

    /// Gate and process each block in order.
    pub fn run_batch(&mut self, gate: &PatchGate, blocks: &[PatchBlock]) -> Vec<PatchReport> {
        info!(patches = blocks.len(), "processing patch batch");
        blocks.iter().map(|block| self.process(gate, block)).collect()
    }

    pub fn process(&mut self, gate: &PatchGate, block: &PatchBlock) -> PatchReport {
        match gate.evaluate(&block.text).into_result() {
            Ok(diff) => self.process_accepted(block.index, &diff, &block.text),
            Err(reason) => {
                warn!(patch = block.index, %reason, "patch rejected by gate");
                PatchReport {
                    index: block.index,
                    files: Vec::new(),
                    additions: 0,
                    deletions: 0,
                    status: PatchStatus::Rejected { reason },
                    attempts: Vec::new(),
                }
            }
        }
    }

    /// Try an already accepted patch on each copy until one applies it.
    pub fn process_accepted(&mut self, index: usize, diff: &ValidatedDiff, text: &str) -> PatchReport {
        let (additions, deletions) = diff.totals();
        let mut report = PatchReport {
            index,
            files: diff.files().iter().cloned().collect(),
            additions,
            deletions,
            status: PatchStatus::Failed {
                kind: FailureKind::ApplyFailed,
                log: "no working copies configured".to_string(),
            },
            attempts: Vec::new(),
        };

        let scratch = match ScratchPatch::write(&self.scratch_dir, index, text) {
            Ok(scratch) => scratch,
            Err(err) => {
                error!(patch = index, error = %err, "could not stage patch");
                report.status = PatchStatus::Failed {
                    kind: FailureKind::ApplyFailed,
                    log: truncate_log(&format!("{err:#}"), self.log_limit),
                };
                return report;
            }
        };

        let touched: Vec<String> = diff.files().iter().cloned().collect();
        for slot_idx in 0..self.copies.len() {
            let outcome = self.attempt(slot_idx, index, &touched, &scratch.path);
            let applied = outcome.applied();
            if matches!(outcome, AttemptOutcome::Corrupted { .. }) {
                self.copies[slot_idx].quarantined_by = Some(index);
            }
            report.attempts.push(TargetAttempt {
                working_copy: self.copies[slot_idx].copy.name.clone(),
                outcome,
            });
            if applied {
                break;
            }
        }

        if !report.attempts.is_empty() {
            report.status = self.summarize(&report.attempts);
        }
        report
    }

    fn summarize(&self, attempts: &[TargetAttempt]) -> PatchStatus {
        if let Some(last) = attempts.last().filter(|a| a.outcome.applied()) {
            let working_copy = last.working_copy.clone();
            let log = last.outcome.log().to_string();
            return match last.outcome {
                AttemptOutcome::Passed { .. } => PatchStatus::Passed { working_copy, log },
                AttemptOutcome::Corrupted { .. } => PatchStatus::Corrupted { working_copy, log },
                _ => PatchStatus::Failed {
                    kind: FailureKind::VerifyFailed,
                    log,
                },
            };
        }

        let combined = attempts
            .iter()
            .map(|a| a.outcome.log())
            .collect::<Vec<_>>()
            .join("\n");
        PatchStatus::Failed {
            kind: FailureKind::ApplyFailed,
            log: truncate_log(&combined, self.log_limit),
        }
    }

    fn attempt(
        &self,
        slot_idx: usize,
        index: usize,
        touched: &[String],
        patch_file: &Path,
    ) -> AttemptOutcome {
        let slot = &self.copies[slot_idx];
        let copy = &slot.copy;
        let limit = self.log_limit;

        if let Some(by) = slot.quarantined_by {
            debug!(patch = index, copy = %copy.name, "skipping quarantined working copy");
            return AttemptOutcome::Skipped {
                reason: format!(
                    "Skipped {}: working copy quarantined after patch {} failed to revert",
                    copy.name, by
                ),
            };
        }
        if !copy.exists() {
            return AttemptOutcome::Skipped {
                reason: format!(
                    "Skipped {}: '{}' does not exist",
                    copy.name,
                    copy.root.display()
                ),
            };
        }

        let before = match copy.snapshot(touched.iter().map(String::as_str)) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(patch = index, copy = %copy.name, error = %err, "snapshot failed");
                return AttemptOutcome::Skipped {
                    reason: truncate_log(
                        &format!("Skipped {}: could not snapshot files: {err:#}", copy.name),
                        limit,
                    ),
                };
            }
        };

        let applied = self.tool.apply(&copy.root, patch_file);
        if !applied.success {
            info!(
                patch = index,
                copy = %copy.name,
                state = PatchState::ApplyFailed.as_str(),
                "patch did not apply"
            );
            return AttemptOutcome::ApplyFailed {
                log: truncate_log(
                    &format!("Failed to apply to {}: {}", copy.name, applied.log(limit)),
                    limit,
                ),
            };
        }
        info!(patch = index, copy = %copy.name, state = PatchState::Applied.as_str(), "patch applied");

        let verified = copy.run_verify();
        if verified.success {
            info!(
                patch = index,
                copy = %copy.name,
                state = PatchState::Passed.as_str(),
                duration_ms = verified.duration_ms,
                "verification passed"
            );
            return AttemptOutcome::Passed {
                log: verified.log(limit),
            };
        }
        warn!(
            patch = index,
            copy = %copy.name,
            state = PatchState::Failed.as_str(),
            exit_code = ?verified.exit_code,
            timed_out = verified.timed_out,
            "verification failed, reverting"
        );
        let verify_log = verified.log(limit);

        let reverted = self.tool.revert(&copy.root, patch_file);
        if !reverted.success {
            error!(
                patch = index,
                copy = %copy.name,
                state = PatchState::Corrupted.as_str(),
                "revert failed; working copy needs manual repair"
            );
            return AttemptOutcome::Corrupted {
                log: truncate_log(
                    &format!(
                        "Revert failed on {}: {}\nverification log:\n{}",
                        copy.name,
                        reverted.log(limit),
                        verify_log
                    ),
                    limit,
                ),
            };
        }

        if let Some(before) = before {
            let changed = copy
                .snapshot(touched.iter().map(String::as_str))
                .map(|after| after.map(|after| before.changed_since(&after)).unwrap_or_default());
            let problem = match changed {
                Ok(changed) if changed.is_empty() => None,
                Ok(changed) => Some(format!("files differ after revert: {}", changed.join(", "))),
                Err(err) => Some(format!("could not verify revert: {err:#}")),
            };
            if let Some(problem) = problem {
                error!(
                    patch = index,
                    copy = %copy.name,
                    state = PatchState::Corrupted.as_str(),
                    %problem,
                    "revert did not restore working copy"
                );
                return AttemptOutcome::Corrupted {
                    log: truncate_log(
                        &format!("Revert incomplete on {}: {}\nverification log:\n{}", copy.name, problem, verify_log),
                        limit,
                    ),
                };
            }
        }

        info!(patch = index, copy = %copy.name, state = PatchState::Reverted.as_str(), "patch reverted");
        AttemptOutcome::Reverted { log: verify_log }
    }
}
