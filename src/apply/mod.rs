//! Apply, verify, and revert patches against working copies.

pub mod command;
pub mod runner;
pub mod tool;
pub mod working_copy;

#[cfg(test)]
mod tests;

pub use command::{CommandOutcome, CommandSpec};
pub use runner::{
    AttemptOutcome, FailureKind, PatchReport, PatchState, PatchStatus, Runner, TargetAttempt,
    DEFAULT_LOG_LIMIT,
};
pub use tool::{CommandTool, GitApply, PatchTool};
pub use working_copy::{CopyLock, RevertCheck, Snapshot, WorkingCopy};
