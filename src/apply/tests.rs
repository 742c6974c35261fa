#![cfg(unix)]

use super::*;
use crate::allowlist::AllowList;
use crate::batch::PatchBlock;
use crate::diff::DiffMarker;
use crate::gate::{GateRejection, PatchGate};
use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

const SAMPLE_FIX: &str = "diff --git a/cpp_project/sample.cpp b/cpp_project/sample.cpp
--- a/cpp_project/sample.cpp
+++ b/cpp_project/sample.cpp
@@ -1 +1 @@
-int main() { return 1; }
+int main() { return 0; }
";

fn git_apply() -> GitApply {
    GitApply::new(Duration::from_secs(30))
}

fn sample_workspace() -> (TempDir, PathBuf) {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("workspace");
    fs::create_dir_all(root.join("cpp_project")).unwrap();
    fs::write(
        root.join("cpp_project/sample.cpp"),
        "int main() { return 1; }\n",
    )
    .unwrap();
    (tmp, root)
}

fn runner_for<T: PatchTool>(tool: T, tmp: &TempDir, copies: Vec<WorkingCopy>) -> Runner<T> {
    Runner::new(tool, copies).with_scratch_dir(tmp.path().join("scratch"))
}

fn sample_gate() -> PatchGate {
    PatchGate::new(AllowList::from_report("cpp_project/sample.cpp:1: warning"))
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

/// Delegates to `git apply` but refuses to revert patches containing `marker`.
struct RevertFailsOn {
    inner: GitApply,
    marker: &'static str,
}

impl PatchTool for RevertFailsOn {
    fn name(&self) -> &str {
        "flaky-git"
    }

    fn apply(&self, root: &Path, patch_file: &Path) -> CommandOutcome {
        self.inner.apply(root, patch_file)
    }

    fn revert(&self, root: &Path, patch_file: &Path) -> CommandOutcome {
        if read(patch_file).contains(self.marker) {
            return CommandOutcome {
                command: "git apply -R".to_string(),
                success: false,
                exit_code: Some(1),
                timed_out: false,
                duration_ms: 0,
                output: "error: patch failed: simulated".to_string(),
                note: None,
            };
        }
        self.inner.revert(root, patch_file)
    }
}

/// Counts invocations and never succeeds.
#[derive(Default)]
struct CountingTool {
    calls: Cell<usize>,
}

impl PatchTool for CountingTool {
    fn name(&self) -> &str {
        "counting"
    }

    fn apply(&self, _root: &Path, _patch_file: &Path) -> CommandOutcome {
        self.calls.set(self.calls.get() + 1);
        CommandOutcome {
            command: "apply".to_string(),
            success: false,
            exit_code: Some(1),
            timed_out: false,
            duration_ms: 0,
            output: String::new(),
            note: None,
        }
    }

    fn revert(&self, root: &Path, patch_file: &Path) -> CommandOutcome {
        self.apply(root, patch_file)
    }
}

#[test]
fn accepted_patch_that_passes_is_kept() {
    let (tmp, root) = sample_workspace();
    let copy = WorkingCopy::new("cpp", &root, CommandSpec::new("true"));
    let mut runner = runner_for(git_apply(), &tmp, vec![copy]);

    let gate = sample_gate();
    assert!(gate.evaluate(SAMPLE_FIX).is_accepted());

    let report = runner.process(&gate, &PatchBlock::new(1, SAMPLE_FIX));
    assert!(report.status.is_passed(), "{:?}", report.status);
    assert_eq!(report.files, vec!["cpp_project/sample.cpp"]);
    assert_eq!((report.additions, report.deletions), (1, 1));
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].outcome.state(), PatchState::Passed);
    assert!(read(&root.join("cpp_project/sample.cpp")).contains("return 0;"));
}

#[test]
fn failing_verification_reverts_the_patch() {
    let (tmp, root) = sample_workspace();
    let copy = WorkingCopy::new("cpp", &root, CommandSpec::shell("echo 'test failed'; exit 1"));
    let mut runner = runner_for(git_apply(), &tmp, vec![copy]);

    let report = runner.process(&sample_gate(), &PatchBlock::new(1, SAMPLE_FIX));
    match &report.status {
        PatchStatus::Failed { kind, log } => {
            assert_eq!(*kind, FailureKind::VerifyFailed);
            assert!(log.contains("test failed"));
        }
        other => panic!("expected verify failure, got {other:?}"),
    }
    assert_eq!(report.attempts[0].outcome.state(), PatchState::Reverted);
    assert!(read(&root.join("cpp_project/sample.cpp")).contains("return 1;"));
    assert!(runner.quarantined().is_empty());
}

#[test]
fn empty_patch_is_rejected_without_running_anything() {
    let (tmp, root) = sample_workspace();
    let marker = tmp.path().join("verify-ran");
    let verify = CommandSpec::shell(&format!("touch {}", marker.display()));
    let copy = WorkingCopy::new("cpp", &root, verify);
    let tool = CountingTool::default();
    let mut runner = runner_for(tool, &tmp, vec![copy]);

    let report = runner.process(&sample_gate(), &PatchBlock::new(1, ""));
    match &report.status {
        PatchStatus::Rejected {
            reason: GateRejection::MalformedDiff(err),
        } => assert!(err.missing.contains(&DiffMarker::GitHeader)),
        other => panic!("expected malformed rejection, got {other:?}"),
    }
    assert!(report.attempts.is_empty());
    assert_eq!(runner.tool().calls.get(), 0);
    assert!(!marker.exists());
}

#[test]
fn disallowed_patch_is_rejected_before_mutation() {
    let (tmp, root) = sample_workspace();
    let copy = WorkingCopy::new("cpp", &root, CommandSpec::new("true"));
    let mut runner = runner_for(git_apply(), &tmp, vec![copy]);
    let gate = PatchGate::new(AllowList::from_report("other/file.cpp:3: style"));

    let report = runner.process(&gate, &PatchBlock::new(7, SAMPLE_FIX));
    assert_eq!(
        report.status,
        PatchStatus::Rejected {
            reason: GateRejection::DisallowedFile {
                files: vec!["cpp_project/sample.cpp".to_string()]
            }
        }
    );
    assert!(read(&root.join("cpp_project/sample.cpp")).contains("return 1;"));
}

#[test]
fn verification_timeout_counts_as_failure_and_reverts() {
    let (tmp, root) = sample_workspace();
    let copy = WorkingCopy::new("cpp", &root, CommandSpec::new("sleep").args(&["5"]))
        .with_timeout(Duration::from_millis(300));
    let mut runner = runner_for(git_apply(), &tmp, vec![copy]);

    let report = runner.process(&sample_gate(), &PatchBlock::new(1, SAMPLE_FIX));
    match &report.status {
        PatchStatus::Failed { kind, log } => {
            assert_eq!(*kind, FailureKind::VerifyFailed);
            assert!(log.contains("timed out"));
        }
        other => panic!("expected timeout failure, got {other:?}"),
    }
    assert!(read(&root.join("cpp_project/sample.cpp")).contains("return 1;"));
}

#[test]
fn apply_failure_everywhere_concatenates_logs() {
    let (tmp, root) = sample_workspace();
    fs::write(root.join("cpp_project/sample.cpp"), "int main() { return 42; }\n").unwrap();
    let other = tmp.path().join("python_repo");
    fs::create_dir_all(&other).unwrap();

    let copies = vec![
        WorkingCopy::new("cpp", &root, CommandSpec::new("true")),
        WorkingCopy::new("python", &other, CommandSpec::new("true")),
    ];
    let mut runner = runner_for(git_apply(), &tmp, copies);

    let report = runner.process(&sample_gate(), &PatchBlock::new(1, SAMPLE_FIX));
    match &report.status {
        PatchStatus::Failed { kind, log } => {
            assert_eq!(*kind, FailureKind::ApplyFailed);
            assert!(log.contains("Failed to apply to cpp"));
            assert!(log.contains("Failed to apply to python"));
            assert!(log.chars().count() <= DEFAULT_LOG_LIMIT);
        }
        other => panic!("expected apply failure, got {other:?}"),
    }
    assert_eq!(report.attempts.len(), 2);
}

#[test]
fn stops_at_first_copy_that_applies() {
    let tmp = tempfile::tempdir().unwrap();
    let cpp = tmp.path().join("cpp");
    let py = tmp.path().join("py");
    fs::create_dir_all(&cpp).unwrap();
    fs::create_dir_all(&py).unwrap();
    fs::write(py.join("app.py"), "x = 1\n").unwrap();

    let patch = "diff --git a/app.py b/app.py\n--- a/app.py\n+++ b/app.py\n@@ -1 +1 @@\n-x = 1\n+x = 2\n";
    let copies = vec![
        WorkingCopy::new("cpp", &cpp, CommandSpec::new("true")),
        WorkingCopy::new("python", &py, CommandSpec::new("false")),
    ];
    let mut runner = runner_for(git_apply(), &tmp, copies);
    let gate = PatchGate::new(AllowList::from_report("app.py:1: E0602"));

    let report = runner.process(&gate, &PatchBlock::new(1, patch));
    let states: Vec<_> = report.attempts.iter().map(|a| a.outcome.state()).collect();
    assert_eq!(states, vec![PatchState::ApplyFailed, PatchState::Reverted]);
    assert!(matches!(
        report.status,
        PatchStatus::Failed {
            kind: FailureKind::VerifyFailed,
            ..
        }
    ));
    assert_eq!(read(&py.join("app.py")), "x = 1\n");
}

#[test]
fn failed_revert_quarantines_only_that_copy() {
    let tmp = tempfile::tempdir().unwrap();
    let cpp = tmp.path().join("cpp");
    let py = tmp.path().join("py");
    fs::create_dir_all(&cpp).unwrap();
    fs::create_dir_all(&py).unwrap();
    fs::write(cpp.join("sample.cpp"), "int main() { return 1; }\n").unwrap();
    fs::write(py.join("app.py"), "x = 1\n").unwrap();

    let patch_one = "diff --git a/sample.cpp b/sample.cpp\n--- a/sample.cpp\n+++ b/sample.cpp\n@@ -1 +1 @@\n-int main() { return 1; }\n+int main() { return 0; }\n";
    let patch_two = "diff --git a/sample.cpp b/sample.cpp\n--- a/sample.cpp\n+++ b/sample.cpp\n@@ -1 +1 @@\n-int main() { return 0; }\n+int main() { return 0; } // BROKEN\n";
    let patch_three = "diff --git a/app.py b/app.py\n--- a/app.py\n+++ b/app.py\n@@ -1 +1 @@\n-x = 1\n+x = 2\n";

    let copies = vec![
        WorkingCopy::new("cpp", &cpp, CommandSpec::shell("! grep -q BROKEN sample.cpp")),
        WorkingCopy::new("python", &py, CommandSpec::new("true")),
    ];
    let tool = RevertFailsOn {
        inner: git_apply(),
        marker: "BROKEN",
    };
    let mut runner = runner_for(tool, &tmp, copies);
    let gate = PatchGate::new(AllowList::from_report("sample.cpp:1: x\napp.py:1: y"));

    let blocks = vec![
        PatchBlock::new(1, patch_one),
        PatchBlock::new(2, patch_two),
        PatchBlock::new(3, patch_three),
    ];
    let reports = runner.run_batch(&gate, &blocks);

    assert!(reports[0].status.is_passed());
    match &reports[1].status {
        PatchStatus::Corrupted { working_copy, log } => {
            assert_eq!(working_copy, "cpp");
            assert!(log.contains("Revert failed"));
        }
        other => panic!("expected corrupted, got {other:?}"),
    }
    assert!(reports[2].status.is_passed());
    assert!(matches!(
        reports[2].attempts[0].outcome,
        AttemptOutcome::Skipped { .. }
    ));
    assert_eq!(reports[2].attempts[1].working_copy, "python");

    assert_eq!(runner.quarantined(), vec!["cpp"]);
    assert_eq!(read(&py.join("app.py")), "x = 2\n");
}

#[test]
fn single_copy_batch_continues_after_corruption() {
    let (tmp, root) = sample_workspace();
    let copy = WorkingCopy::new("cpp", &root, CommandSpec::new("false"));
    let tool = RevertFailsOn {
        inner: git_apply(),
        marker: "return 0;",
    };
    let mut runner = runner_for(tool, &tmp, vec![copy]);

    let blocks = vec![
        PatchBlock::new(1, "not a diff"),
        PatchBlock::new(2, SAMPLE_FIX),
        PatchBlock::new(3, SAMPLE_FIX),
    ];
    let reports = runner.run_batch(&sample_gate(), &blocks);

    assert!(matches!(reports[0].status, PatchStatus::Rejected { .. }));
    assert!(reports[1].status.is_corrupted());
    match &reports[2].status {
        PatchStatus::Failed { kind, log } => {
            assert_eq!(*kind, FailureKind::ApplyFailed);
            assert!(log.contains("quarantined after patch 2"));
        }
        other => panic!("expected skipped failure, got {other:?}"),
    }
}

#[test]
fn apply_then_revert_restores_every_tracked_file() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("repo");
    fs::create_dir_all(root.join("src")).unwrap();
    fs::write(root.join("src/a.cpp"), "int a() { return 1; }\n").unwrap();
    fs::write(root.join("src/b.cpp"), "int b() { return 2; }\n").unwrap();
    fs::write(root.join("README"), "docs\n").unwrap();

    let repo = git2::Repository::init(&root).unwrap();
    let mut index = repo.index().unwrap();
    for path in ["src/a.cpp", "src/b.cpp", "README"] {
        index.add_path(Path::new(path)).unwrap();
    }
    index.write().unwrap();

    let before = Snapshot::capture_tracked(&root).unwrap();
    assert_eq!(before.len(), 3);

    let patch = "diff --git a/src/a.cpp b/src/a.cpp
--- a/src/a.cpp
+++ b/src/a.cpp
@@ -1 +1 @@
-int a() { return 1; }
+int a() { return 10; }
diff --git a/src/b.cpp b/src/b.cpp
--- a/src/b.cpp
+++ b/src/b.cpp
@@ -1 +1 @@
-int b() { return 2; }
+int b() { return 20; }
";
    let copy = WorkingCopy::new("cpp", &root, CommandSpec::shell("echo build artifact > out.o; exit 1"))
        .with_revert_check(RevertCheck::Tracked);
    let mut runner = runner_for(git_apply(), &tmp, vec![copy]);
    let gate = PatchGate::new(AllowList::from_report("src/a.cpp:1: x\nsrc/b.cpp:1: y"));

    let report = runner.process(&gate, &PatchBlock::new(1, patch));
    assert_eq!(report.attempts[0].outcome.state(), PatchState::Reverted);

    let after = Snapshot::capture_tracked(&root).unwrap();
    assert_eq!(before, after);
}

#[test]
fn revert_that_leaves_changes_is_corruption() {
    /// Reverts by doing nothing and claiming success.
    struct LyingRevert(GitApply);

    impl PatchTool for LyingRevert {
        fn name(&self) -> &str {
            "lying"
        }
        fn apply(&self, root: &Path, patch_file: &Path) -> CommandOutcome {
            self.0.apply(root, patch_file)
        }
        fn revert(&self, root: &Path, _patch_file: &Path) -> CommandOutcome {
            CommandSpec::new("true").run(root, Duration::from_secs(5))
        }
    }

    let (tmp, root) = sample_workspace();
    let copy = WorkingCopy::new("cpp", &root, CommandSpec::new("false"));
    let mut runner = runner_for(LyingRevert(git_apply()), &tmp, vec![copy]);

    let report = runner.process(&sample_gate(), &PatchBlock::new(1, SAMPLE_FIX));
    match &report.status {
        PatchStatus::Corrupted { log, .. } => {
            assert!(log.contains("cpp_project/sample.cpp"));
        }
        other => panic!("expected corrupted, got {other:?}"),
    }
}

#[test]
fn boxed_tools_and_missing_copies() {
    let tmp = tempfile::tempdir().unwrap();
    let missing = tmp.path().join("does-not-exist");
    let tool: Box<dyn PatchTool> = Box::new(git_apply());
    let mut runner = runner_for(
        tool,
        &tmp,
        vec![WorkingCopy::new("cpp", &missing, CommandSpec::new("true"))],
    );
    assert!(runner.lock_all().unwrap().is_empty());

    let report = runner.process(&sample_gate(), &PatchBlock::new(1, SAMPLE_FIX));
    match &report.status {
        PatchStatus::Failed { kind, log } => {
            assert_eq!(*kind, FailureKind::ApplyFailed);
            assert!(log.contains("does not exist"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn scratch_patch_files_are_cleaned_up() {
    let (tmp, root) = sample_workspace();
    let copy = WorkingCopy::new("cpp", &root, CommandSpec::new("true"));
    let mut runner = runner_for(git_apply(), &tmp, vec![copy]);

    runner.process(&sample_gate(), &PatchBlock::new(1, SAMPLE_FIX.trim_end()));
    let leftovers = fs::read_dir(tmp.path().join("scratch")).unwrap().count();
    assert_eq!(leftovers, 0);
    assert!(read(&root.join("cpp_project/sample.cpp")).contains("return 0;"));
}
