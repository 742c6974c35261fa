//! Patch application tools
//!
//! A tool applies a unified diff file to a working copy and reverses it
//! again. Both directions must be all-or-nothing and report failure through
//! a non-zero exit.

use super::command::{CommandOutcome, CommandSpec, PATCH_PLACEHOLDER};
use anyhow::{bail, Result};
use std::path::Path;
use std::time::Duration;

pub trait PatchTool {
    fn name(&self) -> &str;

    fn apply(&self, root: &Path, patch_file: &Path) -> CommandOutcome;

    fn revert(&self, root: &Path, patch_file: &Path) -> CommandOutcome;
}

/// `git apply` / `git apply -R`. Works in plain directories too.
#[derive(Debug, Clone)]
pub struct GitApply {
    timeout: Duration,
}

impl GitApply {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn git(&self, root: &Path, args: &[&str]) -> CommandOutcome {
        CommandSpec::new("git")
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .run(root, self.timeout)
    }
}

impl PatchTool for GitApply {
    fn name(&self) -> &str {
        "git"
    }

    fn apply(&self, root: &Path, patch_file: &Path) -> CommandOutcome {
        self.git(root, &["apply", "--whitespace=nowarn", &patch_file.to_string_lossy()])
    }

    fn revert(&self, root: &Path, patch_file: &Path) -> CommandOutcome {
        self.git(
            root,
            &["apply", "-R", "--whitespace=nowarn", &patch_file.to_string_lossy()],
        )
    }
}

/// Arbitrary apply/revert commands with a `{patch}` placeholder, e.g.
/// `patch -p1 -i {patch}` and `patch -R -p1 -i {patch}`.
#[derive(Debug, Clone)]
pub struct CommandTool {
    apply: CommandSpec,
    revert: CommandSpec,
    timeout: Duration,
}

impl CommandTool {
    pub fn new(apply: CommandSpec, revert: CommandSpec, timeout: Duration) -> Result<Self> {
        for (direction, spec) in [("apply", &apply), ("revert", &revert)] {
            if !spec.mentions(PATCH_PLACEHOLDER) {
                bail!(
                    "{} command '{}' must reference the patch file as {}",
                    direction,
                    spec.label(),
                    PATCH_PLACEHOLDER
                );
            }
        }
        Ok(Self {
            apply,
            revert,
            timeout,
        })
    }
}

impl PatchTool for CommandTool {
    fn name(&self) -> &str {
        &self.apply.program
    }

    fn apply(&self, root: &Path, patch_file: &Path) -> CommandOutcome {
        self.apply
            .substitute(PATCH_PLACEHOLDER, &patch_file.to_string_lossy())
            .run(root, self.timeout)
    }

    fn revert(&self, root: &Path, patch_file: &Path) -> CommandOutcome {
        self.revert
            .substitute(PATCH_PLACEHOLDER, &patch_file.to_string_lossy())
            .run(root, self.timeout)
    }
}

impl<T: PatchTool + ?Sized> PatchTool for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn apply(&self, root: &Path, patch_file: &Path) -> CommandOutcome {
        (**self).apply(root, patch_file)
    }

    fn revert(&self, root: &Path, patch_file: &Path) -> CommandOutcome {
        (**self).revert(root, patch_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATCH: &str = "diff --git a/hello.txt b/hello.txt
--- a/hello.txt
+++ b/hello.txt
@@ -1 +1 @@
-hello
+goodbye
";

    #[test]
    fn command_tool_requires_placeholder() {
        let ok = CommandSpec::new("patch").args(&["-p1", "-i", "{patch}"]);
        let bad = CommandSpec::new("patch").args(&["-R", "-p1"]);
        let err = CommandTool::new(ok, bad, Duration::from_secs(5)).unwrap_err();
        assert!(err.to_string().contains("revert command"));
    }

    #[test]
    fn git_apply_and_revert_in_plain_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("copy");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("hello.txt"), "hello\n").unwrap();
        let patch = dir.path().join("p.diff");
        std::fs::write(&patch, PATCH).unwrap();

        let tool = GitApply::new(Duration::from_secs(30));
        let applied = tool.apply(&root, &patch);
        assert!(applied.success, "{}", applied.log(500));
        assert_eq!(std::fs::read_to_string(root.join("hello.txt")).unwrap(), "goodbye\n");

        let reverted = tool.revert(&root, &patch);
        assert!(reverted.success, "{}", reverted.log(500));
        assert_eq!(std::fs::read_to_string(root.join("hello.txt")).unwrap(), "hello\n");
    }

    #[test]
    fn git_apply_rejects_context_mismatch_without_touching_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("copy");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("hello.txt"), "something else\n").unwrap();
        let patch = dir.path().join("p.diff");
        std::fs::write(&patch, PATCH).unwrap();

        let outcome = GitApply::new(Duration::from_secs(30)).apply(&root, &patch);
        assert!(!outcome.success);
        assert!(!outcome.log(500).is_empty());
        assert_eq!(
            std::fs::read_to_string(root.join("hello.txt")).unwrap(),
            "something else\n"
        );
    }
}
