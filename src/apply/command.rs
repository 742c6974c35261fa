use crate::util::{run_command_with_timeout, truncate_log};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

/// Placeholder substituted with the scratch patch path in tool templates.
pub const PATCH_PLACEHOLDER: &str = "{patch}";

/// An external command: program, arguments, extra environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// `sh -c <script>` on unix, `cmd /C <script>` elsewhere.
    pub fn shell(script: &str) -> Self {
        if cfg!(windows) {
            Self::new("cmd").args(&["/C", script])
        } else {
            Self::new("sh").args(&["-c", script])
        }
    }

    pub fn label(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.as_str());
        parts.extend(self.args.iter().map(String::as_str));
        parts.join(" ")
    }

    pub fn mentions(&self, placeholder: &str) -> bool {
        self.args.iter().any(|a| a.contains(placeholder))
    }

    /// Copy with every occurrence of `placeholder` in the args replaced.
    pub fn substitute(&self, placeholder: &str, value: &str) -> Self {
        Self {
            program: self.program.clone(),
            args: self
                .args
                .iter()
                .map(|a| a.replace(placeholder, value))
                .collect(),
            env: self.env.clone(),
        }
    }

    /// Run in `cwd`, killing the child if it outlives `timeout`.
    pub fn run(&self, cwd: &Path, timeout: Duration) -> CommandOutcome {
        let mut command = Command::new(&self.program);
        command.current_dir(cwd).args(&self.args);
        for (key, value) in &self.env {
            command.env(key, value);
        }

        let start = Instant::now();
        match run_command_with_timeout(&mut command, timeout) {
            Ok(result) => CommandOutcome {
                command: self.label(),
                success: result.success(),
                exit_code: result.exit_code(),
                timed_out: result.timed_out,
                duration_ms: start.elapsed().as_millis() as u64,
                output: result.combined_output(),
                note: result
                    .timed_out
                    .then(|| format!("timed out after {}s", timeout.as_secs_f64())),
            },
            Err(error) => CommandOutcome {
                command: self.label(),
                success: false,
                exit_code: None,
                timed_out: false,
                duration_ms: start.elapsed().as_millis() as u64,
                output: String::new(),
                note: Some(error),
            },
        }
    }
}

/// What a finished (or killed, or unstartable) command left behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub command: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    /// Combined stdout and stderr.
    pub output: String,
    /// Spawn error or timeout notice.
    pub note: Option<String>,
}

impl CommandOutcome {
    /// Output plus any note, cut to `limit` characters.
    pub fn log(&self, limit: usize) -> String {
        let mut log = self.output.trim_end().to_string();
        if let Some(note) = &self.note {
            if !log.is_empty() {
                log.push('\n');
            }
            log.push_str(note);
        }
        truncate_log(&log, limit)
    }
}
