//! Configuration for patchloop
//!
//! Read from TOML, searched as `--config <path>`, `./patchloop.toml`, then
//! `<config dir>/patchloop/config.toml`. Relative paths inside the file are
//! resolved against the directory holding it.

use crate::allowlist::{default_extensions, AllowList};
use crate::apply::{
    CommandSpec, CommandTool, GitApply, PatchTool, RevertCheck, WorkingCopy, DEFAULT_LOG_LIMIT,
};
use crate::apply::command::PATCH_PLACEHOLDER;
use crate::gate::{MatchStrictness, PatchGate};
use crate::llm::{gemini, ollama, openai_compat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "patchloop.toml";
const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration file found (looked for {tried})")]
    NotFound { tried: String },
    #[error("failed to read config '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_batch_file")]
    pub batch_file: PathBuf,
    #[serde(default = "default_report_file")]
    pub report_file: PathBuf,
    #[serde(default = "default_log_limit")]
    pub log_limit: usize,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub tool: ToolConfig,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateConfig {
    #[serde(default)]
    pub strictness: MatchStrictness,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub reports: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    #[default]
    Git,
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    #[serde(default)]
    pub kind: ToolKind,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Required for `kind = "command"`; must mention `{patch}`.
    #[serde(default)]
    pub apply: Option<CommandSpec>,
    #[serde(default)]
    pub revert: Option<CommandSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub name: String,
    pub root: PathBuf,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub revert_check: RevertCheck,
    pub verify: CommandSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Gemini,
    OpenaiCompatible,
    Ollama,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenaiCompatible => "openai_compatible",
            ProviderKind::Ollama => "ollama",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ProviderConfig {
    /// Environment variable holding the API key, if this backend needs one.
    pub fn api_key_env(&self) -> Option<&str> {
        if let Some(var) = &self.api_key_env {
            return Some(var);
        }
        match self.kind {
            ProviderKind::Gemini => Some("GEMINI_API_KEY"),
            ProviderKind::OpenaiCompatible => Some("QWEN_API_KEY"),
            ProviderKind::Ollama => None,
        }
    }

    pub fn model_or_default(&self) -> String {
        if let Some(model) = &self.model {
            return model.clone();
        }
        match self.kind {
            ProviderKind::Gemini => gemini::DEFAULT_MODEL.to_string(),
            ProviderKind::OpenaiCompatible => openai_compat::DEFAULT_MODEL.to_string(),
            ProviderKind::Ollama => std::env::var("LOCAL_MODEL")
                .ok()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| ollama::DEFAULT_MODEL.to_string()),
        }
    }

    pub fn base_url_or_default(&self) -> String {
        if let Some(url) = &self.base_url {
            return url.clone();
        }
        match self.kind {
            ProviderKind::Gemini => gemini::DEFAULT_BASE_URL,
            ProviderKind::OpenaiCompatible => openai_compat::DEFAULT_BASE_URL,
            ProviderKind::Ollama => ollama::DEFAULT_BASE_URL,
        }
        .to_string()
    }
}

fn default_batch_file() -> PathBuf {
    PathBuf::from("agent/patches/all_patches.diff")
}

fn default_report_file() -> PathBuf {
    PathBuf::from("agent/dynamic_report.md")
}

fn default_log_limit() -> usize {
    DEFAULT_LOG_LIMIT
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            strictness: MatchStrictness::default(),
            extensions: default_extensions(),
            reports: Vec::new(),
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            kind: ToolKind::default(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            apply: None,
            revert: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_file: default_batch_file(),
            report_file: default_report_file(),
            log_limit: DEFAULT_LOG_LIMIT,
            gate: GateConfig::default(),
            tool: ToolConfig::default(),
            targets: Vec::new(),
            providers: Vec::new(),
            base_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Candidate locations in search order.
    pub fn search_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
        if let Some(path) = explicit {
            return vec![path.to_path_buf()];
        }
        let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("patchloop").join("config.toml"));
        }
        paths
    }

    /// Find and load the configuration. An explicit path must exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let candidates = Self::search_paths(explicit);
        if let Some(path) = explicit {
            return Self::load_from(path);
        }
        match candidates.iter().find(|p| p.is_file()) {
            Some(path) => Self::load_from(path),
            None => Err(ConfigError::NotFound {
                tried: candidates
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let config = Self::parse(&content, base_dir).map_err(|err| match err {
            ParseFailure::Toml(source) => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            ParseFailure::Invalid(err) => err,
        })?;
        tracing::debug!(path = %path.display(), targets = config.targets.len(), "loaded config");
        Ok(config)
    }

    /// Parse and validate TOML text, resolving paths against `base_dir`.
    pub fn from_toml_str(content: &str, base_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Self::parse(content, base_dir.into()).map_err(|err| match err {
            ParseFailure::Toml(source) => ConfigError::Invalid(source.to_string()),
            ParseFailure::Invalid(err) => err,
        })
    }

    fn parse(content: &str, base_dir: PathBuf) -> Result<Self, ParseFailure> {
        let mut config: Config = toml::from_str(content).map_err(ParseFailure::Toml)?;
        config.base_dir = base_dir;
        config.validate().map_err(ParseFailure::Invalid)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.log_limit == 0 {
            return invalid("log_limit must be greater than zero".to_string());
        }
        if self.tool.timeout_secs == 0 {
            return invalid("tool.timeout_secs must be greater than zero".to_string());
        }
        if self.gate.extensions.is_empty() {
            return invalid("gate.extensions must not be empty".to_string());
        }

        if self.tool.kind == ToolKind::Command {
            for (field, spec) in [("apply", &self.tool.apply), ("revert", &self.tool.revert)] {
                match spec {
                    None => return invalid(format!("tool.{} is required when kind = \"command\"", field)),
                    Some(spec) if !spec.mentions(PATCH_PLACEHOLDER) => {
                        return invalid(format!("tool.{} must reference {}", field, PATCH_PLACEHOLDER))
                    }
                    Some(_) => {}
                }
            }
        }

        let mut names = HashSet::new();
        let mut roots = HashSet::new();
        for target in &self.targets {
            if target.name.trim().is_empty() {
                return invalid("target name must not be empty".to_string());
            }
            if !names.insert(target.name.as_str()) {
                return invalid(format!("duplicate target name '{}'", target.name));
            }
            if !roots.insert(root_identity(&self.resolve(&target.root))) {
                return invalid(format!(
                    "target '{}' shares its root with another target",
                    target.name
                ));
            }
            if target.timeout_secs == 0 {
                return invalid(format!("target '{}' timeout_secs must be greater than zero", target.name));
            }
            if target.verify.program.trim().is_empty() {
                return invalid(format!("target '{}' verify.program must not be empty", target.name));
            }
        }

        for provider in &self.providers {
            if let Some(base) = &provider.base_url {
                if let Err(err) = url::Url::parse(base) {
                    return invalid(format!(
                        "provider '{}' base_url '{}' is not a valid URL: {}",
                        provider.kind.as_str(),
                        base,
                        err
                    ));
                }
            }
        }
        Ok(())
    }

    /// `run` needs somewhere to apply patches.
    pub fn require_targets(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [[targets]] entry is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn batch_path(&self) -> PathBuf {
        self.resolve(&self.batch_file)
    }

    pub fn report_path(&self) -> PathBuf {
        self.resolve(&self.report_file)
    }

    pub fn analysis_reports(&self) -> Vec<PathBuf> {
        self.gate.reports.iter().map(|p| self.resolve(p)).collect()
    }

    /// Allow-list merged from every configured analyzer report.
    pub fn allow_list(&self) -> anyhow::Result<AllowList> {
        AllowList::from_report_files(&self.analysis_reports(), &self.gate.extensions)
    }

    pub fn gate(&self) -> anyhow::Result<PatchGate> {
        Ok(PatchGate::new(self.allow_list()?).with_strictness(self.gate.strictness))
    }

    /// Working copies in preference order.
    pub fn working_copies(&self) -> Vec<WorkingCopy> {
        self.targets
            .iter()
            .map(|target| {
                WorkingCopy::new(&target.name, self.resolve(&target.root), target.verify.clone())
                    .with_timeout(Duration::from_secs(target.timeout_secs))
                    .with_revert_check(target.revert_check)
            })
            .collect()
    }

    pub fn patch_tool(&self) -> anyhow::Result<Box<dyn PatchTool>> {
        let timeout = Duration::from_secs(self.tool.timeout_secs);
        match (self.tool.kind, &self.tool.apply, &self.tool.revert) {
            (ToolKind::Git, _, _) => Ok(Box::new(GitApply::new(timeout))),
            (ToolKind::Command, Some(apply), Some(revert)) => Ok(Box::new(CommandTool::new(
                apply.clone(),
                revert.clone(),
                timeout,
            )?)),
            (ToolKind::Command, _, _) => {
                anyhow::bail!("tool.apply and tool.revert are required when kind = \"command\"")
            }
        }
    }
}

enum ParseFailure {
    Toml(toml::de::Error),
    Invalid(ConfigError),
}

/// Canonical path when it exists; otherwise `.` dropped and `..` folded
/// lexically, so `cpp`, `./cpp` and `x/../cpp` compare equal.
fn root_identity(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}
