//! Patch generation through an ordered chain of completion backends.
//!
//! Each backend is asked in turn; the first response that contains a
//! structurally valid unified diff wins. Transport errors and prose-only
//! answers both fall through to the next backend.

pub mod gemini;
pub mod ollama;
pub mod openai_compat;

pub use gemini::Gemini;
pub use ollama::Ollama;
pub use openai_compat::OpenAiCompatible;

use crate::config::{ProviderConfig, ProviderKind};
use crate::diff::{extract_patch_text, validate_unified_diff};
use crate::util::truncate;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// HTTP timeout for a single completion request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Longest error body echoed back from a backend.
const ERROR_BODY_LIMIT: usize = 300;

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Raw text of the model's answer to `prompt`.
    async fn complete(&self, prompt: &str) -> anyhow::Result<String>;
}

/// A diff produced by one of the providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub provider: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderFailure {
    pub provider: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("no completion providers are configured")]
    NoProviders,
    #[error("no provider produced a valid diff ({})", describe_failures(.attempts))]
    Exhausted { attempts: Vec<ProviderFailure> },
}

fn describe_failures(attempts: &[ProviderFailure]) -> String {
    attempts
        .iter()
        .map(|f| format!("{}: {}", f.provider, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Default)]
pub struct ProviderChain {
    providers: Vec<Box<dyn CompletionProvider>>,
}

impl ProviderChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, provider: impl CompletionProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Build the chain in configured order. Providers that need an API key
    /// whose environment variable is unset are left out.
    pub fn from_config(configs: &[ProviderConfig]) -> anyhow::Result<Self> {
        let client = http_client()?;
        let mut chain = Self::new();

        for config in configs {
            let key = match config.api_key_env() {
                Some(var) => match std::env::var(var) {
                    Ok(value) if !value.trim().is_empty() => Some(value),
                    _ => {
                        warn!(provider = config.kind.as_str(), env = var, "API key not set, skipping provider");
                        continue;
                    }
                },
                None => None,
            };

            chain = match config.kind {
                ProviderKind::Gemini => chain.push(Gemini::new(
                    client.clone(),
                    config.base_url_or_default(),
                    config.model_or_default(),
                    key.unwrap_or_default(),
                )),
                ProviderKind::OpenaiCompatible => chain.push(OpenAiCompatible::new(
                    client.clone(),
                    config.base_url_or_default(),
                    config.model_or_default(),
                    key.unwrap_or_default(),
                )),
                ProviderKind::Ollama => chain.push(Ollama::new(
                    client.clone(),
                    config.base_url_or_default(),
                    config.model_or_default(),
                )),
            };
        }
        Ok(chain)
    }

    /// Ask each provider in order until one answers with a valid diff.
    pub async fn complete_diff(&self, prompt: &str) -> Result<Completion, ChainError> {
        if self.providers.is_empty() {
            return Err(ChainError::NoProviders);
        }

        let mut attempts = Vec::new();
        for provider in &self.providers {
            let reason = match provider.complete(prompt).await {
                Ok(answer) => match accept_diff(&answer) {
                    Some(text) => {
                        info!(provider = provider.name(), "patch generated");
                        return Ok(Completion {
                            provider: provider.name().to_string(),
                            text,
                        });
                    }
                    None => "invalid diff format".to_string(),
                },
                Err(err) => format!("{err:#}"),
            };
            warn!(provider = provider.name(), %reason, "provider failed, falling back");
            attempts.push(ProviderFailure {
                provider: provider.name().to_string(),
                reason,
            });
        }
        Err(ChainError::Exhausted { attempts })
    }
}

fn accept_diff(answer: &str) -> Option<String> {
    let text = extract_patch_text(answer)?;
    validate_unified_diff(&text).ok()?;
    Some(text)
}

pub(crate) fn http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))
}

/// Turn a non-success HTTP response into an error message.
pub(crate) fn status_error(provider: &str, status: reqwest::StatusCode, body: &str) -> anyhow::Error {
    match status.as_u16() {
        401 | 403 => anyhow::anyhow!("{} rejected the API key ({})", provider, status),
        429 => anyhow::anyhow!("{} rate limited the request", provider),
        _ => anyhow::anyhow!(
            "{} returned {}: {}",
            provider,
            status,
            truncate(body.trim(), ERROR_BODY_LIMIT)
        ),
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
