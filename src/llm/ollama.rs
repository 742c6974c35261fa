use super::{join_url, status_error, CompletionProvider};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "deepseek-coder";
const TEMPERATURE: f32 = 0.3;

/// Local Ollama server, non-streaming `/api/generate`.
pub struct Ollama {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl Ollama {
    pub fn new(client: reqwest::Client, base_url: String, model: String) -> Self {
        Self {
            client,
            base_url,
            model,
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: Options,
}

#[derive(Serialize)]
struct Options {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
}

fn parse_response(body: &str) -> anyhow::Result<String> {
    let parsed: GenerateResponse = serde_json::from_str(body)
        .map_err(|e| anyhow::anyhow!("Failed to parse Ollama response: {}", e))?;
    if let Some(error) = parsed.error {
        anyhow::bail!("Ollama error: {}", error);
    }
    Ok(parsed.response)
}

#[async_trait]
impl CompletionProvider for Ollama {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: Options {
                temperature: TEMPERATURE,
            },
        };

        let response = self
            .client
            .post(join_url(&self.base_url, "api/generate"))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(status_error(self.name(), status, &text));
        }
        parse_response(&text)
    }
}
