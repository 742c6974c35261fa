use super::{join_url, status_error, CompletionProvider};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// DashScope compatible-mode endpoint, which serves the Qwen models.
pub const DEFAULT_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
pub const DEFAULT_MODEL: &str = "qwen2.5-7b-instruct";

/// Any server that speaks the OpenAI `/chat/completions` protocol.
pub struct OpenAiCompatible {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiCompatible {
    pub fn new(client: reqwest::Client, base_url: String, model: String, api_key: String) -> Self {
        Self {
            client,
            base_url,
            model,
            api_key,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

fn parse_response(body: &str) -> anyhow::Result<String> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| anyhow::anyhow!("Failed to parse chat completion response: {}", e))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("chat completion returned no content"))
}

#[async_trait]
impl CompletionProvider for OpenAiCompatible {
    fn name(&self) -> &str {
        "openai_compatible"
    }

    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
            stream: false,
        };

        let response = self
            .client
            .post(join_url(&self.base_url, "chat/completions"))
            .header("Authorization", format!("Bearer {}", self.api_key))
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
