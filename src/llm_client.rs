use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A fully assembled generation request, platform-agnostic.
///
/// Built by the response composer (or the narrative engine, for summaries and
/// phase seeding); the core never hands raw strings to the wire layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Opaque text-completion collaborator.
///
/// Implementations may be slow and may return empty or garbled text; callers
/// must validate what comes back.
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(&self, request: &PromptRequest) -> Result<String>;
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: String, model: String) -> Self {
        Self {
            api_url,
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }

    /// Generate a completion using the OpenAI API format
    async fn generate_chat(&self, request: &PromptRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);

        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: request.system.clone(),
                },
                Message {
                    role: "user".to_string(),
                    content: request.user.clone(),
                },
            ],
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
        };

        let mut req = self.client.post(&url).json(&body);

        // Add API key header if provided (not needed for local models)
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?;

        Ok(content)
    }
}

#[async_trait]
impl GenerationService for LlmClient {
    async fn generate(&self, request: &PromptRequest) -> Result<String> {
        self.generate_chat(request).await
    }
}

/// Parse a JSON payload out of raw model output.
///
/// Models wrap JSON in markdown fences or chatter around it often enough that
/// plain `from_str` is not good enough. Tries, in order: the raw text, the
/// contents of a ```json fence, the outermost brace span.
pub fn extract_json<T>(response: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    if let Ok(parsed) = serde_json::from_str::<T>(response) {
        return Ok(parsed);
    }

    let json_content = if let Some(start) = response.find("```json") {
        let after_start = &response[start + 7..];
        if let Some(end) = after_start.find("```") {
            after_start[..end].trim()
        } else {
            response
        }
    } else if let Some(start) = response.find('{') {
        if let Some(end) = response.rfind('}') {
            &response[start..=end]
        } else {
            response
        }
    } else {
        response
    };

    serde_json::from_str::<T>(json_content).context(format!(
        "Failed to parse JSON response. Raw response: {}",
        response.chars().take(500).collect::<String>()
    ))
}
