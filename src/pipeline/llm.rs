use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    #[serde(rename = "max_completion_tokens")]
    pub max_tokens: u32,
    pub top_p: f32,
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Error)]
pub enum ChatCompletionError {
    #[error("language model API key is not configured (set {0})")]
    MissingApiKey(String),
    #[error("language model request failed: {0}")]
    Transport(String),
    #[error("language model HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("language model response decode failed: {0}")]
    Decode(String),
    #[error("language model returned no choices")]
    EmptyChoices,
}

/// Blocking chat-completion collaborator. Returns the first choice's text.
pub trait ChatCompletion: Send + Sync + 'static {
    fn complete(&self, request: &ChatCompletionRequest) -> Result<String, ChatCompletionError>;
}

pub type SharedChatCompletion = Arc<dyn ChatCompletion>;

/// Client for OpenAI-compatible `/chat/completions` endpoints (Groq by default).
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleChatClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    api_key_env: String,
}

impl OpenAiCompatibleChatClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        api_key_env: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ChatCompletionError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatCompletionError::Transport(format!("http client init failed: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
            api_key_env: api_key_env.into(),
        })
    }

    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

impl ChatCompletion for OpenAiCompatibleChatClient {
    fn complete(&self, request: &ChatCompletionRequest) -> Result<String, ChatCompletionError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ChatCompletionError::MissingApiKey(self.api_key_env.clone()))?;
        debug!(
            model = request.model.as_str(),
            temperature = request.temperature,
            "sending chat completion"
        );
        let resp = self
            .client
            .post(self.completions_url())
            .bearer_auth(api_key)
            .json(request)
            .send()
            .map_err(|e| ChatCompletionError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(ChatCompletionError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let payload: ChatCompletionResponse = resp
            .json()
            .map_err(|e| ChatCompletionError::Decode(e.to_string()))?;
        first_choice_content(payload)
    }
}

fn first_choice_content(payload: ChatCompletionResponse) -> Result<String, ChatCompletionError> {
    payload
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content.unwrap_or_default())
        .ok_or(ChatCompletionError::EmptyChoices)
}
