//! Reply generation via hosted language models

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::ReplyGenerator;
use crate::db::{Role, TranscriptEntry};
use crate::{Error, Result};

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// LLM provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    Anthropic,
    OpenAI,
}

impl std::str::FromStr for LlmProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAI),
            other => Err(Error::Config(format!("unknown LLM provider: {other}"))),
        }
    }
}

/// A chat message as sent to the provider (timestamps stripped)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContent {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Generates persona replies
pub struct ReplyClient {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    max_tokens: u32,
    temperature: f32,
    provider: LlmProvider,
    endpoint: String,
}

impl ReplyClient {
    /// Create a reply client for the given provider
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(
        provider: LlmProvider,
        api_key: SecretString,
        model: String,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(format!(
                "{provider:?} API key required for reply generation"
            )));
        }

        let endpoint = match provider {
            LlmProvider::Anthropic => ANTHROPIC_MESSAGES_URL,
            LlmProvider::OpenAI => OPENAI_CHAT_URL,
        };

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            max_tokens,
            temperature,
            provider,
            endpoint: endpoint.to_string(),
        })
    }

    /// Point the client at a different URL (proxies, tests)
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn generate_anthropic(&self, instructions: &str, messages: Vec<ChatMessage<'_>>) -> Result<String> {
        let request = AnthropicRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system: instructions,
            messages,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Anthropic API error");
            return Err(Error::Llm(format!("Anthropic API error {status}: {body}")));
        }

        let result: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;

        Ok(result
            .content
            .into_iter()
            .find_map(|block| match block {
                AnthropicContent::Text { text } => Some(text),
                AnthropicContent::Other => None,
            })
            .unwrap_or_default())
    }

    async fn generate_openai(&self, instructions: &str, history: Vec<ChatMessage<'_>>) -> Result<String> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage {
            role: "system",
            content: instructions,
        });
        messages.extend(history);

        let request = OpenAiRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            messages,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "OpenAI API error");
            return Err(Error::Llm(format!("OpenAI API error {status}: {body}")));
        }

        let result: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;

        Ok(result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

/// History plus the new input, as provider chat messages
fn chat_messages<'a>(history: &'a [TranscriptEntry], input: &'a str) -> Vec<ChatMessage<'a>> {
    history
        .iter()
        .map(|entry| ChatMessage {
            role: match entry.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: entry.content.as_str(),
        })
        .chain(std::iter::once(ChatMessage {
            role: "user",
            content: input,
        }))
        .collect()
}

#[async_trait]
impl ReplyGenerator for ReplyClient {
    async fn generate(
        &self,
        instructions: &str,
        history: &[TranscriptEntry],
        input: &str,
    ) -> Result<String> {
        tracing::debug!(
            provider = ?self.provider,
            model = %self.model,
            history = history.len(),
            "generating reply"
        );

        let messages = chat_messages(history, input);
        let reply = match self.provider {
            LlmProvider::Anthropic => self.generate_anthropic(instructions, messages).await?,
            LlmProvider::OpenAI => self.generate_openai(instructions, messages).await?,
        };

        Ok(reply.trim().to_string())
    }
}
