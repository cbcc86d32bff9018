use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ChatMessage, ChatOptions, ChatRole, LlmClient};
use crate::error::LlmError;

/// Chat client for OpenAI-compatible HTTP APIs.
pub struct OpenAiChatClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiChatClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl LlmClient for OpenAiChatClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
        budget: Duration,
    ) -> Result<String, LlmError> {
        let req_body = OpenAiRequest {
            model: opts.model.clone(),
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: match m.role {
                        ChatRole::System => "system".to_string(),
                        ChatRole::User => "user".to_string(),
                    },
                    content: m.content.clone(),
                })
                .collect(),
            max_tokens: Some(opts.max_tokens),
            temperature: Some(opts.temperature),
        };

        // The budget covers the whole round trip, body read included.
        let exchange = async {
            let response = self
                .client
                .post(&self.base_url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&req_body)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        LlmError::Timeout
                    } else {
                        LlmError::Unavailable(e.to_string())
                    }
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(match status.as_u16() {
                    429 => LlmError::RateLimited,
                    413 => LlmError::InputTooLarge,
                    code if code >= 500 => LlmError::Unavailable(format!("HTTP {}", code)),
                    code => LlmError::Api(code),
                });
            }

            let resp_body: OpenAiResponse = response
                .json()
                .await
                .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

            resp_body
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .ok_or_else(|| LlmError::InvalidResponse("response has no choices".into()))
        };

        tokio::time::timeout(budget, exchange)
            .await
            .map_err(|_| LlmError::Timeout)?
    }
}

// OpenAI wire structures
#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: WireMessage,
}
