use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;

pub mod remote;
pub mod summarizer;

/// Target language of a produced summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Ko,
    En,
}

impl Default for Language {
    fn default() -> Self {
        Language::Ko
    }
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Ko => "ko",
            Language::En => "en",
        }
    }

    /// English name used inside prompts.
    pub fn prompt_name(&self) -> &'static str {
        match self {
            Language::Ko => "Korean",
            Language::En => "English",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
}

/// One message of a chat request. The system and user portions are always
/// separate messages; user-controlled text never rides in a system slot.
#[derive(Debug, Clone, Serialize)]
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

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub model: String,
    pub max_tokens: usize,
    pub temperature: f32,
}

impl ChatOptions {
    pub fn from_config(cfg: &common::LlmConfig) -> Self {
        Self {
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
        }
    }
}

/// Core trait for chat-completion backends. Implementations must surface
/// transient errors (network, 5xx, rate limit) distinctly from permanent
/// ones so the summarizer can decide what to retry.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
        budget: Duration,
    ) -> Result<String, LlmError>;
}
