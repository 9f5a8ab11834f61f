//! AI chat abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ServiceResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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

/// Coarse model selection. Providers map each hint to a concrete model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelHint {
    #[default]
    Cheap,
    Good,
    Best,
}

impl ModelHint {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ModelHint::Cheap => "cheap",
            ModelHint::Good => "good",
            ModelHint::Best => "best",
        }
    }
}

/// Chat completion provider shared by all agents.
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Send a conversation and return the assistant reply text.
    async fn send(&self, messages: &[ChatMessage], model: ModelHint) -> ServiceResult<String>;
}
