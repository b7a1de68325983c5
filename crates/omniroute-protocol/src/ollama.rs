//! Ollama /api/chat dialect (newline-delimited JSON frames).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaChatRequest {
    pub model: String,
    pub messages: Vec<OllamaMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaChatFrame {
    pub model: String,
    pub created_at: String,
    pub message: OllamaMessage,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_reason: Option<String>,
}

impl OllamaChatFrame {
    pub fn delta(model: &str, created_at: &str, content: impl Into<String>) -> Self {
        Self {
            model: model.to_string(),
            created_at: created_at.to_string(),
            message: OllamaMessage {
                role: "assistant".to_string(),
                content: content.into(),
            },
            done: false,
            done_reason: None,
        }
    }

    pub fn done(model: &str, created_at: &str, reason: Option<String>) -> Self {
        Self {
            model: model.to_string(),
            created_at: created_at.to_string(),
            message: OllamaMessage {
                role: "assistant".to_string(),
                content: String::new(),
            },
            done: true,
            done_reason: reason,
        }
    }
}
