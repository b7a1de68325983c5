//! OpenAI embeddings dialect. The response envelope is passed through
//! verbatim; only the request needs typing for validation and defaults.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsRequest {
    pub model: String,
    pub input: EmbeddingsInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingsInput {
    Text(String),
    Batch(Vec<String>),
}

impl EmbeddingsInput {
    /// Empty inputs are rejected before dispatch.
    pub fn is_empty(&self) -> bool {
        match self {
            EmbeddingsInput::Text(text) => text.is_empty(),
            EmbeddingsInput::Batch(items) => {
                items.is_empty() || items.iter().any(|item| item.is_empty())
            }
        }
    }
}
