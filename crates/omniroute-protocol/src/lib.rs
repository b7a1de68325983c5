//! Wire dialects spoken by the gateway.
//!
//! This crate intentionally contains **no IO**: DTOs for each upstream
//! dialect, the incremental SSE parser, and the Connect/protobuf codec used
//! by the Cursor transport. Translation between dialects lives in
//! `omniroute-transform`.

pub mod claude;
pub mod connect;
pub mod cursor;
pub mod embeddings;
pub mod error;
pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod pb;
pub mod responses;
pub mod sse;

use serde::{Deserialize, Serialize};

/// A wire dialect tag. Closed set; translator lookup is keyed by a pair of
/// these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Format {
    OpenaiChat,
    OpenaiResponses,
    Claude,
    Gemini,
    Ollama,
    Cursor,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::OpenaiChat => "openai-chat",
            Format::OpenaiResponses => "openai-responses",
            Format::Claude => "claude",
            Format::Gemini => "gemini",
            Format::Ollama => "ollama",
            Format::Cursor => "cursor",
        }
    }

    /// How streamed frames of this dialect are framed on the wire.
    pub fn stream_framing(&self) -> StreamFraming {
        match self {
            Format::Claude | Format::OpenaiResponses => StreamFraming::SseNamedEvent,
            Format::OpenaiChat => StreamFraming::SseDataOnly,
            Format::Gemini | Format::Ollama => StreamFraming::JsonLines,
            Format::Cursor => StreamFraming::ConnectFrames,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFraming {
    SseNamedEvent,
    SseDataOnly,
    JsonLines,
    ConnectFrames,
}
