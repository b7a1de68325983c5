//! Ollama /api/chat served by an openai-chat upstream: requests translate
//! ollama → openai-chat, response chunks translate back into Ollama frames.

pub mod request;
pub mod stream;
