//! openai-chat ↔ openai-responses. Used when a chat client is routed to a
//! Responses-only upstream (Codex, some Copilot models) and when a Responses
//! client is routed to a chat upstream.

pub mod request;
pub mod stream;
