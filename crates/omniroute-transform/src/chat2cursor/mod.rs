//! openai-chat → Cursor chat request. One-directional: Cursor responses are
//! protobuf frames the executor synthesizes back into chat chunks.

pub mod request;
