//! Inbound Claude `/v1/messages` served by an openai-chat upstream:
//! requests translate claude → openai-chat, response chunks translate
//! openai-chat → claude stream events.

pub mod request;
pub mod stream;
