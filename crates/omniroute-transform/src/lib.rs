//! Dialect translation.
//!
//! Translators are registered per `(source, target)` pair at startup and
//! looked up by the engine. A translator converts request bodies in the
//! source→target direction and streamed response chunks in the
//! target→source direction, carrying per-stream state.

pub mod chat2cursor;
pub mod chat2gemini;
pub mod chat2ollama;
pub mod chat2responses;
pub mod claude2openai;
pub mod collapse;
pub mod openai2claude;
pub mod registry;
pub mod schema;
pub mod toolmap;

pub use registry::{
    RequestContext, StreamFrame, StreamTranslator, TranslateError, Translator,
    TranslatorRegistry,
};

pub use omniroute_protocol::Format;
