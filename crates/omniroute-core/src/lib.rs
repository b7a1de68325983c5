//! The routing engine: model resolution, credential selection and refresh,
//! the account fallback loop, and the streaming pipe.

pub mod apikey;
pub mod engine;
pub mod error;
pub mod pipe;
pub mod resolver;

pub use apikey::{ParsedApiKey, format_api_key, parse_api_key};
pub use engine::{Engine, EngineBody, EngineRequest, EngineResponse};
pub use error::GatewayError;
pub use resolver::{ResolvedModel, resolve_model};
