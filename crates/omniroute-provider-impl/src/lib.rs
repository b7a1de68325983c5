//! Provider executors: one adapter per upstream family, plus the wreq-backed
//! upstream client they share.

pub mod antigravity;
pub mod client;
pub mod codex;
pub mod cursor;
pub mod default_exec;
pub mod github;
pub mod iflow;
pub mod kiro;
pub mod refresh;
pub mod registry;

pub use client::{UpstreamClientConfig, WreqUpstreamClient};
pub use registry::ExecutorRegistry;
