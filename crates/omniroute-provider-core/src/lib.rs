//! Provider abstractions for omniroute.
//!
//! This crate intentionally does **not** depend on axum or any concrete HTTP
//! client. Executors construct `UpstreamHttpRequest` values; a higher layer
//! performs IO through the `UpstreamClient` trait.

pub mod errors;
pub mod events;
pub mod executor;
pub mod fallback;
pub mod headers;
pub mod kind;
pub mod machine;
pub mod runtime;
pub mod select;
pub mod singleflight;
pub mod store;

pub use errors::{ProviderError, ProviderResult};
pub use events::{Event, EventHub};
pub use executor::{
    ByteStream, ExecuteContext, ExecutionOutcome, ExecutorLookup, HttpMethod, ProviderExecutor,
    UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
    UpstreamTransportErrorKind, failure_from_response, provider_error_failure,
};
pub use fallback::{FallbackDecision, check_fallback_error};
pub use headers::{Headers, header_get, header_remove, header_set, set_bearer};
pub use kind::{ProviderKind, alias_to_provider, provider_to_alias};
pub use machine::{
    AuthType, Combo, ConnectionHealth, ConnectionStatus, ConnectionUpdate, MachineRecord,
    ProviderConnection,
};
pub use runtime::ProviderRuntime;
pub use select::{CredentialSelection, select_credential};
pub use singleflight::Singleflight;
pub use store::{ConfigStore, MemoryConfigStore, StoreError};
