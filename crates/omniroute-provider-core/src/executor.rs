use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use omniroute_protocol::Format;

use crate::errors::{ProviderError, ProviderResult};
use crate::headers::Headers;
use crate::machine::{ConnectionUpdate, ProviderConnection};
use crate::runtime::ProviderRuntime;

pub type ByteStream = tokio::sync::mpsc::Receiver<Bytes>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
    /// Ask the client for HTTP/2 prior knowledge (Cursor Connect-RPC).
    pub prefer_h2: bool,
}

impl UpstreamHttpRequest {
    pub fn post_json(url: impl Into<String>, headers: Headers, body: Bytes, stream: bool) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers,
            body: Some(body),
            is_stream: stream,
            prefer_h2: false,
        }
    }
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

impl UpstreamHttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UpstreamTransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    /// Transport-level failure; no HTTP response was received.
    Transport {
        kind: UpstreamTransportErrorKind,
        message: String,
    },
    /// Non-2xx HTTP response captured as bytes.
    Http {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
}

impl UpstreamFailure {
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamFailure::Http { status, .. } => Some(*status),
            UpstreamFailure::Transport { .. } => None,
        }
    }

    pub fn body_text(&self) -> String {
        match self {
            UpstreamFailure::Http { body, .. } => String::from_utf8_lossy(body).to_string(),
            UpstreamFailure::Transport { message, .. } => message.clone(),
        }
    }
}

/// Resolves the executor for a provider tag. Implemented by the executor
/// registry in provider-impl; the engine only sees this trait.
pub trait ExecutorLookup: Send + Sync {
    fn executor(&self, kind: &crate::kind::ProviderKind) -> Option<std::sync::Arc<dyn ProviderExecutor>>;
}

/// Performs the actual upstream IO. Implemented over wreq in provider-impl;
/// scripted in tests.
pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>;
}

/// Everything an executor needs to build and send one attempt. Owned so the
/// engine's retry loop can mint one per attempt without lifetime threading.
#[derive(Clone)]
pub struct ExecuteContext {
    pub trace_id: String,
    pub machine_id: String,
    pub runtime: std::sync::Arc<ProviderRuntime>,
    pub client: std::sync::Arc<dyn UpstreamClient>,
    pub attempt_no: u32,
}

/// Per-provider adapter: URL, headers, signing, request transform, token
/// refresh. The wire body arrives already translated into the executor's
/// dialect (`wire_format`).
#[async_trait]
pub trait ProviderExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// The dialect this provider's chat endpoint speaks.
    fn wire_format(&self) -> Format;

    fn build_url(
        &self,
        connection: &ProviderConnection,
        model: &str,
        stream: bool,
    ) -> ProviderResult<String>;

    fn build_headers(
        &self,
        connection: &ProviderConnection,
        stream: bool,
    ) -> ProviderResult<Headers>;

    /// Provider-specific body rewrite applied after dialect translation.
    fn transform_request(
        &self,
        _connection: &ProviderConnection,
        _model: &str,
        body: Value,
        _stream: bool,
    ) -> ProviderResult<Value> {
        Ok(body)
    }

    /// Build and send one attempt. The default covers plain JSON-over-HTTPS
    /// providers; executors with bespoke transports (Cursor) or endpoint
    /// fallbacks (GitHub Copilot) override it.
    async fn execute(
        &self,
        ctx: &ExecuteContext,
        connection: &ProviderConnection,
        model: &str,
        body: Value,
        stream: bool,
    ) -> Result<ExecutionOutcome, UpstreamFailure> {
        let body = self
            .transform_request(connection, model, body, stream)
            .map_err(provider_error_failure)?;
        let url = self
            .build_url(connection, model, stream)
            .map_err(provider_error_failure)?;
        let headers = self
            .build_headers(connection, stream)
            .map_err(provider_error_failure)?;
        let payload = serde_json::to_vec(&body).map_err(|err| UpstreamFailure::Transport {
            kind: UpstreamTransportErrorKind::Other,
            message: format!("serialize request body: {err}"),
        })?;
        let request =
            UpstreamHttpRequest::post_json(url, headers, Bytes::from(payload), stream);
        let response = ctx.client.send(request).await?;
        if !response.is_success() {
            return Err(failure_from_response(response).await);
        }
        Ok(ExecutionOutcome {
            response,
            response_format: self.wire_format(),
            retry_after_ms: None,
            connection_update: None,
        })
    }

    /// Proactive refresh check. Default: token expires within five minutes.
    fn needs_refresh(&self, connection: &ProviderConnection, now_unix: i64) -> bool {
        match connection.expires_at {
            Some(expires_at) => expires_at - now_unix < 300,
            None => false,
        }
    }

    /// Refresh credentials, returning the fields that changed. `Ok(None)`
    /// means nothing to refresh for this auth type.
    async fn refresh_credentials(
        &self,
        _ctx: &ExecuteContext,
        _connection: &ProviderConnection,
    ) -> ProviderResult<Option<ConnectionUpdate>> {
        Ok(None)
    }

    /// Provider-specific recovery hint parsed from an error body
    /// (Antigravity quota messages). Milliseconds, used verbatim.
    fn retry_after_hint(&self, _failure: &UpstreamFailure) -> Option<u64> {
        None
    }

    /// Embeddings endpoint, where the provider has one (OpenAI-shaped
    /// upstreams only).
    fn build_embeddings_url(&self, _connection: &ProviderConnection) -> ProviderResult<String> {
        Err(ProviderError::Unsupported("embeddings"))
    }
}

/// A successful upstream call plus what the engine needs to translate it
/// back.
pub struct ExecutionOutcome {
    pub response: UpstreamHttpResponse,
    /// Dialect of the response body/stream (Copilot's /responses reroute
    /// differs from its request format).
    pub response_format: Format,
    pub retry_after_ms: Option<u64>,
    /// State the executor learned during the call (rerouted models, rotated
    /// short-lived tokens); the engine persists it through the ConfigStore.
    pub connection_update: Option<ConnectionUpdate>,
}

pub fn provider_error_failure(err: ProviderError) -> UpstreamFailure {
    UpstreamFailure::Transport {
        kind: UpstreamTransportErrorKind::Other,
        message: err.to_string(),
    }
}

/// Drain a non-2xx response into an `UpstreamFailure::Http`.
pub async fn failure_from_response(response: UpstreamHttpResponse) -> UpstreamFailure {
    let status = response.status;
    let headers = response.headers;
    let body = match response.body {
        UpstreamBody::Bytes(bytes) => bytes,
        UpstreamBody::Stream(mut rx) => {
            let mut collected = Vec::new();
            while let Some(chunk) = rx.recv().await {
                collected.extend_from_slice(&chunk);
                if collected.len() > 1 << 20 {
                    break;
                }
            }
            Bytes::from(collected)
        }
    };
    UpstreamFailure::Http {
        status,
        headers,
        body,
    }
}
