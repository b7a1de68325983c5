//! wreq-backed implementation of `UpstreamClient`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use wreq::{Client, Method, Proxy};

use omniroute_provider_core::{
    Headers, HttpMethod, UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse, UpstreamTransportErrorKind,
};

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    /// Whole-request ceiling for streaming calls.
    pub stream_timeout: Duration,
    /// Whole-request ceiling for non-streaming calls.
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(5),
            stream_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(60),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Clients are cached per (proxy, h2) pair; Cursor asks for HTTP/2 prior
/// knowledge and falls back to HTTP/1.1 if the build fails.
#[derive(Clone)]
pub struct WreqUpstreamClient {
    config: UpstreamClientConfig,
    clients: Arc<Mutex<HashMap<ClientKey, Client>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    proxy: Option<String>,
    h2_prior_knowledge: bool,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let client = Self {
            config,
            clients: Arc::new(Mutex::new(HashMap::new())),
        };
        // Build the default client eagerly so bad proxy URLs fail at startup.
        client.client_for(false)?;
        Ok(client)
    }

    fn client_for(&self, prefer_h2: bool) -> Result<Client, wreq::Error> {
        let key = ClientKey {
            proxy: normalize_proxy(self.config.proxy.clone()),
            h2_prior_knowledge: prefer_h2,
        };
        if let Ok(guard) = self.clients.lock()
            && let Some(client) = guard.get(&key)
        {
            return Ok(client.clone());
        }
        let client = build_client(&self.config, key.proxy.as_deref(), prefer_h2)?;
        if let Ok(mut guard) = self.clients.lock() {
            guard.insert(key, client.clone());
        }
        Ok(client)
    }
}

fn normalize_proxy(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

fn build_client(
    config: &UpstreamClientConfig,
    proxy: Option<&str>,
    prefer_h2: bool,
) -> Result<Client, wreq::Error> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.stream_idle_timeout);
    if prefer_h2 {
        builder = builder.http2_only();
    }
    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }
    builder.build()
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            let client = match self.client_for(req.prefer_h2) {
                Ok(client) => client,
                // HTTP/2 unavailable: retry the build over HTTP/1.1.
                Err(_) if req.prefer_h2 => {
                    self.client_for(false).map_err(map_wreq_error)?
                }
                Err(err) => return Err(map_wreq_error(err)),
            };

            let method = match req.method {
                HttpMethod::Get => Method::GET,
                HttpMethod::Post => Method::POST,
                HttpMethod::Put => Method::PUT,
                HttpMethod::Delete => Method::DELETE,
            };
            let mut builder = client.request(method, &req.url);
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = req.body.clone() {
                builder = builder.body(body);
            }
            let timeout = if req.is_stream {
                self.config.stream_timeout
            } else {
                self.config.request_timeout
            };
            builder = builder.timeout(timeout);

            let response = builder.send().await.map_err(map_wreq_error)?;
            convert_response(response, req.is_stream, self.config.stream_idle_timeout).await
        })
    }
}

async fn convert_response(
    response: wreq::Response,
    want_stream: bool,
    idle_timeout: Duration,
) -> Result<UpstreamHttpResponse, UpstreamFailure> {
    let status = response.status().as_u16();
    let headers = headers_from_wreq(response.headers());

    let is_success = (200..300).contains(&status);
    if !is_success || !want_stream {
        let body = response.bytes().await.map_err(map_wreq_error)?;
        return Ok(UpstreamHttpResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(body),
        });
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::time::timeout(idle_timeout, stream.next()).await;
            let Ok(item) = next else {
                break;
            };
            let Some(Ok(chunk)) = item else {
                break;
            };
            if tx.send(chunk).await.is_err() {
                // Downstream hung up; dropping the stream aborts upstream.
                break;
            }
        }
    });

    Ok(UpstreamHttpResponse {
        status,
        headers,
        body: UpstreamBody::Stream(rx),
    })
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (name, value) in map {
        if let Ok(text) = value.to_str() {
            out.push((name.as_str().to_string(), text.to_string()));
        }
    }
    out
}

fn map_wreq_error(err: wreq::Error) -> UpstreamFailure {
    UpstreamFailure::Transport {
        kind: classify_wreq_error(&err),
        message: err.to_string(),
    }
}

fn classify_wreq_error(err: &wreq::Error) -> UpstreamTransportErrorKind {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        if message.contains("read") || message.contains("idle") {
            return UpstreamTransportErrorKind::ReadTimeout;
        }
        return UpstreamTransportErrorKind::Timeout;
    }
    if err.is_connect() {
        if message.contains("dns") || message.contains("resolve") {
            return UpstreamTransportErrorKind::Dns;
        }
        if message.contains("tls") || message.contains("ssl") {
            return UpstreamTransportErrorKind::Tls;
        }
        return UpstreamTransportErrorKind::Connect;
    }
    if message.contains("tls") || message.contains("ssl") {
        return UpstreamTransportErrorKind::Tls;
    }
    UpstreamTransportErrorKind::Other
}
