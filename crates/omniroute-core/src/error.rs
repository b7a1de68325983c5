use bytes::Bytes;

use omniroute_protocol::error::{ErrorEnvelope, ErrorType};
use omniroute_provider_core::{Headers, UpstreamFailure, header_set};

/// A terminal gateway error carrying the HTTP status and the wire envelope.
#[derive(Debug, Clone)]
pub struct GatewayError {
    pub status: u16,
    pub envelope: ErrorEnvelope,
    /// Seconds, rendered as a `Retry-After` header (429 only).
    pub retry_after_secs: Option<i64>,
    /// Raw upstream body for verbatim passthrough; replaces the envelope
    /// when present.
    pub passthrough_body: Option<Bytes>,
}

impl GatewayError {
    pub fn new(status: u16, kind: ErrorType, message: impl Into<String>) -> Self {
        Self {
            status,
            envelope: ErrorEnvelope::new(kind, message),
            retry_after_secs: None,
            passthrough_body: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(400, ErrorType::InvalidRequestError, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(401, ErrorType::AuthenticationError, message)
    }

    pub fn no_credentials(provider: &str) -> Self {
        Self::invalid_request(format!("no credentials configured for provider {provider}"))
    }

    pub fn all_rate_limited(retry_after_secs: i64, last_error: Option<String>) -> Self {
        let message = match last_error {
            Some(detail) => format!("all accounts are rate limited: {detail}"),
            None => "all accounts are rate limited".to_string(),
        };
        Self {
            status: 429,
            envelope: ErrorEnvelope::new(ErrorType::RateLimitError, message),
            retry_after_secs: Some(retry_after_secs.max(1)),
            passthrough_body: None,
        }
    }

    pub fn translator_failure(chunk_kind: &str) -> Self {
        let mut err = Self::new(
            502,
            ErrorType::ServerError,
            "stream translation failed for a mandatory chunk",
        );
        err.envelope = err.envelope.with_code(chunk_kind);
        err
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(500, ErrorType::ServerError, message)
    }

    /// Verbatim passthrough of a non-retryable upstream failure.
    pub fn upstream_passthrough(failure: &UpstreamFailure) -> Self {
        match failure {
            UpstreamFailure::Http { status, body, .. } => Self {
                status: *status,
                envelope: ErrorEnvelope::new(
                    type_for_status(*status),
                    String::from_utf8_lossy(body).to_string(),
                ),
                retry_after_secs: if *status == 429 { Some(1) } else { None },
                passthrough_body: Some(body.clone()),
            },
            UpstreamFailure::Transport { message, .. } => Self {
                status: 502,
                envelope: ErrorEnvelope::new(ErrorType::ServerError, message.clone()),
                retry_after_secs: None,
                passthrough_body: None,
            },
        }
    }

    /// The last upstream status after every account failed.
    pub fn upstream_exhausted(failure: &UpstreamFailure) -> Self {
        let mut err = Self::upstream_passthrough(failure);
        if err.status == 429 && err.retry_after_secs.is_none() {
            err.retry_after_secs = Some(1);
        }
        err
    }

    pub fn body_bytes(&self) -> Bytes {
        match &self.passthrough_body {
            Some(body) if !body.is_empty() => body.clone(),
            _ => Bytes::from(self.envelope.to_json()),
        }
    }

    pub fn headers(&self) -> Headers {
        let mut headers: Headers = Vec::new();
        let content_type = match &self.passthrough_body {
            Some(body) if !body.is_empty() => {
                if body.first() == Some(&b'{') {
                    "application/json"
                } else {
                    "text/plain; charset=utf-8"
                }
            }
            _ => "application/json",
        };
        header_set(&mut headers, "content-type", content_type);
        if let Some(secs) = self.retry_after_secs {
            header_set(&mut headers, "retry-after", secs.max(1).to_string());
        }
        headers
    }
}

fn type_for_status(status: u16) -> ErrorType {
    match status {
        401 => ErrorType::AuthenticationError,
        403 => ErrorType::PermissionError,
        429 => ErrorType::RateLimitError,
        400..=499 => ErrorType::InvalidRequestError,
        _ => ErrorType::ServerError,
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status, self.envelope.error.message)
    }
}

impl std::error::Error for GatewayError {}
