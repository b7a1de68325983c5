//! Shared OAuth refresh-grant plumbing.

use serde::Deserialize;
use serde_json::Value;

use omniroute_provider_core::{
    ConnectionUpdate, ProviderError, ProviderResult, UpstreamClient, UpstreamFailure,
};
use omniroute_provider_core::{Headers, HttpMethod, UpstreamBody, UpstreamHttpRequest, header_set};

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub id_token: Option<String>,
}

/// POST a `grant_type=refresh_token` form and map the result into a
/// field-wise connection update. The update never clears the stored refresh
/// token: a response without one keeps the old value.
pub async fn refresh_token_grant(
    client: &dyn UpstreamClient,
    token_url: &str,
    client_id: &str,
    client_secret: Option<&str>,
    refresh_token: &str,
) -> ProviderResult<ConnectionUpdate> {
    let mut form = format!(
        "grant_type=refresh_token&client_id={}&refresh_token={}",
        urlencode(client_id),
        urlencode(refresh_token)
    );
    if let Some(secret) = client_secret {
        form.push_str("&client_secret=");
        form.push_str(&urlencode(secret));
    }

    let mut headers: Headers = Vec::new();
    header_set(
        &mut headers,
        "content-type",
        "application/x-www-form-urlencoded",
    );
    header_set(&mut headers, "accept", "application/json");

    let request = UpstreamHttpRequest {
        method: HttpMethod::Post,
        url: token_url.to_string(),
        headers,
        body: Some(bytes::Bytes::from(form)),
        is_stream: false,
        prefer_h2: false,
    };

    let response = client.send(request).await.map_err(|failure| match failure {
        UpstreamFailure::Transport { message, .. } => ProviderError::RefreshFailed(message),
        UpstreamFailure::Http { status, body, .. } => ProviderError::RefreshFailed(format!(
            "token endpoint returned {status}: {}",
            String::from_utf8_lossy(&body)
        )),
    })?;

    let body = match response.body {
        UpstreamBody::Bytes(bytes) => bytes,
        UpstreamBody::Stream(_) => {
            return Err(ProviderError::RefreshFailed(
                "unexpected streaming token response".to_string(),
            ));
        }
    };
    if !(200..300).contains(&response.status) {
        return Err(ProviderError::RefreshFailed(format!(
            "token endpoint returned {}: {}",
            response.status,
            String::from_utf8_lossy(&body)
        )));
    }

    let parsed: TokenResponse = serde_json::from_slice(&body)
        .map_err(|err| ProviderError::RefreshFailed(format!("token response decode: {err}")))?;
    if parsed.access_token.is_empty() {
        return Err(ProviderError::RefreshFailed(
            "token response missing access_token".to_string(),
        ));
    }

    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    Ok(ConnectionUpdate {
        access_token: Some(parsed.access_token),
        refresh_token: parsed.refresh_token,
        expires_at: parsed.expires_in.map(|secs| now + secs),
        id_token: parsed.id_token,
        ..ConnectionUpdate::default()
    })
}

/// Decode the payload segment of a JWT without verifying it; used to pull
/// account metadata out of id tokens.
pub fn decode_jwt_claims(token: &str) -> Option<Value> {
    use base64::Engine;
    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

pub fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
