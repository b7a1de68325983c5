//! Kiro executor: AWS CodeWhisperer-backed OpenAI-compatible upstream with
//! OAuth 2.0 device-code credential acquisition.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use omniroute_protocol::Format;
use omniroute_provider_core::{
    ConnectionUpdate, ExecuteContext, Headers, ProviderConnection, ProviderError,
    ProviderExecutor, ProviderResult, UpstreamBody, UpstreamClient, UpstreamHttpRequest,
    header_set, set_bearer,
};

const DEFAULT_BASE_URL: &str = "https://codewhisperer.us-east-1.amazonaws.com/v1";
const DEVICE_AUTH_URL: &str = "https://oidc.us-east-1.amazonaws.com/device_authorization";
const DEVICE_TOKEN_URL: &str = "https://oidc.us-east-1.amazonaws.com/token";
const DEVICE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    pub expires_in: i64,
    #[serde(default = "default_interval")]
    pub interval: i64,
}

fn default_interval() -> i64 {
    5
}

/// Begin the device-code flow; the caller shows `user_code` /
/// `verification_uri` to the operator and then polls `poll_device_token`.
pub async fn start_device_authorization(
    client: &dyn UpstreamClient,
    client_id: &str,
) -> ProviderResult<DeviceAuthorization> {
    let body = format!(
        "client_id={}&scopes=codewhisperer:completions",
        crate::refresh::urlencode(client_id)
    );
    let response = post_form(client, DEVICE_AUTH_URL, body).await?;
    serde_json::from_slice(&response)
        .map_err(|err| ProviderError::Other(format!("device authorization decode: {err}")))
}

/// One poll of the token endpoint. `Ok(None)` means authorization is still
/// pending.
pub async fn poll_device_token(
    client: &dyn UpstreamClient,
    client_id: &str,
    device_code: &str,
) -> ProviderResult<Option<ConnectionUpdate>> {
    let body = format!(
        "grant_type={}&client_id={}&device_code={}",
        crate::refresh::urlencode(DEVICE_GRANT),
        crate::refresh::urlencode(client_id),
        crate::refresh::urlencode(device_code)
    );
    let bytes = match post_form(client, DEVICE_TOKEN_URL, body).await {
        Ok(bytes) => bytes,
        Err(ProviderError::RefreshFailed(message)) if message.contains("authorization_pending") => {
            return Ok(None);
        }
        Err(err) => return Err(err),
    };
    let parsed: crate::refresh::TokenResponse = serde_json::from_slice(&bytes)
        .map_err(|err| ProviderError::Other(format!("device token decode: {err}")))?;
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    Ok(Some(ConnectionUpdate {
        access_token: Some(parsed.access_token),
        refresh_token: parsed.refresh_token,
        expires_at: parsed.expires_in.map(|secs| now + secs),
        ..ConnectionUpdate::default()
    }))
}

async fn post_form(
    client: &dyn UpstreamClient,
    url: &str,
    form: String,
) -> ProviderResult<Bytes> {
    let mut headers: Headers = Vec::new();
    header_set(
        &mut headers,
        "content-type",
        "application/x-www-form-urlencoded",
    );
    let request = UpstreamHttpRequest::post_json(url, headers, Bytes::from(form), false);
    let response = client
        .send(request)
        .await
        .map_err(|failure| ProviderError::RefreshFailed(failure.body_text()))?;
    let bytes = match response.body {
        UpstreamBody::Bytes(bytes) => bytes,
        UpstreamBody::Stream(_) => {
            return Err(ProviderError::Other("unexpected stream".to_string()));
        }
    };
    if !(200..300).contains(&response.status) {
        return Err(ProviderError::RefreshFailed(
            String::from_utf8_lossy(&bytes).to_string(),
        ));
    }
    Ok(bytes)
}

#[derive(Debug, Default)]
pub struct KiroExecutor;

impl KiroExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProviderExecutor for KiroExecutor {
    fn name(&self) -> &str {
        "kiro"
    }

    fn wire_format(&self) -> Format {
        Format::OpenaiChat
    }

    fn build_url(
        &self,
        connection: &ProviderConnection,
        _model: &str,
        _stream: bool,
    ) -> ProviderResult<String> {
        let base = connection
            .data_str("base_url")
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        Ok(format!("{base}/chat/completions"))
    }

    fn build_headers(
        &self,
        connection: &ProviderConnection,
        _stream: bool,
    ) -> ProviderResult<Headers> {
        let token = connection
            .access_token
            .as_deref()
            .ok_or(ProviderError::MissingCredentialField("access_token"))?;
        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "content-type", "application/json");
        set_bearer(&mut headers, token);
        Ok(headers)
    }

    fn transform_request(
        &self,
        _connection: &ProviderConnection,
        model: &str,
        mut body: Value,
        stream: bool,
    ) -> ProviderResult<Value> {
        if let Some(map) = body.as_object_mut() {
            map.insert("model".to_string(), Value::String(model.to_string()));
            if stream {
                map.insert("stream".to_string(), Value::Bool(true));
            } else {
                map.remove("stream");
            }
        }
        Ok(body)
    }

    async fn refresh_credentials(
        &self,
        ctx: &ExecuteContext,
        connection: &ProviderConnection,
    ) -> ProviderResult<Option<ConnectionUpdate>> {
        let refresh_token = connection
            .refresh_token
            .as_deref()
            .ok_or(ProviderError::MissingCredentialField("refresh_token"))?;
        let client_id = connection
            .data_str("client_id")
            .ok_or(ProviderError::MissingCredentialField("client_id"))?;
        let update = crate::refresh::refresh_token_grant(
            ctx.client.as_ref(),
            DEVICE_TOKEN_URL,
            client_id,
            None,
            refresh_token,
        )
        .await?;
        Ok(Some(update))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omniroute_provider_core::ProviderKind;

    #[test]
    fn url_defaults_to_codewhisperer() {
        let exec = KiroExecutor::new();
        let mut connection = ProviderConnection::new_api_key("kr", ProviderKind::Kiro, "x");
        connection.access_token = Some("t".to_string());
        assert_eq!(
            exec.build_url(&connection, "m", false).unwrap(),
            "https://codewhisperer.us-east-1.amazonaws.com/v1/chat/completions"
        );
        let headers = exec.build_headers(&connection, false).unwrap();
        assert_eq!(
            omniroute_provider_core::header_get(&headers, "authorization"),
            Some("Bearer t")
        );
    }
}
