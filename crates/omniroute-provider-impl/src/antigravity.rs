//! Antigravity / Gemini CLI executor: Google OAuth accounts calling the
//! Cloud Code companion API, with project-id onboarding and quota-reset
//! parsing.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use omniroute_protocol::Format;
use omniroute_provider_core::{
    ConnectionUpdate, ExecuteContext, ExecutionOutcome, Headers, ProviderConnection,
    ProviderError, ProviderExecutor, ProviderKind, ProviderResult, UpstreamBody, UpstreamClient,
    UpstreamFailure, UpstreamHttpRequest, failure_from_response, header_set,
    provider_error_failure, set_bearer,
};

const DEFAULT_BASE_URL: &str = "https://cloudcode-pa.googleapis.com";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GEMINI_CLI_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const GEMINI_CLI_CLIENT_SECRET: &str = "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";

const ONBOARD_MAX_ATTEMPTS: u32 = 5;
const ONBOARD_POLL_DELAY: Duration = Duration::from_secs(2);

/// Parse human-readable quota reset durations (`reset after 2h7m23s`) into
/// milliseconds.
pub fn parse_quota_reset_ms(text: &str) -> Option<u64> {
    let idx = text.find("reset after ")?;
    let rest = &text[idx + "reset after ".len()..];
    let mut total_ms: u64 = 0;
    let mut number = String::new();
    let mut matched = false;
    for ch in rest.chars() {
        if ch.is_ascii_digit() {
            number.push(ch);
            continue;
        }
        let unit_ms = match ch {
            'h' => 3_600_000,
            'm' => 60_000,
            's' => 1_000,
            _ => break,
        };
        let value: u64 = number.parse().ok()?;
        number.clear();
        total_ms += value * unit_ms;
        matched = true;
    }
    matched.then_some(total_ms)
}

/// Serves both `antigravity` and `gemini-cli` connections; the request wrap
/// differs slightly per kind.
pub struct AntigravityExecutor {
    kind: ProviderKind,
    name: String,
}

impl AntigravityExecutor {
    pub fn new(kind: ProviderKind) -> Self {
        let name = kind.as_str().to_string();
        Self { kind, name }
    }

    fn base_url(connection: &ProviderConnection) -> String {
        connection
            .data_str("base_url")
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string()
    }

    fn access_token(connection: &ProviderConnection) -> ProviderResult<&str> {
        connection
            .access_token
            .as_deref()
            .ok_or(ProviderError::MissingCredentialField("access_token"))
    }

    /// Resolve the Google project id: connection binding first, then the
    /// runtime cache, then the loadCodeAssist/onboardUser dance.
    async fn project_id(
        &self,
        ctx: &ExecuteContext,
        connection: &ProviderConnection,
    ) -> Result<(String, Option<ConnectionUpdate>), UpstreamFailure> {
        if let Some(project) = connection.project_id.as_deref() {
            return Ok((project.to_string(), None));
        }
        let base = Self::base_url(connection);
        let token = Self::access_token(connection)
            .map_err(provider_error_failure)?
            .to_string();
        let client = ctx.client.clone();
        let resolved = ctx
            .runtime
            .resolve_project_id(&connection.id, move || {
                fetch_project_id(client, base, token)
            })
            .await
            .map_err(|message| UpstreamFailure::Transport {
                kind: omniroute_provider_core::UpstreamTransportErrorKind::Other,
                message,
            })?;
        let update = ConnectionUpdate {
            project_id: Some(resolved.clone()),
            ..ConnectionUpdate::default()
        };
        Ok((resolved, Some(update)))
    }
}

async fn post_internal(
    client: &dyn UpstreamClient,
    base: &str,
    token: &str,
    method: &str,
    body: &Value,
) -> Result<Value, String> {
    let mut headers: Headers = Vec::new();
    header_set(&mut headers, "content-type", "application/json");
    set_bearer(&mut headers, token);
    let request = UpstreamHttpRequest::post_json(
        format!("{base}/v1internal:{method}"),
        headers,
        Bytes::from(serde_json::to_vec(body).map_err(|err| err.to_string())?),
        false,
    );
    let send = client.send(request);
    let response = tokio::time::timeout(Duration::from_secs(30), send)
        .await
        .map_err(|_| format!("{method} timed out"))?
        .map_err(|failure| failure.body_text())?;
    let bytes = match response.body {
        UpstreamBody::Bytes(bytes) => bytes,
        UpstreamBody::Stream(_) => return Err(format!("{method}: unexpected stream")),
    };
    if !(200..300).contains(&response.status) {
        return Err(format!(
            "{method} returned {}: {}",
            response.status,
            String::from_utf8_lossy(&bytes)
        ));
    }
    serde_json::from_slice(&bytes).map_err(|err| format!("{method} decode: {err}"))
}

/// `loadCodeAssist`, falling back to `onboardUser` polling until the
/// operation reports `done=true`.
async fn fetch_project_id(
    client: std::sync::Arc<dyn UpstreamClient>,
    base: String,
    token: String,
) -> Result<String, String> {
    let loaded = post_internal(
        client.as_ref(),
        &base,
        &token,
        "loadCodeAssist",
        &json!({"metadata": client_metadata()}),
    )
    .await?;
    if let Some(project) = loaded
        .get("cloudaicompanionProject")
        .and_then(Value::as_str)
    {
        return Ok(project.to_string());
    }

    let tier_id = loaded
        .get("allowedTiers")
        .and_then(Value::as_array)
        .and_then(|tiers| {
            tiers
                .iter()
                .find(|tier| tier.get("isDefault").and_then(Value::as_bool) == Some(true))
        })
        .and_then(|tier| tier.get("id"))
        .and_then(Value::as_str)
        .unwrap_or("free-tier")
        .to_string();

    for attempt in 1..=ONBOARD_MAX_ATTEMPTS {
        let operation = post_internal(
            client.as_ref(),
            &base,
            &token,
            "onboardUser",
            &json!({"tierId": tier_id, "metadata": client_metadata()}),
        )
        .await?;
        if operation.get("done").and_then(Value::as_bool) == Some(true) {
            let project = operation
                .get("response")
                .and_then(|r| r.get("cloudaicompanionProject"))
                .and_then(|p| p.get("id"))
                .and_then(Value::as_str)
                .ok_or_else(|| "onboardUser finished without a project id".to_string())?;
            return Ok(project.to_string());
        }
        debug!(event = "onboard_user_pending", attempt = attempt);
        tokio::time::sleep(ONBOARD_POLL_DELAY).await;
    }
    Err("onboardUser did not complete".to_string())
}

fn client_metadata() -> Value {
    json!({"ideType": "IDE_UNSPECIFIED", "platform": "PLATFORM_UNSPECIFIED", "pluginType": "GEMINI"})
}

#[async_trait]
impl ProviderExecutor for AntigravityExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn wire_format(&self) -> Format {
        Format::Gemini
    }

    fn build_url(
        &self,
        connection: &ProviderConnection,
        _model: &str,
        stream: bool,
    ) -> ProviderResult<String> {
        let base = Self::base_url(connection);
        let verb = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        Ok(format!("{base}/v1internal:{verb}"))
    }

    fn build_headers(
        &self,
        connection: &ProviderConnection,
        _stream: bool,
    ) -> ProviderResult<Headers> {
        let token = Self::access_token(connection)?;
        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "content-type", "application/json");
        set_bearer(&mut headers, token);
        header_set(&mut headers, "user-agent", "GeminiCLI/0.1.5 (linux; x64)");
        Ok(headers)
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
            .unwrap_or(GEMINI_CLI_CLIENT_ID);
        let client_secret = connection
            .data_str("client_secret")
            .unwrap_or(GEMINI_CLI_CLIENT_SECRET);
        let update = crate::refresh::refresh_token_grant(
            ctx.client.as_ref(),
            GOOGLE_TOKEN_URL,
            client_id,
            Some(client_secret),
            refresh_token,
        )
        .await?;
        Ok(Some(update))
    }

    fn retry_after_hint(&self, failure: &UpstreamFailure) -> Option<u64> {
        parse_quota_reset_ms(&failure.body_text())
    }

    async fn execute(
        &self,
        ctx: &ExecuteContext,
        connection: &ProviderConnection,
        model: &str,
        body: Value,
        stream: bool,
    ) -> Result<ExecutionOutcome, UpstreamFailure> {
        let (project, project_update) = self.project_id(ctx, connection).await?;

        // The companion API wraps the plain generateContent body.
        let mut wrapped = json!({
            "model": model,
            "project": project,
            "request": body,
        });
        if matches!(self.kind, ProviderKind::GeminiCli) {
            wrapped["user_prompt_id"] = Value::String(Uuid::new_v4().to_string());
        }

        let url = self
            .build_url(connection, model, stream)
            .map_err(provider_error_failure)?;
        let headers = self
            .build_headers(connection, stream)
            .map_err(provider_error_failure)?;
        let payload = serde_json::to_vec(&wrapped).map_err(|err| {
            provider_error_failure(ProviderError::Other(format!("serialize body: {err}")))
        })?;
        let response = ctx
            .client
            .send(UpstreamHttpRequest::post_json(
                url,
                headers,
                Bytes::from(payload),
                stream,
            ))
            .await?;
        if !response.is_success() {
            let failure = failure_from_response(response).await;
            if let Some(ms) = self.retry_after_hint(&failure) {
                warn!(
                    event = "quota_exhausted",
                    trace_id = %ctx.trace_id,
                    provider = %self.name,
                    retry_after_ms = ms
                );
            }
            return Err(failure);
        }
        Ok(ExecutionOutcome {
            response,
            response_format: Format::Gemini,
            retry_after_ms: None,
            connection_update: project_update,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_reset_parses_compound_durations() {
        assert_eq!(
            parse_quota_reset_ms("quota exceeded, reset after 2h7m23s"),
            Some(7_643_000)
        );
        assert_eq!(parse_quota_reset_ms("reset after 45s"), Some(45_000));
        assert_eq!(parse_quota_reset_ms("reset after 3m"), Some(180_000));
        assert_eq!(parse_quota_reset_ms("no match"), None);
        assert_eq!(parse_quota_reset_ms("reset after soon"), None);
    }

    #[test]
    fn stream_url_uses_sse_alt() {
        let exec = AntigravityExecutor::new(ProviderKind::Antigravity);
        let mut connection =
            ProviderConnection::new_api_key("ag", ProviderKind::Antigravity, "x");
        connection.access_token = Some("t".to_string());
        assert_eq!(
            exec.build_url(&connection, "gemini-3-pro", true).unwrap(),
            "https://cloudcode-pa.googleapis.com/v1internal:streamGenerateContent?alt=sse"
        );
    }
}
