//! GitHub Copilot executor: dual-endpoint routing plus the two-level token
//! scheme (GitHub OAuth token -> short-lived Copilot token).

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use omniroute_protocol::Format;
use omniroute_provider_core::{
    ConnectionUpdate, ExecuteContext, ExecutionOutcome, Headers, ProviderConnection,
    ProviderError, ProviderExecutor, ProviderResult, UpstreamFailure, UpstreamHttpRequest,
    failure_from_response, header_set, provider_error_failure, set_bearer,
};
use omniroute_transform::registry::RequestContext;
use omniroute_transform::schema::sanitize_tools_for_github;

const DEFAULT_BASE_URL: &str = "https://api.githubcopilot.com";
const COPILOT_TOKEN_URL: &str = "https://api.github.com/copilot_internal/v2/token";
const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const GITHUB_CLIENT_ID: &str = "Iv1.b507a08c87ecfe98";
const CODEX_REROUTE_MARKER: &str = "not accessible via the /chat/completions endpoint";
const TOKEN_SLACK_SECS: i64 = 300;

#[derive(Debug, Default)]
pub struct GithubCopilotExecutor;

#[derive(Debug, Deserialize)]
struct CopilotTokenResponse {
    token: String,
    expires_at: i64,
}

impl GithubCopilotExecutor {
    pub fn new() -> Self {
        Self
    }

    fn base_url(connection: &ProviderConnection) -> String {
        connection
            .data_str("base_url")
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string()
    }

    fn copilot_token(connection: &ProviderConnection) -> ProviderResult<String> {
        connection
            .data_str("copilot_token")
            .map(|token| token.to_string())
            .ok_or(ProviderError::MissingCredentialField("copilot_token"))
    }

    fn known_codex_model(connection: &ProviderConnection, model: &str) -> bool {
        connection
            .provider_data
            .get("known_codex_models")
            .and_then(Value::as_array)
            .map(|models| models.iter().any(|m| m.as_str() == Some(model)))
            .unwrap_or(false)
    }

    async fn send(
        &self,
        ctx: &ExecuteContext,
        connection: &ProviderConnection,
        path: &str,
        body: &Value,
        stream: bool,
    ) -> Result<omniroute_provider_core::UpstreamHttpResponse, UpstreamFailure> {
        let url = format!("{}{path}", Self::base_url(connection));
        let headers = self
            .build_headers(connection, stream)
            .map_err(provider_error_failure)?;
        let payload = serde_json::to_vec(body).map_err(|err| {
            provider_error_failure(ProviderError::Other(format!("serialize body: {err}")))
        })?;
        ctx.client
            .send(UpstreamHttpRequest::post_json(
                url,
                headers,
                Bytes::from(payload),
                stream,
            ))
            .await
    }

    // The /responses endpoint always streams back; non-streaming clients
    // are collapsed by the engine.
    fn to_responses_body(model: &str, chat_body: &Value) -> Result<Value, UpstreamFailure> {
        let ctx = RequestContext {
            model,
            stream: true,
        };
        omniroute_transform::chat2responses::request::translate(&ctx, chat_body).map_err(|err| {
            provider_error_failure(ProviderError::Other(format!(
                "codex reroute translation: {err}"
            )))
        })
    }
}

#[async_trait]
impl ProviderExecutor for GithubCopilotExecutor {
    fn name(&self) -> &str {
        "github"
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
        Ok(format!("{}/chat/completions", Self::base_url(connection)))
    }

    fn build_headers(
        &self,
        connection: &ProviderConnection,
        _stream: bool,
    ) -> ProviderResult<Headers> {
        let token = Self::copilot_token(connection)?;
        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "content-type", "application/json");
        set_bearer(&mut headers, &token);
        header_set(&mut headers, "copilot-integration-id", "vscode-chat");
        header_set(&mut headers, "editor-version", "vscode/1.99.0");
        header_set(
            &mut headers,
            "editor-plugin-version",
            "copilot-chat/0.26.0",
        );
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
            if let Some(Value::Array(tools)) = map.get("tools") {
                let sanitized = sanitize_tools_for_github(tools);
                map.insert("tools".to_string(), Value::Array(sanitized));
            }
        }
        Ok(body)
    }

    /// The Copilot token is the one that authenticates chat calls; refresh
    /// whenever it is missing or inside the five-minute window, cascading a
    /// GitHub-token refresh first when that one has expired too.
    fn needs_refresh(&self, connection: &ProviderConnection, now_unix: i64) -> bool {
        let copilot_expiry = connection.data_i64("copilot_token_expires_at");
        match (connection.data_str("copilot_token"), copilot_expiry) {
            (None, _) => true,
            (Some(_), Some(expires_at)) => expires_at - now_unix < TOKEN_SLACK_SECS,
            (Some(_), None) => true,
        }
    }

    async fn refresh_credentials(
        &self,
        ctx: &ExecuteContext,
        connection: &ProviderConnection,
    ) -> ProviderResult<Option<ConnectionUpdate>> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let mut update = ConnectionUpdate::default();

        // Cascade: expired GitHub token first.
        let mut github_token = connection
            .access_token
            .clone()
            .ok_or(ProviderError::MissingCredentialField("access_token"))?;
        let github_expired = connection
            .expires_at
            .map(|at| at - now < TOKEN_SLACK_SECS)
            .unwrap_or(false);
        if github_expired {
            let refresh_token = connection
                .refresh_token
                .as_deref()
                .ok_or(ProviderError::MissingCredentialField("refresh_token"))?;
            let refreshed = crate::refresh::refresh_token_grant(
                ctx.client.as_ref(),
                GITHUB_TOKEN_URL,
                GITHUB_CLIENT_ID,
                None,
                refresh_token,
            )
            .await?;
            if let Some(token) = &refreshed.access_token {
                github_token = token.clone();
            }
            update.access_token = refreshed.access_token;
            update.refresh_token = refreshed.refresh_token;
            update.expires_at = refreshed.expires_at;
        }

        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "authorization", format!("token {github_token}"));
        header_set(&mut headers, "accept", "application/json");
        header_set(&mut headers, "editor-version", "vscode/1.99.0");
        let request = UpstreamHttpRequest {
            method: omniroute_provider_core::HttpMethod::Get,
            url: COPILOT_TOKEN_URL.to_string(),
            headers,
            body: None,
            is_stream: false,
            prefer_h2: false,
        };
        let response = ctx.client.send(request).await.map_err(|failure| {
            ProviderError::RefreshFailed(format!(
                "copilot token fetch: {}",
                failure.body_text()
            ))
        })?;
        let body = match response.body {
            omniroute_provider_core::UpstreamBody::Bytes(bytes) => bytes,
            omniroute_provider_core::UpstreamBody::Stream(_) => {
                return Err(ProviderError::RefreshFailed(
                    "unexpected streaming copilot token response".to_string(),
                ));
            }
        };
        if !(200..300).contains(&response.status) {
            return Err(ProviderError::RefreshFailed(format!(
                "copilot token endpoint returned {}",
                response.status
            )));
        }
        let parsed: CopilotTokenResponse = serde_json::from_slice(&body)
            .map_err(|err| ProviderError::RefreshFailed(format!("copilot token decode: {err}")))?;

        update.provider_data = Some(json!({
            "copilot_token": parsed.token,
            "copilot_token_expires_at": parsed.expires_at,
        }));
        Ok(Some(update))
    }

    async fn execute(
        &self,
        ctx: &ExecuteContext,
        connection: &ProviderConnection,
        model: &str,
        body: Value,
        stream: bool,
    ) -> Result<ExecutionOutcome, UpstreamFailure> {
        let chat_body = self
            .transform_request(connection, model, body, stream)
            .map_err(provider_error_failure)?;

        let known = ctx.runtime.is_known_codex_model(model).await
            || Self::known_codex_model(connection, model);
        if known {
            let responses_body = Self::to_responses_body(model, &chat_body)?;
            let response = self
                .send(ctx, connection, "/responses", &responses_body, true)
                .await?;
            if !response.is_success() {
                return Err(failure_from_response(response).await);
            }
            return Ok(ExecutionOutcome {
                response,
                response_format: Format::OpenaiResponses,
                retry_after_ms: None,
                connection_update: None,
            });
        }

        let response = self
            .send(ctx, connection, "/chat/completions", &chat_body, stream)
            .await?;
        if response.is_success() {
            return Ok(ExecutionOutcome {
                response,
                response_format: Format::OpenaiChat,
                retry_after_ms: None,
                connection_update: None,
            });
        }

        let failure = failure_from_response(response).await;
        let reroute = matches!(&failure, UpstreamFailure::Http { status: 400, body, .. }
            if String::from_utf8_lossy(body).contains(CODEX_REROUTE_MARKER));
        if !reroute {
            return Err(failure);
        }

        info!(
            event = "copilot_codex_reroute",
            trace_id = %ctx.trace_id,
            model = %model
        );
        ctx.runtime.remember_codex_model(model).await;
        let mut known_models: Vec<Value> = connection
            .provider_data
            .get("known_codex_models")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if !known_models.iter().any(|m| m.as_str() == Some(model)) {
            known_models.push(Value::String(model.to_string()));
        }

        let responses_body = Self::to_responses_body(model, &chat_body)?;
        let response = self
            .send(ctx, connection, "/responses", &responses_body, true)
            .await?;
        if !response.is_success() {
            return Err(failure_from_response(response).await);
        }
        Ok(ExecutionOutcome {
            response,
            response_format: Format::OpenaiResponses,
            retry_after_ms: None,
            connection_update: Some(ConnectionUpdate {
                provider_data: Some(json!({"known_codex_models": known_models})),
                ..ConnectionUpdate::default()
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omniroute_provider_core::ProviderKind;

    fn connection() -> ProviderConnection {
        let mut connection =
            ProviderConnection::new_api_key("gh-1", ProviderKind::Github, "unused");
        connection.access_token = Some("gho_token".to_string());
        connection.provider_data = json!({
            "copilot_token": "cop_token",
            "copilot_token_expires_at": 4_102_444_800i64,
        });
        connection
    }

    #[test]
    fn needs_refresh_when_copilot_token_missing_or_stale() {
        let exec = GithubCopilotExecutor::new();
        let now = 1_700_000_000;
        let mut fresh = connection();
        assert!(!exec.needs_refresh(&fresh, now));

        fresh.provider_data = json!({});
        assert!(exec.needs_refresh(&fresh, now));

        let mut stale = connection();
        stale.provider_data["copilot_token_expires_at"] = json!(now + 60);
        assert!(exec.needs_refresh(&stale, now));
    }

    #[test]
    fn headers_carry_copilot_token() {
        let exec = GithubCopilotExecutor::new();
        let headers = exec.build_headers(&connection(), true).unwrap();
        assert_eq!(
            omniroute_provider_core::header_get(&headers, "authorization"),
            Some("Bearer cop_token")
        );
        assert!(
            omniroute_provider_core::header_get(&headers, "copilot-integration-id").is_some()
        );
    }

    #[test]
    fn transform_sanitizes_tools() {
        let exec = GithubCopilotExecutor::new();
        let tools: Vec<Value> = (0..200)
            .map(|i| json!({"type": "function", "function": {"name": format!("t{i}")}}))
            .collect();
        let body = exec
            .transform_request(
                &connection(),
                "gpt-4o",
                json!({"messages": [], "tools": tools}),
                true,
            )
            .unwrap();
        assert_eq!(body["tools"].as_array().unwrap().len(), 128);
    }

    #[test]
    fn known_codex_models_read_from_provider_data() {
        let mut conn = connection();
        conn.provider_data["known_codex_models"] = json!(["gpt-5.1-codex"]);
        assert!(GithubCopilotExecutor::known_codex_model(&conn, "gpt-5.1-codex"));
        assert!(!GithubCopilotExecutor::known_codex_model(&conn, "gpt-4o"));
    }
}
