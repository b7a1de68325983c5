//! Codex executor (OpenAI Responses API behind a ChatGPT account).

use async_trait::async_trait;
use serde_json::{Value, json};
use uuid::Uuid;

use omniroute_protocol::Format;
use omniroute_provider_core::{
    ConnectionUpdate, ExecuteContext, Headers, ProviderConnection, ProviderError,
    ProviderExecutor, ProviderResult, header_set, set_bearer,
};

const DEFAULT_BASE_URL: &str = "https://chatgpt.com/backend-api/codex";
const TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

const DEFAULT_INSTRUCTIONS: &str = "You are a coding agent. Answer precisely and prefer \
minimal, correct diffs over prose.";

/// Parameters the Codex upstream rejects outright.
const DISALLOWED_PARAMS: &[&str] = &[
    "temperature",
    "top_p",
    "frequency_penalty",
    "presence_penalty",
    "n",
    "seed",
    "max_tokens",
    "user",
    "metadata",
    "stream_options",
    "prompt_cache_retention",
    "safety_identifier",
    "logprobs",
    "top_logprobs",
];

const EFFORT_SUFFIXES: &[(&str, &str)] = &[
    ("-xhigh", "xhigh"),
    ("-high", "high"),
    ("-medium", "medium"),
    ("-low", "low"),
];

/// Splits a `-low/-medium/-high/-xhigh` model suffix into a reasoning
/// effort.
pub fn split_effort_suffix(model: &str) -> (&str, Option<&'static str>) {
    for (suffix, effort) in EFFORT_SUFFIXES {
        if let Some(base) = model.strip_suffix(suffix) {
            return (base, Some(effort));
        }
    }
    (model, None)
}

#[derive(Debug, Default)]
pub struct CodexExecutor;

impl CodexExecutor {
    pub fn new() -> Self {
        Self
    }

    fn access_token(connection: &ProviderConnection) -> ProviderResult<&str> {
        connection
            .access_token
            .as_deref()
            .ok_or(ProviderError::MissingCredentialField("access_token"))
    }
}

#[async_trait]
impl ProviderExecutor for CodexExecutor {
    fn name(&self) -> &str {
        "codex"
    }

    fn wire_format(&self) -> Format {
        Format::OpenaiResponses
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
        Ok(format!("{base}/responses"))
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
        header_set(&mut headers, "accept", "text/event-stream");
        // Fresh session id per request.
        header_set(&mut headers, "session_id", Uuid::new_v4().to_string());
        if let Some(account_id) = connection.data_str("account_id") {
            header_set(&mut headers, "chatgpt-account-id", account_id);
        }
        Ok(headers)
    }

    fn transform_request(
        &self,
        _connection: &ProviderConnection,
        model: &str,
        mut body: Value,
        _stream: bool,
    ) -> ProviderResult<Value> {
        let Some(map) = body.as_object_mut() else {
            return Err(ProviderError::Other("responses body must be an object".into()));
        };

        let (base_model, effort) = split_effort_suffix(model);
        map.insert("model".to_string(), Value::String(base_model.to_string()));

        // Codex upstream requires streaming and refuses stored responses.
        map.insert("stream".to_string(), Value::Bool(true));
        map.insert("store".to_string(), Value::Bool(false));
        for param in DISALLOWED_PARAMS {
            map.remove(*param);
        }

        if !map
            .get("instructions")
            .and_then(Value::as_str)
            .map(|text| !text.trim().is_empty())
            .unwrap_or(false)
        {
            map.insert(
                "instructions".to_string(),
                Value::String(DEFAULT_INSTRUCTIONS.to_string()),
            );
        }

        // String input normalises to the item-list form.
        if let Some(Value::String(text)) = map.get("input").cloned() {
            map.insert(
                "input".to_string(),
                json!([{
                    "type": "message",
                    "role": "user",
                    "content": [{"type": "input_text", "text": text}],
                }]),
            );
        }

        if let Some(effort) = effort {
            let reasoning = map
                .entry("reasoning".to_string())
                .or_insert_with(|| json!({}));
            if let Some(reasoning) = reasoning.as_object_mut() {
                reasoning.insert("effort".to_string(), Value::String(effort.to_string()));
            }
        }
        let effort_is_none = map
            .get("reasoning")
            .and_then(|r| r.get("effort"))
            .and_then(Value::as_str)
            .map(|e| e == "none")
            .unwrap_or(false);
        if !effort_is_none {
            map.insert(
                "include".to_string(),
                json!(["reasoning.encrypted_content"]),
            );
        }

        Ok(body)
    }

    /// Codex always streams on the wire; a non-streaming client is served
    /// by the engine's collapse. Opening the transport in streaming mode
    /// here keeps the SSE frames from being buffered as a fake JSON body.
    async fn execute(
        &self,
        ctx: &ExecuteContext,
        connection: &ProviderConnection,
        model: &str,
        body: serde_json::Value,
        _stream: bool,
    ) -> Result<omniroute_provider_core::ExecutionOutcome, omniroute_provider_core::UpstreamFailure>
    {
        use omniroute_provider_core::{
            ExecutionOutcome, UpstreamHttpRequest, failure_from_response, provider_error_failure,
        };
        let body = self
            .transform_request(connection, model, body, true)
            .map_err(provider_error_failure)?;
        let url = self
            .build_url(connection, model, true)
            .map_err(provider_error_failure)?;
        let headers = self
            .build_headers(connection, true)
            .map_err(provider_error_failure)?;
        let payload = serde_json::to_vec(&body).map_err(|err| {
            provider_error_failure(ProviderError::Other(format!("serialize body: {err}")))
        })?;
        let request =
            UpstreamHttpRequest::post_json(url, headers, bytes::Bytes::from(payload), true);
        let response = ctx.client.send(request).await?;
        if !response.is_success() {
            return Err(failure_from_response(response).await);
        }
        Ok(ExecutionOutcome {
            response,
            response_format: Format::OpenaiResponses,
            retry_after_ms: None,
            connection_update: None,
        })
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
        let update = crate::refresh::refresh_token_grant(
            ctx.client.as_ref(),
            TOKEN_URL,
            CLIENT_ID,
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

    fn connection() -> ProviderConnection {
        let mut connection = ProviderConnection::new_api_key("cx", ProviderKind::Codex, "x");
        connection.access_token = Some("at".to_string());
        connection.provider_data = json!({"account_id": "acct_1"});
        connection
    }

    #[test]
    fn effort_suffix_parsing() {
        assert_eq!(split_effort_suffix("gpt-5.1-codex"), ("gpt-5.1-codex", None));
        assert_eq!(
            split_effort_suffix("gpt-5.1-codex-high"),
            ("gpt-5.1-codex", Some("high"))
        );
        assert_eq!(
            split_effort_suffix("gpt-5.1-xhigh"),
            ("gpt-5.1", Some("xhigh"))
        );
    }

    #[test]
    fn transform_enforces_codex_rules() {
        let exec = CodexExecutor::new();
        let body = exec
            .transform_request(
                &connection(),
                "gpt-5.1-codex-medium",
                json!({
                    "model": "alias",
                    "input": "do it",
                    "stream": false,
                    "temperature": 0.5,
                    "max_tokens": 100,
                    "stream_options": {"include_usage": true}
                }),
                false,
            )
            .unwrap();
        assert_eq!(body["model"], "gpt-5.1-codex");
        assert_eq!(body["stream"], true);
        assert_eq!(body["store"], false);
        assert!(body.get("temperature").is_none());
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("stream_options").is_none());
        assert_eq!(body["reasoning"]["effort"], "medium");
        assert_eq!(body["include"][0], "reasoning.encrypted_content");
        assert_eq!(body["input"][0]["content"][0]["text"], "do it");
        assert_eq!(body["instructions"], DEFAULT_INSTRUCTIONS);
    }

    #[test]
    fn existing_instructions_survive() {
        let exec = CodexExecutor::new();
        let body = exec
            .transform_request(
                &connection(),
                "gpt-5.1",
                json!({"instructions": "custom", "input": []}),
                true,
            )
            .unwrap();
        assert_eq!(body["instructions"], "custom");
    }

    #[test]
    fn none_effort_skips_encrypted_content() {
        let exec = CodexExecutor::new();
        let body = exec
            .transform_request(
                &connection(),
                "gpt-5.1",
                json!({"input": [], "reasoning": {"effort": "none"}}),
                true,
            )
            .unwrap();
        assert!(body.get("include").is_none());
    }

    #[test]
    fn headers_have_fresh_session_ids() {
        let exec = CodexExecutor::new();
        let first = exec.build_headers(&connection(), true).unwrap();
        let second = exec.build_headers(&connection(), true).unwrap();
        let sid = |headers: &Headers| {
            omniroute_provider_core::header_get(headers, "session_id").map(str::to_string)
        };
        assert_ne!(sid(&first), sid(&second));
        assert_eq!(
            omniroute_provider_core::header_get(&first, "chatgpt-account-id"),
            Some("acct_1")
        );
    }
}
