//! The passthrough executor for OpenAI-style and Anthropic-style providers.

use async_trait::async_trait;
use serde_json::Value;

use omniroute_protocol::Format;
use omniroute_provider_core::{
    Headers, ProviderConnection, ProviderError, ProviderExecutor, ProviderKind, ProviderResult,
    header_set, set_bearer,
};

const OPENROUTER_REFERER: &str = "https://omniroute.dev";
const OPENROUTER_TITLE: &str = "omniroute";

/// One executor covers every plain HTTPS JSON provider; behaviour varies by
/// `ProviderKind` (base URL, auth header style, wire dialect).
pub struct DefaultExecutor {
    kind: ProviderKind,
    name: String,
}

impl DefaultExecutor {
    pub fn new(kind: ProviderKind) -> Self {
        let name = kind.as_str().to_string();
        Self { kind, name }
    }

    pub fn kind(&self) -> &ProviderKind {
        &self.kind
    }

    fn base_url(&self, connection: &ProviderConnection) -> ProviderResult<String> {
        if let Some(base) = connection.data_str("base_url") {
            return Ok(base.trim_end_matches('/').to_string());
        }
        let base = match &self.kind {
            ProviderKind::Openai => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
            ProviderKind::Openrouter => "https://openrouter.ai/api/v1",
            ProviderKind::Glm => "https://open.bigmodel.cn/api/paas/v4",
            ProviderKind::Kimi => "https://api.moonshot.cn/v1",
            ProviderKind::Minimax => "https://api.minimax.io/v1",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            ProviderKind::Compat(_) => {
                return Err(ProviderError::InvalidConfig(
                    "compatible provider requires provider_data.base_url".to_string(),
                ));
            }
            other => {
                return Err(ProviderError::InvalidConfig(format!(
                    "provider {} is not served by the default executor",
                    other.as_str()
                )));
            }
        };
        Ok(base.to_string())
    }

    fn api_key<'a>(&self, connection: &'a ProviderConnection) -> ProviderResult<&'a str> {
        connection
            .api_key
            .as_deref()
            .or(connection.access_token.as_deref())
            .ok_or(ProviderError::MissingCredentialField("api_key"))
    }

    fn is_anthropic_style(&self) -> bool {
        matches!(self.kind, ProviderKind::Anthropic)
            || matches!(&self.kind, ProviderKind::Compat(tag) if tag.starts_with("anthropic-compatible-"))
    }

    fn is_gemini_style(&self) -> bool {
        matches!(self.kind, ProviderKind::Gemini)
    }

}

#[async_trait]
impl ProviderExecutor for DefaultExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn wire_format(&self) -> Format {
        if self.is_anthropic_style() {
            Format::Claude
        } else if self.is_gemini_style() {
            Format::Gemini
        } else {
            Format::OpenaiChat
        }
    }

    fn build_url(
        &self,
        connection: &ProviderConnection,
        model: &str,
        stream: bool,
    ) -> ProviderResult<String> {
        let base = self.base_url(connection)?;
        if self.is_gemini_style() {
            let verb = if stream {
                "streamGenerateContent?alt=sse"
            } else {
                "generateContent"
            };
            return Ok(format!("{base}/models/{model}:{verb}"));
        }
        if self.is_anthropic_style() {
            return Ok(format!("{base}/messages"));
        }
        Ok(format!("{base}/chat/completions"))
    }

    fn build_headers(
        &self,
        connection: &ProviderConnection,
        _stream: bool,
    ) -> ProviderResult<Headers> {
        let key = self.api_key(connection)?;
        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "content-type", "application/json");
        header_set(&mut headers, "accept", "application/json");
        if self.is_anthropic_style() {
            header_set(&mut headers, "x-api-key", key);
            header_set(&mut headers, "anthropic-version", "2023-06-01");
        } else if self.is_gemini_style() {
            header_set(&mut headers, "x-goog-api-key", key);
        } else {
            set_bearer(&mut headers, key);
        }
        if matches!(self.kind, ProviderKind::Openrouter) {
            header_set(&mut headers, "http-referer", OPENROUTER_REFERER);
            header_set(&mut headers, "x-title", OPENROUTER_TITLE);
        }
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
            // Gemini bodies carry the model in the URL, not the payload.
            if !self.is_gemini_style() {
                map.insert("model".to_string(), Value::String(model.to_string()));
            }
            if stream {
                map.insert("stream".to_string(), Value::Bool(true));
            } else {
                map.remove("stream");
            }
        }
        Ok(body)
    }

    /// Embeddings pass straight through for OpenAI-shaped upstreams.
    fn build_embeddings_url(&self, connection: &ProviderConnection) -> ProviderResult<String> {
        if !self.kind.is_openai_compatible() {
            return Err(ProviderError::Unsupported("embeddings"));
        }
        Ok(format!("{}/embeddings", self.base_url(connection)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conn(kind: ProviderKind) -> ProviderConnection {
        ProviderConnection::new_api_key("c1", kind, "sk-test")
    }

    #[test]
    fn openai_url_and_bearer() {
        let exec = DefaultExecutor::new(ProviderKind::Openai);
        let connection = conn(ProviderKind::Openai);
        assert_eq!(
            exec.build_url(&connection, "gpt-4o", false).unwrap(),
            "https://api.openai.com/v1/chat/completions"
        );
        let headers = exec.build_headers(&connection, false).unwrap();
        assert_eq!(
            omniroute_provider_core::header_get(&headers, "authorization"),
            Some("Bearer sk-test")
        );
        assert_eq!(exec.wire_format(), Format::OpenaiChat);
    }

    #[test]
    fn anthropic_uses_x_api_key_and_messages_path() {
        let exec = DefaultExecutor::new(ProviderKind::Anthropic);
        let connection = conn(ProviderKind::Anthropic);
        assert_eq!(
            exec.build_url(&connection, "claude-sonnet-4-5", true).unwrap(),
            "https://api.anthropic.com/v1/messages"
        );
        let headers = exec.build_headers(&connection, true).unwrap();
        assert_eq!(
            omniroute_provider_core::header_get(&headers, "x-api-key"),
            Some("sk-test")
        );
        assert_eq!(exec.wire_format(), Format::Claude);
    }

    #[test]
    fn gemini_url_embeds_model_and_stream_verb() {
        let exec = DefaultExecutor::new(ProviderKind::Gemini);
        let connection = conn(ProviderKind::Gemini);
        assert_eq!(
            exec.build_url(&connection, "gemini-2.5-pro", true).unwrap(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn openrouter_adds_referrer_headers() {
        let exec = DefaultExecutor::new(ProviderKind::Openrouter);
        let headers = exec
            .build_headers(&conn(ProviderKind::Openrouter), false)
            .unwrap();
        assert!(omniroute_provider_core::header_get(&headers, "http-referer").is_some());
        assert!(omniroute_provider_core::header_get(&headers, "x-title").is_some());
    }

    #[test]
    fn compat_requires_base_url() {
        let kind = ProviderKind::Compat("openai-compatible-groq".to_string());
        let exec = DefaultExecutor::new(kind.clone());
        let mut connection = conn(kind);
        assert!(exec.build_url(&connection, "m", false).is_err());
        connection.provider_data = json!({"base_url": "https://api.groq.com/openai/v1/"});
        assert_eq!(
            exec.build_url(&connection, "m", false).unwrap(),
            "https://api.groq.com/openai/v1/chat/completions"
        );
    }

    #[test]
    fn stream_flag_is_forced_into_body() {
        let exec = DefaultExecutor::new(ProviderKind::Openai);
        let body = exec
            .transform_request(
                &conn(ProviderKind::Openai),
                "gpt-4o",
                json!({"model": "alias", "messages": [], "stream": false}),
                true,
            )
            .unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["model"], "gpt-4o");
    }

    #[test]
    fn embeddings_only_for_openai_shapes() {
        let exec = DefaultExecutor::new(ProviderKind::Openai);
        assert!(exec.build_embeddings_url(&conn(ProviderKind::Openai)).is_ok());
        let exec = DefaultExecutor::new(ProviderKind::Anthropic);
        assert!(exec
            .build_embeddings_url(&conn(ProviderKind::Anthropic))
            .is_err());
    }
}
