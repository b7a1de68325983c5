//! iFlow executor: OpenAI-compatible upstream with an HMAC request
//! signature.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;

use omniroute_protocol::Format;
use omniroute_provider_core::{
    Headers, ProviderConnection, ProviderError, ProviderExecutor, ProviderResult, header_set,
    set_bearer,
};

const DEFAULT_BASE_URL: &str = "https://apis.iflow.cn/v1";
const USER_AGENT: &str = "iflow-cli/2.0";

type HmacSha256 = Hmac<Sha256>;

/// `HMAC-SHA256(api_key, "{userAgent}:{sessionId}:{timestampMs}")`, hex.
pub fn sign_request(api_key: &str, user_agent: &str, session_id: &str, timestamp_ms: i64) -> String {
    let message = format!("{user_agent}:{session_id}:{timestamp_ms}");
    let mut mac = HmacSha256::new_from_slice(api_key.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(message.as_bytes());
    let digest = mac.finalize().into_bytes();
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[derive(Debug, Default)]
pub struct IflowExecutor;

impl IflowExecutor {
    pub fn new() -> Self {
        Self
    }

    fn api_key(connection: &ProviderConnection) -> ProviderResult<&str> {
        connection
            .api_key
            .as_deref()
            .or(connection.access_token.as_deref())
            .ok_or(ProviderError::MissingCredentialField("api_key"))
    }
}

#[async_trait]
impl ProviderExecutor for IflowExecutor {
    fn name(&self) -> &str {
        "iflow"
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
        let key = Self::api_key(connection)?;
        let session_id = Uuid::new_v4().to_string();
        let timestamp_ms =
            (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
        let signature = sign_request(key, USER_AGENT, &session_id, timestamp_ms);

        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "content-type", "application/json");
        set_bearer(&mut headers, key);
        header_set(&mut headers, "user-agent", USER_AGENT);
        header_set(&mut headers, "x-iflow-session-id", session_id);
        header_set(&mut headers, "x-iflow-timestamp", timestamp_ms.to_string());
        header_set(&mut headers, "x-iflow-signature", signature);
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use omniroute_provider_core::{ProviderKind, header_get};

    #[test]
    fn signature_is_deterministic_hex() {
        let a = sign_request("key", "ua/1.0", "sess-1", 1_700_000_000_000);
        let b = sign_request("key", "ua/1.0", "sess-1", 1_700_000_000_000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        let different_session = sign_request("key", "ua/1.0", "sess-2", 1_700_000_000_000);
        assert_ne!(a, different_session);
        let different_key = sign_request("other", "ua/1.0", "sess-1", 1_700_000_000_000);
        assert_ne!(a, different_key);
    }

    #[test]
    fn headers_carry_signature_and_session() {
        let exec = IflowExecutor::new();
        let connection = ProviderConnection::new_api_key("if", ProviderKind::Iflow, "ik");
        let headers = exec.build_headers(&connection, false).unwrap();
        let session = header_get(&headers, "x-iflow-session-id").unwrap();
        let ts: i64 = header_get(&headers, "x-iflow-timestamp")
            .unwrap()
            .parse()
            .unwrap();
        let expected = sign_request("ik", USER_AGENT, session, ts);
        assert_eq!(header_get(&headers, "x-iflow-signature"), Some(expected.as_str()));

        // Session ids are fresh per request.
        let again = exec.build_headers(&connection, false).unwrap();
        assert_ne!(
            header_get(&again, "x-iflow-session-id"),
            Some(session)
        );
    }
}
