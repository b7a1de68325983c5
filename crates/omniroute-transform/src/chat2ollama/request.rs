use serde_json::{Map, Value, json};

use omniroute_protocol::ollama::OllamaChatRequest;

use crate::registry::{RequestContext, TranslateError};

pub fn translate(ctx: &RequestContext<'_>, body: &Value) -> Result<Value, TranslateError> {
    let request: OllamaChatRequest = serde_json::from_value(body.clone())
        .map_err(|err| TranslateError::BadRequest(format!("ollama chat body: {err}")))?;

    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|message| json!({"role": message.role, "content": message.content}))
        .collect();

    let mut out = Map::new();
    out.insert("model".to_string(), Value::String(ctx.model.to_string()));
    out.insert("messages".to_string(), Value::Array(messages));
    if ctx.stream {
        out.insert("stream".to_string(), Value::Bool(true));
    }
    if let Some(options) = &request.options {
        if let Some(temperature) = options.get("temperature") {
            out.insert("temperature".to_string(), temperature.clone());
        }
        if let Some(num_predict) = options.get("num_predict") {
            out.insert("max_tokens".to_string(), num_predict.clone());
        }
    }
    Ok(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_map_to_openai_params() {
        let ctx = RequestContext {
            model: "openai/gpt-4o",
            stream: true,
        };
        let out = translate(
            &ctx,
            &json!({
                "model": "anything",
                "messages": [{"role": "user", "content": "hi"}],
                "options": {"temperature": 0.2, "num_predict": 64}
            }),
        )
        .unwrap();
        assert_eq!(out["temperature"], 0.2);
        assert_eq!(out["max_tokens"], 64);
        assert_eq!(out["stream"], true);
    }
}
