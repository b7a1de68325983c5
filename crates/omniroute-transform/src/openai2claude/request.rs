use serde_json::{Map, Value, json};

use omniroute_protocol::openai::{ChatRequest, ChatRole};

use crate::registry::{RequestContext, TranslateError};
use crate::schema::{ClaudeSchemaMode, clean_schema_for_claude};

const DEFAULT_MAX_TOKENS: i64 = 4096;

pub fn translate(ctx: &RequestContext<'_>, body: &Value) -> Result<Value, TranslateError> {
    let request: ChatRequest = serde_json::from_value(body.clone())
        .map_err(|err| TranslateError::BadRequest(format!("openai chat body: {err}")))?;

    let mut system_texts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for message in &request.messages {
        match message.role {
            ChatRole::System | ChatRole::Developer => {
                let text = message.content_text();
                if !text.is_empty() {
                    system_texts.push(text);
                }
            }
            ChatRole::User => {
                messages.push(json!({"role": "user", "content": message.content_text()}));
            }
            ChatRole::Assistant => {
                let mut blocks: Vec<Value> = Vec::new();
                let text = message.content_text();
                if !text.is_empty() {
                    blocks.push(json!({"type": "text", "text": text}));
                }
                if let Some(calls) = &message.tool_calls {
                    for call in calls {
                        let input: Value = serde_json::from_str(&call.function.arguments)
                            .unwrap_or_else(|_| json!({}));
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.function.name,
                            "input": input,
                        }));
                    }
                }
                if !blocks.is_empty() {
                    messages.push(json!({"role": "assistant", "content": blocks}));
                }
            }
            ChatRole::Tool | ChatRole::Function => {
                let id = message.tool_call_id.clone().unwrap_or_default();
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": id,
                        "content": message.content_text(),
                    }]
                }));
            }
        }
    }

    let tools: Option<Vec<Value>> = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| {
                // Strict tools follow the Antigravity schema rules: no
                // `default`/`examples` anywhere in the input schema.
                let mode = if tool.function.strict == Some(true) {
                    ClaudeSchemaMode::Antigravity
                } else {
                    ClaudeSchemaMode::Api
                };
                let schema = tool
                    .function
                    .parameters
                    .as_ref()
                    .map(|params| clean_schema_for_claude(params, mode))
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
                json!({
                    "name": tool.function.name,
                    "description": tool.function.description,
                    "input_schema": schema,
                })
            })
            .collect()
    });

    let mut out = Map::new();
    out.insert("model".to_string(), Value::String(ctx.model.to_string()));
    out.insert("messages".to_string(), Value::Array(messages));
    out.insert(
        "max_tokens".to_string(),
        json!(request
            .max_tokens
            .or(request.max_completion_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS)),
    );
    if !system_texts.is_empty() {
        out.insert("system".to_string(), json!(system_texts.join("\n")));
    }
    if ctx.stream {
        out.insert("stream".to_string(), Value::Bool(true));
    }
    if let Some(temperature) = request.temperature {
        out.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        out.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(stop) = &request.stop {
        let sequences = match stop {
            Value::String(single) => json!([single]),
            other => other.clone(),
        };
        out.insert("stop_sequences".to_string(), sequences);
    }
    if let Some(tools) = tools {
        out.insert("tools".to_string(), Value::Array(tools));
    }
    Ok(Value::Object(out))
}
