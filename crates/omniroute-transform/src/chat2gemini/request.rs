use serde_json::{Map, Value, json};

use omniroute_protocol::openai::{ChatRequest, ChatRole};

use crate::registry::{RequestContext, TranslateError};
use crate::schema::clean_schema_for_gemini;
use crate::toolmap::{synthetic_tool_result_text, tool_names_by_call_id};

pub fn translate(_ctx: &RequestContext<'_>, body: &Value) -> Result<Value, TranslateError> {
    let request: ChatRequest = serde_json::from_value(body.clone())
        .map_err(|err| TranslateError::BadRequest(format!("openai chat body: {err}")))?;

    let raw_messages: Vec<Value> = body
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let tool_names = tool_names_by_call_id(&raw_messages);

    let mut system_texts: Vec<String> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();

    for message in &request.messages {
        match message.role {
            ChatRole::System | ChatRole::Developer => {
                let text = message.content_text();
                if !text.is_empty() {
                    system_texts.push(text);
                }
            }
            ChatRole::User => {
                contents.push(json!({
                    "role": "user",
                    "parts": [{"text": message.content_text()}],
                }));
            }
            ChatRole::Assistant => {
                let mut parts: Vec<Value> = Vec::new();
                let text = message.content_text();
                if !text.is_empty() {
                    parts.push(json!({"text": text}));
                }
                if let Some(calls) = &message.tool_calls {
                    for call in calls {
                        let args: Value = serde_json::from_str(&call.function.arguments)
                            .unwrap_or_else(|_| json!({}));
                        parts.push(json!({
                            "functionCall": {"name": call.function.name, "args": args}
                        }));
                    }
                }
                if !parts.is_empty() {
                    contents.push(json!({"role": "model", "parts": parts}));
                }
            }
            ChatRole::Tool | ChatRole::Function => {
                let call_id = message.tool_call_id.as_deref().unwrap_or_default();
                match tool_names.get(call_id) {
                    Some(name) => {
                        contents.push(json!({
                            "role": "user",
                            "parts": [{"functionResponse": {
                                "name": name,
                                "response": {"result": message.content_text()},
                            }}],
                        }));
                    }
                    None => {
                        // No originating call in scope: thread the result
                        // through a synthetic user turn instead.
                        let text = synthetic_tool_result_text(
                            "unknown_tool",
                            &Value::String(message.content_text()),
                        );
                        contents.push(json!({"role": "user", "parts": [{"text": text}]}));
                    }
                }
            }
        }
    }

    let tools: Option<Value> = request.tools.as_ref().map(|tools| {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|tool| {
                let parameters = tool
                    .function
                    .parameters
                    .as_ref()
                    .map(clean_schema_for_gemini);
                json!({
                    "name": tool.function.name,
                    "description": tool.function.description,
                    "parameters": parameters,
                })
            })
            .collect();
        json!([{"functionDeclarations": declarations}])
    });

    let mut generation = Map::new();
    if let Some(temperature) = request.temperature {
        generation.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        generation.insert("topP".to_string(), json!(top_p));
    }
    if let Some(max) = request.max_tokens.or(request.max_completion_tokens) {
        generation.insert("maxOutputTokens".to_string(), json!(max));
    }
    if let Some(Value::String(stop)) = &request.stop {
        generation.insert("stopSequences".to_string(), json!([stop]));
    } else if let Some(Value::Array(stops)) = &request.stop {
        generation.insert("stopSequences".to_string(), json!(stops));
    }

    let mut out = Map::new();
    out.insert("contents".to_string(), Value::Array(contents));
    if !system_texts.is_empty() {
        out.insert(
            "systemInstruction".to_string(),
            json!({"parts": [{"text": system_texts.join("\n")}]}),
        );
    }
    if let Some(tools) = tools {
        out.insert("tools".to_string(), tools);
    }
    if !generation.is_empty() {
        out.insert("generationConfig".to_string(), Value::Object(generation));
    }
    Ok(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_and_system_map() {
        let ctx = RequestContext {
            model: "gemini-2.5-pro",
            stream: false,
        };
        let out = translate(
            &ctx,
            &json!({
                "model": "x",
                "messages": [
                    {"role": "system", "content": "sys"},
                    {"role": "user", "content": "q"},
                    {"role": "assistant", "content": "a"}
                ],
                "max_tokens": 5
            }),
        )
        .unwrap();
        assert_eq!(out["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(out["contents"][0]["role"], "user");
        assert_eq!(out["contents"][1]["role"], "model");
        assert_eq!(out["generationConfig"]["maxOutputTokens"], 5);
    }

    #[test]
    fn tool_results_recover_the_function_name() {
        let ctx = RequestContext {
            model: "gemini-2.5-pro",
            stream: false,
        };
        let out = translate(
            &ctx,
            &json!({
                "model": "x",
                "messages": [
                    {"role": "assistant", "tool_calls": [
                        {"id": "c1", "type": "function", "function": {"name": "probe", "arguments": "{}"}}
                    ]},
                    {"role": "tool", "tool_call_id": "c1", "content": "pong"}
                ]
            }),
        )
        .unwrap();
        let response = &out["contents"][1]["parts"][0]["functionResponse"];
        assert_eq!(response["name"], "probe");
        assert_eq!(response["response"]["result"], "pong");
    }

    #[test]
    fn orphan_tool_result_threads_as_user_text() {
        let ctx = RequestContext {
            model: "gemini-2.5-pro",
            stream: false,
        };
        let out = translate(
            &ctx,
            &json!({
                "model": "x",
                "messages": [{"role": "tool", "tool_call_id": "missing", "content": "data"}]
            }),
        )
        .unwrap();
        let text = out["contents"][0]["parts"][0]["text"].as_str().unwrap();
        assert!(text.contains("data"));
    }

    #[test]
    fn tool_schemas_are_cleaned() {
        let ctx = RequestContext {
            model: "gemini-2.5-pro",
            stream: false,
        };
        let out = translate(
            &ctx,
            &json!({
                "model": "x",
                "messages": [{"role": "user", "content": "q"}],
                "tools": [{"type": "function", "function": {
                    "name": "f",
                    "parameters": {"type": "object", "properties": {
                        "a": {"type": "string", "minLength": 3}
                    }, "additionalProperties": false}
                }}]
            }),
        )
        .unwrap();
        let params = &out["tools"][0]["functionDeclarations"][0]["parameters"];
        assert!(params["properties"]["a"].get("minLength").is_none());
        assert!(params.get("additionalProperties").is_none());
    }
}
