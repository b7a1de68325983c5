use serde_json::{Map, Value, json};

use omniroute_protocol::openai::{ChatRequest, ChatRole};
use omniroute_protocol::responses::{InputItem, InputParam, ResponsesRequest};

use crate::registry::{RequestContext, TranslateError};

/// openai-chat request → openai-responses request.
pub fn translate(ctx: &RequestContext<'_>, body: &Value) -> Result<Value, TranslateError> {
    let request: ChatRequest = serde_json::from_value(body.clone())
        .map_err(|err| TranslateError::BadRequest(format!("openai chat body: {err}")))?;

    let mut instructions: Vec<String> = Vec::new();
    let mut input: Vec<Value> = Vec::new();

    for message in &request.messages {
        match message.role {
            ChatRole::System | ChatRole::Developer => {
                let text = message.content_text();
                if !text.is_empty() {
                    instructions.push(text);
                }
            }
            ChatRole::User => {
                input.push(json!({
                    "type": "message",
                    "role": "user",
                    "content": [{"type": "input_text", "text": message.content_text()}],
                }));
            }
            ChatRole::Assistant => {
                let text = message.content_text();
                if !text.is_empty() {
                    input.push(json!({
                        "type": "message",
                        "role": "assistant",
                        "content": [{"type": "output_text", "text": text}],
                    }));
                }
                if let Some(calls) = &message.tool_calls {
                    for call in calls {
                        input.push(json!({
                            "type": "function_call",
                            "call_id": call.id,
                            "name": call.function.name,
                            "arguments": call.function.arguments,
                        }));
                    }
                }
            }
            ChatRole::Tool | ChatRole::Function => {
                input.push(json!({
                    "type": "function_call_output",
                    "call_id": message.tool_call_id.clone().unwrap_or_default(),
                    "output": message.content_text(),
                }));
            }
        }
    }

    let tools: Option<Vec<Value>> = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "name": tool.function.name,
                    "description": tool.function.description,
                    "parameters": tool.function.parameters,
                })
            })
            .collect()
    });

    let mut out = Map::new();
    out.insert("model".to_string(), Value::String(ctx.model.to_string()));
    out.insert("input".to_string(), Value::Array(input));
    if !instructions.is_empty() {
        out.insert("instructions".to_string(), json!(instructions.join("\n")));
    }
    if ctx.stream {
        out.insert("stream".to_string(), Value::Bool(true));
    }
    if let Some(max) = request.max_tokens.or(request.max_completion_tokens) {
        out.insert("max_output_tokens".to_string(), json!(max));
    }
    if let Some(effort) = &request.reasoning_effort {
        out.insert("reasoning".to_string(), json!({"effort": effort}));
    }
    if let Some(tools) = tools {
        out.insert("tools".to_string(), Value::Array(tools));
    }
    if let Some(choice) = &request.tool_choice {
        out.insert("tool_choice".to_string(), choice.clone());
    }
    Ok(Value::Object(out))
}

/// openai-responses request → openai-chat request.
pub fn translate_back(ctx: &RequestContext<'_>, body: &Value) -> Result<Value, TranslateError> {
    let request: ResponsesRequest = serde_json::from_value(body.clone())
        .map_err(|err| TranslateError::BadRequest(format!("openai responses body: {err}")))?;

    let mut messages: Vec<Value> = Vec::new();
    if let Some(instructions) = &request.instructions {
        messages.push(json!({"role": "system", "content": instructions}));
    }

    match &request.input {
        Some(InputParam::Text(text)) => {
            messages.push(json!({"role": "user", "content": text}));
        }
        Some(InputParam::Items(items)) => {
            for item in items {
                push_item_as_message(&mut messages, item);
            }
        }
        None => {}
    }

    let tools: Option<Vec<Value>> = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.get("name").cloned().unwrap_or(Value::Null),
                        "description": tool.get("description").cloned().unwrap_or(Value::Null),
                        "parameters": tool.get("parameters").cloned().unwrap_or(Value::Null),
                    }
                })
            })
            .collect()
    });

    let mut out = Map::new();
    out.insert("model".to_string(), Value::String(ctx.model.to_string()));
    out.insert("messages".to_string(), Value::Array(messages));
    if ctx.stream {
        out.insert("stream".to_string(), Value::Bool(true));
    }
    if let Some(max) = request.max_output_tokens {
        out.insert("max_tokens".to_string(), json!(max));
    }
    if let Some(tools) = tools {
        out.insert("tools".to_string(), Value::Array(tools));
    }
    Ok(Value::Object(out))
}

fn push_item_as_message(messages: &mut Vec<Value>, item: &InputItem) {
    match item.kind.as_deref() {
        Some("function_call") => {
            messages.push(json!({
                "role": "assistant",
                "tool_calls": [{
                    "id": item.extra.get("call_id").cloned().unwrap_or(json!("")),
                    "type": "function",
                    "function": {
                        "name": item.extra.get("name").cloned().unwrap_or(json!("")),
                        "arguments": item.extra.get("arguments").cloned().unwrap_or(json!("")),
                    }
                }]
            }));
        }
        Some("function_call_output") => {
            messages.push(json!({
                "role": "tool",
                "tool_call_id": item.extra.get("call_id").cloned().unwrap_or(json!("")),
                "content": item.extra.get("output").cloned().unwrap_or(json!("")),
            }));
        }
        _ => {
            let role = item.role.as_deref().unwrap_or("user");
            let role = if role == "developer" { "system" } else { role };
            messages.push(json!({
                "role": role,
                "content": flatten_content(item.content.as_ref()),
            }));
        }
    }
}

fn flatten_content(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}
