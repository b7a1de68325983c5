use serde_json::{Map, Value, json};

use omniroute_protocol::claude::{ContentBlock, MessageContent, MessagesRequest};

use crate::registry::{RequestContext, TranslateError};

pub fn translate(ctx: &RequestContext<'_>, body: &Value) -> Result<Value, TranslateError> {
    let request: MessagesRequest = serde_json::from_value(body.clone())
        .map_err(|err| TranslateError::BadRequest(format!("claude messages body: {err}")))?;

    let mut messages: Vec<Value> = Vec::new();
    if let Some(system) = &request.system {
        let text = system.joined_text();
        if !text.is_empty() {
            messages.push(json!({"role": "system", "content": text}));
        }
    }

    for message in &request.messages {
        match &message.content {
            MessageContent::Text(text) => {
                messages.push(json!({"role": role_str(message.role), "content": text}));
            }
            MessageContent::Blocks(blocks) => {
                append_blocks(&mut messages, role_str(message.role), blocks);
            }
        }
    }

    let tools: Option<Vec<Value>> = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
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
    if let Some(max_tokens) = request.max_tokens {
        out.insert("max_tokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        out.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        out.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(stops) = &request.stop_sequences {
        out.insert("stop".to_string(), json!(stops));
    }
    if let Some(tools) = tools {
        out.insert("tools".to_string(), Value::Array(tools));
    }
    Ok(Value::Object(out))
}

fn role_str(role: omniroute_protocol::claude::MessageRole) -> &'static str {
    match role {
        omniroute_protocol::claude::MessageRole::User => "user",
        omniroute_protocol::claude::MessageRole::Assistant => "assistant",
    }
}

/// Claude packs text, tool_use, and tool_result into one message; OpenAI
/// needs them split into assistant/tool messages in order.
fn append_blocks(messages: &mut Vec<Value>, role: &str, blocks: &[ContentBlock]) {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::Thinking { .. } | ContentBlock::Unknown => {}
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": serde_json::to_string(input).unwrap_or_else(|_| "{}".into()),
                    }
                }));
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                let rendered = match content {
                    Some(Value::String(text)) => text.clone(),
                    Some(other) => render_tool_result(other),
                    None => String::new(),
                };
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": rendered,
                }));
            }
        }
    }

    let text = text_parts.join("");
    if role == "assistant" && !tool_calls.is_empty() {
        let mut msg = Map::new();
        msg.insert("role".to_string(), json!("assistant"));
        msg.insert(
            "content".to_string(),
            if text.is_empty() {
                Value::Null
            } else {
                Value::String(text)
            },
        );
        msg.insert("tool_calls".to_string(), Value::Array(tool_calls));
        messages.push(Value::Object(msg));
    } else if !text.is_empty() {
        messages.push(json!({"role": role, "content": text}));
    }
}

fn render_tool_result(content: &Value) -> String {
    // Claude tool results may themselves be block lists.
    if let Value::Array(blocks) = content {
        let texts: Vec<&str> = blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect();
        if !texts.is_empty() {
            return texts.join("\n");
        }
    }
    serde_json::to_string(content).unwrap_or_default()
}
