//! Tool-call bookkeeping shared by translators.

use std::collections::HashMap;

use serde_json::Value;

/// Collect `tool_call_id -> function name` from the assistant turns of an
/// OpenAI chat message list. Targets without a tool role (Cursor, some
/// Gemini modes) need the original name to synthesize a user message
/// wrapping the result.
pub fn tool_names_by_call_id(messages: &[Value]) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for message in messages {
        if message.get("role").and_then(Value::as_str) != Some("assistant") {
            continue;
        }
        let Some(calls) = message.get("tool_calls").and_then(Value::as_array) else {
            continue;
        };
        for call in calls {
            let Some(id) = call.get("id").and_then(Value::as_str) else {
                continue;
            };
            let Some(name) = call
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            out.insert(id.to_string(), name.to_string());
        }
    }
    out
}

/// Render a tool result as a synthetic user message body for targets that
/// lack a tool role.
pub fn synthetic_tool_result_text(tool_name: &str, content: &Value) -> String {
    let rendered = match content {
        Value::String(text) => text.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    };
    format!("[tool result from {tool_name}]\n{rendered}")
}
