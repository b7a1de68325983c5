use serde_json::{Value, json};

use omniroute_protocol::cursor::{
    CursorChatRequest, CursorMessage, CursorTool, ROLE_ASSISTANT, ROLE_USER, normalize_tool_name,
};
use omniroute_protocol::openai::{ChatRequest, ChatRole};

use crate::registry::{RequestContext, TranslateError};
use crate::toolmap::{synthetic_tool_result_text, tool_names_by_call_id};

/// Builds the typed Cursor request and returns it as JSON carrying the
/// protobuf payload in base64-free form: the executor re-reads this value
/// into `CursorChatRequest` via `from_wire`.
pub fn translate(ctx: &RequestContext<'_>, body: &Value) -> Result<Value, TranslateError> {
    let request = build(ctx, body)?;
    Ok(to_wire(&request))
}

pub fn build(
    ctx: &RequestContext<'_>,
    body: &Value,
) -> Result<CursorChatRequest, TranslateError> {
    let request: ChatRequest = serde_json::from_value(body.clone())
        .map_err(|err| TranslateError::BadRequest(format!("openai chat body: {err}")))?;

    let raw_messages: Vec<Value> = body
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let tool_names = tool_names_by_call_id(&raw_messages);

    let mut messages: Vec<CursorMessage> = Vec::new();
    let mut counter = 0usize;
    let mut next_id = || {
        counter += 1;
        format!("bubble-{counter}")
    };

    for message in &request.messages {
        match message.role {
            // Cursor has no system slot; system text leads the conversation
            // as a user turn.
            ChatRole::System | ChatRole::Developer | ChatRole::User => {
                let text = message.content_text();
                if !text.is_empty() {
                    messages.push(CursorMessage {
                        content: text,
                        role: ROLE_USER,
                        id: next_id(),
                    });
                }
            }
            ChatRole::Assistant => {
                let text = message.content_text();
                if !text.is_empty() {
                    messages.push(CursorMessage {
                        content: text,
                        role: ROLE_ASSISTANT,
                        id: next_id(),
                    });
                }
            }
            // Cursor lacks a tool role entirely; results thread through a
            // synthetic user turn naming the original tool.
            ChatRole::Tool | ChatRole::Function => {
                let call_id = message.tool_call_id.as_deref().unwrap_or_default();
                let name = tool_names
                    .get(call_id)
                    .map(String::as_str)
                    .unwrap_or("unknown_tool");
                messages.push(CursorMessage {
                    content: synthetic_tool_result_text(
                        name,
                        &Value::String(message.content_text()),
                    ),
                    role: ROLE_USER,
                    id: next_id(),
                });
            }
        }
    }

    let mcp_tools: Vec<CursorTool> = request
        .tools
        .as_ref()
        .map(|tools| {
            tools
                .iter()
                .map(|tool| CursorTool {
                    name: normalize_tool_name(&tool.function.name),
                    description: tool.function.description.clone().unwrap_or_default(),
                    parameters_json: tool
                        .function
                        .parameters
                        .as_ref()
                        .map(|p| serde_json::to_string(p).unwrap_or_else(|_| "{}".into()))
                        .unwrap_or_else(|| "{}".to_string()),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(CursorChatRequest {
        messages,
        model: ctx.model.to_string(),
        conversation_id: String::new(), // assigned by the executor per call
        is_agentic: !mcp_tools.is_empty(),
        should_disable_tools: mcp_tools.is_empty(),
        mcp_tools,
        large_context: false,
        unified_mode: 2,
        thinking_level: 0,
        unified_mode_name: "agent".to_string(),
    })
}

pub fn to_wire(request: &CursorChatRequest) -> Value {
    json!({
        "messages": request.messages.iter().map(|m| json!({
            "content": m.content, "role": m.role, "id": m.id,
        })).collect::<Vec<_>>(),
        "model": request.model,
        "conversation_id": request.conversation_id,
        "is_agentic": request.is_agentic,
        "mcp_tools": request.mcp_tools.iter().map(|t| json!({
            "name": t.name, "description": t.description, "parameters_json": t.parameters_json,
        })).collect::<Vec<_>>(),
        "large_context": request.large_context,
        "unified_mode": request.unified_mode,
        "should_disable_tools": request.should_disable_tools,
        "thinking_level": request.thinking_level,
        "unified_mode_name": request.unified_mode_name,
    })
}

pub fn from_wire(value: &Value) -> Option<CursorChatRequest> {
    Some(CursorChatRequest {
        messages: value
            .get("messages")?
            .as_array()?
            .iter()
            .map(|m| {
                Some(CursorMessage {
                    content: m.get("content")?.as_str()?.to_string(),
                    role: m.get("role")?.as_u64()?,
                    id: m.get("id")?.as_str()?.to_string(),
                })
            })
            .collect::<Option<Vec<_>>>()?,
        model: value.get("model")?.as_str()?.to_string(),
        conversation_id: value
            .get("conversation_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        is_agentic: value.get("is_agentic").and_then(Value::as_bool).unwrap_or(false),
        mcp_tools: value
            .get("mcp_tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|t| {
                        Some(CursorTool {
                            name: t.get("name")?.as_str()?.to_string(),
                            description: t
                                .get("description")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            parameters_json: t
                                .get("parameters_json")
                                .and_then(Value::as_str)
                                .unwrap_or("{}")
                                .to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default(),
        large_context: value
            .get("large_context")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        unified_mode: value.get("unified_mode").and_then(Value::as_u64).unwrap_or(2),
        should_disable_tools: value
            .get("should_disable_tools")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        thinking_level: value
            .get("thinking_level")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        unified_mode_name: value
            .get("unified_mode_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_and_tools_map_into_cursor_shapes() {
        let ctx = RequestContext {
            model: "claude-4.5-sonnet",
            stream: true,
        };
        let request = build(
            &ctx,
            &json!({
                "model": "x",
                "messages": [
                    {"role": "system", "content": "rules"},
                    {"role": "user", "content": "hello"}
                ],
                "tools": [
                    {"type": "function", "function": {"name": "grep", "parameters": {}}},
                    {"type": "function", "function": {"name": "mcp_list", "parameters": {}}}
                ]
            }),
        )
        .unwrap();
        assert_eq!(request.messages.len(), 2);
        assert!(request.messages.iter().all(|m| m.role == ROLE_USER));
        assert_eq!(request.mcp_tools[0].name, "mcp_custom_grep");
        assert_eq!(request.mcp_tools[1].name, "mcp_list");
        assert!(request.is_agentic);
    }

    #[test]
    fn tool_results_thread_as_user_messages() {
        let ctx = RequestContext {
            model: "gpt-5.1",
            stream: true,
        };
        let request = build(
            &ctx,
            &json!({
                "model": "x",
                "messages": [
                    {"role": "assistant", "tool_calls": [
                        {"id": "c1", "type": "function", "function": {"name": "grep", "arguments": "{}"}}
                    ]},
                    {"role": "tool", "tool_call_id": "c1", "content": "3 matches"}
                ]
            }),
        )
        .unwrap();
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].role, ROLE_USER);
        assert!(request.messages[0].content.contains("grep"));
        assert!(request.messages[0].content.contains("3 matches"));
    }

    #[test]
    fn wire_roundtrip() {
        let ctx = RequestContext {
            model: "m",
            stream: true,
        };
        let built = build(&ctx, &json!({"model": "m", "messages": [{"role": "user", "content": "q"}]}))
            .unwrap();
        let back = from_wire(&to_wire(&built)).unwrap();
        assert_eq!(back.messages.len(), 1);
        assert_eq!(back.model, "m");
        assert_eq!(back.encode(), built.encode());
    }
}
