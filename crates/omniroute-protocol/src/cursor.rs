//! Cursor chat transport messages.
//!
//! Field numbers on the request/response messages are frozen; do not renumber.
//! The payload travels inside Connect frames (`connect` module) encoded with
//! the wire codec (`pb` module).

use serde_json::Value;

use crate::pb::{PbError, PbReader, PbValue, PbWriter};

/// Splits a combined tool-call id into the externally visible id and the
/// model-internal id.
pub const TOOL_CALL_ID_DELIMITER: &str = "\nmc_";

pub const ROLE_USER: u64 = 1;
pub const ROLE_ASSISTANT: u64 = 2;

#[derive(Debug, Clone)]
pub struct CursorMessage {
    pub content: String,
    pub role: u64,
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct CursorTool {
    pub name: String,
    pub description: String,
    pub parameters_json: String,
}

#[derive(Debug, Clone)]
pub struct CursorChatRequest {
    pub messages: Vec<CursorMessage>,
    pub model: String,
    pub conversation_id: String,
    pub is_agentic: bool,
    pub mcp_tools: Vec<CursorTool>,
    pub large_context: bool,
    pub unified_mode: u64,
    pub should_disable_tools: bool,
    pub thinking_level: u64,
    pub unified_mode_name: String,
}

/// Tool names forwarded to Cursor must carry the `mcp_` prefix; anything
/// else is namespaced under `mcp_custom_`.
pub fn normalize_tool_name(name: &str) -> String {
    if name.starts_with("mcp_") {
        name.to_string()
    } else {
        format!("mcp_custom_{name}")
    }
}

pub fn join_tool_call_id(external: &str, internal: &str) -> String {
    format!("{external}{TOOL_CALL_ID_DELIMITER}{internal}")
}

pub fn split_tool_call_id(combined: &str) -> (&str, Option<&str>) {
    match combined.split_once(TOOL_CALL_ID_DELIMITER) {
        Some((external, internal)) => (external, Some(internal)),
        None => (combined, None),
    }
}

impl CursorChatRequest {
    /// Encode as `StreamUnifiedChatRequestWithTools` (request = field 1).
    pub fn encode(&self) -> Vec<u8> {
        let mut request = PbWriter::new();
        for message in &self.messages {
            let mut msg = PbWriter::new();
            msg.string(1, &message.content);
            msg.uint(2, message.role);
            msg.string(13, &message.id);
            msg.uint(47, self.unified_mode);
            request.message(1, &msg);
        }
        let mut model = PbWriter::new();
        model.string(1, &self.model);
        request.message(5, &model);
        request.string(23, &self.conversation_id);
        request.bool(27, self.is_agentic);
        for message in &self.messages {
            request.string(30, &message.id);
        }
        if !self.mcp_tools.is_empty() {
            let mut tools = PbWriter::new();
            for tool in &self.mcp_tools {
                let mut entry = PbWriter::new();
                entry.string(1, &tool.name);
                entry.string(2, &tool.description);
                entry.string(3, &tool.parameters_json);
                tools.message(1, &entry);
            }
            request.message(34, &tools);
        }
        if self.large_context {
            request.bool(35, true);
        }
        request.uint(46, self.unified_mode);
        request.bool(48, self.should_disable_tools);
        if self.thinking_level > 0 {
            request.uint(49, self.thinking_level);
        }
        if !self.unified_mode_name.is_empty() {
            request.string(54, &self.unified_mode_name);
        }

        let mut outer = PbWriter::new();
        outer.message(1, &request);
        outer.into_bytes()
    }
}

/// One decoded item from a `StreamUnifiedChatResponse` payload.
#[derive(Debug, Clone)]
pub enum CursorStreamItem {
    Text(String),
    Thinking(String),
    ToolCall(CursorToolCall),
}

#[derive(Debug, Clone)]
pub struct CursorToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

/// Decode one protobuf payload into stream items. JSON error payloads are
/// handled by the caller before this point (they do not parse as protobuf
/// messages with known fields).
pub fn decode_response_payload(payload: &[u8]) -> Result<Vec<CursorStreamItem>, PbError> {
    let mut out = Vec::new();
    let mut reader = PbReader::new(payload);
    while let Some(field) = reader.next_field()? {
        match (field.number, field.value) {
            (1, PbValue::Len(bytes)) => {
                if let Some(call) = decode_tool_call(bytes)? {
                    out.push(CursorStreamItem::ToolCall(call));
                }
            }
            (2, PbValue::Len(bytes)) => {
                if let Some(text) = decode_text_message(bytes)? {
                    out.push(CursorStreamItem::Text(text));
                }
            }
            (25, PbValue::Len(bytes)) => {
                if let Some(text) = decode_text_message(bytes)? {
                    out.push(CursorStreamItem::Thinking(text));
                }
            }
            _ => {}
        }
    }
    Ok(out)
}

fn decode_text_message(bytes: &[u8]) -> Result<Option<String>, PbError> {
    let mut reader = PbReader::new(bytes);
    while let Some(field) = reader.next_field()? {
        if field.number == 1
            && let Some(text) = field.value.as_str()
        {
            return Ok(Some(text.to_string()));
        }
    }
    Ok(None)
}

// ClientSideToolV2Call subset: 8 tool_call_id, 27 mcp_params{1 name, 2 args}.
fn decode_tool_call(bytes: &[u8]) -> Result<Option<CursorToolCall>, PbError> {
    let mut call_id = String::new();
    let mut name = String::new();
    let mut arguments = String::new();
    let mut reader = PbReader::new(bytes);
    while let Some(field) = reader.next_field()? {
        match (field.number, field.value) {
            (8, value) => {
                if let Some(text) = value.as_str() {
                    call_id = text.to_string();
                }
            }
            (27, PbValue::Len(inner)) => {
                let mut params = PbReader::new(inner);
                while let Some(param) = params.next_field()? {
                    match (param.number, param.value.as_str()) {
                        (1, Some(text)) => name = text.to_string(),
                        (2, Some(text)) => arguments = text.to_string(),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    if name.is_empty() {
        return Ok(None);
    }
    Ok(Some(CursorToolCall {
        call_id,
        name,
        arguments,
    }))
}

/// A JSON payload starting with `{"error"` signals an upstream error; a
/// `resource_exhausted` code maps to rate limiting.
pub fn parse_error_payload(payload: &[u8]) -> Option<CursorError> {
    let text = std::str::from_utf8(payload).ok()?;
    let trimmed = text.trim_start();
    if !trimmed.starts_with("{\"error\"") {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let error = value.get("error")?;
    let code = error
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or(trimmed)
        .to_string();
    Some(CursorError {
        rate_limited: code == "resource_exhausted",
        code,
        message,
    })
}

#[derive(Debug, Clone)]
pub struct CursorError {
    pub rate_limited: bool,
    pub code: String,
    pub message: String,
}
