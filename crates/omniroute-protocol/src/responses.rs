//! OpenAI Responses-API dialect (used by Codex and some Copilot models).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<InputParam>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Reasoning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputParam {
    Text(String),
    Items(Vec<InputItem>),
}

/// Input items are structurally open; the fields the gateway needs are typed
/// and everything else rides along.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputItem {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InputItem {
    pub fn message(role: &str, content: Value) -> Self {
        Self {
            kind: Some("message".to_string()),
            role: Some(role.to_string()),
            content: Some(content),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reasoning {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ---- Response envelope ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    pub object: String,
    pub created_at: i64,
    pub status: String,
    pub output: Vec<OutputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResponsesUsage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<OutputContent>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OutputItem {
    pub fn empty_message() -> Self {
        Self {
            kind: "message".to_string(),
            id: None,
            role: Some("assistant".to_string()),
            status: Some("completed".to_string()),
            content: Some(Vec::new()),
            call_id: None,
            name: None,
            arguments: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputContent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsesUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ---- Stream events ----

/// Responses-API stream event. The variants the gateway observes are typed;
/// everything else is carried verbatim so passthrough clients still see it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsesEvent {
    Known(KnownEvent),
    Other(Value),
}

impl ResponsesEvent {
    pub fn event_type(&self) -> Option<&str> {
        match self {
            ResponsesEvent::Known(known) => Some(known.event_type()),
            ResponsesEvent::Other(value) => value.get("type").and_then(Value::as_str),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum KnownEvent {
    #[serde(rename = "response.created")]
    Created { response: ResponseEnvelope },
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        output_index: usize,
        item: OutputItem,
    },
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta {
        output_index: usize,
        delta: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
    },
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        output_index: usize,
        delta: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
    },
    #[serde(rename = "response.output_item.done")]
    OutputItemDone {
        output_index: usize,
        item: OutputItem,
    },
    #[serde(rename = "response.completed")]
    Completed { response: ResponseEnvelope },
    #[serde(rename = "response.failed")]
    Failed { response: ResponseEnvelope },
}

impl KnownEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            KnownEvent::Created { .. } => "response.created",
            KnownEvent::OutputItemAdded { .. } => "response.output_item.added",
            KnownEvent::OutputTextDelta { .. } => "response.output_text.delta",
            KnownEvent::FunctionCallArgumentsDelta { .. } => {
                "response.function_call_arguments.delta"
            }
            KnownEvent::OutputItemDone { .. } => "response.output_item.done",
            KnownEvent::Completed { .. } => "response.completed",
            KnownEvent::Failed { .. } => "response.failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_event_parses_by_type_tag() {
        let ev: ResponsesEvent = serde_json::from_value(serde_json::json!({
            "type": "response.output_text.delta",
            "output_index": 0,
            "delta": "hel"
        }))
        .unwrap();
        assert!(matches!(
            ev,
            ResponsesEvent::Known(KnownEvent::OutputTextDelta { ref delta, .. }) if delta == "hel"
        ));
    }

    #[test]
    fn unknown_event_is_preserved() {
        let raw = serde_json::json!({"type": "response.in_progress", "sequence_number": 3});
        let ev: ResponsesEvent = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(ev.event_type(), Some("response.in_progress"));
        assert_eq!(serde_json::to_value(&ev).unwrap(), raw);
    }
}
