//! Stream → single-JSON collapse, for clients that asked `stream: false`
//! when the upstream only streams (Codex forces streaming) and for the
//! Ollama non-streaming rule.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

use omniroute_protocol::openai::{
    ChatChoice, ChatChunk, ChatMessage, ChatResponse, ChatRole, FinishReason, MessageContent,
    ToolCall, Usage,
};
use omniroute_protocol::responses::{
    KnownEvent, OutputItem, ResponseEnvelope, ResponsesEvent,
};

/// Accumulates Responses-API events into one response envelope. Output items
/// land at their declared `output_index`; gaps are filled with empty
/// assistant messages.
#[derive(Debug, Default)]
pub struct ResponsesCollapse {
    envelope: Option<ResponseEnvelope>,
    items: BTreeMap<usize, OutputItem>,
    failed: bool,
}

impl ResponsesCollapse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &Value) {
        let Ok(event) = serde_json::from_value::<ResponsesEvent>(event.clone()) else {
            return;
        };
        let ResponsesEvent::Known(event) = event else {
            return;
        };
        match event {
            KnownEvent::Created { response } => {
                self.envelope = Some(response);
            }
            KnownEvent::OutputItemDone { output_index, item } => {
                self.items.insert(output_index, item);
            }
            KnownEvent::Completed { response } => {
                self.merge_final(response);
            }
            KnownEvent::Failed { response } => {
                self.failed = true;
                self.merge_final(response);
            }
            _ => {}
        }
    }

    fn merge_final(&mut self, response: ResponseEnvelope) {
        // The terminal envelope may itself carry the output list; prefer the
        // per-item done events and fill from the terminal copy.
        for (index, item) in response.output.iter().enumerate() {
            self.items.entry(index).or_insert_with(|| item.clone());
        }
        let mut merged = response;
        merged.output = Vec::new();
        self.envelope = Some(merged);
    }

    pub fn into_response(mut self) -> Value {
        let Some(mut envelope) = self.envelope.take() else {
            return json!({
                "id": "resp-empty",
                "object": "response",
                "created_at": 0,
                "status": "failed",
                "output": [],
            });
        };

        let max_index = self.items.keys().next_back().copied();
        let mut output = Vec::new();
        if let Some(max_index) = max_index {
            for index in 0..=max_index {
                match self.items.remove(&index) {
                    Some(item) => output.push(item),
                    None => output.push(OutputItem::empty_message()),
                }
            }
        }
        envelope.output = output;
        if self.failed {
            envelope.status = "failed".to_string();
        } else if envelope.status == "in_progress" {
            envelope.status = "completed".to_string();
        }
        serde_json::to_value(&envelope).unwrap_or(Value::Null)
    }
}

/// Accumulates openai-chat stream chunks into one chat completion response.
#[derive(Debug)]
pub struct ChatCollapse {
    id: String,
    model: String,
    created: i64,
    usage: Option<Usage>,
    choices: BTreeMap<i64, ChoiceAccumulator>,
}

#[derive(Debug, Default)]
struct ChoiceAccumulator {
    content: String,
    reasoning: String,
    tool_calls: BTreeMap<i64, ToolCallAccumulator>,
    finish_reason: Option<FinishReason>,
}

#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl ChatCollapse {
    pub fn new() -> Self {
        Self {
            id: "chatcmpl-unknown".to_string(),
            model: "unknown".to_string(),
            created: 0,
            usage: None,
            choices: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, chunk: &Value) {
        let Ok(chunk) = serde_json::from_value::<ChatChunk>(chunk.clone()) else {
            return;
        };
        self.id = chunk.id;
        self.model = chunk.model;
        self.created = chunk.created;
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
        for choice in chunk.choices {
            let acc = self.choices.entry(choice.index).or_default();
            if let Some(content) = choice.delta.content {
                acc.content.push_str(&content);
            }
            if let Some(reasoning) = choice.delta.reasoning_content {
                acc.reasoning.push_str(&reasoning);
            }
            if let Some(calls) = choice.delta.tool_calls {
                for call in calls {
                    let entry = acc.tool_calls.entry(call.index).or_default();
                    if call.id.is_some() {
                        entry.id = call.id;
                    }
                    if let Some(function) = call.function {
                        if let Some(name) = function.name {
                            entry.name = Some(name);
                        }
                        if let Some(arguments) = function.arguments {
                            entry.arguments.push_str(&arguments);
                        }
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                acc.finish_reason = Some(reason);
            }
        }
    }

    /// Concatenated assistant text (the Ollama collapse rule).
    pub fn joined_text(&self) -> String {
        self.choices
            .values()
            .map(|choice| choice.content.as_str())
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn into_response(self) -> ChatResponse {
        let choices: Vec<ChatChoice> = self
            .choices
            .iter()
            .map(|(index, acc)| {
                let tool_calls: Option<Vec<ToolCall>> = if acc.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        acc.tool_calls
                            .iter()
                            .map(|(call_index, call)| ToolCall {
                                id: call
                                    .id
                                    .clone()
                                    .unwrap_or_else(|| format!("tool_call_{index}_{call_index}")),
                                kind: "function".to_string(),
                                function: omniroute_protocol::openai::FunctionCall {
                                    name: call.name.clone().unwrap_or_else(|| "tool".to_string()),
                                    arguments: call.arguments.clone(),
                                },
                            })
                            .collect(),
                    )
                };
                ChatChoice {
                    index: *index,
                    message: ChatMessage {
                        role: ChatRole::Assistant,
                        content: if acc.content.is_empty() {
                            None
                        } else {
                            Some(MessageContent::Text(acc.content.clone()))
                        },
                        name: None,
                        tool_calls,
                        tool_call_id: None,
                        reasoning_content: if acc.reasoning.is_empty() {
                            None
                        } else {
                            Some(acc.reasoning.clone())
                        },
                    },
                    finish_reason: Some(acc.finish_reason.unwrap_or(FinishReason::Stop)),
                }
            })
            .collect();

        ChatResponse {
            id: self.id,
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model,
            choices,
            usage: self.usage,
            extra: Map::new(),
        }
    }
}

impl Default for ChatCollapse {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulates Claude stream events into one messages response.
#[derive(Debug, Default)]
pub struct ClaudeCollapse {
    id: String,
    model: String,
    blocks: BTreeMap<u32, BlockAccumulator>,
    stop_reason: Option<omniroute_protocol::claude::StopReason>,
    usage: omniroute_protocol::claude::ClaudeUsage,
}

#[derive(Debug)]
enum BlockAccumulator {
    Text(String),
    Thinking(String),
    ToolUse {
        id: String,
        name: String,
        partial_json: String,
    },
}

impl ClaudeCollapse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &Value) {
        use omniroute_protocol::claude::{BlockDelta, ContentBlock, StreamEvent};
        let Ok(event) = serde_json::from_value::<StreamEvent>(event.clone()) else {
            return;
        };
        match event {
            StreamEvent::MessageStart { message } => {
                self.id = message.id;
                self.model = message.model;
                if message.usage.input_tokens.is_some() {
                    self.usage.input_tokens = message.usage.input_tokens;
                }
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let acc = match content_block {
                    ContentBlock::Text { text } => BlockAccumulator::Text(text),
                    ContentBlock::Thinking { thinking, .. } => {
                        BlockAccumulator::Thinking(thinking)
                    }
                    ContentBlock::ToolUse { id, name, .. } => BlockAccumulator::ToolUse {
                        id,
                        name,
                        partial_json: String::new(),
                    },
                    _ => return,
                };
                self.blocks.insert(index, acc);
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let Some(acc) = self.blocks.get_mut(&index) else {
                    return;
                };
                match (acc, delta) {
                    (BlockAccumulator::Text(text), BlockDelta::TextDelta { text: delta }) => {
                        text.push_str(&delta);
                    }
                    (
                        BlockAccumulator::Thinking(thinking),
                        BlockDelta::ThinkingDelta { thinking: delta },
                    ) => {
                        thinking.push_str(&delta);
                    }
                    (
                        BlockAccumulator::ToolUse { partial_json, .. },
                        BlockDelta::InputJsonDelta { partial_json: delta },
                    ) => {
                        partial_json.push_str(&delta);
                    }
                    _ => {}
                }
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                if usage.input_tokens.is_some() {
                    self.usage.input_tokens = usage.input_tokens;
                }
                if usage.output_tokens.is_some() {
                    self.usage.output_tokens = usage.output_tokens;
                }
            }
            _ => {}
        }
    }

    pub fn into_response(self) -> Value {
        use omniroute_protocol::claude::StopReason;
        let content: Vec<Value> = self
            .blocks
            .into_values()
            .map(|block| match block {
                BlockAccumulator::Text(text) => json!({"type": "text", "text": text}),
                BlockAccumulator::Thinking(thinking) => {
                    json!({"type": "thinking", "thinking": thinking})
                }
                BlockAccumulator::ToolUse {
                    id,
                    name,
                    partial_json,
                } => {
                    let input: Value =
                        serde_json::from_str(&partial_json).unwrap_or_else(|_| json!({}));
                    json!({"type": "tool_use", "id": id, "name": name, "input": input})
                }
            })
            .collect();
        json!({
            "id": if self.id.is_empty() { "msg-unknown".to_string() } else { self.id },
            "type": "message",
            "role": "assistant",
            "model": self.model,
            "content": content,
            "stop_reason": self.stop_reason.unwrap_or(StopReason::EndTurn),
            "stop_sequence": null,
            "usage": self.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_collapse_places_items_and_fills_gaps() {
        let mut acc = ResponsesCollapse::new();
        acc.push(&json!({
            "type": "response.created",
            "response": {"id": "r1", "object": "response", "created_at": 9,
                          "status": "in_progress", "output": []}
        }));
        acc.push(&json!({
            "type": "response.output_item.done",
            "output_index": 2,
            "item": {"type": "message", "role": "assistant", "status": "completed",
                      "content": [{"type": "output_text", "text": "late"}]}
        }));
        acc.push(&json!({
            "type": "response.output_item.done",
            "output_index": 0,
            "item": {"type": "reasoning", "id": "rs_1"}
        }));
        acc.push(&json!({
            "type": "response.completed",
            "response": {"id": "r1", "object": "response", "created_at": 9,
                          "status": "completed", "output": [],
                          "usage": {"input_tokens": 1, "output_tokens": 2}}
        }));
        let value = acc.into_response();
        assert_eq!(value["status"], "completed");
        let output = value["output"].as_array().unwrap();
        assert_eq!(output.len(), 3);
        assert_eq!(output[0]["type"], "reasoning");
        // gap at index 1 filled with an empty assistant message
        assert_eq!(output[1]["type"], "message");
        assert_eq!(output[1]["content"], json!([]));
        assert_eq!(output[2]["content"][0]["text"], "late");
        assert_eq!(value["usage"]["output_tokens"], 2);
    }

    #[test]
    fn failed_response_keeps_failed_status() {
        let mut acc = ResponsesCollapse::new();
        acc.push(&json!({
            "type": "response.failed",
            "response": {"id": "r1", "object": "response", "created_at": 1,
                          "status": "failed", "output": []}
        }));
        assert_eq!(acc.into_response()["status"], "failed");
    }

    #[test]
    fn claude_collapse_rebuilds_blocks() {
        let mut acc = ClaudeCollapse::new();
        acc.push(&json!({
            "type": "message_start",
            "message": {"id": "msg_1", "type": "message", "role": "assistant",
                         "model": "claude-sonnet-4-5", "content": [],
                         "usage": {"input_tokens": 4}}
        }));
        acc.push(&json!({"type": "content_block_start", "index": 0,
                          "content_block": {"type": "text", "text": ""}}));
        acc.push(&json!({"type": "content_block_delta", "index": 0,
                          "delta": {"type": "text_delta", "text": "hi "}}));
        acc.push(&json!({"type": "content_block_delta", "index": 0,
                          "delta": {"type": "text_delta", "text": "there"}}));
        acc.push(&json!({"type": "content_block_stop", "index": 0}));
        acc.push(&json!({"type": "message_delta",
                          "delta": {"stop_reason": "end_turn"},
                          "usage": {"output_tokens": 2}}));
        let response = acc.into_response();
        assert_eq!(response["content"][0]["text"], "hi there");
        assert_eq!(response["stop_reason"], "end_turn");
        assert_eq!(response["usage"]["input_tokens"], 4);
        assert_eq!(response["usage"]["output_tokens"], 2);
    }

    #[test]
    fn chat_collapse_merges_deltas_and_tools() {
        let mut acc = ChatCollapse::new();
        acc.push(&json!({
            "id": "c1", "object": "chat.completion.chunk", "created": 3, "model": "m",
            "choices": [{"index": 0, "delta": {"role": "assistant", "content": "he"}}]
        }));
        acc.push(&json!({
            "id": "c1", "object": "chat.completion.chunk", "created": 3, "model": "m",
            "choices": [{"index": 0, "delta": {"content": "y", "tool_calls": [
                {"index": 0, "id": "t1", "function": {"name": "f", "arguments": "{\"a\""}}
            ]}}]
        }));
        acc.push(&json!({
            "id": "c1", "object": "chat.completion.chunk", "created": 3, "model": "m",
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": ":1}"}}
            ]}, "finish_reason": "tool_calls"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
        }));
        assert_eq!(acc.joined_text(), "hey");
        let response = acc.into_response();
        assert_eq!(response.choices.len(), 1);
        let message = &response.choices[0].message;
        let calls = message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.arguments, "{\"a\":1}");
        assert_eq!(
            response.choices[0].finish_reason,
            Some(FinishReason::ToolCalls)
        );
        assert_eq!(response.usage.as_ref().unwrap().total_tokens, 7);
    }
}
