//! Stream translation between the Responses event dialect and chat chunks.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use omniroute_protocol::openai::{
    ChatChunk, ChatRole, ChunkChoice, ChunkDelta, FinishReason, FunctionCallDelta, ToolCallChunk,
    Usage,
};
use omniroute_protocol::responses::{KnownEvent, ResponsesEvent};

use crate::registry::{RequestContext, StreamFrame, StreamTranslator, TranslateError};

/// Responses events (provider) → chat chunks (client).
pub fn new_translator(_ctx: &RequestContext<'_>) -> Box<dyn StreamTranslator> {
    Box::new(ResponsesToChatStream::new())
}

/// Chat chunks (provider) → Responses events (client).
pub fn new_reverse_translator(ctx: &RequestContext<'_>) -> Box<dyn StreamTranslator> {
    Box::new(ChatToResponsesStream::new(ctx.model.to_string()))
}

struct ResponsesToChatStream {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    finished: bool,
    saw_tool_call: bool,
    // output_index -> chat tool_call index
    tool_indices: BTreeMap<usize, i64>,
    next_tool_index: i64,
}

impl ResponsesToChatStream {
    fn new() -> Self {
        Self {
            id: "chatcmpl-unknown".to_string(),
            model: "unknown".to_string(),
            created: 0,
            role_sent: false,
            finished: false,
            saw_tool_call: false,
            tool_indices: BTreeMap::new(),
            next_tool_index: 0,
        }
    }

    fn chunk(&self, delta: ChunkDelta, finish: Option<FinishReason>) -> ChatChunk {
        let mut chunk = ChatChunk::new(self.id.clone(), self.model.clone(), self.created);
        chunk.choices.push(ChunkChoice {
            index: 0,
            delta,
            finish_reason: finish,
        });
        chunk
    }
}

impl StreamTranslator for ResponsesToChatStream {
    fn translate(&mut self, chunk: &Value) -> Result<Vec<StreamFrame>, TranslateError> {
        let event: ResponsesEvent =
            serde_json::from_value(chunk.clone()).map_err(|_| TranslateError::BadChunk {
                expected: "openai responses stream event",
            })?;
        let ResponsesEvent::Known(event) = event else {
            return Ok(Vec::new());
        };

        let mut out: Vec<ChatChunk> = Vec::new();
        match event {
            KnownEvent::Created { response } => {
                self.id = format!("chatcmpl-{}", response.id);
                self.model = response
                    .extra
                    .get("model")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                self.created = response.created_at;
                self.role_sent = true;
                out.push(self.chunk(
                    ChunkDelta {
                        role: Some(ChatRole::Assistant),
                        ..ChunkDelta::default()
                    },
                    None,
                ));
            }
            KnownEvent::OutputItemAdded { output_index, item } => {
                if item.kind == "function_call" {
                    self.saw_tool_call = true;
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.tool_indices.insert(output_index, tool_index);
                    out.push(self.chunk(
                        ChunkDelta {
                            tool_calls: Some(vec![ToolCallChunk {
                                index: tool_index,
                                id: item.call_id.clone().or(item.id.clone()),
                                kind: Some("function".to_string()),
                                function: Some(FunctionCallDelta {
                                    name: item.name.clone(),
                                    arguments: Some(String::new()),
                                }),
                            }]),
                            ..ChunkDelta::default()
                        },
                        None,
                    ));
                }
            }
            KnownEvent::OutputTextDelta { delta, .. } => {
                out.push(self.chunk(
                    ChunkDelta {
                        content: Some(delta),
                        ..ChunkDelta::default()
                    },
                    None,
                ));
            }
            KnownEvent::FunctionCallArgumentsDelta {
                output_index,
                delta,
                ..
            } => {
                if let Some(tool_index) = self.tool_indices.get(&output_index) {
                    out.push(self.chunk(
                        ChunkDelta {
                            tool_calls: Some(vec![ToolCallChunk {
                                index: *tool_index,
                                id: None,
                                kind: None,
                                function: Some(FunctionCallDelta {
                                    name: None,
                                    arguments: Some(delta),
                                }),
                            }]),
                            ..ChunkDelta::default()
                        },
                        None,
                    ));
                }
            }
            KnownEvent::OutputItemDone { .. } => {}
            KnownEvent::Completed { response } | KnownEvent::Failed { response } => {
                self.finished = true;
                let reason = if self.saw_tool_call {
                    FinishReason::ToolCalls
                } else {
                    FinishReason::Stop
                };
                let mut chunk = self.chunk(ChunkDelta::default(), Some(reason));
                if let Some(usage) = &response.usage {
                    chunk.usage = Some(Usage {
                        prompt_tokens: usage.input_tokens.unwrap_or(0),
                        completion_tokens: usage.output_tokens.unwrap_or(0),
                        total_tokens: usage
                            .total_tokens
                            .unwrap_or(usage.input_tokens.unwrap_or(0)
                                + usage.output_tokens.unwrap_or(0)),
                        extra: serde_json::Map::new(),
                    });
                }
                out.push(chunk);
            }
        }

        Ok(out
            .into_iter()
            .map(|chunk| StreamFrame::data(serde_json::to_value(&chunk).unwrap_or(json!({}))))
            .collect())
    }

    fn finish(&mut self) -> Vec<StreamFrame> {
        if self.role_sent && !self.finished {
            self.finished = true;
            let chunk = self.chunk(ChunkDelta::default(), Some(FinishReason::Stop));
            return vec![StreamFrame::data(
                serde_json::to_value(&chunk).unwrap_or(json!({})),
            )];
        }
        Vec::new()
    }
}

// ---- reverse direction ----

struct ChatToResponsesStream {
    model: String,
    id: String,
    created: i64,
    started: bool,
    completed: bool,
    text: String,
    usage: Option<Usage>,
}

impl ChatToResponsesStream {
    fn new(model: String) -> Self {
        Self {
            model,
            id: "resp-unknown".to_string(),
            created: 0,
            started: false,
            completed: false,
            text: String::new(),
            usage: None,
        }
    }

    fn envelope(&self, status: &str, output: Vec<Value>) -> Value {
        let usage = self.usage.as_ref().map(|usage| {
            json!({
                "input_tokens": usage.prompt_tokens,
                "output_tokens": usage.completion_tokens,
                "total_tokens": usage.total_tokens,
            })
        });
        json!({
            "id": self.id,
            "object": "response",
            "created_at": self.created,
            "status": status,
            "model": self.model,
            "output": output,
            "usage": usage,
        })
    }

    fn message_item(&self, status: &str) -> Value {
        json!({
            "type": "message",
            "id": format!("{}-msg-0", self.id),
            "role": "assistant",
            "status": status,
            "content": [{"type": "output_text", "text": self.text}],
        })
    }
}

impl StreamTranslator for ChatToResponsesStream {
    fn translate(&mut self, chunk: &Value) -> Result<Vec<StreamFrame>, TranslateError> {
        let chunk: ChatChunk = serde_json::from_value(chunk.clone()).map_err(|_| {
            TranslateError::BadChunk {
                expected: "openai chat completion chunk",
            }
        })?;

        let mut frames = Vec::new();
        if !self.started {
            self.started = true;
            self.id = format!("resp_{}", chunk.id);
            self.created = chunk.created;
            frames.push(StreamFrame::named(
                "response.created",
                json!({"type": "response.created", "response": self.envelope("in_progress", vec![])}),
            ));
            frames.push(StreamFrame::named(
                "response.output_item.added",
                json!({
                    "type": "response.output_item.added",
                    "output_index": 0,
                    "item": self.message_item("in_progress"),
                }),
            ));
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        if let Some(choice) = chunk.choices.first() {
            if let Some(content) = &choice.delta.content
                && !content.is_empty()
            {
                self.text.push_str(content);
                frames.push(StreamFrame::named(
                    "response.output_text.delta",
                    json!({
                        "type": "response.output_text.delta",
                        "output_index": 0,
                        "item_id": format!("{}-msg-0", self.id),
                        "delta": content,
                    }),
                ));
            }
            if choice.finish_reason.is_some() && !self.completed {
                self.completed = true;
                frames.push(StreamFrame::named(
                    "response.output_item.done",
                    json!({
                        "type": "response.output_item.done",
                        "output_index": 0,
                        "item": self.message_item("completed"),
                    }),
                ));
                frames.push(StreamFrame::named(
                    "response.completed",
                    json!({
                        "type": "response.completed",
                        "response": self.envelope("completed", vec![self.message_item("completed")]),
                    }),
                ));
            }
        }
        Ok(frames)
    }

    fn finish(&mut self) -> Vec<StreamFrame> {
        if self.started && !self.completed {
            self.completed = true;
            return vec![StreamFrame::named(
                "response.completed",
                json!({
                    "type": "response.completed",
                    "response": self.envelope("completed", vec![self.message_item("completed")]),
                }),
            )];
        }
        Vec::new()
    }
}
