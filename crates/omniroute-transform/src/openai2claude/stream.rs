//! Claude stream events → openai-chat chunks.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use omniroute_protocol::claude::{BlockDelta, ContentBlock, StopReason, StreamEvent};
use omniroute_protocol::openai::{
    ChatChunk, ChunkChoice, ChunkDelta, FinishReason, FunctionCallDelta, ToolCallChunk, Usage,
};

use crate::registry::{RequestContext, StreamFrame, StreamTranslator, TranslateError};

pub fn new_translator(_ctx: &RequestContext<'_>) -> Box<dyn StreamTranslator> {
    Box::new(ClaudeToChatStream::new())
}

struct ClaudeToChatStream {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    // claude block index -> openai tool_call index
    tool_indices: BTreeMap<u32, i64>,
    next_tool_index: i64,
    input_tokens: i64,
    finished: bool,
}

impl ClaudeToChatStream {
    fn new() -> Self {
        Self {
            id: "chatcmpl-unknown".to_string(),
            model: "unknown".to_string(),
            created: 0,
            role_sent: false,
            tool_indices: BTreeMap::new(),
            next_tool_index: 0,
            input_tokens: 0,
            finished: false,
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

    fn role_delta(&mut self) -> Option<ChatChunk> {
        if self.role_sent {
            return None;
        }
        self.role_sent = true;
        Some(self.chunk(
            ChunkDelta {
                role: Some(omniroute_protocol::openai::ChatRole::Assistant),
                ..ChunkDelta::default()
            },
            None,
        ))
    }
}

impl StreamTranslator for ClaudeToChatStream {
    fn translate(&mut self, chunk: &Value) -> Result<Vec<StreamFrame>, TranslateError> {
        let event: StreamEvent =
            serde_json::from_value(chunk.clone()).map_err(|_| TranslateError::BadChunk {
                expected: "claude stream event",
            })?;

        let mut out: Vec<ChatChunk> = Vec::new();
        match event {
            StreamEvent::MessageStart { message } => {
                self.id = format!("chatcmpl-{}", message.id);
                self.model = message.model;
                self.input_tokens = message.usage.input_tokens.unwrap_or(0);
                if let Some(chunk) = self.role_delta() {
                    out.push(chunk);
                }
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                if let ContentBlock::ToolUse { id, name, .. } = content_block {
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.tool_indices.insert(index, tool_index);
                    out.push(self.chunk(
                        ChunkDelta {
                            tool_calls: Some(vec![ToolCallChunk {
                                index: tool_index,
                                id: Some(id),
                                kind: Some("function".to_string()),
                                function: Some(FunctionCallDelta {
                                    name: Some(name),
                                    arguments: Some(String::new()),
                                }),
                            }]),
                            ..ChunkDelta::default()
                        },
                        None,
                    ));
                }
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => {
                    if let Some(chunk) = self.role_delta() {
                        out.push(chunk);
                    }
                    out.push(self.chunk(
                        ChunkDelta {
                            content: Some(text),
                            ..ChunkDelta::default()
                        },
                        None,
                    ));
                }
                BlockDelta::ThinkingDelta { thinking } => {
                    out.push(self.chunk(
                        ChunkDelta {
                            reasoning_content: Some(thinking),
                            ..ChunkDelta::default()
                        },
                        None,
                    ));
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(tool_index) = self.tool_indices.get(&index) {
                        out.push(self.chunk(
                            ChunkDelta {
                                tool_calls: Some(vec![ToolCallChunk {
                                    index: *tool_index,
                                    id: None,
                                    kind: None,
                                    function: Some(FunctionCallDelta {
                                        name: None,
                                        arguments: Some(partial_json),
                                    }),
                                }]),
                                ..ChunkDelta::default()
                            },
                            None,
                        ));
                    }
                }
                BlockDelta::SignatureDelta { .. } => {}
            },
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    self.finished = true;
                    let mut chunk = self.chunk(ChunkDelta::default(), Some(map_stop(reason)));
                    chunk.usage = Some(Usage {
                        prompt_tokens: usage.input_tokens.unwrap_or(self.input_tokens),
                        completion_tokens: usage.output_tokens.unwrap_or(0),
                        total_tokens: usage.input_tokens.unwrap_or(self.input_tokens)
                            + usage.output_tokens.unwrap_or(0),
                        extra: serde_json::Map::new(),
                    });
                    out.push(chunk);
                }
            }
            StreamEvent::ContentBlockStop { .. }
            | StreamEvent::MessageStop
            | StreamEvent::Ping => {}
            StreamEvent::Error { error } => {
                return Err(TranslateError::BadRequest(
                    error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("upstream stream error")
                        .to_string(),
                ));
            }
        }

        Ok(out
            .into_iter()
            .map(|chunk| StreamFrame::data(serde_json::to_value(&chunk).unwrap_or(json!({}))))
            .collect())
    }

    fn finish(&mut self) -> Vec<StreamFrame> {
        if !self.finished && self.role_sent {
            let chunk = self.chunk(ChunkDelta::default(), Some(FinishReason::Stop));
            self.finished = true;
            return vec![StreamFrame::data(
                serde_json::to_value(&chunk).unwrap_or(json!({})),
            )];
        }
        Vec::new()
    }
}

fn map_stop(reason: StopReason) -> FinishReason {
    match reason {
        StopReason::EndTurn | StopReason::StopSequence => FinishReason::Stop,
        StopReason::MaxTokens => FinishReason::Length,
        StopReason::ToolUse => FinishReason::ToolCalls,
        StopReason::Refusal => FinishReason::ContentFilter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext<'static> {
        RequestContext {
            model: "gpt-proxy",
            stream: true,
        }
    }

    #[test]
    fn message_lifecycle_maps_to_chunks() {
        let mut tr = new_translator(&ctx());
        let frames = tr
            .translate(&json!({
                "type": "message_start",
                "message": {"id": "msg_1", "type": "message", "role": "assistant",
                            "model": "claude-sonnet-4-5", "content": [],
                            "usage": {"input_tokens": 7}}
            }))
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data["choices"][0]["delta"]["role"], "assistant");

        let frames = tr
            .translate(&json!({
                "type": "content_block_delta", "index": 0,
                "delta": {"type": "text_delta", "text": "hi"}
            }))
            .unwrap();
        assert_eq!(frames[0].data["choices"][0]["delta"]["content"], "hi");

        let frames = tr
            .translate(&json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn"},
                "usage": {"output_tokens": 2}
            }))
            .unwrap();
        assert_eq!(frames[0].data["choices"][0]["finish_reason"], "stop");
        assert_eq!(frames[0].data["usage"]["prompt_tokens"], 7);
        assert!(tr.finish().is_empty());
    }

    #[test]
    fn tool_use_maps_to_tool_call_chunks() {
        let mut tr = new_translator(&ctx());
        tr.translate(&json!({
            "type": "message_start",
            "message": {"id": "m", "type": "message", "role": "assistant",
                        "model": "c", "content": [], "usage": {}}
        }))
        .unwrap();
        let frames = tr
            .translate(&json!({
                "type": "content_block_start", "index": 1,
                "content_block": {"type": "tool_use", "id": "tu1", "name": "grep", "input": {}}
            }))
            .unwrap();
        let call = &frames[0].data["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["id"], "tu1");
        assert_eq!(call["function"]["name"], "grep");

        let frames = tr
            .translate(&json!({
                "type": "content_block_delta", "index": 1,
                "delta": {"type": "input_json_delta", "partial_json": "{\"p\""}
            }))
            .unwrap();
        assert_eq!(
            frames[0].data["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
            "{\"p\""
        );
    }
}
