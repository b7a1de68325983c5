//! openai-chat stream chunks → Claude stream events.

use std::collections::BTreeMap;

use serde_json::Value;

use omniroute_protocol::claude::{
    BlockDelta, ClaudeUsage, ContentBlock, MessageDeltaBody, MessageRole, StreamEvent,
    StreamMessage,
};
use omniroute_protocol::openai::{ChatChunk, FinishReason, ToolCallChunk};

use crate::registry::{RequestContext, StreamFrame, StreamTranslator, TranslateError};

pub fn new_translator(_ctx: &RequestContext<'_>) -> Box<dyn StreamTranslator> {
    Box::new(ChatToClaudeStream::new())
}

struct ChatToClaudeStream {
    started: bool,
    stopped: bool,
    pending_stop: Option<omniroute_protocol::claude::StopReason>,
    next_block_index: u32,
    text_block: Option<u32>,
    thinking_block: Option<u32>,
    tool_blocks: BTreeMap<i64, u32>,
}

impl ChatToClaudeStream {
    fn new() -> Self {
        Self {
            started: false,
            stopped: false,
            pending_stop: None,
            next_block_index: 0,
            text_block: None,
            thinking_block: None,
            tool_blocks: BTreeMap::new(),
        }
    }

    fn alloc_block(&mut self) -> u32 {
        let index = self.next_block_index;
        self.next_block_index += 1;
        index
    }

    fn start_message(&mut self, chunk: &ChatChunk, events: &mut Vec<StreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        events.push(StreamEvent::MessageStart {
            message: StreamMessage {
                id: chunk.id.clone(),
                kind: "message".to_string(),
                role: MessageRole::Assistant,
                model: chunk.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: ClaudeUsage::default(),
            },
        });
    }

    fn emit_text(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        let index = match self.text_block {
            Some(index) => index,
            None => {
                let index = self.alloc_block();
                self.text_block = Some(index);
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::Text {
                        text: String::new(),
                    },
                });
                index
            }
        };
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::TextDelta {
                text: text.to_string(),
            },
        });
    }

    fn emit_thinking(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        let index = match self.thinking_block {
            Some(index) => index,
            None => {
                let index = self.alloc_block();
                self.thinking_block = Some(index);
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::Thinking {
                        thinking: String::new(),
                        signature: None,
                    },
                });
                index
            }
        };
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::ThinkingDelta {
                thinking: text.to_string(),
            },
        });
    }

    fn emit_tool_call(&mut self, call: &ToolCallChunk, events: &mut Vec<StreamEvent>) {
        let index = match self.tool_blocks.get(&call.index) {
            Some(index) => *index,
            None => {
                let index = self.alloc_block();
                self.tool_blocks.insert(call.index, index);
                let id = call
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("toolcall-{}", call.index));
                let name = call
                    .function
                    .as_ref()
                    .and_then(|f| f.name.clone())
                    .unwrap_or_else(|| "tool".to_string());
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::ToolUse {
                        id,
                        name,
                        input: Value::Object(serde_json::Map::new()),
                    },
                });
                index
            }
        };
        if let Some(arguments) = call.function.as_ref().and_then(|f| f.arguments.as_ref())
            && !arguments.is_empty()
        {
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: BlockDelta::InputJsonDelta {
                    partial_json: arguments.clone(),
                },
            });
        }
    }

    fn close_blocks(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(index) = self.thinking_block.take() {
            events.push(StreamEvent::ContentBlockStop { index });
        }
        if let Some(index) = self.text_block.take() {
            events.push(StreamEvent::ContentBlockStop { index });
        }
        for (_, index) in std::mem::take(&mut self.tool_blocks) {
            events.push(StreamEvent::ContentBlockStop { index });
        }
    }

    fn stop_events(
        &mut self,
        reason: omniroute_protocol::claude::StopReason,
        usage: ClaudeUsage,
        events: &mut Vec<StreamEvent>,
    ) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.close_blocks(events);
        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(reason),
                stop_sequence: None,
            },
            usage,
        });
        events.push(StreamEvent::MessageStop);
    }
}

impl StreamTranslator for ChatToClaudeStream {
    fn translate(&mut self, chunk: &Value) -> Result<Vec<StreamFrame>, TranslateError> {
        let chunk: ChatChunk = serde_json::from_value(chunk.clone()).map_err(|_| {
            TranslateError::BadChunk {
                expected: "openai chat completion chunk",
            }
        })?;

        let mut events = Vec::new();
        self.start_message(&chunk, &mut events);

        if let Some(choice) = chunk.choices.first() {
            if let Some(thinking) = &choice.delta.reasoning_content {
                self.emit_thinking(thinking, &mut events);
            }
            if let Some(content) = &choice.delta.content {
                self.emit_text(content, &mut events);
            }
            if let Some(calls) = &choice.delta.tool_calls {
                for call in calls {
                    self.emit_tool_call(call, &mut events);
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.pending_stop = Some(map_finish(reason));
            }
        }

        // Usage arrives on the trailing chunk; combine it with any pending
        // stop so message_delta carries both.
        let usage = chunk.usage.as_ref().map(|usage| ClaudeUsage {
            input_tokens: Some(usage.prompt_tokens),
            output_tokens: Some(usage.completion_tokens),
            cache_creation_input_tokens: None,
            cache_read_input_tokens: None,
        });
        if let Some(usage) = usage
            && let Some(reason) = self.pending_stop.take()
        {
            self.stop_events(reason, usage, &mut events);
        }

        Ok(events.into_iter().map(frame).collect())
    }

    fn finish(&mut self) -> Vec<StreamFrame> {
        let mut events = Vec::new();
        if self.started && !self.stopped {
            let reason = self
                .pending_stop
                .take()
                .unwrap_or(omniroute_protocol::claude::StopReason::EndTurn);
            self.stop_events(reason, ClaudeUsage::default(), &mut events);
        }
        events.into_iter().map(frame).collect()
    }
}

fn frame(event: StreamEvent) -> StreamFrame {
    let name = event.event_name().to_string();
    let data = serde_json::to_value(&event).unwrap_or(Value::Null);
    StreamFrame::named(name, data)
}

fn map_finish(reason: FinishReason) -> omniroute_protocol::claude::StopReason {
    use omniroute_protocol::claude::StopReason;
    match reason {
        FinishReason::Stop => StopReason::EndTurn,
        FinishReason::Length => StopReason::MaxTokens,
        FinishReason::ToolCalls | FinishReason::FunctionCall => StopReason::ToolUse,
        FinishReason::ContentFilter => StopReason::Refusal,
    }
}
