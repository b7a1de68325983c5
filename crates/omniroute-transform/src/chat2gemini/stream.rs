//! Gemini generateContent chunks → openai-chat chunks.

use serde_json::{Value, json};

use omniroute_protocol::gemini::GenerateContentResponse;
use omniroute_protocol::openai::{
    ChatChunk, ChatRole, ChunkChoice, ChunkDelta, FinishReason, FunctionCallDelta, ToolCallChunk,
    Usage,
};

use crate::registry::{RequestContext, StreamFrame, StreamTranslator, TranslateError};

pub fn new_translator(ctx: &RequestContext<'_>) -> Box<dyn StreamTranslator> {
    Box::new(GeminiToChatStream {
        model: ctx.model.to_string(),
        id: format!("chatcmpl-{:x}", clock_seed()),
        role_sent: false,
        finished: false,
        next_tool_index: 0,
    })
}

// Stream ids only need uniqueness within the process.
fn clock_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

struct GeminiToChatStream {
    model: String,
    id: String,
    role_sent: bool,
    finished: bool,
    next_tool_index: i64,
}

impl StreamTranslator for GeminiToChatStream {
    fn translate(&mut self, chunk: &Value) -> Result<Vec<StreamFrame>, TranslateError> {
        let response: GenerateContentResponse =
            serde_json::from_value(chunk.clone()).map_err(|_| TranslateError::BadChunk {
                expected: "gemini generateContent chunk",
            })?;

        let mut chunks: Vec<ChatChunk> = Vec::new();
        if !self.role_sent {
            self.role_sent = true;
            chunks.push(self.chunk(
                ChunkDelta {
                    role: Some(ChatRole::Assistant),
                    ..ChunkDelta::default()
                },
                None,
            ));
        }

        let Some(candidate) = response.candidates.first() else {
            return Ok(frames(chunks));
        };

        if let Some(content) = &candidate.content {
            for part in &content.parts {
                if let Some(text) = &part.text {
                    if part.thought == Some(true) {
                        chunks.push(self.chunk(
                            ChunkDelta {
                                reasoning_content: Some(text.clone()),
                                ..ChunkDelta::default()
                            },
                            None,
                        ));
                    } else if !text.is_empty() {
                        chunks.push(self.chunk(
                            ChunkDelta {
                                content: Some(text.clone()),
                                ..ChunkDelta::default()
                            },
                            None,
                        ));
                    }
                }
                if let Some(call) = &part.function_call {
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    let arguments = call
                        .args
                        .as_ref()
                        .map(|args| serde_json::to_string(args).unwrap_or_default())
                        .unwrap_or_else(|| "{}".to_string());
                    chunks.push(self.chunk(
                        ChunkDelta {
                            tool_calls: Some(vec![ToolCallChunk {
                                index: tool_index,
                                id: Some(format!("{}-call-{tool_index}", self.id)),
                                kind: Some("function".to_string()),
                                function: Some(FunctionCallDelta {
                                    name: Some(call.name.clone()),
                                    arguments: Some(arguments),
                                }),
                            }]),
                            ..ChunkDelta::default()
                        },
                        None,
                    ));
                }
            }
        }

        if let Some(reason) = &candidate.finish_reason {
            self.finished = true;
            let mut chunk = self.chunk(ChunkDelta::default(), Some(map_finish(reason)));
            if let Some(usage) = &response.usage_metadata {
                chunk.usage = Some(Usage {
                    prompt_tokens: usage.prompt_token_count.unwrap_or(0),
                    completion_tokens: usage.candidates_token_count.unwrap_or(0),
                    total_tokens: usage.total_token_count.unwrap_or(0),
                    extra: serde_json::Map::new(),
                });
            }
            chunks.push(chunk);
        }

        Ok(frames(chunks))
    }

    fn finish(&mut self) -> Vec<StreamFrame> {
        if self.role_sent && !self.finished {
            self.finished = true;
            return frames(vec![self.chunk(ChunkDelta::default(), Some(FinishReason::Stop))]);
        }
        Vec::new()
    }
}

impl GeminiToChatStream {
    fn chunk(&self, delta: ChunkDelta, finish: Option<FinishReason>) -> ChatChunk {
        let mut chunk = ChatChunk::new(self.id.clone(), self.model.clone(), 0);
        chunk.choices.push(ChunkChoice {
            index: 0,
            delta,
            finish_reason: finish,
        });
        chunk
    }
}

fn frames(chunks: Vec<ChatChunk>) -> Vec<StreamFrame> {
    chunks
        .into_iter()
        .map(|chunk| StreamFrame::data(serde_json::to_value(&chunk).unwrap_or(json!({}))))
        .collect()
}

fn map_finish(reason: &str) -> FinishReason {
    match reason {
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext<'static> {
        RequestContext {
            model: "gemini-2.5-flash",
            stream: true,
        }
    }

    #[test]
    fn text_chunk_translates() {
        let mut tr = new_translator(&ctx());
        let frames = tr
            .translate(&json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": "hi"}]}}]
            }))
            .unwrap();
        assert_eq!(frames[0].data["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(frames[1].data["choices"][0]["delta"]["content"], "hi");
        assert_eq!(frames[1].data["model"], "gemini-2.5-flash");
    }

    #[test]
    fn finish_carries_usage() {
        let mut tr = new_translator(&ctx());
        let frames = tr
            .translate(&json!({
                "candidates": [{"content": {"parts": [{"text": "x"}]}, "finishReason": "STOP"}],
                "usageMetadata": {"promptTokenCount": 2, "candidatesTokenCount": 1, "totalTokenCount": 3}
            }))
            .unwrap();
        let last = frames.last().unwrap();
        assert_eq!(last.data["choices"][0]["finish_reason"], "stop");
        assert_eq!(last.data["usage"]["total_tokens"], 3);
        assert!(tr.finish().is_empty());
    }

    #[test]
    fn function_call_part_becomes_tool_call() {
        let mut tr = new_translator(&ctx());
        let frames = tr
            .translate(&json!({
                "candidates": [{"content": {"parts": [
                    {"functionCall": {"name": "probe", "args": {"k": 1}}}
                ]}}]
            }))
            .unwrap();
        let call = &frames[1].data["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["function"]["name"], "probe");
        assert_eq!(call["function"]["arguments"], "{\"k\":1}");
    }
}
