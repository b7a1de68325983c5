//! openai-chat chunks → Ollama chat frames (newline-delimited JSON).

use serde_json::{Value, json};

use omniroute_protocol::ollama::OllamaChatFrame;
use omniroute_protocol::openai::{ChatChunk, FinishReason};

use crate::registry::{RequestContext, StreamFrame, StreamTranslator, TranslateError};

pub fn new_translator(ctx: &RequestContext<'_>) -> Box<dyn StreamTranslator> {
    Box::new(ChatToOllamaStream {
        model: ctx.model.to_string(),
        created_at: now_rfc3339(),
        done_sent: false,
    })
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

struct ChatToOllamaStream {
    model: String,
    created_at: String,
    done_sent: bool,
}

impl StreamTranslator for ChatToOllamaStream {
    fn translate(&mut self, chunk: &Value) -> Result<Vec<StreamFrame>, TranslateError> {
        let chunk: ChatChunk = serde_json::from_value(chunk.clone()).map_err(|_| {
            TranslateError::BadChunk {
                expected: "openai chat completion chunk",
            }
        })?;

        let mut frames = Vec::new();
        if let Some(choice) = chunk.choices.first() {
            if let Some(content) = &choice.delta.content
                && !content.is_empty()
            {
                let frame = OllamaChatFrame::delta(&self.model, &self.created_at, content.clone());
                frames.push(StreamFrame::data(
                    serde_json::to_value(&frame).unwrap_or(json!({})),
                ));
            }
            if let Some(reason) = choice.finish_reason
                && !self.done_sent
            {
                self.done_sent = true;
                let frame = OllamaChatFrame::done(
                    &self.model,
                    &self.created_at,
                    Some(done_reason(reason).to_string()),
                );
                frames.push(StreamFrame::data(
                    serde_json::to_value(&frame).unwrap_or(json!({})),
                ));
            }
        }
        Ok(frames)
    }

    fn finish(&mut self) -> Vec<StreamFrame> {
        if self.done_sent {
            return Vec::new();
        }
        self.done_sent = true;
        let frame = OllamaChatFrame::done(&self.model, &self.created_at, Some("stop".to_string()));
        vec![StreamFrame::data(
            serde_json::to_value(&frame).unwrap_or(json!({})),
        )]
    }
}

fn done_reason(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Length => "length",
        _ => "stop",
    }
}
