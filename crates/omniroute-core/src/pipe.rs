//! The streaming pipe: upstream bytes → SSE frames → stateful translation →
//! client frames, plus the stream→JSON collapse for non-streaming clients.

use bytes::Bytes;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::warn;

use omniroute_protocol::Format;
use omniroute_protocol::sse::{SseDecoder, done_frame, encode_frame};
use omniroute_provider_core::{UpstreamBody, header_get};
use omniroute_transform::collapse::{ChatCollapse, ClaudeCollapse, ResponsesCollapse};
use omniroute_transform::registry::{StreamFrame, StreamTranslator};

use crate::error::GatewayError;

/// Dropped silently when unparseable; anything larger fails the stream.
const MAX_IGNORED_INVALID_LINE: usize = 1024;

pub fn content_type_for(client_format: Format) -> &'static str {
    match client_format {
        Format::Ollama => "application/x-ndjson",
        _ => "text/event-stream",
    }
}

fn encode_client_frame(client_format: Format, frame: &StreamFrame) -> Bytes {
    match client_format {
        Format::Ollama => {
            let mut line = frame.data.to_string();
            line.push('\n');
            Bytes::from(line)
        }
        _ => encode_frame(frame.event.as_deref(), &frame.data.to_string()),
    }
}

fn terminal_error_frames(client_format: Format, message: &str, code: &str) -> Vec<Bytes> {
    let payload = json!({"error": {"message": message, "type": "server_error", "code": code}});
    match client_format {
        Format::Ollama => vec![Bytes::from(format!("{payload}\n"))],
        _ => vec![encode_frame(None, &payload.to_string()), done_frame()],
    }
}

enum Decoded {
    Chunk(Value),
    Done,
    Skip,
    /// Oversized garbage; the stream cannot continue.
    Fatal,
}

fn decode_data(data: &str, trace_id: &str) -> Decoded {
    let trimmed = data.trim();
    if trimmed.is_empty() {
        return Decoded::Skip;
    }
    if trimmed == "[DONE]" {
        return Decoded::Done;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => Decoded::Chunk(value),
        Err(err) => {
            if trimmed.len() <= MAX_IGNORED_INVALID_LINE {
                warn!(
                    event = "stream_chunk_dropped",
                    trace_id = %trace_id,
                    size = trimmed.len(),
                    error = %err
                );
                Decoded::Skip
            } else {
                Decoded::Fatal
            }
        }
    }
}

/// Pump an upstream stream through a translator into client frames. Returns
/// the receiving end of the client byte stream; the pump task ends when the
/// upstream closes or the client goes away (send failure).
pub fn stream_to_client(
    body: UpstreamBody,
    mut translator: Box<dyn StreamTranslator>,
    client_format: Format,
    trace_id: String,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut source = ByteSource::new(body);
        let mut decoder = SseDecoder::new();

        'outer: while let Some(chunk) = source.next().await {
            for frame in decoder.push(&chunk) {
                match decode_data(&frame.data, &trace_id) {
                    Decoded::Skip => {}
                    Decoded::Done => break 'outer,
                    Decoded::Fatal => {
                        for frame in terminal_error_frames(
                            client_format,
                            "unparseable oversized stream chunk",
                            "stream_decode",
                        ) {
                            let _ = tx.send(frame).await;
                        }
                        return;
                    }
                    Decoded::Chunk(value) => {
                        match translator.translate(&value) {
                            Ok(frames) => {
                                for frame in frames {
                                    let bytes = encode_client_frame(client_format, &frame);
                                    if tx.send(bytes).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(err) => {
                                warn!(
                                    event = "stream_translate_failed",
                                    trace_id = %trace_id,
                                    error = %err
                                );
                                for frame in terminal_error_frames(
                                    client_format,
                                    &err.to_string(),
                                    "translator",
                                ) {
                                    let _ = tx.send(frame).await;
                                }
                                return;
                            }
                        }
                    }
                }
            }
        }

        // Residual buffer flush at EOF, then translator trailers.
        for frame in decoder.finish() {
            if let Decoded::Chunk(value) = decode_data(&frame.data, &trace_id)
                && let Ok(frames) = translator.translate(&value)
            {
                for frame in frames {
                    if tx.send(encode_client_frame(client_format, &frame)).await.is_err() {
                        return;
                    }
                }
            }
        }
        for frame in translator.finish() {
            if tx.send(encode_client_frame(client_format, &frame)).await.is_err() {
                return;
            }
        }
        if client_format != Format::Ollama {
            let _ = tx.send(done_frame()).await;
        }
    });
    rx
}

/// Drain the whole upstream stream through the translator and fold the
/// client-dialect frames into one JSON body.
pub async fn collapse_to_json(
    body: UpstreamBody,
    mut translator: Box<dyn StreamTranslator>,
    client_format: Format,
    trace_id: &str,
) -> Result<Bytes, GatewayError> {
    let mut source = ByteSource::new(body);
    let mut decoder = SseDecoder::new();
    let mut frames: Vec<StreamFrame> = Vec::new();

    let mut handle = |value: &Value,
                      translator: &mut Box<dyn StreamTranslator>,
                      frames: &mut Vec<StreamFrame>|
     -> Result<(), GatewayError> {
        let translated = translator
            .translate(value)
            .map_err(|err| GatewayError::translator_failure(&err.to_string()))?;
        frames.extend(translated);
        Ok(())
    };

    'outer: while let Some(chunk) = source.next().await {
        for frame in decoder.push(&chunk) {
            match decode_data(&frame.data, trace_id) {
                Decoded::Skip => {}
                Decoded::Done => break 'outer,
                Decoded::Fatal => {
                    return Err(GatewayError::translator_failure("stream_decode"));
                }
                Decoded::Chunk(value) => handle(&value, &mut translator, &mut frames)?,
            }
        }
    }
    for frame in decoder.finish() {
        if let Decoded::Chunk(value) = decode_data(&frame.data, trace_id) {
            handle(&value, &mut translator, &mut frames)?;
        }
    }
    frames.extend(translator.finish());

    Ok(fold_frames(client_format, &frames))
}

fn fold_frames(client_format: Format, frames: &[StreamFrame]) -> Bytes {
    match client_format {
        Format::OpenaiResponses => {
            let mut acc = ResponsesCollapse::new();
            for frame in frames {
                acc.push(&frame.data);
            }
            Bytes::from(acc.into_response().to_string())
        }
        Format::Claude => {
            let mut acc = ClaudeCollapse::new();
            for frame in frames {
                acc.push(&frame.data);
            }
            Bytes::from(acc.into_response().to_string())
        }
        Format::Ollama => {
            // Concatenate assistant deltas into one final done frame.
            let mut model = String::new();
            let mut created_at = String::new();
            let mut content = String::new();
            let mut done_reason = None;
            for frame in frames {
                if model.is_empty()
                    && let Some(name) = frame.data.get("model").and_then(Value::as_str)
                {
                    name.clone_into(&mut model);
                }
                if created_at.is_empty()
                    && let Some(at) = frame.data.get("created_at").and_then(Value::as_str)
                {
                    at.clone_into(&mut created_at);
                }
                if let Some(delta) = frame
                    .data
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(Value::as_str)
                {
                    content.push_str(delta);
                }
                if let Some(reason) = frame.data.get("done_reason").and_then(Value::as_str) {
                    done_reason = Some(reason.to_string());
                }
            }
            let body = json!({
                "model": model,
                "created_at": created_at,
                "message": {"role": "assistant", "content": content},
                "done": true,
                "done_reason": done_reason.unwrap_or_else(|| "stop".to_string()),
            });
            Bytes::from(body.to_string())
        }
        _ => {
            let mut acc = ChatCollapse::new();
            for frame in frames {
                acc.push(&frame.data);
            }
            Bytes::from(
                serde_json::to_string(&acc.into_response()).unwrap_or_else(|_| "{}".to_string()),
            )
        }
    }
}

/// Uniform pull over the two upstream body shapes.
struct ByteSource {
    bytes: Option<Bytes>,
    rx: Option<omniroute_provider_core::ByteStream>,
}

impl ByteSource {
    fn new(body: UpstreamBody) -> Self {
        match body {
            UpstreamBody::Bytes(bytes) => Self {
                bytes: Some(bytes),
                rx: None,
            },
            UpstreamBody::Stream(rx) => Self {
                bytes: None,
                rx: Some(rx),
            },
        }
    }

    async fn next(&mut self) -> Option<Bytes> {
        if let Some(bytes) = self.bytes.take() {
            return Some(bytes);
        }
        self.rx.as_mut()?.recv().await
    }
}

/// Charset sniff for upstream JSON passthrough responses.
pub fn upstream_content_type(headers: &omniroute_provider_core::Headers) -> String {
    header_get(headers, "content-type")
        .unwrap_or("application/json")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use omniroute_transform::registry::{RequestContext, TranslatorRegistry};

    fn chat_sse(chunks: &[Value]) -> UpstreamBody {
        let mut raw = String::new();
        for chunk in chunks {
            raw.push_str(&format!("data: {chunk}\n\n"));
        }
        raw.push_str("data: [DONE]\n\n");
        UpstreamBody::Bytes(Bytes::from(raw))
    }

    fn passthrough_translator() -> Box<dyn StreamTranslator> {
        TranslatorRegistry::standard()
            .lookup(Format::OpenaiChat, Format::OpenaiChat)
            .unwrap()
            .stream
            .unwrap()(&RequestContext {
            model: "gpt-4o",
            stream: true,
        })
    }

    async fn drain(mut rx: mpsc::Receiver<Bytes>) -> String {
        let mut out = String::new();
        while let Some(chunk) = rx.recv().await {
            out.push_str(std::str::from_utf8(&chunk).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn sse_stream_ends_with_done_terminator() {
        let body = chat_sse(&[json!({
            "id": "c", "object": "chat.completion.chunk", "created": 1, "model": "m",
            "choices": [{"index": 0, "delta": {"content": "hi"}}]
        })]);
        let rx = stream_to_client(
            body,
            passthrough_translator(),
            Format::OpenaiChat,
            "t1".to_string(),
        );
        let out = drain(rx).await;
        assert!(out.starts_with("data: {"));
        assert!(out.ends_with("data: [DONE]\n\n"));
        // Every frame is terminated by a blank line.
        for part in out.trim_end().split("\n\n") {
            assert!(part.starts_with("data: "));
        }
    }

    #[tokio::test]
    async fn small_garbage_lines_are_dropped() {
        let raw = "data: not-json\n\ndata: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\
                    \"created\":1,\"model\":\"m\",\"choices\":[]}\n\ndata: [DONE]\n\n";
        let rx = stream_to_client(
            UpstreamBody::Bytes(Bytes::from(raw)),
            passthrough_translator(),
            Format::OpenaiChat,
            "t2".to_string(),
        );
        let out = drain(rx).await;
        assert!(!out.contains("not-json"));
        assert!(out.contains("chat.completion.chunk"));
    }

    #[tokio::test]
    async fn oversized_garbage_fails_the_stream() {
        let big = "x".repeat(4096);
        let raw = format!("data: {big}\n\n");
        let rx = stream_to_client(
            UpstreamBody::Bytes(Bytes::from(raw)),
            passthrough_translator(),
            Format::OpenaiChat,
            "t3".to_string(),
        );
        let out = drain(rx).await;
        assert!(out.contains("\"error\""));
        assert!(out.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn collapse_produces_single_chat_response() {
        let body = chat_sse(&[
            json!({"id": "c", "object": "chat.completion.chunk", "created": 1, "model": "m",
                    "choices": [{"index": 0, "delta": {"role": "assistant", "content": "hel"}}]}),
            json!({"id": "c", "object": "chat.completion.chunk", "created": 1, "model": "m",
                    "choices": [{"index": 0, "delta": {"content": "lo"}, "finish_reason": "stop"}]}),
        ]);
        let bytes = collapse_to_json(
            body,
            passthrough_translator(),
            Format::OpenaiChat,
            "t4",
        )
        .await
        .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["object"], "chat.completion");
        assert_eq!(value["choices"][0]["message"]["content"], "hello");
    }
}
