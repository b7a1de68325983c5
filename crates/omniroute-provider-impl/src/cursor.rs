//! Cursor executor: Jyh checksum signing, Connect-RPC transport, protobuf
//! body, and synthesis of the frame stream back into openai-chat chunks.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;

use omniroute_protocol::connect::{FrameDecoder, encode_frame};
use omniroute_protocol::cursor::{
    CursorStreamItem, decode_response_payload, parse_error_payload, split_tool_call_id,
};
use omniroute_protocol::openai::{
    ChatChunk, ChatRole, ChunkChoice, ChunkDelta, FinishReason, FunctionCallDelta, ToolCallChunk,
};
use omniroute_protocol::{Format, sse};
use omniroute_provider_core::{
    ExecuteContext, ExecutionOutcome, Headers, ProviderConnection, ProviderError,
    ProviderExecutor, ProviderResult, UpstreamBody, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse, failure_from_response, header_set, provider_error_failure, set_bearer,
};

const DEFAULT_BASE_URL: &str = "https://api2.cursor.sh";
const CHAT_RPC_PATH: &str = "/aiserver.v1.ChatService/StreamUnifiedChatWithTools";
const CLIENT_VERSION: &str = "1.7.38";

/// Time-windowed request checksum: the millisecond clock divided down to a
/// coarse window, packed into 6 bytes, run through an XOR chain seeded at
/// 165, base64-url encoded, with the machine id appended.
pub fn jyh_checksum(machine_id: &str, now_ms: u64) -> String {
    let window = now_ms / 1_000_000;
    let mut packed = [
        (window >> 40) as u8,
        (window >> 32) as u8,
        (window >> 24) as u8,
        (window >> 16) as u8,
        (window >> 8) as u8,
        window as u8,
    ];
    let mut key: u8 = 165;
    for (index, byte) in packed.iter_mut().enumerate() {
        *byte = (*byte ^ key).wrapping_add(index as u8);
        key = *byte;
    }
    format!("{}{machine_id}", URL_SAFE_NO_PAD.encode(packed))
}

#[derive(Debug, Default)]
pub struct CursorExecutor;

impl CursorExecutor {
    pub fn new() -> Self {
        Self
    }

    fn session_token(connection: &ProviderConnection) -> ProviderResult<&str> {
        connection
            .access_token
            .as_deref()
            .or(connection.api_key.as_deref())
            .ok_or(ProviderError::MissingCredentialField("access_token"))
    }

    fn machine_id(connection: &ProviderConnection) -> ProviderResult<&str> {
        connection
            .data_str("machine_id")
            .ok_or(ProviderError::MissingCredentialField("machine_id"))
    }
}

#[async_trait]
impl ProviderExecutor for CursorExecutor {
    fn name(&self) -> &str {
        "cursor"
    }

    fn wire_format(&self) -> Format {
        Format::Cursor
    }

    fn build_url(
        &self,
        connection: &ProviderConnection,
        _model: &str,
        _stream: bool,
    ) -> ProviderResult<String> {
        let base = connection
            .data_str("base_url")
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        Ok(format!("{base}{CHAT_RPC_PATH}"))
    }

    fn build_headers(
        &self,
        connection: &ProviderConnection,
        _stream: bool,
    ) -> ProviderResult<Headers> {
        let token = Self::session_token(connection)?;
        let machine_id = Self::machine_id(connection)?;
        let now_ms = (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64;

        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "content-type", "application/connect+proto");
        header_set(&mut headers, "connect-protocol-version", "1");
        set_bearer(&mut headers, token);
        header_set(
            &mut headers,
            "x-cursor-checksum",
            jyh_checksum(machine_id, now_ms),
        );
        header_set(&mut headers, "x-cursor-client-version", CLIENT_VERSION);
        if connection
            .provider_data
            .get("ghost_mode")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            header_set(&mut headers, "x-ghost-mode", "true");
        }
        Ok(headers)
    }

    async fn execute(
        &self,
        ctx: &ExecuteContext,
        connection: &ProviderConnection,
        model: &str,
        body: Value,
        _stream: bool,
    ) -> Result<ExecutionOutcome, UpstreamFailure> {
        let mut request = omniroute_transform::chat2cursor::request::from_wire(&body)
            .ok_or_else(|| {
                provider_error_failure(ProviderError::Other(
                    "cursor wire body did not round-trip".to_string(),
                ))
            })?;
        request.conversation_id = Uuid::new_v4().to_string();
        if request.model.is_empty() {
            request.model = model.to_string();
        }

        let payload = request.encode();
        let framed = encode_frame(0, &payload);
        let url = self
            .build_url(connection, model, true)
            .map_err(provider_error_failure)?;
        let headers = self
            .build_headers(connection, true)
            .map_err(provider_error_failure)?;

        let mut http_request =
            UpstreamHttpRequest::post_json(url, headers, framed, true);
        http_request.prefer_h2 = true;

        let response = ctx.client.send(http_request).await?;
        if !response.is_success() {
            return Err(failure_from_response(response).await);
        }

        let upstream_headers = response.headers;
        let mut frames = match response.body {
            UpstreamBody::Stream(rx) => FrameStream::new(rx),
            UpstreamBody::Bytes(bytes) => FrameStream::from_bytes(bytes),
        };

        // Peek ahead so a leading error envelope (rate limit) becomes a
        // proper HTTP failure instead of a poisoned stream.
        let first = frames.next_items().await;
        if let Some(FrameItems::Error(error)) = &first {
            let status = if error.rate_limited { 429 } else { 502 };
            return Err(UpstreamFailure::Http {
                status,
                headers: upstream_headers,
                body: Bytes::from(error.message.clone()),
            });
        }

        let model_name = model.to_string();
        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
        tokio::spawn(async move {
            let mut synth = ChunkSynthesizer::new(&model_name);
            let mut next = first;
            loop {
                match next {
                    Some(FrameItems::Items(items)) => {
                        for item in items {
                            for chunk in synth.on_item(item) {
                                if send_chunk(&tx, &chunk).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Some(FrameItems::Error(error)) => {
                        let frame = sse::encode_frame(
                            None,
                            &json!({"error": {"message": error.message, "code": error.code}})
                                .to_string(),
                        );
                        let _ = tx.send(frame).await;
                        return;
                    }
                    Some(FrameItems::EndOfStream) | None => break,
                }
                next = frames.next_items().await;
            }
            for chunk in synth.finish() {
                if send_chunk(&tx, &chunk).await.is_err() {
                    return;
                }
            }
        });

        Ok(ExecutionOutcome {
            response: UpstreamHttpResponse {
                status: 200,
                headers: upstream_headers,
                body: UpstreamBody::Stream(rx),
            },
            response_format: Format::OpenaiChat,
            retry_after_ms: None,
            connection_update: None,
        })
    }
}

async fn send_chunk(
    tx: &tokio::sync::mpsc::Sender<Bytes>,
    chunk: &ChatChunk,
) -> Result<(), ()> {
    let data = serde_json::to_string(chunk).map_err(|_| ())?;
    tx.send(sse::encode_frame(None, &data)).await.map_err(|_| ())
}

enum FrameItems {
    Items(Vec<CursorStreamItem>),
    Error(omniroute_protocol::cursor::CursorError),
    EndOfStream,
}

/// Pulls Connect frames out of the byte stream and decodes their payloads.
struct FrameStream {
    rx: Option<omniroute_provider_core::ByteStream>,
    decoder: FrameDecoder,
    queued: std::collections::VecDeque<omniroute_protocol::connect::ConnectFrame>,
    done: bool,
}

impl FrameStream {
    fn new(rx: omniroute_provider_core::ByteStream) -> Self {
        Self {
            rx: Some(rx),
            decoder: FrameDecoder::new(),
            queued: std::collections::VecDeque::new(),
            done: false,
        }
    }

    fn from_bytes(bytes: Bytes) -> Self {
        let mut stream = Self {
            rx: None,
            decoder: FrameDecoder::new(),
            queued: std::collections::VecDeque::new(),
            done: false,
        };
        if let Ok(frames) = stream.decoder.push(&bytes) {
            stream.queued.extend(frames);
        }
        stream
    }

    async fn next_items(&mut self) -> Option<FrameItems> {
        loop {
            if let Some(frame) = self.queued.pop_front() {
                let payload = match frame.decoded_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(event = "cursor_frame_decode_failed", error = %err);
                        continue;
                    }
                };
                if let Some(error) = parse_error_payload(&payload) {
                    return Some(FrameItems::Error(error));
                }
                if frame.is_end_stream() {
                    return Some(FrameItems::EndOfStream);
                }
                match decode_response_payload(&payload) {
                    Ok(items) if items.is_empty() => continue,
                    Ok(items) => return Some(FrameItems::Items(items)),
                    Err(err) => {
                        warn!(event = "cursor_payload_decode_failed", error = %err);
                        continue;
                    }
                }
            }
            if self.done {
                return None;
            }
            let Some(rx) = self.rx.as_mut() else {
                self.done = true;
                continue;
            };
            match rx.recv().await {
                Some(chunk) => match self.decoder.push(&chunk) {
                    Ok(frames) => self.queued.extend(frames),
                    Err(err) => {
                        warn!(event = "cursor_frame_decode_failed", error = %err);
                        self.done = true;
                    }
                },
                None => self.done = true,
            }
        }
    }
}

/// Builds openai-chat chunks from decoded Cursor items.
struct ChunkSynthesizer {
    id: String,
    model: String,
    role_sent: bool,
    saw_tool_call: bool,
    next_tool_index: i64,
}

impl ChunkSynthesizer {
    fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4()),
            model: model.to_string(),
            role_sent: false,
            saw_tool_call: false,
            next_tool_index: 0,
        }
    }

    fn chunk(&self, delta: ChunkDelta, finish: Option<FinishReason>) -> ChatChunk {
        let mut chunk = ChatChunk::new(self.id.clone(), self.model.clone(), 0);
        chunk.choices.push(ChunkChoice {
            index: 0,
            delta,
            finish_reason: finish,
        });
        chunk
    }

    fn on_item(&mut self, item: CursorStreamItem) -> Vec<ChatChunk> {
        let mut out = Vec::new();
        if !self.role_sent {
            self.role_sent = true;
            out.push(self.chunk(
                ChunkDelta {
                    role: Some(ChatRole::Assistant),
                    ..ChunkDelta::default()
                },
                None,
            ));
        }
        match item {
            CursorStreamItem::Text(text) => {
                if !text.is_empty() {
                    out.push(self.chunk(
                        ChunkDelta {
                            content: Some(text),
                            ..ChunkDelta::default()
                        },
                        None,
                    ));
                }
            }
            CursorStreamItem::Thinking(text) => {
                if !text.is_empty() {
                    out.push(self.chunk(
                        ChunkDelta {
                            reasoning_content: Some(text),
                            ..ChunkDelta::default()
                        },
                        None,
                    ));
                }
            }
            CursorStreamItem::ToolCall(call) => {
                self.saw_tool_call = true;
                let index = self.next_tool_index;
                self.next_tool_index += 1;
                let (external_id, _) = split_tool_call_id(&call.call_id);
                let id = if external_id.is_empty() {
                    format!("{}-call-{index}", self.id)
                } else {
                    external_id.to_string()
                };
                let name = call
                    .name
                    .strip_prefix("mcp_custom_")
                    .unwrap_or(&call.name)
                    .to_string();
                out.push(self.chunk(
                    ChunkDelta {
                        tool_calls: Some(vec![ToolCallChunk {
                            index,
                            id: Some(id),
                            kind: Some("function".to_string()),
                            function: Some(FunctionCallDelta {
                                name: Some(name),
                                arguments: Some(call.arguments),
                            }),
                        }]),
                        ..ChunkDelta::default()
                    },
                    None,
                ));
            }
        }
        out
    }

    fn finish(&mut self) -> Vec<ChatChunk> {
        let reason = if self.saw_tool_call {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        };
        vec![self.chunk(ChunkDelta::default(), Some(reason))]
    }
}
