//! End-to-end engine tests over a scripted upstream client and the
//! in-memory config store.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::{Value, json};
use time::OffsetDateTime;

use omniroute_core::{Engine, EngineBody, EngineRequest};
use omniroute_protocol::Format;
use omniroute_provider_core::{
    ConfigStore, ConnectionStatus, EventHub, Headers, MachineRecord, MemoryConfigStore,
    ProviderConnection, ProviderKind, ProviderRuntime, UpstreamBody, UpstreamClient,
    UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
};

// ---- scripted upstream ----

struct Scripted {
    status: u16,
    headers: Headers,
    body: Bytes,
}

impl Scripted {
    fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(body.to_string()),
        }
    }

    fn sse(frames: &[Value]) -> Self {
        let mut raw = String::new();
        for frame in frames {
            raw.push_str(&format!("data: {frame}\n\n"));
        }
        raw.push_str("data: [DONE]\n\n");
        Self {
            status: 200,
            headers: vec![("content-type".to_string(), "text/event-stream".to_string())],
            body: Bytes::from(raw),
        }
    }

    fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::from(body.to_string()),
        }
    }
}

#[derive(Default)]
struct ScriptedClient {
    responses: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<UpstreamHttpRequest>>,
}

impl ScriptedClient {
    fn push(&self, response: Scripted) {
        self.responses.lock().unwrap().push_back(response);
    }

    fn seen(&self) -> Vec<UpstreamHttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl UpstreamClient for ScriptedClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            self.requests.lock().unwrap().push(req);
            let scripted = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Scripted::text(500, "script exhausted"));
            Ok(UpstreamHttpResponse {
                status: scripted.status,
                headers: scripted.headers,
                body: UpstreamBody::Bytes(scripted.body),
            })
        })
    }
}

// ---- fixture plumbing ----

struct Fixture {
    engine: Engine,
    store: Arc<MemoryConfigStore>,
    client: Arc<ScriptedClient>,
}

async fn fixture(record: MachineRecord) -> Fixture {
    let store = Arc::new(MemoryConfigStore::new());
    store.insert("m1", record).await;
    let client = Arc::new(ScriptedClient::default());
    let engine = Engine::new(
        store.clone(),
        client.clone(),
        Arc::new(omniroute_provider_impl::ExecutorRegistry::standard()),
        Arc::new(ProviderRuntime::new()),
        EventHub::new(64),
    );
    Fixture {
        engine,
        store,
        client,
    }
}

fn openai_connection(id: &str, priority: i64) -> ProviderConnection {
    let mut connection = ProviderConnection::new_api_key(id, ProviderKind::Openai, "sk-up");
    connection.priority = priority;
    connection
}

fn record_with(connections: Vec<ProviderConnection>) -> MachineRecord {
    let mut record = MachineRecord::default();
    for connection in connections {
        record.providers.insert(connection.id.clone(), connection);
    }
    record
}

fn chat_request(model: &str, stream: bool) -> EngineRequest {
    EngineRequest {
        trace_id: "trace-test".to_string(),
        machine_id: "m1".to_string(),
        dialect: Format::OpenaiChat,
        body: json!({
            "model": model,
            "messages": [{"role": "user", "content": "hi"}],
            "stream": stream,
        }),
        stream,
    }
}

async fn body_json(body: EngineBody) -> Value {
    match body {
        EngineBody::Json(bytes) => serde_json::from_slice(&bytes).unwrap(),
        EngineBody::Stream { mut rx, .. } => {
            let mut out = Vec::new();
            while let Some(chunk) = rx.recv().await {
                out.extend_from_slice(&chunk);
            }
            panic!(
                "expected json body, got stream: {}",
                String::from_utf8_lossy(&out)
            );
        }
    }
}

async fn body_text(body: EngineBody) -> String {
    match body {
        EngineBody::Json(bytes) => String::from_utf8_lossy(&bytes).to_string(),
        EngineBody::Stream { mut rx, .. } => {
            let mut out = String::new();
            while let Some(chunk) = rx.recv().await {
                out.push_str(std::str::from_utf8(&chunk).unwrap());
            }
            out
        }
    }
}

// ---- scenarios ----

#[tokio::test]
async fn happy_openai_chat_passthrough() {
    let fx = fixture(record_with(vec![openai_connection("a", 1)])).await;
    let upstream = json!({"id": "cmpl-1", "object": "chat.completion", "created": 1,
        "model": "gpt-4o",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"},
                      "finish_reason": "stop"}]});
    fx.client.push(Scripted::json(200, upstream.clone()));

    let record = fx.engine.load_machine("m1").await.unwrap();
    let response = fx
        .engine
        .handle_chat(&record, chat_request("openai/gpt-4o", false))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(body_json(response.body).await, upstream);

    let seen = fx.client.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].url, "https://api.openai.com/v1/chat/completions");
    let sent: Value = serde_json::from_slice(seen[0].body.as_ref().unwrap()).unwrap();
    assert_eq!(sent["model"], "gpt-4o");
    assert!(sent.get("stream").is_none());

    // markAccountActive observed exactly once: health written with active
    // status and a fresh updated_at.
    let stored = fx.store.load("m1").await.unwrap().unwrap();
    let health = &stored.providers["a"].health;
    assert_eq!(health.status, ConnectionStatus::Active);
    assert!(health.updated_at.is_some());
    assert_eq!(health.backoff_level, 0);
}

#[tokio::test]
async fn fallback_rotates_to_second_account_on_429() {
    let fx = fixture(record_with(vec![
        openai_connection("a", 1),
        openai_connection("b", 2),
    ]))
    .await;
    fx.client.push(Scripted::text(429, "slow down"));
    fx.client.push(Scripted::json(
        200,
        json!({"id": "x", "object": "chat.completion", "created": 1, "model": "gpt-4o",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "from b"},
                              "finish_reason": "stop"}]}),
    ));

    let record = fx.engine.load_machine("m1").await.unwrap();
    let response = fx
        .engine
        .handle_chat(&record, chat_request("openai/gpt-4o", false))
        .await
        .unwrap();
    let body = body_json(response.body).await;
    assert_eq!(body["choices"][0]["message"]["content"], "from b");
    assert_eq!(fx.client.seen().len(), 2);

    let stored = fx.store.load("m1").await.unwrap().unwrap();
    let a = &stored.providers["a"].health;
    assert_eq!(a.status, ConnectionStatus::Unavailable);
    let until = a.rate_limited_until.unwrap();
    let lead = until - OffsetDateTime::now_utc();
    // 60 s base cooldown at backoff level zero.
    assert!(lead.whole_seconds() > 50 && lead.whole_seconds() <= 60);
    assert_eq!(a.backoff_level, 1);
    assert_eq!(a.error_code, Some(429));

    let b = &stored.providers["b"].health;
    assert_eq!(b.status, ConnectionStatus::Active);
}

#[tokio::test]
async fn all_rate_limited_returns_429_with_retry_after() {
    let now = OffsetDateTime::now_utc();
    let mut a = openai_connection("a", 1);
    a.health.rate_limited_until = Some(now + time::Duration::seconds(300));
    a.health.last_error = Some("upstream 429".to_string());
    let mut b = openai_connection("b", 2);
    b.health.rate_limited_until = Some(now + time::Duration::seconds(300));
    let fx = fixture(record_with(vec![a, b])).await;

    let record = fx.engine.load_machine("m1").await.unwrap();
    let err = fx
        .engine
        .handle_chat(&record, chat_request("openai/gpt-4o", false))
        .await
        .unwrap_err();
    assert_eq!(err.status, 429);
    let retry = err.retry_after_secs.unwrap();
    assert!((295..=300).contains(&retry));
    assert!(fx.client.seen().is_empty());
}

#[tokio::test]
async fn other_4xx_passes_through_without_retry() {
    let fx = fixture(record_with(vec![
        openai_connection("a", 1),
        openai_connection("b", 2),
    ]))
    .await;
    fx.client
        .push(Scripted::text(400, "{\"error\":{\"message\":\"bad request\"}}"));

    let record = fx.engine.load_machine("m1").await.unwrap();
    let err = fx
        .engine
        .handle_chat(&record, chat_request("openai/gpt-4o", false))
        .await
        .unwrap_err();
    assert_eq!(err.status, 400);
    assert_eq!(fx.client.seen().len(), 1);

    let stored = fx.store.load("m1").await.unwrap().unwrap();
    assert_eq!(
        stored.providers["a"].health.status,
        ConnectionStatus::Active
    );
}

#[tokio::test]
async fn no_credentials_is_a_400() {
    let fx = fixture(record_with(vec![])).await;
    let record = fx.engine.load_machine("m1").await.unwrap();
    let err = fx
        .engine
        .handle_chat(&record, chat_request("openai/gpt-4o", false))
        .await
        .unwrap_err();
    assert_eq!(err.status, 400);
    assert!(err.envelope.error.message.contains("no credentials"));
}

#[tokio::test]
async fn model_alias_resolves_before_dispatch() {
    let mut record = record_with(vec![openai_connection("a", 1)]);
    record
        .model_aliases
        .insert("mychat".to_string(), "openai/gpt-4o-mini".to_string());
    let fx = fixture(record).await;
    fx.client.push(Scripted::json(
        200,
        json!({"id": "x", "object": "chat.completion", "created": 1, "model": "gpt-4o-mini",
                "choices": []}),
    ));

    let record = fx.engine.load_machine("m1").await.unwrap();
    fx.engine
        .handle_chat(&record, chat_request("mychat", false))
        .await
        .unwrap();
    let sent: Value =
        serde_json::from_slice(fx.client.seen()[0].body.as_ref().unwrap()).unwrap();
    assert_eq!(sent["model"], "gpt-4o-mini");
}

#[tokio::test]
async fn streaming_claude_client_over_openai_provider() {
    let fx = fixture(record_with(vec![openai_connection("a", 1)])).await;
    fx.client.push(Scripted::sse(&[
        json!({"id": "c1", "object": "chat.completion.chunk", "created": 1, "model": "gpt-4o",
                "choices": [{"index": 0, "delta": {"role": "assistant", "content": "hi"}}]}),
        json!({"id": "c1", "object": "chat.completion.chunk", "created": 1, "model": "gpt-4o",
                "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}}),
    ]));

    let record = fx.engine.load_machine("m1").await.unwrap();
    let request = EngineRequest {
        trace_id: "t".to_string(),
        machine_id: "m1".to_string(),
        dialect: Format::Claude,
        body: json!({
            "model": "openai/gpt-4o",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
        }),
        stream: true,
    };
    let response = fx.engine.handle_chat(&record, request).await.unwrap();
    assert_eq!(response.status, 200);
    let out = body_text(response.body).await;
    assert!(out.contains("event: message_start"));
    assert!(out.contains("event: content_block_delta"));
    assert!(out.contains("event: message_stop"));
    assert!(out.ends_with("data: [DONE]\n\n"));

    // The upstream call was translated into openai-chat with streaming on.
    let sent: Value =
        serde_json::from_slice(fx.client.seen()[0].body.as_ref().unwrap()).unwrap();
    assert_eq!(sent["stream"], true);
    assert_eq!(sent["messages"][0]["role"], "user");
}

#[tokio::test]
async fn copilot_codex_models_reroute_to_responses() {
    let mut connection =
        ProviderConnection::new_api_key("gh-1", ProviderKind::Github, "unused");
    connection.access_token = Some("gho_x".to_string());
    connection.provider_data = json!({
        "copilot_token": "cop",
        "copilot_token_expires_at": 4_102_444_800i64,
    });
    let fx = fixture(record_with(vec![connection])).await;

    // First call: /chat/completions rejects the model, /responses streams.
    fx.client.push(Scripted::text(
        400,
        "this model is not accessible via the /chat/completions endpoint",
    ));
    let responses_stream = || {
        Scripted::sse(&[
            json!({"type": "response.created",
                    "response": {"id": "r1", "object": "response", "created_at": 7,
                                  "status": "in_progress", "output": [], "model": "gpt-5.1-codex"}}),
            json!({"type": "response.output_text.delta", "output_index": 0, "delta": "hey"}),
            json!({"type": "response.output_item.done", "output_index": 0,
                    "item": {"type": "message", "role": "assistant", "status": "completed",
                              "content": [{"type": "output_text", "text": "hey"}]}}),
            json!({"type": "response.completed",
                    "response": {"id": "r1", "object": "response", "created_at": 7,
                                  "status": "completed", "output": [],
                                  "usage": {"input_tokens": 2, "output_tokens": 1}}}),
        ])
    };
    fx.client.push(responses_stream());

    let record = fx.engine.load_machine("m1").await.unwrap();
    let response = fx
        .engine
        .handle_chat(&record, chat_request("gh/gpt-5.1-codex", false))
        .await
        .unwrap();
    let body = body_json(response.body).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "hey");

    let seen = fx.client.seen();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].url.ends_with("/chat/completions"));
    assert!(seen[1].url.ends_with("/responses"));
    let rerouted: Value = serde_json::from_slice(seen[1].body.as_ref().unwrap()).unwrap();
    assert_eq!(rerouted["input"][0]["type"], "message");

    // The learned model is persisted for restarts.
    let stored = fx.store.load("m1").await.unwrap().unwrap();
    let known = &stored.providers["gh-1"].provider_data["known_codex_models"];
    assert_eq!(known[0], "gpt-5.1-codex");

    // Second call goes straight to /responses.
    fx.client.push(responses_stream());
    let record = fx.store.load("m1").await.unwrap().unwrap();
    fx.engine
        .handle_chat(&record, chat_request("gh/gpt-5.1-codex", false))
        .await
        .unwrap();
    let seen = fx.client.seen();
    assert_eq!(seen.len(), 3);
    assert!(seen[2].url.ends_with("/responses"));
}

#[tokio::test]
async fn embeddings_default_encoding_and_passthrough() {
    let fx = fixture(record_with(vec![openai_connection("a", 1)])).await;
    let upstream = json!({"object": "list", "data": [{"object": "embedding", "index": 0,
        "embedding": [0.1, 0.2]}], "model": "text-embedding-ada-002"});
    fx.client.push(Scripted::json(200, upstream.clone()));

    let record = fx.engine.load_machine("m1").await.unwrap();
    let request = EngineRequest {
        trace_id: "t".to_string(),
        machine_id: "m1".to_string(),
        dialect: Format::OpenaiChat,
        body: json!({"model": "openai/text-embedding-ada-002", "input": "hi"}),
        stream: false,
    };
    let response = fx.engine.handle_embeddings(&record, request).await.unwrap();
    assert_eq!(body_json(response.body).await, upstream);

    let seen = fx.client.seen();
    assert_eq!(seen[0].url, "https://api.openai.com/v1/embeddings");
    let sent: Value = serde_json::from_slice(seen[0].body.as_ref().unwrap()).unwrap();
    assert_eq!(sent["encoding_format"], "float");
    assert_eq!(sent["input"], "hi");
}

#[tokio::test]
async fn embeddings_reject_empty_input_and_non_openai_providers() {
    let mut anthropic =
        ProviderConnection::new_api_key("c", ProviderKind::Anthropic, "sk-ant");
    anthropic.priority = 1;
    let fx = fixture(record_with(vec![openai_connection("a", 1), anthropic])).await;

    let record = fx.engine.load_machine("m1").await.unwrap();
    let empty = EngineRequest {
        trace_id: "t".to_string(),
        machine_id: "m1".to_string(),
        dialect: Format::OpenaiChat,
        body: json!({"model": "openai/text-embedding-ada-002", "input": ""}),
        stream: false,
    };
    let err = fx.engine.handle_embeddings(&record, empty).await.unwrap_err();
    assert_eq!(err.status, 400);

    let wrong_provider = EngineRequest {
        trace_id: "t".to_string(),
        machine_id: "m1".to_string(),
        dialect: Format::OpenaiChat,
        body: json!({"model": "anthropic/claude-sonnet-4-5", "input": "hi"}),
        stream: false,
    };
    let err = fx
        .engine
        .handle_embeddings(&record, wrong_provider)
        .await
        .unwrap_err();
    assert_eq!(err.status, 400);
    assert!(err.envelope.error.message.contains("does not support embeddings"));
}

#[tokio::test]
async fn combo_advances_on_5xx_only() {
    let mut record = record_with(vec![
        openai_connection("a", 1),
        {
            let mut c =
                ProviderConnection::new_api_key("ant", ProviderKind::Anthropic, "sk-ant");
            c.priority = 1;
            c
        },
    ]);
    record.combos.push(omniroute_provider_core::Combo {
        id: "cb".to_string(),
        name: "pair".to_string(),
        models: vec![
            "openai/gpt-4o".to_string(),
            "anthropic/claude-sonnet-4-5".to_string(),
        ],
    });
    let fx = fixture(record).await;

    // The only openai account dies with a 500, so the combo advances to the
    // anthropic entry. The chat client's request is translated to claude, so
    // the upstream is asked to stream; script claude stream events.
    fx.client.push(Scripted::text(500, "boom"));
    fx.client.push(Scripted::sse(&[
        json!({"type": "message_start",
                "message": {"id": "m", "type": "message", "role": "assistant",
                             "model": "claude-sonnet-4-5", "content": [],
                             "usage": {"input_tokens": 1}}}),
        json!({"type": "content_block_start", "index": 0,
                "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_delta", "index": 0,
                "delta": {"type": "text_delta", "text": "ok"}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"},
                "usage": {"output_tokens": 1}}),
        json!({"type": "message_stop"}),
    ]));

    let record = fx.engine.load_machine("m1").await.unwrap();
    let response = fx
        .engine
        .handle_chat(&record, chat_request("pair", false))
        .await
        .unwrap();
    // Second combo entry answered; its claude response was collapsed back
    // into the client's chat dialect.
    let body = body_json(response.body).await;
    assert_eq!(body["choices"][0]["message"]["content"], "ok");
    assert_eq!(fx.client.seen().len(), 2);
}

fn codex_connection(expires_at: i64) -> ProviderConnection {
    let mut connection = ProviderConnection::new_api_key("cx", ProviderKind::Codex, "unused");
    connection.access_token = Some("old-token".to_string());
    connection.refresh_token = Some("refresh-1".to_string());
    connection.expires_at = Some(expires_at);
    connection.provider_data = json!({"account_id": "acct_9"});
    connection
}

fn codex_stream() -> Scripted {
    Scripted::sse(&[
        json!({"type": "response.created",
                "response": {"id": "r9", "object": "response", "created_at": 1,
                              "status": "in_progress", "output": [], "model": "gpt-5.1"}}),
        json!({"type": "response.output_text.delta", "output_index": 0, "delta": "done"}),
        json!({"type": "response.completed",
                "response": {"id": "r9", "object": "response", "created_at": 1,
                              "status": "completed", "output": []}}),
    ])
}

#[tokio::test]
async fn expired_token_is_refreshed_before_the_attempt() {
    let fx = fixture(record_with(vec![codex_connection(1_000)])).await;
    fx.client.push(Scripted::json(
        200,
        json!({"access_token": "fresh-token", "refresh_token": "refresh-2", "expires_in": 3600}),
    ));
    fx.client.push(codex_stream());

    let record = fx.engine.load_machine("m1").await.unwrap();
    let response = fx
        .engine
        .handle_chat(&record, chat_request("cx/gpt-5.1", false))
        .await
        .unwrap();
    let body = body_json(response.body).await;
    assert_eq!(body["choices"][0]["message"]["content"], "done");

    let seen = fx.client.seen();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].url.contains("oauth/token"));
    let auth = seen[1]
        .headers
        .iter()
        .find(|(name, _)| name == "authorization")
        .map(|(_, value)| value.as_str());
    assert_eq!(auth, Some("Bearer fresh-token"));

    // The merged fields were persisted; the refresh token rotated too.
    let stored = fx.store.load("m1").await.unwrap().unwrap();
    let connection = &stored.providers["cx"];
    assert_eq!(connection.access_token.as_deref(), Some("fresh-token"));
    assert_eq!(connection.refresh_token.as_deref(), Some("refresh-2"));
    assert!(connection.expires_at.unwrap() > 1_000);
}

#[tokio::test]
async fn auth_failure_triggers_one_in_place_refresh() {
    let future = OffsetDateTime::now_utc().unix_timestamp() + 86_400;
    let fx = fixture(record_with(vec![codex_connection(future)])).await;
    fx.client.push(Scripted::text(401, "token revoked"));
    fx.client.push(Scripted::json(
        200,
        json!({"access_token": "rotated", "expires_in": 3600}),
    ));
    fx.client.push(codex_stream());

    let record = fx.engine.load_machine("m1").await.unwrap();
    let response = fx
        .engine
        .handle_chat(&record, chat_request("cx/gpt-5.1", false))
        .await
        .unwrap();
    let body = body_json(response.body).await;
    assert_eq!(body["choices"][0]["message"]["content"], "done");

    let seen = fx.client.seen();
    assert_eq!(seen.len(), 3);
    let auth = seen[2]
        .headers
        .iter()
        .find(|(name, _)| name == "authorization")
        .map(|(_, value)| value.as_str());
    assert_eq!(auth, Some("Bearer rotated"));

    let stored = fx.store.load("m1").await.unwrap().unwrap();
    assert_eq!(
        stored.providers["cx"].health.status,
        ConnectionStatus::Active
    );
}

#[tokio::test]
async fn models_list_merges_providers_and_combos() {
    let mut connection = openai_connection("a", 1);
    connection.provider_data = json!({"models": ["gpt-4o", "gpt-4o-mini"]});
    let mut record = record_with(vec![connection]);
    record.combos.push(omniroute_provider_core::Combo {
        id: "cb".to_string(),
        name: "smart".to_string(),
        models: vec!["openai/gpt-4o".to_string()],
    });
    let fx = fixture(record).await;

    let record = fx.engine.load_machine("m1").await.unwrap();
    let list = fx.engine.models_list(&record);
    let ids: Vec<&str> = list["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"openai/gpt-4o"));
    assert!(ids.contains(&"openai/gpt-4o-mini"));
    assert!(ids.contains(&"smart"));
}
