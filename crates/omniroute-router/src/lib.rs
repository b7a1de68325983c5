//! HTTP edge: thin axum handlers around the engine, bearer authentication,
//! dialect detection by path, and CORS on every response.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use bytes::Bytes;
use serde_json::{Value, json};
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;
use uuid::Uuid;

use omniroute_core::{Engine, EngineBody, EngineRequest, EngineResponse, GatewayError, parse_api_key};
use omniroute_protocol::Format;
use omniroute_provider_core::MachineRecord;

#[derive(Clone)]
pub struct GatewayState {
    pub engine: Arc<Engine>,
    pub server_secret: String,
}

pub fn gateway_router(engine: Arc<Engine>, server_secret: String) -> Router {
    let state = GatewayState {
        engine,
        server_secret,
    };
    let v1 = Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/messages", post(messages))
        .route("/responses", post(responses))
        .route("/embeddings", post(embeddings))
        .route("/api/chat", post(ollama_chat))
        .route("/verify", get(verify))
        .route("/models", get(models));
    let scoped = Router::new()
        .route("/chat/completions", post(chat_completions_scoped))
        .route("/messages", post(messages_scoped))
        .route("/responses", post(responses_scoped))
        .route("/embeddings", post(embeddings_scoped))
        .route("/api/chat", post(ollama_chat_scoped))
        .route("/verify", get(verify_scoped))
        .route("/models", get(models_scoped));

    Router::new()
        .nest("/v1", v1)
        .nest("/{machine_id}/v1", scoped)
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// `Access-Control-Allow-Origin: *` on every response; preflight short-
/// circuits with 204.
async fn cors(request: axum::extract::Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        apply_cors(response.headers_mut(), true);
        return response;
    }
    let mut response = next.run(request).await;
    apply_cors(response.headers_mut(), false);
    response
}

fn apply_cors(headers: &mut HeaderMap, preflight: bool) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    if preflight {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("*"),
        );
    }
}

macro_rules! dialect_handlers {
    ($bare:ident, $scoped:ident, $format:expr) => {
        async fn $bare(
            State(state): State<GatewayState>,
            headers: HeaderMap,
            body: Bytes,
        ) -> Response {
            dispatch(state, None, $format, headers, body).await
        }

        async fn $scoped(
            State(state): State<GatewayState>,
            Path(machine_id): Path<String>,
            headers: HeaderMap,
            body: Bytes,
        ) -> Response {
            dispatch(state, Some(machine_id), $format, headers, body).await
        }
    };
}

dialect_handlers!(chat_completions, chat_completions_scoped, Format::OpenaiChat);
dialect_handlers!(messages, messages_scoped, Format::Claude);
dialect_handlers!(responses, responses_scoped, Format::OpenaiResponses);
dialect_handlers!(ollama_chat, ollama_chat_scoped, Format::Ollama);

async fn embeddings(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_embeddings(state, None, headers, body).await
}

async fn embeddings_scoped(
    State(state): State<GatewayState>,
    Path(machine_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_embeddings(state, Some(machine_id), headers, body).await
}

async fn verify(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    verify_inner(state, None, headers).await
}

async fn verify_scoped(
    State(state): State<GatewayState>,
    Path(machine_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    verify_inner(state, Some(machine_id), headers).await
}

async fn models(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    models_inner(state, None, headers).await
}

async fn models_scoped(
    State(state): State<GatewayState>,
    Path(machine_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    models_inner(state, Some(machine_id), headers).await
}

struct AuthedMachine {
    machine_id: String,
    record: MachineRecord,
}

/// Resolve the machine from the path prefix or the bearer key, then check
/// the key against the machine's admitted set.
async fn authenticate(
    state: &GatewayState,
    path_machine: Option<String>,
    headers: &HeaderMap,
) -> Result<AuthedMachine, GatewayError> {
    let bearer = bearer_token(headers)
        .ok_or_else(|| GatewayError::authentication("missing bearer api key"))?;

    let machine_id = match path_machine {
        Some(machine_id) => machine_id,
        None => {
            let parsed = parse_api_key(&bearer, &state.server_secret)
                .ok_or_else(|| GatewayError::authentication("invalid api key"))?;
            if !parsed.is_new_format {
                return Err(GatewayError::invalid_request(
                    "legacy api keys must use the /{machineId}/v1 path prefix",
                ));
            }
            parsed.machine_id
        }
    };

    let record = state.engine.load_machine(&machine_id).await?;
    if !record.api_keys.contains(&bearer) {
        return Err(GatewayError::authentication("unknown api key"));
    }
    Ok(AuthedMachine { machine_id, record })
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(value.trim().to_string());
    }
    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    auth.strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
}

async fn dispatch(
    state: GatewayState,
    path_machine: Option<String>,
    dialect: Format,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    let authed = match authenticate(&state, path_machine, &headers).await {
        Ok(authed) => authed,
        Err(err) => return error_response(err, &trace_id),
    };
    let body: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return error_response(
                GatewayError::invalid_request(format!("request body: {err}")),
                &trace_id,
            );
        }
    };
    // Ollama's /api/chat streams unless the caller opts out.
    let stream = body
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(dialect == Format::Ollama);

    info!(
        event = "request_received",
        trace_id = %trace_id,
        machine_id = %authed.machine_id,
        dialect = %dialect.as_str(),
        is_stream = stream
    );

    let request = EngineRequest {
        trace_id: trace_id.clone(),
        machine_id: authed.machine_id,
        dialect,
        body,
        stream,
    };
    match state.engine.handle_chat(&authed.record, request).await {
        Ok(response) => engine_response(response, &trace_id),
        Err(err) => error_response(err, &trace_id),
    }
}

async fn dispatch_embeddings(
    state: GatewayState,
    path_machine: Option<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    let authed = match authenticate(&state, path_machine, &headers).await {
        Ok(authed) => authed,
        Err(err) => return error_response(err, &trace_id),
    };
    let body: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return error_response(
                GatewayError::invalid_request(format!("request body: {err}")),
                &trace_id,
            );
        }
    };
    let request = EngineRequest {
        trace_id: trace_id.clone(),
        machine_id: authed.machine_id,
        dialect: Format::OpenaiChat,
        body,
        stream: false,
    };
    match state.engine.handle_embeddings(&authed.record, request).await {
        Ok(response) => engine_response(response, &trace_id),
        Err(err) => error_response(err, &trace_id),
    }
}

async fn verify_inner(
    state: GatewayState,
    path_machine: Option<String>,
    headers: HeaderMap,
) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    match authenticate(&state, path_machine, &headers).await {
        Ok(authed) => {
            let body = json!({
                "valid": true,
                "machineId": authed.machine_id,
                "providersCount": authed.record.providers.len(),
            });
            json_response(StatusCode::OK, body, &trace_id)
        }
        Err(err) => error_response(err, &trace_id),
    }
}

async fn models_inner(
    state: GatewayState,
    path_machine: Option<String>,
    headers: HeaderMap,
) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    match authenticate(&state, path_machine, &headers).await {
        Ok(authed) => {
            let body = state.engine.models_list(&authed.record);
            json_response(StatusCode::OK, body, &trace_id)
        }
        Err(err) => error_response(err, &trace_id),
    }
}

fn engine_response(response: EngineResponse, trace_id: &str) -> Response {
    let EngineResponse {
        status,
        headers,
        body,
    } = response;
    let mut out = match body {
        EngineBody::Json(bytes) => Response::new(Body::from(bytes)),
        EngineBody::Stream { rx, .. } => {
            Response::new(Body::from_stream(
                ReceiverStream::new(rx).map(Ok::<Bytes, std::convert::Infallible>),
            ))
        }
    };
    *out.status_mut() =
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    for (name, value) in &headers {
        if let (Ok(name), Ok(value)) = (
            header::HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            out.headers_mut().insert(name, value);
        }
    }
    attach_trace(&mut out, trace_id);
    out
}

fn error_response(err: GatewayError, trace_id: &str) -> Response {
    let mut out = Response::new(Body::from(err.body_bytes()));
    *out.status_mut() =
        StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    for (name, value) in &err.headers() {
        if let (Ok(name), Ok(value)) = (
            header::HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            out.headers_mut().insert(name, value);
        }
    }
    attach_trace(&mut out, trace_id);
    out
}

fn json_response(status: StatusCode, body: Value, trace_id: &str) -> Response {
    let mut out = Response::new(Body::from(body.to_string()));
    *out.status_mut() = status;
    out.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    attach_trace(&mut out, trace_id);
    out
}

fn attach_trace(response: &mut Response, trace_id: &str) {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        response.headers_mut().insert("x-omniroute-request-id", value);
    }
}
