//! Request dispatch: resolve → select → (refresh) → execute → translate,
//! with the account fallback loop around every upstream attempt.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{info, warn};

use omniroute_protocol::Format;
use omniroute_protocol::embeddings::EmbeddingsRequest;
use omniroute_provider_core::{
    ConfigStore, ConnectionHealth, ConnectionStatus, ConnectionUpdate, CredentialSelection,
    Event, EventHub, ExecuteContext, ExecutionOutcome, ExecutorLookup, FallbackDecision,
    Headers, MachineRecord, ProviderConnection, ProviderExecutor, ProviderKind, ProviderRuntime,
    UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamHttpRequest, check_fallback_error,
    provider_to_alias, select_credential,
};
use omniroute_transform::registry::{RequestContext, TranslatorRegistry};

use crate::error::GatewayError;
use crate::pipe;
use crate::resolver::{ResolvedModel, resolve_model};

pub struct Engine {
    store: Arc<dyn ConfigStore>,
    client: Arc<dyn UpstreamClient>,
    executors: Arc<dyn ExecutorLookup>,
    translators: TranslatorRegistry,
    runtime: Arc<ProviderRuntime>,
    events: EventHub,
}

#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub trace_id: String,
    pub machine_id: String,
    pub dialect: Format,
    pub body: Value,
    pub stream: bool,
}

#[derive(Debug)]
pub enum EngineBody {
    Json(Bytes),
    Stream {
        content_type: &'static str,
        rx: mpsc::Receiver<Bytes>,
    },
}

#[derive(Debug)]
pub struct EngineResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: EngineBody,
}

impl EngineResponse {
    fn json(status: u16, content_type: String, body: Bytes) -> Self {
        let mut headers: Headers = Vec::new();
        omniroute_provider_core::header_set(&mut headers, "content-type", content_type);
        Self {
            status,
            headers,
            body: EngineBody::Json(body),
        }
    }
}

impl Engine {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        client: Arc<dyn UpstreamClient>,
        executors: Arc<dyn ExecutorLookup>,
        runtime: Arc<ProviderRuntime>,
        events: EventHub,
    ) -> Self {
        Self {
            store,
            client,
            executors,
            translators: TranslatorRegistry::standard(),
            runtime,
            events,
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub async fn load_machine(&self, machine_id: &str) -> Result<MachineRecord, GatewayError> {
        self.store
            .load(machine_id)
            .await
            .map_err(|err| GatewayError::server(err.to_string()))?
            .ok_or_else(|| GatewayError::authentication("unknown machine"))
    }

    /// Chat-shaped traffic on every dialect surface.
    pub async fn handle_chat(
        &self,
        record: &MachineRecord,
        request: EngineRequest,
    ) -> Result<EngineResponse, GatewayError> {
        let model_string = request
            .body
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::invalid_request("missing model"))?;

        match resolve_model(record, &model_string)? {
            ResolvedModel::Single { provider, model } => {
                self.dispatch_single(record, &request, &provider, &model)
                    .await
            }
            ResolvedModel::Combo { name, models } => {
                let mut last: Option<GatewayError> = None;
                for candidate in &models {
                    let ResolvedModel::Single { provider, model } =
                        resolve_model(record, candidate)?
                    else {
                        return Err(GatewayError::invalid_request(format!(
                            "combo {name} may not nest combos"
                        )));
                    };
                    match self
                        .dispatch_single(record, &request, &provider, &model)
                        .await
                    {
                        Ok(response) => return Ok(response),
                        // Combos advance only past server-side failures.
                        Err(err) if (500..600).contains(&err.status) => {
                            warn!(
                                event = "combo_advance",
                                trace_id = %request.trace_id,
                                combo = %name,
                                failed_model = %candidate,
                                status = err.status
                            );
                            last = Some(err);
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(last.unwrap_or_else(|| {
                    GatewayError::invalid_request(format!("combo {name} has no models"))
                }))
            }
        }
    }

    async fn dispatch_single(
        &self,
        record: &MachineRecord,
        request: &EngineRequest,
        provider: &ProviderKind,
        model: &str,
    ) -> Result<EngineResponse, GatewayError> {
        let executor = self.executors.executor(provider).ok_or_else(|| {
            GatewayError::invalid_request(format!("unsupported provider {}", provider.as_str()))
        })?;

        let translator = self
            .translators
            .lookup(request.dialect, executor.wire_format())
            .map_err(|err| GatewayError::invalid_request(err.to_string()))?;
        let request_builder = translator.request.ok_or_else(|| {
            GatewayError::invalid_request(format!(
                "no request translation from {} to {}",
                request.dialect.as_str(),
                executor.wire_format().as_str()
            ))
        })?;

        let needs_translation = request.dialect != executor.wire_format();
        // Translation across dialects runs over the stream form; the JSON
        // shapes only line up when passing through untouched.
        let upstream_stream = request.stream || needs_translation;
        let translate_ctx = RequestContext {
            model,
            stream: upstream_stream,
        };
        let wire_body = request_builder(&translate_ctx, &request.body)
            .map_err(|err| GatewayError::invalid_request(err.to_string()))?;

        let (outcome, connection) = self
            .fallback_loop(record, request, provider, executor.as_ref(), |ctx, conn| {
                let body = wire_body.clone();
                let executor = executor.clone();
                async move {
                    executor
                        .execute(&ctx, &conn, model, body, upstream_stream)
                        .await
                }
            })
            .await?;

        info!(
            event = "upstream_success",
            trace_id = %request.trace_id,
            provider = %provider.as_str(),
            connection_id = %connection.id,
            model = %model,
            is_stream = request.stream
        );
        self.assemble_response(request, outcome).await
    }

    async fn assemble_response(
        &self,
        request: &EngineRequest,
        outcome: ExecutionOutcome,
    ) -> Result<EngineResponse, GatewayError> {
        let response_format = outcome.response_format;
        let translator = self
            .translators
            .lookup(request.dialect, response_format)
            .map_err(|_| GatewayError::translator_failure(response_format.as_str()))?;
        let stream_factory = translator
            .stream
            .ok_or_else(|| GatewayError::translator_failure(response_format.as_str()))?;

        let upstream_status = outcome.response.status;
        let upstream_headers = outcome.response.headers;
        let body = outcome.response.body;

        if request.stream {
            let model = request
                .body
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let translator = stream_factory(&RequestContext {
                model,
                stream: true,
            });
            let rx = pipe::stream_to_client(
                body,
                translator,
                request.dialect,
                request.trace_id.clone(),
            );
            let content_type = pipe::content_type_for(request.dialect);
            let mut headers: Headers = Vec::new();
            omniroute_provider_core::header_set(&mut headers, "content-type", content_type);
            omniroute_provider_core::header_set(&mut headers, "cache-control", "no-cache");
            return Ok(EngineResponse {
                status: 200,
                headers,
                body: EngineBody::Stream { content_type, rx },
            });
        }

        // Non-streaming client. A passthrough JSON body goes back verbatim;
        // anything streamed (translation, or a stream-forcing upstream like
        // Codex) collapses into one JSON document.
        match body {
            UpstreamBody::Bytes(bytes) if request.dialect == response_format => {
                Ok(EngineResponse::json(
                    upstream_status,
                    pipe::upstream_content_type(&upstream_headers),
                    bytes,
                ))
            }
            other => {
                let model = request
                    .body
                    .get("model")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let translator = stream_factory(&RequestContext {
                    model,
                    stream: false,
                });
                let collapsed = pipe::collapse_to_json(
                    other,
                    translator,
                    request.dialect,
                    &request.trace_id,
                )
                .await?;
                Ok(EngineResponse::json(
                    200,
                    "application/json".to_string(),
                    collapsed,
                ))
            }
        }
    }

    /// The account fallback loop. `attempt` runs one upstream call against a
    /// selected connection; the loop owns selection, proactive refresh,
    /// health bookkeeping, and rotation.
    async fn fallback_loop<F, Fut>(
        &self,
        record: &MachineRecord,
        request: &EngineRequest,
        provider: &ProviderKind,
        executor: &dyn ProviderExecutor,
        attempt: F,
    ) -> Result<(ExecutionOutcome, ProviderConnection), GatewayError>
    where
        F: Fn(ExecuteContext, ProviderConnection) -> Fut,
        Fut: std::future::Future<Output = Result<ExecutionOutcome, UpstreamFailure>>,
    {
        let mut excluded: HashSet<String> = HashSet::new();
        let mut refreshed_in_place: HashSet<String> = HashSet::new();
        // The MachineRecord is memoized for the duration of this loop;
        // credential fields we refreshed along the way live here.
        let mut overrides: std::collections::HashMap<String, ConnectionUpdate> =
            std::collections::HashMap::new();
        let mut last_failure: Option<UpstreamFailure> = None;
        let mut attempt_no: u32 = 0;

        loop {
            attempt_no += 1;
            let now = OffsetDateTime::now_utc();
            let mut connection =
                match select_credential(record, provider, &excluded, now) {
                    CredentialSelection::Selected(connection) => connection,
                    CredentialSelection::AllRateLimited {
                        retry_after_secs,
                        last_error,
                    } => {
                        return Err(GatewayError::all_rate_limited(retry_after_secs, last_error));
                    }
                    CredentialSelection::None => {
                        return Err(match last_failure {
                            Some(failure) => GatewayError::upstream_exhausted(&failure),
                            None => GatewayError::no_credentials(provider.as_str()),
                        });
                    }
                };
            if let Some(update) = overrides.get(&connection.id) {
                update.apply(&mut connection, now);
            }

            if executor.needs_refresh(&connection, now.unix_timestamp()) {
                match self
                    .refresh_connection(request, executor, &connection)
                    .await
                {
                    Ok(Some(update)) => {
                        update.apply(&mut connection, now);
                        self.persist_update(&request.machine_id, &connection.id, update.clone())
                            .await;
                        overrides.insert(connection.id.clone(), update);
                    }
                    Ok(None) => {}
                    Err(message) => {
                        warn!(
                            event = "token_refresh_failed",
                            trace_id = %request.trace_id,
                            connection_id = %connection.id,
                            error = %message
                        );
                        let decision =
                            check_fallback_error(Some(401), None, connection.health.backoff_level);
                        self.mark_unavailable(
                            &request.machine_id,
                            &connection,
                            Some(401),
                            &message,
                            &decision,
                        )
                        .await;
                        excluded.insert(connection.id.clone());
                        continue;
                    }
                }
            }

            let ctx = ExecuteContext {
                trace_id: request.trace_id.clone(),
                machine_id: request.machine_id.clone(),
                runtime: self.runtime.clone(),
                client: self.client.clone(),
                attempt_no,
            };

            match attempt(ctx, connection.clone()).await {
                Ok(outcome) => {
                    self.mark_active(&request.machine_id, &connection).await;
                    if let Some(update) = &outcome.connection_update {
                        self.persist_update(&request.machine_id, &connection.id, update.clone())
                            .await;
                    }
                    return Ok((outcome, connection));
                }
                Err(failure) => {
                    warn!(
                        event = "upstream_attempt_failed",
                        trace_id = %request.trace_id,
                        provider = %provider.as_str(),
                        connection_id = %connection.id,
                        attempt_no,
                        status = ?failure.status()
                    );

                    // One in-place refresh on auth failures before rotating.
                    if matches!(failure.status(), Some(401) | Some(403))
                        && !refreshed_in_place.contains(&connection.id)
                    {
                        refreshed_in_place.insert(connection.id.clone());
                        if let Ok(Some(update)) = self
                            .refresh_connection(request, executor, &connection)
                            .await
                        {
                            self.persist_update(
                                &request.machine_id,
                                &connection.id,
                                update.clone(),
                            )
                            .await;
                            overrides.insert(connection.id.clone(), update);
                            last_failure = Some(failure);
                            continue;
                        }
                    }

                    let hint = executor.retry_after_hint(&failure);
                    let decision = check_fallback_error(
                        failure.status(),
                        hint,
                        connection.health.backoff_level,
                    );
                    if !decision.should_fallback {
                        return Err(GatewayError::upstream_passthrough(&failure));
                    }
                    self.mark_unavailable(
                        &request.machine_id,
                        &connection,
                        failure.status(),
                        &failure.body_text(),
                        &decision,
                    )
                    .await;
                    excluded.insert(connection.id.clone());
                    last_failure = Some(failure);
                }
            }
        }
    }

    /// Token refresh behind the cross-request singleflight.
    async fn refresh_connection(
        &self,
        request: &EngineRequest,
        executor: &dyn ProviderExecutor,
        connection: &ProviderConnection,
    ) -> Result<Option<ConnectionUpdate>, String> {
        const REFRESH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(20);
        let result = self
            .runtime
            .refresh_flight
            .run(&connection.id, || async {
                let ctx = ExecuteContext {
                    trace_id: request.trace_id.clone(),
                    machine_id: request.machine_id.clone(),
                    runtime: self.runtime.clone(),
                    client: self.client.clone(),
                    attempt_no: 0,
                };
                match tokio::time::timeout(
                    REFRESH_TIMEOUT,
                    executor.refresh_credentials(&ctx, connection),
                )
                .await
                {
                    Ok(result) => result.map_err(|err| err.to_string()),
                    Err(_) => Err("token refresh timed out".to_string()),
                }
            })
            .await;
        if let Ok(Some(_)) = &result {
            self.events.emit(Event::TokenRefreshed {
                machine_id: request.machine_id.clone(),
                connection_id: connection.id.clone(),
                provider: connection.provider.as_str().to_string(),
            });
        }
        result
    }

    async fn persist_update(
        &self,
        machine_id: &str,
        connection_id: &str,
        update: ConnectionUpdate,
    ) {
        if let Err(err) = self
            .store
            .update_connection(machine_id, connection_id, update)
            .await
        {
            warn!(event = "store_update_failed", connection_id = %connection_id, error = %err);
        }
    }

    async fn mark_active(&self, machine_id: &str, connection: &ProviderConnection) {
        let health = ConnectionHealth {
            status: ConnectionStatus::Active,
            last_error: None,
            error_code: None,
            rate_limited_until: None,
            backoff_level: 0,
            last_error_at: connection.health.last_error_at,
            updated_at: Some(OffsetDateTime::now_utc()),
        };
        self.persist_update(
            machine_id,
            &connection.id,
            ConnectionUpdate {
                health: Some(health),
                ..ConnectionUpdate::default()
            },
        )
        .await;
        self.events.emit(Event::ConnectionActive {
            machine_id: machine_id.to_string(),
            connection_id: connection.id.clone(),
        });
    }

    async fn mark_unavailable(
        &self,
        machine_id: &str,
        connection: &ProviderConnection,
        status: Option<u16>,
        error_text: &str,
        decision: &FallbackDecision,
    ) {
        let now = OffsetDateTime::now_utc();
        let until = now + time::Duration::milliseconds(decision.cooldown.as_millis() as i64);
        let mut message = error_text.to_string();
        if message.len() > 512 {
            let mut cut = 512;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        let health = ConnectionHealth {
            status: ConnectionStatus::Unavailable,
            last_error: Some(message),
            error_code: status.map(i64::from),
            rate_limited_until: Some(until),
            backoff_level: decision.new_backoff_level,
            last_error_at: Some(now),
            updated_at: Some(now),
        };
        self.persist_update(
            machine_id,
            &connection.id,
            ConnectionUpdate {
                health: Some(health),
                ..ConnectionUpdate::default()
            },
        )
        .await;
        self.events.emit(Event::ConnectionUnavailable {
            machine_id: machine_id.to_string(),
            connection_id: connection.id.clone(),
            status,
            cooldown_ms: decision.cooldown.as_millis() as u64,
        });
    }

    /// `/v1/embeddings`: OpenAI-shaped providers only, body passed through.
    pub async fn handle_embeddings(
        &self,
        record: &MachineRecord,
        request: EngineRequest,
    ) -> Result<EngineResponse, GatewayError> {
        let mut parsed: EmbeddingsRequest = serde_json::from_value(request.body.clone())
            .map_err(|err| GatewayError::invalid_request(format!("embeddings body: {err}")))?;
        if parsed.input.is_empty() {
            return Err(GatewayError::invalid_request("input must not be empty"));
        }
        if parsed.encoding_format.is_none() {
            parsed.encoding_format = Some("float".to_string());
        }

        let ResolvedModel::Single { provider, model } = resolve_model(record, &parsed.model)?
        else {
            return Err(GatewayError::invalid_request(
                "combos are not supported for embeddings",
            ));
        };
        if !provider.is_openai_compatible() {
            return Err(GatewayError::invalid_request(format!(
                "provider {} does not support embeddings",
                provider.as_str()
            )));
        }
        let executor = self.executors.executor(&provider).ok_or_else(|| {
            GatewayError::invalid_request(format!("unsupported provider {}", provider.as_str()))
        })?;
        parsed.model = model.clone();
        let body = serde_json::to_value(&parsed)
            .map_err(|err| GatewayError::server(err.to_string()))?;

        let (outcome, _connection) = self
            .fallback_loop(record, &request, &provider, executor.as_ref(), |ctx, conn| {
                let body = body.clone();
                let executor = executor.clone();
                async move {
                    let url = executor.build_embeddings_url(&conn).map_err(|err| {
                        omniroute_provider_core::provider_error_failure(err)
                    })?;
                    let headers = executor
                        .build_headers(&conn, false)
                        .map_err(omniroute_provider_core::provider_error_failure)?;
                    let payload = serde_json::to_vec(&body).map_err(|err| {
                        omniroute_provider_core::provider_error_failure(
                            omniroute_provider_core::ProviderError::Other(err.to_string()),
                        )
                    })?;
                    let response = ctx
                        .client
                        .send(UpstreamHttpRequest::post_json(
                            url,
                            headers,
                            Bytes::from(payload),
                            false,
                        ))
                        .await?;
                    if !response.is_success() {
                        return Err(
                            omniroute_provider_core::failure_from_response(response).await
                        );
                    }
                    Ok(ExecutionOutcome {
                        response,
                        response_format: Format::OpenaiChat,
                        retry_after_ms: None,
                        connection_update: None,
                    })
                }
            })
            .await?;

        let content_type = pipe::upstream_content_type(&outcome.response.headers);
        match outcome.response.body {
            UpstreamBody::Bytes(bytes) => Ok(EngineResponse::json(
                outcome.response.status,
                content_type,
                bytes,
            )),
            UpstreamBody::Stream(_) => Err(GatewayError::server(
                "unexpected streaming embeddings response",
            )),
        }
    }

    /// `/v1/models`: every configured provider's advertised models plus the
    /// machine's combos, as an OpenAI list.
    pub fn models_list(&self, record: &MachineRecord) -> Value {
        let mut ids: Vec<String> = Vec::new();
        for connection in record.providers.values() {
            if !connection.is_active {
                continue;
            }
            let alias = provider_to_alias(&connection.provider);
            if let Some(models) = connection
                .provider_data
                .get("models")
                .and_then(Value::as_array)
            {
                for model in models.iter().filter_map(Value::as_str) {
                    ids.push(format!("{alias}/{model}"));
                }
            }
        }
        for combo in &record.combos {
            ids.push(combo.name.clone());
        }
        ids.sort();
        ids.dedup();

        let data: Vec<Value> = ids
            .into_iter()
            .map(|id| {
                json!({
                    "id": id,
                    "object": "model",
                    "created": 0,
                    "owned_by": "omniroute",
                })
            })
            .collect();
        json!({"object": "list", "data": data})
    }
}
