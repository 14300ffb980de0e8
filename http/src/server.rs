use crate::client_ip::SmartClientIp;
use crate::state::Registry;
use crate::user_agent::OptionalUserAgent;
use axum::extract::{Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::{routing::get, routing::post, Json, Router as AxumRouter};
use futures_util::Stream;
use lens_core::{apply_field_selection, filter_patch_fields, first_value_from, Engine, EntitySet, LensConfig, ObserverBuilder, Plugins, ReconnectContext, Router, SubscribeContext};
use lens_proto::{CollectionId, ConnectionId, EntityId, FieldSelector, ReconnectSubscription};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{debug, info, warn, Level};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
    router: Arc<Router>,
    plugins: Arc<Plugins>,
    config: Arc<LensConfig>,
    registry: Arc<Registry>,
    /// `operation -> return entity`, precomputed from the router once at
    /// startup so a resume lookup on `/__lens/sse` doesn't rebuild the whole
    /// metadata tree per request.
    operation_entities: Arc<HashMap<String, CollectionId>>,
    started_at: Instant,
}

/// The HTTP/SSE protocol handler: a thin bridge over the same `Engine` the
/// websocket adapter drives. `POST /` is one-shot query/mutation execution;
/// `/__lens/sse` establishes a long-lived channel for subscriptions.
pub struct LensHttpServer {
    state: AppState,
}

impl LensHttpServer {
    pub fn new(router: Router, entities: EntitySet, plugins: Plugins, config: LensConfig) -> Self {
        let router = Arc::new(router);
        let plugins = Arc::new(plugins);
        let engine = Arc::new(Engine::new(router.clone(), Arc::new(entities), plugins.clone()));
        let operation_entities = router
            .metadata("")
            .operations
            .into_iter()
            .filter_map(|(path, meta)| meta.return_type.map(|rt| (path, CollectionId::from(rt))))
            .collect();
        Self {
            state: AppState {
                engine,
                router,
                plugins,
                config: Arc::new(config),
                registry: Arc::new(Registry::new()),
                operation_entities: Arc::new(operation_entities),
                started_at: Instant::now(),
            },
        }
    }

    pub async fn run(&self, bind_address: &str) -> Result<(), ServerError> {
        let cors = match &self.state.config.cors.origin {
            Some(origin) => match origin.parse::<HeaderValue>() {
                Ok(value) => CorsLayer::new().allow_origin(value).allow_methods(Any).allow_headers(Any),
                Err(_) => {
                    warn!("invalid cors.origin {origin:?}, falling back to permissive cors");
                    CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
                }
            },
            None => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
        };

        let mut app = AxumRouter::new()
            .route("/", post(execute_handler))
            .route("/__lens/metadata", get(metadata_handler))
            .route("/__lens/sse", get(sse_handler));

        if self.state.config.health.enabled {
            app = app.route(&self.state.config.health.path, get(health_handler));
        }

        let app = app
            .layer(axum::extract::DefaultBodyLimit::max(self.state.config.max_message_size))
            .layer(cors)
            .layer(
                ServiceBuilder::new().layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                ),
            )
            .with_state(self.state.clone());

        let listener = tokio::net::TcpListener::bind(bind_address).await?;
        info!("Lens http server listening on {}", listener.local_addr()?);
        axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>()).await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct OperationRequest {
    operation: String,
    #[serde(default)]
    input: Value,
}

async fn execute_handler(
    SmartClientIp(client_ip): SmartClientIp,
    OptionalUserAgent(user_agent): OptionalUserAgent,
    State(state): State<AppState>,
    Json(request): Json<OperationRequest>,
) -> impl IntoResponse {
    debug!("`{}` at {client_ip} calling {}", user_agent.unwrap_or_else(|| "unknown client".into()), request.operation);

    if !state.registry.allow(client_ip, &state.config) {
        return (StatusCode::TOO_MANY_REQUESTS, Json(json!({"error": {"code": "RATE_LIMITED", "message": "rate limit exceeded"}}))).into_response();
    }

    let observable = state.engine.execute(&request.operation, request.input);
    let outcome = match tokio::time::timeout(state.config.timeout(), first_value_from(&observable)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(lens_core::EngineError::Timeout),
    };
    match outcome {
        Ok(lens_core::OperationOutcome::Data { value, .. }) => (StatusCode::OK, Json(json!({"data": value}))).into_response(),
        Ok(lens_core::OperationOutcome::Error(err)) => error_response(&state, &err),
        Err(err) => error_response(&state, &err),
    }
}

fn error_response(state: &AppState, err: &lens_core::EngineError) -> axum::response::Response {
    let wire = lens_core::sanitize_for_wire(err, state.config.errors.development);
    let status = match wire.code {
        lens_proto::ErrorCode::NotFound => StatusCode::NOT_FOUND,
        lens_proto::ErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
        lens_proto::ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        lens_proto::ErrorCode::MessageTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        lens_proto::ErrorCode::Timeout => StatusCode::REQUEST_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": wire}))).into_response()
}

async fn metadata_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.router.metadata(env!("CARGO_PKG_VERSION")))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "connections": state.registry.sse_connection_count(),
        "checks": state.config.health.checks,
    }))
}

#[derive(Deserialize)]
struct SseParams {
    operation: String,
    /// JSON-encoded operation input; absent means `null`.
    #[serde(default)]
    input: Option<String>,
    /// `"*"` or a comma-separated field list; absent means all fields.
    #[serde(default)]
    fields: Option<String>,
    /// The last version the caller observed, present only when resuming.
    #[serde(default)]
    version: Option<u64>,
}

async fn sse_handler(
    SmartClientIp(client_ip): SmartClientIp,
    State(state): State<AppState>,
    Query(params): Query<SseParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, StatusCode> {
    if !state.registry.allow(client_ip, &state.config) {
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }
    let Some(guard) = state.registry.try_reserve_sse(state.config.max_connections) else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let input: Value = match params.input {
        Some(raw) => serde_json::from_str(&raw).map_err(|_| StatusCode::BAD_REQUEST)?,
        None => Value::Null,
    };
    let fields = parse_fields(params.fields.as_deref());

    let sub_ctx = SubscribeContext {
        client_id: ConnectionId::new(),
        sub_id: format!("sse-{client_ip}"),
        operation: params.operation.clone(),
        input: input.clone(),
        fields: fields.clone(),
        entity: entity_for(&state, &params.operation),
        entity_id: entity_id_from_input(&input),
    };
    if !state.plugins.on_subscribe(&sub_ctx).await {
        return Err(StatusCode::FORBIDDEN);
    }

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Event>();

    if let (Some(version), Some(entity), Some(entity_id)) = (params.version, sub_ctx.entity.clone(), sub_ctx.entity_id.clone()) {
        replay_resume(&state, &tx, version, entity, entity_id, fields.clone(), input.clone()).await;
    }

    let development = state.config.errors.development;
    let observable = state.engine.execute(&params.operation, input);
    let forward_fields = fields.clone();
    let subscription = observable.subscribe(ObserverBuilder::new().on_next(move |outcome| forward_outcome(&tx, outcome, development, &forward_fields)));

    let stream = SseSession { inner: UnboundedReceiverStream::new(rx), _subscription: subscription, _guard: guard };
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn parse_fields(raw: Option<&str>) -> FieldSelector {
    match raw {
        None | Some("*") => FieldSelector::all(),
        Some(list) => FieldSelector::Set(list.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect::<HashSet<_>>()),
    }
}

fn entity_for(state: &AppState, operation: &str) -> Option<CollectionId> { state.operation_entities.get(operation).cloned() }

fn entity_id_from_input(input: &Value) -> Option<EntityId> {
    input.as_object()?.get("id")?.as_str().map(EntityId::from)
}

/// Resolve an initial resume frame against the operation log via the
/// already-installed reconnect hook, reusing the exact machinery the
/// websocket adapter's `reconnect` frame uses for a single subscription.
async fn replay_resume(
    state: &AppState,
    tx: &tokio::sync::mpsc::UnboundedSender<Event>,
    version: u64,
    entity: CollectionId,
    entity_id: EntityId,
    fields: FieldSelector,
    input: Value,
) {
    let sub = ReconnectSubscription { id: "sse".into(), entity, entity_id, fields: fields.clone(), version, data_hash: None, input: Some(input) };
    let Some(results) = state.plugins.on_reconnect(ReconnectContext { client_id: ConnectionId::new(), subscriptions: vec![sub] }).await else { return };
    let Some(result) = results.into_iter().next() else { return };

    match result.status {
        lens_proto::ReconnectStatus::Patched { version, patches } => {
            let patches: Vec<Vec<lens_proto::PatchOp>> =
                patches.into_iter().map(|ops| filter_patch_fields(ops, &fields)).filter(|ops| !ops.is_empty()).collect();
            if patches.is_empty() {
                return;
            }
            let _ = tx.send(sse_event("update", &json!({"version": version, "patch": patches})));
        }
        lens_proto::ReconnectStatus::Snapshot { version, data } => {
            let data = apply_field_selection(data, &fields);
            let _ = tx.send(sse_event("update", &json!({"version": version, "data": data})));
        }
        lens_proto::ReconnectStatus::Unchanged => {}
        lens_proto::ReconnectStatus::Gone => {
            let _ = tx.send(sse_event("error", &json!({"error": {"code": "NOT_FOUND", "message": "entity no longer exists"}})));
        }
    }
}

fn forward_outcome(tx: &tokio::sync::mpsc::UnboundedSender<Event>, outcome: lens_core::OperationOutcome, development: bool, fields: &FieldSelector) {
    match outcome {
        lens_core::OperationOutcome::Data { value, .. } => {
            let value = apply_field_selection(value, fields);
            let _ = tx.send(sse_event("update", &json!({"data": value})));
        }
        lens_core::OperationOutcome::Error(err) => {
            let wire = lens_core::sanitize_for_wire(&err, development);
            let _ = tx.send(sse_event("error", &json!({"error": wire})));
        }
    }
}

fn sse_event(name: &str, payload: &Value) -> Event {
    match serde_json::to_string(payload) {
        Ok(data) => Event::default().event(name).data(data),
        Err(_) => Event::default().event("error").data("{\"error\":{\"code\":\"INTERNAL_ERROR\",\"message\":\"internal error\"}}"),
    }
}

/// Keeps the engine subscription and the connection-count guard alive for
/// as long as the SSE response body is being polled; dropped (and thus
/// unsubscribed/released) when the client disconnects.
struct SseSession {
    inner: UnboundedReceiverStream<Event>,
    _subscription: lens_core::Subscription,
    _guard: crate::state::SseGuard,
}

impl Stream for SseSession {
    type Item = Result<Event, std::convert::Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_next(cx).map(|opt| opt.map(Ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fields_defaults_to_all() {
        assert!(matches!(parse_fields(None), FieldSelector::All(_)));
        assert!(matches!(parse_fields(Some("*")), FieldSelector::All(_)));
    }

    #[test]
    fn parse_fields_splits_and_trims_comma_list() {
        let FieldSelector::Set(fields) = parse_fields(Some("name, age ,email")) else {
            panic!("expected a field set");
        };
        assert_eq!(fields, HashSet::from(["name".to_string(), "age".to_string(), "email".to_string()]));
    }

    #[test]
    fn parse_fields_drops_empty_entries() {
        let FieldSelector::Set(fields) = parse_fields(Some("name,,age")) else {
            panic!("expected a field set");
        };
        assert_eq!(fields, HashSet::from(["name".to_string(), "age".to_string()]));
    }

    #[test]
    fn entity_id_from_input_reads_string_id_field() {
        let input = json!({"id": "entity-1", "other": 2});
        assert_eq!(entity_id_from_input(&input), Some(EntityId::from("entity-1")));
    }

    #[test]
    fn entity_id_from_input_missing_or_non_string_id_is_none() {
        assert_eq!(entity_id_from_input(&json!({"other": 2})), None);
        assert_eq!(entity_id_from_input(&json!({"id": 5})), None);
        assert_eq!(entity_id_from_input(&Value::Null), None);
    }
}
