use crate::client_ip::SmartClientIp;
use crate::state::{ConnectionState, Registry, SubscriptionState};
use crate::user_agent::OptionalUserAgent;
use axum::extract::{ws::Message, ws::WebSocket, State, WebSocketUpgrade};
use axum::{response::IntoResponse, routing::get, Router as AxumRouter};
use futures_util::{SinkExt, StreamExt};
use lens_core::{
    apply_field_selection, filter_patch_fields, first_value_from, BroadcastInput, Engine, EntitySet, LensConfig, ObserverBuilder, Plugins,
    ReconnectContext, Router, SubscribeContext,
};
use lens_proto::{CallId, ClientFrame, ConnectionId, EntityKey, ErrorCode, FieldSelector, ServerFrame, WireError};
use std::collections::HashMap;
use std::net::IpAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{debug, error, info, warn, Level};

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
}

/// The websocket protocol handler. Owns nothing about storage — `Engine`
/// already closes over the router, entity set, and plugins; this just
/// drives one axum route and the per-connection state machine.
pub struct LensWebsocketServer {
    state: AppState,
}

impl LensWebsocketServer {
    pub fn new(router: Router, entities: EntitySet, plugins: Plugins, config: LensConfig) -> Self {
        let router = Arc::new(router);
        let plugins = Arc::new(plugins);
        let engine = Arc::new(Engine::new(router.clone(), Arc::new(entities), plugins.clone()));
        Self { state: AppState { engine, router, plugins, config: Arc::new(config), registry: Arc::new(Registry::new()) } }
    }

    pub async fn run(&self, bind_address: &str) -> Result<(), ServerError> {
        let app = AxumRouter::new().route("/ws", get(ws_handler)).with_state(self.state.clone()).layer(
            ServiceBuilder::new().layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                    .on_request(DefaultOnRequest::new().level(Level::INFO))
                    .on_response(DefaultOnResponse::new().level(Level::INFO)),
            ),
        );

        let listener = tokio::net::TcpListener::bind(bind_address).await?;
        info!("Lens websocket server listening on {}", listener.local_addr()?);
        axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>()).await?;
        Ok(())
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    SmartClientIp(client_ip): SmartClientIp,
    OptionalUserAgent(user_agent): OptionalUserAgent,
    State(state): State<AppState>,
) -> impl IntoResponse {
    debug!("`{}` at {client_ip} connecting", user_agent.unwrap_or_else(|| "unknown client".into()));
    ws.on_upgrade(move |socket| handle_connection(socket, client_ip, state))
}

async fn handle_connection(socket: WebSocket, client_ip: IpAddr, state: AppState) {
    if state.registry.connection_count() >= state.config.max_connections {
        warn!("rejecting {client_ip}: connection limit reached");
        return;
    }

    let connection_id = ConnectionId::new();
    if !state.plugins.on_connect(connection_id).await {
        debug!("connect hook vetoed {client_ip}");
        return;
    }

    let (mut sender, mut receiver) = socket.split();
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Message>();
    let conn = Arc::new(ConnectionState::new(connection_id, outbox, &state.config));
    state.registry.insert(conn.clone());

    let handshake = state.plugins.before_send(ServerFrame::Handshake { metadata: state.router.metadata(env!("CARGO_PKG_VERSION")) });
    if send_frame(&mut sender, &handshake).await.is_err() {
        state.registry.remove(connection_id);
        return;
    }
    state.plugins.after_send(&handshake);

    let writer = tokio::spawn(async move {
        while let Some(message) = outbox_rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    info!("{client_ip} connected as {connection_id}");

    while let Some(message) = receiver.next().await {
        match message {
            Ok(message) => {
                if process_message(message, client_ip, &conn, &state).await.is_break() {
                    break;
                }
            }
            Err(err) => {
                debug!("{client_ip} websocket error: {err}");
                break;
            }
        }
    }

    writer.abort();
    let subscription_count = conn.subscriptions.len();
    for entry in conn.subscriptions.iter() {
        state.registry.remove_subscription(connection_id, entry.key(), &entry.value().entity_keys);
    }
    state.registry.remove(connection_id);
    state.plugins.on_disconnect(connection_id, subscription_count).await;
    debug!("{client_ip} ({connection_id}) disconnected");
}

async fn process_message(message: Message, client_ip: IpAddr, conn: &Arc<ConnectionState>, state: &AppState) -> ControlFlow<(), ()> {
    let text = match message {
        Message::Text(text) => text.to_string(),
        Message::Close(_) => return ControlFlow::Break(()),
        Message::Ping(_) | Message::Pong(_) => return ControlFlow::Continue(()),
        Message::Binary(_) => {
            send_error(conn, state, None, ErrorCode::InvalidInput, "binary frames are not supported").await;
            return ControlFlow::Continue(());
        }
    };

    if text.len() > state.config.max_message_size {
        send_error(conn, state, None, ErrorCode::MessageTooLarge, "message exceeds the configured size limit").await;
        return ControlFlow::Continue(());
    }

    if !conn.limiter.allow() {
        send_error(conn, state, None, ErrorCode::RateLimited, "rate limit exceeded").await;
        return ControlFlow::Continue(());
    }

    let frame: ClientFrame = match serde_json::from_str(&text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!("{client_ip} sent an unparseable frame: {err}");
            send_error(conn, state, None, ErrorCode::InvalidInput, "malformed frame").await;
            return ControlFlow::Continue(());
        }
    };

    match frame {
        ClientFrame::Handshake => {
            send_frame_to(conn, state, ServerFrame::Handshake { metadata: state.router.metadata(env!("CARGO_PKG_VERSION")) }).await;
        }
        ClientFrame::Query { id, operation, input, fields } => {
            run_one_shot(conn, state, id, operation, input.unwrap_or(serde_json::Value::Null), fields.unwrap_or_default()).await;
        }
        ClientFrame::Mutation { id, operation, input, fields } => {
            run_one_shot(conn, state, id, operation, input.unwrap_or(serde_json::Value::Null), fields.unwrap_or_default()).await;
        }
        ClientFrame::Subscribe { id, operation, input, fields } => {
            start_subscription(conn, state, id, operation, input.unwrap_or(serde_json::Value::Null), fields).await;
        }
        ClientFrame::Unsubscribe { id } => {
            if let Some((_, sub)) = conn.subscriptions.remove(&id) {
                state.registry.remove_subscription(conn.id, &id, &sub.entity_keys);
            }
        }
        ClientFrame::UpdateFields { id, set_fields, add_fields, remove_fields } => {
            apply_update_fields(conn, state, id, set_fields, add_fields, remove_fields).await;
        }
        ClientFrame::Reconnect { reconnect_id, subscriptions } => {
            handle_reconnect(conn, state, reconnect_id, subscriptions).await;
        }
    }

    ControlFlow::Continue(())
}

async fn run_one_shot(conn: &Arc<ConnectionState>, state: &AppState, id: CallId, operation: String, input: serde_json::Value, fields: FieldSelector) {
    let observable = state.engine.execute(&operation, input);
    let outcome = match tokio::time::timeout(state.config.timeout(), first_value_from(&observable)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(lens_core::EngineError::Timeout),
    };

    match outcome {
        Ok(lens_core::OperationOutcome::Data { value, changes, .. }) => {
            let value = apply_field_selection(value, &fields);
            send_frame_to(conn, state, ServerFrame::Result { id: id.clone(), data: value }).await;
            broadcast_changes(conn, &state.registry, &id, &changes);
        }
        Ok(lens_core::OperationOutcome::Error(err)) => {
            let wire = lens_core::sanitize_for_wire(&err, state.config.errors.development);
            send_frame_to(conn, state, ServerFrame::Error { id: Some(id), error: wire }).await;
        }
        Err(err) => {
            let wire = lens_core::sanitize_for_wire(&err, state.config.errors.development);
            send_frame_to(conn, state, ServerFrame::Error { id: Some(id), error: wire }).await;
        }
    }
}

/// Fan a one-shot query/mutation's entity changes out to every sibling
/// subscription watching the same entity — the same fan-out a live
/// subscription's own emits already get in `deliver_update`. The one-shot
/// call itself was never registered in the entity index, so there's no
/// subscription id to exclude.
fn broadcast_changes(conn: &Arc<ConnectionState>, registry: &Arc<Registry>, id: &CallId, changes: &[lens_core::EntityChange]) {
    for change in changes {
        let Some(outcome) = &change.outcome else { continue };
        for (sibling_conn, sibling_sub) in registry.siblings_for(&change.key, (conn.id, id)) {
            let sibling_fields = sibling_conn.subscriptions.get(&sibling_sub).map(|s| s.fields.clone()).unwrap_or_default();
            let frame = match (&outcome.patch, &outcome.data) {
                (Some(patch), _) => {
                    let patch = filter_patch_fields(patch.clone(), &sibling_fields);
                    if patch.is_empty() {
                        continue;
                    }
                    ServerFrame::Update { subscription_id: sibling_sub, version: Some(outcome.version), data: None, patch: Some(patch) }
                }
                (None, Some(data)) => {
                    let data = apply_field_selection(data.clone(), &sibling_fields);
                    ServerFrame::Update { subscription_id: sibling_sub, version: Some(outcome.version), data: Some(data), patch: None }
                }
                (None, None) => continue,
            };
            let _ = sibling_conn.outbox.send(to_message(&frame));
        }
    }
}

/// Apply `setFields`/`addFields`/`removeFields` to a live subscription's
/// stored selector and fire `onUpdateFields`.
async fn apply_update_fields(
    conn: &Arc<ConnectionState>,
    state: &AppState,
    id: CallId,
    set_fields: Option<FieldSelector>,
    add_fields: Option<FieldSelector>,
    remove_fields: Option<Vec<String>>,
) {
    let Some((operation, input, current_fields)) = conn.subscriptions.get(&id).map(|s| (s.operation.clone(), s.input.clone(), s.fields.clone())) else {
        send_error(conn, state, Some(id), ErrorCode::NotFound, "no such subscription").await;
        return;
    };

    let next_fields = merge_fields(current_fields, set_fields, add_fields, remove_fields);

    let ctx = SubscribeContext {
        client_id: conn.id,
        sub_id: id.to_string(),
        operation,
        input,
        fields: next_fields.clone(),
        entity: None,
        entity_id: None,
    };
    if !state.plugins.on_update_fields(&ctx).await {
        send_error(conn, state, Some(id), ErrorCode::ExecutionError, "updateFields vetoed").await;
        return;
    }

    if let Some(mut sub) = conn.subscriptions.get_mut(&id) {
        sub.fields = next_fields;
    }
}

fn merge_fields(current: FieldSelector, set: Option<FieldSelector>, add: Option<FieldSelector>, remove: Option<Vec<String>>) -> FieldSelector {
    let mut next = set.unwrap_or(current);
    if let Some(add) = add {
        next = union_fields(next, add);
    }
    if let Some(remove) = remove {
        next = subtract_fields(next, &remove);
    }
    next
}

fn union_fields(a: FieldSelector, b: FieldSelector) -> FieldSelector {
    match (a, b) {
        (FieldSelector::Set(mut a), FieldSelector::Set(b)) => {
            a.extend(b);
            FieldSelector::Set(a)
        }
        _ => FieldSelector::all(),
    }
}

fn subtract_fields(selector: FieldSelector, remove: &[String]) -> FieldSelector {
    match selector {
        // There's no way to express "everything except" in this selector;
        // removing from "*" is a no-op until a narrower set is set first.
        FieldSelector::All(_) => FieldSelector::all(),
        FieldSelector::Set(mut set) => {
            for field in remove {
                set.remove(field);
            }
            FieldSelector::Set(set)
        }
    }
}

async fn start_subscription(
    conn: &Arc<ConnectionState>,
    state: &AppState,
    id: CallId,
    operation: String,
    input: serde_json::Value,
    fields: FieldSelector,
) {
    if conn.subscriptions.len() >= state.config.max_subscriptions_per_client {
        send_error(conn, state, Some(id), ErrorCode::SubscriptionLimit, "subscription limit reached").await;
        return;
    }

    let sub_ctx = SubscribeContext {
        client_id: conn.id,
        sub_id: id.to_string(),
        operation: operation.clone(),
        input: input.clone(),
        fields,
        entity: None,
        entity_id: None,
    };
    if !state.plugins.on_subscribe(&sub_ctx).await {
        send_error(conn, state, Some(id), ErrorCode::ExecutionError, "subscription vetoed").await;
        return;
    }

    let observable = state.engine.execute(&operation, input);
    let registry = state.registry.clone();
    let conn_for_next = conn.clone();
    let sub_id_for_next = id.clone();
    let development = state.config.errors.development;

    let conn_for_complete = conn.clone();
    let sub_id_for_complete = id.clone();
    let registry_for_complete = state.registry.clone();

    let handle = observable.subscribe(
        ObserverBuilder::new()
            .on_next(move |outcome| deliver_update(&conn_for_next, &registry, &sub_id_for_next, outcome, development))
            .on_complete(move || {
                if let Some((_, sub)) = conn_for_complete.subscriptions.remove(&sub_id_for_complete) {
                    registry_for_complete.remove_subscription(conn_for_complete.id, &sub_id_for_complete, &sub.entity_keys);
                }
            }),
    );

    conn.subscriptions.insert(
        id,
        SubscriptionState { operation, input: sub_ctx.input, fields: sub_ctx.fields, entity_keys: Default::default(), last_value: None, handle },
    );
}

fn deliver_update(
    conn: &Arc<ConnectionState>,
    registry: &Arc<Registry>,
    sub_id: &CallId,
    outcome: lens_core::OperationOutcome,
    development: bool,
) {
    match outcome {
        lens_core::OperationOutcome::Error(err) => {
            let wire = lens_core::sanitize_for_wire(&err, development);
            let _ = conn.outbox.send(to_message(&ServerFrame::Error { id: Some(sub_id.clone()), error: wire }));
        }
        lens_core::OperationOutcome::Data { value, entity_keys, changes } => {
            let new_keys: std::collections::HashSet<EntityKey> = entity_keys.into_iter().collect();

            if let Some(mut state) = conn.subscriptions.get_mut(sub_id) {
                registry.update_entity_keys(conn.id, sub_id, &state.entity_keys, &new_keys);
                state.entity_keys = new_keys.clone();

                let version = changes.iter().filter_map(|c| c.outcome.as_ref()).map(|o| o.version).max();
                let frame = match &state.last_value {
                    None => {
                        let data = apply_field_selection(value.clone(), &state.fields);
                        ServerFrame::Update { subscription_id: sub_id.clone(), version, data: Some(data), patch: None }
                    }
                    Some(previous) => {
                        let ops = lens_core::patch_derive::derive_patch(previous, &value);
                        if ops.is_empty() {
                            return;
                        }
                        let ops = filter_patch_fields(ops, &state.fields);
                        if ops.is_empty() {
                            return;
                        }
                        ServerFrame::Update { subscription_id: sub_id.clone(), version, data: None, patch: Some(ops) }
                    }
                };
                // `last_value` stays the full, unfiltered value so later
                // diffs and a subsequent `updateFields` both see the whole
                // state regardless of what's currently selected.
                state.last_value = Some(value);
                let _ = conn.outbox.send(to_message(&frame));
            }

            for change in &changes {
                let Some(outcome) = &change.outcome else { continue };
                for (sibling_conn, sibling_sub) in registry.siblings_for(&change.key, (conn.id, sub_id)) {
                    let sibling_fields = sibling_conn.subscriptions.get(&sibling_sub).map(|s| s.fields.clone()).unwrap_or_default();
                    let frame = match (&outcome.patch, &outcome.data) {
                        (Some(patch), _) => {
                            let patch = filter_patch_fields(patch.clone(), &sibling_fields);
                            if patch.is_empty() {
                                continue;
                            }
                            ServerFrame::Update { subscription_id: sibling_sub, version: Some(outcome.version), data: None, patch: Some(patch) }
                        }
                        (None, Some(data)) => {
                            let data = apply_field_selection(data.clone(), &sibling_fields);
                            ServerFrame::Update { subscription_id: sibling_sub, version: Some(outcome.version), data: Some(data), patch: None }
                        }
                        (None, None) => continue,
                    };
                    let _ = sibling_conn.outbox.send(to_message(&frame));
                }
            }
        }
    }
}

async fn handle_reconnect(conn: &Arc<ConnectionState>, state: &AppState, reconnect_id: lens_proto::ReconnectId, subscriptions: Vec<lens_proto::ReconnectSubscription>) {
    let started = std::time::Instant::now();
    let fields_by_id: HashMap<String, FieldSelector> = subscriptions.iter().map(|s| (s.id.clone(), s.fields.clone())).collect();
    let results = state
        .plugins
        .on_reconnect(ReconnectContext { client_id: conn.id, subscriptions })
        .await
        .unwrap_or_default();
    let results = results
        .into_iter()
        .map(|mut result| {
            let fields = fields_by_id.get(&result.id).cloned().unwrap_or_default();
            result.status = filter_reconnect_status(result.status, &fields);
            result
        })
        .collect();
    let frame = ServerFrame::ReconnectAck {
        reconnect_id,
        results,
        server_time: chrono::Utc::now(),
        processing_time_ms: started.elapsed().as_millis() as u64,
    };
    send_frame_to(conn, state, frame).await;
}

fn filter_reconnect_status(status: lens_proto::ReconnectStatus, fields: &FieldSelector) -> lens_proto::ReconnectStatus {
    match status {
        lens_proto::ReconnectStatus::Patched { version, patches } => {
            let patches = patches.into_iter().map(|ops| filter_patch_fields(ops, fields)).collect();
            lens_proto::ReconnectStatus::Patched { version, patches }
        }
        lens_proto::ReconnectStatus::Snapshot { version, data } => lens_proto::ReconnectStatus::Snapshot { version, data: apply_field_selection(data, fields) },
        other => other,
    }
}

async fn send_error(conn: &Arc<ConnectionState>, state: &AppState, id: Option<CallId>, code: ErrorCode, message: &str) {
    let _ = state;
    let _ = conn.outbox.send(to_message(&ServerFrame::Error { id, error: WireError::new(code, message) }));
}

async fn send_frame_to(conn: &Arc<ConnectionState>, state: &AppState, frame: ServerFrame) {
    let frame = state.plugins.before_send(frame);
    let _ = conn.outbox.send(to_message(&frame));
    state.plugins.after_send(&frame);
}

async fn send_frame(sender: &mut futures_util::stream::SplitSink<WebSocket, Message>, frame: &ServerFrame) -> Result<(), axum::Error> {
    sender.send(to_message(frame)).await
}

fn to_message(frame: &ServerFrame) -> Message {
    match serde_json::to_string(frame) {
        Ok(text) => Message::Text(text.into()),
        Err(err) => {
            error!("failed to serialize server frame: {err}");
            Message::Text("{\"type\":\"error\",\"error\":{\"code\":\"internal_error\",\"message\":\"internal error\"}}".into())
        }
    }
}
