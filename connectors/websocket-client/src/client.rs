use crate::error::ClientError;
use crate::registry::{SubState, SubscriptionEntry, SubscriptionRegistry};
use crate::state::{ConnectionState, StateCell};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use lens_core::config::ReconnectConfig;
use lens_core::error::EngineError;
use lens_core::observable::{Cleanup, Observable, Observer};
use lens_proto::{apply_patch, CallId, ClientFrame, CollectionId, EntityId, FieldSelector, ReconnectResult, ReconnectStatus, ReconnectSubscription, ServerFrame};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Timeouts and reconnect policy for a `LensClient`. `reconnect` is shared
/// with the server-side config type since both describe the same policy
/// knobs from opposite ends of the wire.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub operation_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { connect_timeout: Duration::from_secs(10), handshake_timeout: Duration::from_secs(10), operation_timeout: Duration::from_secs(30), reconnect: ReconnectConfig::default() }
    }
}

struct PendingOp {
    tx: oneshot::Sender<Result<Value, ClientError>>,
}

struct Inner {
    server_url: String,
    config: ClientConfig,
    state: Arc<StateCell<ConnectionState>>,
    connected: AtomicBool,
    shutdown: Notify,
    shutdown_requested: AtomicBool,
    connected_notify: Notify,
    outbox: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    pending: Mutex<HashMap<CallId, PendingOp>>,
    subscriptions: Mutex<SubscriptionRegistry>,
    next_call_id: AtomicU64,
    latest_metadata: Mutex<Option<lens_proto::Metadata>>,
}

impl Inner {
    fn next_id(&self) -> CallId { CallId::new(format!("c{}", self.next_call_id.fetch_add(1, Ordering::Relaxed))) }

    fn try_send(&self, frame: ClientFrame) -> Result<(), ClientError> {
        match self.outbox.lock().unwrap().as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| ClientError::Disconnected),
            None => Err(ClientError::Disconnected),
        }
    }

    /// The entity collection a subscribable operation returns, learned from
    /// the most recent handshake. `None` until a handshake has completed at
    /// least once, or if the operation isn't in the metadata at all.
    fn entity_for_operation(&self, operation: &str) -> Option<CollectionId> {
        self.latest_metadata.lock().unwrap().as_ref()?.operations.get(operation)?.return_type.clone().map(CollectionId::from)
    }
}

/// A WebSocket client transport for Lens. Maintains a single logical
/// connection, transparently reconnecting (subject to `ClientConfig`) and
/// replaying active subscriptions against the server's operation log.
pub struct LensClient {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LensClient {
    pub async fn new(server_url: &str) -> Self { Self::with_config(server_url, ClientConfig::default()) }

    pub fn with_config(server_url: &str, config: ClientConfig) -> Self {
        let url = Self::normalize_url(server_url);
        info!("creating Lens websocket client for {url}");

        let inner = Arc::new(Inner {
            server_url: url,
            config,
            state: StateCell::new(ConnectionState::Disconnected),
            connected: AtomicBool::new(false),
            shutdown: Notify::new(),
            shutdown_requested: AtomicBool::new(false),
            connected_notify: Notify::new(),
            outbox: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(SubscriptionRegistry::new()),
            next_call_id: AtomicU64::new(0),
            latest_metadata: Mutex::new(None),
        });

        let task = tokio::spawn(Self::run_connection_loop(inner.clone()));
        Self { inner, task: Mutex::new(Some(task)) }
    }

    fn normalize_url(url: &str) -> String {
        match url {
            u if u.starts_with("ws://") || u.starts_with("wss://") => format!("{u}/ws"),
            u if u.starts_with("http://") => format!("ws://{}/ws", &u[7..]),
            u if u.starts_with("https://") => format!("wss://{}/ws", &u[8..]),
            u => format!("wss://{u}/ws"),
        }
    }

    /// A signal for the connection's lifecycle; freshly caught up with the
    /// current state on every `subscribe()`.
    pub fn connection_state(&self) -> Observable<ConnectionState> { self.inner.state.observe() }

    pub fn is_connected(&self) -> bool { self.inner.connected.load(Ordering::Acquire) }

    pub async fn shutdown(self) {
        info!("shutting down Lens websocket client");
        if let Some(task) = self.task.lock().unwrap().take() {
            self.inner.shutdown_requested.store(true, Ordering::Release);
            self.inner.shutdown.notify_waiters();
            if let Err(e) = task.await {
                warn!("connection task join error during shutdown: {e}");
            }
        }
    }

    /// Issue a `query` or `mutation` and await its single result. Pending
    /// operations are not replayed across a reconnect — they reject with
    /// `ClientError::Disconnected` and the caller is expected to retry.
    pub async fn execute(&self, operation: impl Into<String>, input: Option<Value>, fields: Option<FieldSelector>, mutation: bool) -> Result<Value, ClientError> {
        let id = self.inner.next_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(id.clone(), PendingOp { tx });

        let operation = operation.into();
        let frame = if mutation {
            ClientFrame::Mutation { id: id.clone(), operation, input, fields }
        } else {
            ClientFrame::Query { id: id.clone(), operation, input, fields }
        };

        if Self::send_with_wait(&self.inner, frame, self.inner.config.connect_timeout).await.is_err() {
            self.inner.pending.lock().unwrap().remove(&id);
            return Err(ClientError::Disconnected);
        }

        match tokio::time::timeout(self.inner.config.operation_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                self.inner.pending.lock().unwrap().remove(&id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// A cold observable: each `subscribe()` opens a fresh `subscribe` frame
    /// and tracks it in the client's subscription registry, surviving
    /// reconnects when the entity identity is known (see
    /// `SubscriptionEntry::can_replay`). Dropping the returned
    /// `Subscription` sends `unsubscribe`.
    pub fn watch(&self, operation: impl Into<String>, input: Option<Value>, fields: FieldSelector) -> Observable<Value> {
        let inner = self.inner.clone();
        let operation = operation.into();

        Observable::new(move |observer: Observer<Value>| {
            let id = inner.next_id();
            let entity = inner.entity_for_operation(&operation);
            let entity_id = input.as_ref().and_then(|v| v.get("id")).and_then(Value::as_str).map(EntityId::new);

            inner.subscriptions.lock().unwrap().insert(
                id.clone(),
                SubscriptionEntry {
                    operation: operation.clone(),
                    input: input.clone(),
                    fields: fields.clone(),
                    entity,
                    entity_id,
                    state: SubState::Active,
                    last_data: None,
                    version: 0,
                    observer: observer.clone(),
                },
            );

            let frame = ClientFrame::Subscribe { id: id.clone(), operation: operation.clone(), input: input.clone(), fields: fields.clone() };
            let inner_send = inner.clone();
            let id_send = id.clone();
            tokio::spawn(async move {
                if Self::send_with_wait(&inner_send, frame, inner_send.config.connect_timeout).await.is_err() {
                    if let Some(entry) = inner_send.subscriptions.lock().unwrap().remove(&id_send) {
                        entry.observer.error(EngineError::Resolver(anyhow::anyhow!("not connected")));
                    }
                }
            });

            let inner_cleanup = inner.clone();
            Box::new(move || {
                if let Some(entry) = inner_cleanup.subscriptions.lock().unwrap().remove(&id) {
                    if entry.state != SubState::Closed {
                        let frame = ClientFrame::Unsubscribe { id: id.clone() };
                        let _ = inner_cleanup.try_send(frame);
                    }
                }
            }) as Cleanup
        })
    }

    async fn send_with_wait(inner: &Arc<Inner>, frame: ClientFrame, timeout: Duration) -> Result<(), ClientError> {
        if inner.try_send(frame.clone()).is_ok() {
            return Ok(());
        }
        if tokio::time::timeout(timeout, inner.connected_notify.notified()).await.is_err() {
            return Err(ClientError::Timeout);
        }
        inner.try_send(frame)
    }

    async fn run_connection_loop(inner: Arc<Inner>) {
        let mut backoff = inner.config.reconnect.base_delay();
        let mut attempts: u32 = 0;
        info!("starting websocket connection loop to {}", inner.server_url);

        loop {
            tokio::select! {
                _ = inner.shutdown.notified() => {
                    info!("websocket connection shutting down");
                    break;
                }
                result = Self::connect_once(&inner) => {
                    if inner.shutdown_requested.load(Ordering::Acquire) {
                        break;
                    }
                    if !inner.config.reconnect.enabled {
                        if let Err(e) = result {
                            inner.state.set(ConnectionState::Error(e));
                        }
                        break;
                    }
                    match result {
                        Ok(()) => {
                            attempts = 0;
                            backoff = inner.config.reconnect.base_delay();
                        }
                        Err(e) => {
                            attempts += 1;
                            inner.state.set(ConnectionState::Error(e));
                            if attempts > inner.config.reconnect.max_attempts {
                                warn!("giving up after {attempts} reconnect attempts");
                                break;
                            }
                        }
                    }
                    inner.connected.store(false, Ordering::Release);
                    let delay = Self::jittered(backoff, inner.config.reconnect.jitter);
                    tokio::select! {
                        _ = inner.shutdown.notified() => break,
                        _ = sleep(delay) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        inner.state.set(ConnectionState::Disconnected);
        inner.connected.store(false, Ordering::Release);
    }

    fn jittered(base: Duration, jitter: bool) -> Duration {
        if !jitter {
            return base;
        }
        let factor = 0.85 + rand::random::<f64>() * 0.3;
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }

    async fn connect_once(inner: &Arc<Inner>) -> Result<(), ClientError> {
        inner.state.set(ConnectionState::Connecting { url: inner.server_url.clone() });

        let (ws_stream, _) = tokio::time::timeout(inner.config.connect_timeout, connect_async(inner.server_url.as_str()))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        debug!("websocket handshake completed with {}", inner.server_url);

        let (mut sink, mut stream) = ws_stream.split();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientFrame>();

        Self::write_frame(&mut sink, ClientFrame::Handshake).await?;

        let metadata = loop {
            let frame = tokio::time::timeout(inner.config.handshake_timeout, Self::next_server_frame(&mut stream, &mut sink))
                .await
                .map_err(|_| ClientError::Timeout)??;
            if let ServerFrame::Handshake { metadata } = frame {
                break metadata;
            }
        };

        *inner.outbox.lock().unwrap() = Some(outgoing_tx);
        *inner.latest_metadata.lock().unwrap() = Some(metadata.clone());
        inner.state.set(ConnectionState::Connected { url: inner.server_url.clone(), metadata });
        inner.connected.store(true, Ordering::Release);
        inner.connected_notify.notify_waiters();

        Self::replay_subscriptions(inner, &mut stream, &mut sink).await?;

        let result = loop {
            tokio::select! {
                _ = inner.shutdown.notified() => break Ok(()),
                maybe_frame = outgoing_rx.recv() => {
                    match maybe_frame {
                        Some(frame) => { if Self::write_frame(&mut sink, frame).await.is_err() { break Ok(()); } }
                        None => break Ok(()),
                    }
                }
                frame = Self::next_server_frame(&mut stream, &mut sink) => {
                    match frame {
                        Ok(frame) => Self::dispatch_frame(inner, frame),
                        Err(ClientError::Disconnected) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        *inner.outbox.lock().unwrap() = None;
        Self::on_disconnected(inner);
        result
    }

    async fn replay_subscriptions(inner: &Arc<Inner>, stream: &mut WsSource, sink: &mut WsSink) -> Result<(), ClientError> {
        let items: Vec<ReconnectSubscription> = {
            let subs = inner.subscriptions.lock().unwrap();
            subs.iter_reconnecting()
                .filter(|(_, entry)| entry.can_replay())
                .map(|(id, entry)| ReconnectSubscription {
                    id: id.as_str().to_string(),
                    entity: entry.entity.clone().expect("checked by can_replay"),
                    entity_id: entry.entity_id.clone().expect("checked by can_replay"),
                    fields: entry.fields.clone(),
                    version: entry.version,
                    data_hash: None,
                    input: entry.input.clone(),
                })
                .collect()
        };

        if items.is_empty() {
            return Ok(());
        }

        let reconnect_id = inner.next_id();
        Self::write_frame(sink, ClientFrame::Reconnect { reconnect_id, subscriptions: items }).await?;

        let results = loop {
            let frame = tokio::time::timeout(inner.config.handshake_timeout, Self::next_server_frame(stream, sink)).await.map_err(|_| ClientError::Timeout)??;
            match frame {
                ServerFrame::ReconnectAck { results, .. } => break results,
                other => Self::dispatch_frame(inner, other),
            }
        };

        Self::apply_reconnect_results(inner, results);
        Ok(())
    }

    fn apply_reconnect_results(inner: &Arc<Inner>, results: Vec<ReconnectResult>) {
        let mut subs = inner.subscriptions.lock().unwrap();
        for result in results {
            let id = CallId::new(result.id.as_str());
            let Some(entry) = subs.get_mut(&id) else { continue };
            match result.status {
                ReconnectStatus::Patched { version, patches } => {
                    let mut state = entry.last_data.clone().unwrap_or(Value::Null);
                    for ops in patches {
                        state = apply_patch(&state, &ops);
                    }
                    entry.last_data = Some(state.clone());
                    entry.version = version;
                    entry.state = SubState::Active;
                    entry.observer.next(state);
                }
                ReconnectStatus::Snapshot { version, data } => {
                    entry.last_data = Some(data.clone());
                    entry.version = version;
                    entry.state = SubState::Active;
                    entry.observer.next(data);
                }
                ReconnectStatus::Unchanged => entry.state = SubState::Active,
                ReconnectStatus::Gone => {
                    entry.state = SubState::Closed;
                    entry.observer.error(EngineError::Resolver(anyhow::anyhow!("entity no longer exists")));
                }
            }
        }
    }

    fn dispatch_frame(inner: &Arc<Inner>, frame: ServerFrame) {
        match frame {
            ServerFrame::Handshake { .. } | ServerFrame::ReconnectAck { .. } => {
                debug!("ignoring unexpected {frame:?} outside handshake/reconnect window");
            }
            ServerFrame::Result { id, data } => {
                if let Some(pending) = inner.pending.lock().unwrap().remove(&id) {
                    let _ = pending.tx.send(Ok(data));
                }
            }
            ServerFrame::Error { id, error } => {
                let Some(id) = id else {
                    warn!("protocol error with no id: {error}");
                    return;
                };
                if let Some(pending) = inner.pending.lock().unwrap().remove(&id) {
                    let _ = pending.tx.send(Err(ClientError::Server(error)));
                    return;
                }
                if let Some(mut entry) = inner.subscriptions.lock().unwrap().remove(&id) {
                    entry.state = SubState::Closed;
                    entry.observer.error(EngineError::Resolver(anyhow::anyhow!(error.message)));
                }
            }
            ServerFrame::Update { subscription_id, version, data, patch } => {
                let mut subs = inner.subscriptions.lock().unwrap();
                let Some(entry) = subs.get_mut(&subscription_id) else { return };
                if let Some(data) = data {
                    if entry.entity_id.is_none() {
                        if let Some(id_str) = data.get("id").and_then(Value::as_str) {
                            entry.entity_id = Some(EntityId::new(id_str));
                        }
                    }
                    if entry.entity.is_none() {
                        entry.entity = inner.entity_for_operation(&entry.operation);
                    }
                    entry.last_data = Some(data.clone());
                    entry.version = version.unwrap_or(entry.version);
                    entry.state = SubState::Active;
                    entry.observer.next(data);
                } else if let Some(ops) = patch {
                    let base = entry.last_data.clone().unwrap_or(Value::Null);
                    let applied = apply_patch(&base, &ops);
                    entry.last_data = Some(applied.clone());
                    entry.version = version.unwrap_or(entry.version);
                    entry.observer.next(applied);
                }
            }
        }
    }

    fn on_disconnected(inner: &Arc<Inner>) {
        for (_, pending) in inner.pending.lock().unwrap().drain() {
            let _ = pending.tx.send(Err(ClientError::Disconnected));
        }
        inner.subscriptions.lock().unwrap().mark_all_reconnecting_or_drop(inner.config.reconnect.enabled);
    }

    async fn write_frame(sink: &mut WsSink, frame: ClientFrame) -> Result<(), ClientError> {
        let text = serde_json::to_string(&frame).map_err(|e| ClientError::Transport(e.to_string()))?;
        sink.send(Message::Text(text.into())).await.map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn next_server_frame(stream: &mut WsSource, sink: &mut WsSink) -> Result<ServerFrame, ClientError> {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => return Ok(frame),
                    Err(e) => {
                        warn!("malformed server frame: {e}");
                        continue;
                    }
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Err(ClientError::Disconnected),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(ClientError::Transport(e.to_string())),
            }
        }
    }
}

impl Drop for LensClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            debug!("Lens websocket client dropped, requesting shutdown");
            self.inner.shutdown_requested.store(true, Ordering::Release);
            self.inner.shutdown.notify_waiters();
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_url_adds_ws_path_and_scheme() {
        assert_eq!(LensClient::normalize_url("ws://localhost:8080"), "ws://localhost:8080/ws");
        assert_eq!(LensClient::normalize_url("wss://api.example.com"), "wss://api.example.com/ws");
        assert_eq!(LensClient::normalize_url("http://localhost:8080"), "ws://localhost:8080/ws");
        assert_eq!(LensClient::normalize_url("https://api.example.com"), "wss://api.example.com/ws");
        assert_eq!(LensClient::normalize_url("api.example.com"), "wss://api.example.com/ws");
    }

    #[test]
    fn jittered_backoff_stays_within_bounds_when_enabled() {
        let base = Duration::from_millis(200);
        for _ in 0..50 {
            let delay = LensClient::jittered(base, true);
            assert!(delay >= Duration::from_millis(170) && delay <= Duration::from_millis(230));
        }
        assert_eq!(LensClient::jittered(base, false), base);
    }
}

