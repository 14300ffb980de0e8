//! Hook points exposed by the engine and protocol handler. Hooks implement
//! policy; the core never does. Each hook kind is an ordered `Vec<Arc<dyn
//! _>>`, composed in installation order: the first hook to veto
//! short-circuits the chain. Lens names several independent hook points
//! (connect, subscription, broadcast, reconnect, send) rather than a single
//! combined policy agent.

use crate::oplog::OperationLog;
use async_trait::async_trait;
use lens_proto::{CollectionId, ConnectionId, EntityId, FieldSelector, PatchOp, ReconnectResult, ReconnectSubscription, ServerFrame};
use serde_json::Value;
use std::sync::Arc;

#[async_trait]
pub trait ConnectHook: Send + Sync {
    async fn on_connect(&self, _client_id: ConnectionId) -> bool { true }
    async fn on_disconnect(&self, _client_id: ConnectionId, _subscription_count: usize) {}
}

/// Context shared by `onSubscribe` / `onUnsubscribe` / `onUpdateFields`.
#[derive(Clone, Debug)]
pub struct SubscribeContext {
    pub client_id: ConnectionId,
    pub sub_id: String,
    pub operation: String,
    pub input: Value,
    pub fields: FieldSelector,
    pub entity: Option<CollectionId>,
    pub entity_id: Option<EntityId>,
}

#[async_trait]
pub trait SubscriptionHook: Send + Sync {
    async fn on_subscribe(&self, _ctx: &SubscribeContext) -> bool { true }
    async fn on_unsubscribe(&self, _ctx: &SubscribeContext) {}
    async fn on_update_fields(&self, _ctx: &SubscribeContext) -> bool { true }
}

pub struct BroadcastInput {
    pub entity: CollectionId,
    pub entity_id: EntityId,
    pub data: Value,
}

#[derive(Clone, Debug)]
pub struct BroadcastOutcome {
    pub version: u64,
    pub patch: Option<Vec<PatchOp>>,
    pub data: Option<Value>,
}

/// The primary integration point for the operation log: decides whether a
/// broadcast is a snapshot or a patch, and assigns the version.
#[async_trait]
pub trait BroadcastHook: Send + Sync {
    async fn on_broadcast(&self, input: BroadcastInput) -> Option<BroadcastOutcome>;
}

/// Backs `BroadcastHook` with an `OperationLog`: every entity-producing
/// operation offers its result here, and this hook is what actually calls
/// `OperationLog::emit` and turns the outcome into a patch-or-suppress
/// decision.
pub struct OpLogBroadcastHook<L: OperationLog> {
    log: Arc<L>,
}

impl<L: OperationLog> OpLogBroadcastHook<L> {
    pub fn new(log: Arc<L>) -> Self { Self { log } }
}

#[async_trait]
impl<L: OperationLog> BroadcastHook for OpLogBroadcastHook<L> {
    async fn on_broadcast(&self, input: BroadcastInput) -> Option<BroadcastOutcome> {
        let key = lens_proto::EntityKey::new(input.entity, input.entity_id);
        let data = input.data.clone();
        let outcome = self.log.emit(&key, input.data).await.ok()?;
        if !outcome.changed {
            return None;
        }
        // A brand-new entity has no patch yet; any sibling subscription
        // that already somehow tracks this key needs the full state.
        let snapshot = outcome.patch.is_none().then_some(data);
        Some(BroadcastOutcome { version: outcome.version, patch: outcome.patch.map(|p| p.operations), data: snapshot })
    }
}

pub struct ReconnectContext {
    pub client_id: ConnectionId,
    pub subscriptions: Vec<ReconnectSubscription>,
}

#[async_trait]
pub trait ReconnectHook: Send + Sync {
    async fn on_reconnect(&self, ctx: ReconnectContext) -> Option<Vec<ReconnectResult>>;
}

/// Resolves `reconnect` requests directly against an `OperationLog` — the
/// default behaviour when no custom hook overrides it.
pub struct OpLogReconnectHook<L: OperationLog> {
    log: Arc<L>,
}

impl<L: OperationLog> OpLogReconnectHook<L> {
    pub fn new(log: Arc<L>) -> Self { Self { log } }
}

#[async_trait]
impl<L: OperationLog> ReconnectHook for OpLogReconnectHook<L> {
    async fn on_reconnect(&self, ctx: ReconnectContext) -> Option<Vec<ReconnectResult>> {
        let mut results = Vec::with_capacity(ctx.subscriptions.len());
        for sub in ctx.subscriptions {
            let key = lens_proto::EntityKey::new(sub.entity.clone(), sub.entity_id.clone());
            let current_version = self.log.get_version(&key).await.ok()?;

            let status = if current_version == 0 {
                lens_proto::ReconnectStatus::Gone
            } else if sub.version == current_version {
                lens_proto::ReconnectStatus::Unchanged
            } else {
                match self.log.get_patches_since(&key, sub.version).await.ok()? {
                    Some(patches) => lens_proto::ReconnectStatus::Patched { version: current_version, patches: patches.into_iter().map(|p| p.operations).collect() },
                    None => match self.log.get_state(&key).await.ok()? {
                        Some(data) => lens_proto::ReconnectStatus::Snapshot { version: current_version, data },
                        None => lens_proto::ReconnectStatus::Gone,
                    },
                }
            };

            results.push(ReconnectResult { id: sub.id, entity: sub.entity, entity_id: sub.entity_id, status });
        }
        Some(results)
    }
}

pub trait SendHook: Send + Sync {
    fn before_send(&self, frame: ServerFrame) -> ServerFrame { frame }
    fn after_send(&self, _frame: &ServerFrame) {}
}

/// An ordered chain of hooks for one hook point. Installation order is
/// preserved; callers fold over `hooks()` and stop at the first veto.
pub struct HookChain<T: ?Sized> {
    hooks: Vec<Arc<T>>,
}

impl<T: ?Sized> Default for HookChain<T> {
    fn default() -> Self { Self { hooks: Vec::new() } }
}

impl<T: ?Sized> HookChain<T> {
    pub fn new() -> Self { Self::default() }

    pub fn install(&mut self, hook: Arc<T>) -> &mut Self {
        self.hooks.push(hook);
        self
    }

    pub fn hooks(&self) -> &[Arc<T>] { &self.hooks }
}

/// The full plugin surface installed on an engine / protocol handler.
#[derive(Default)]
pub struct Plugins {
    pub connect: HookChain<dyn ConnectHook>,
    pub subscription: HookChain<dyn SubscriptionHook>,
    pub broadcast: HookChain<dyn BroadcastHook>,
    pub reconnect: HookChain<dyn ReconnectHook>,
    pub send: HookChain<dyn SendHook>,
}

impl Plugins {
    pub fn new() -> Self { Self::default() }

    pub async fn on_connect(&self, client_id: ConnectionId) -> bool {
        for hook in self.connect.hooks() {
            if !hook.on_connect(client_id).await {
                return false;
            }
        }
        true
    }

    pub async fn on_disconnect(&self, client_id: ConnectionId, subscription_count: usize) {
        for hook in self.connect.hooks() {
            hook.on_disconnect(client_id, subscription_count).await;
        }
    }

    pub async fn on_subscribe(&self, ctx: &SubscribeContext) -> bool {
        for hook in self.subscription.hooks() {
            if !hook.on_subscribe(ctx).await {
                return false;
            }
        }
        true
    }

    pub async fn on_unsubscribe(&self, ctx: &SubscribeContext) {
        for hook in self.subscription.hooks() {
            hook.on_unsubscribe(ctx).await;
        }
    }

    pub async fn on_update_fields(&self, ctx: &SubscribeContext) -> bool {
        for hook in self.subscription.hooks() {
            if !hook.on_update_fields(ctx).await {
                return false;
            }
        }
        true
    }

    pub async fn on_broadcast(&self, input: BroadcastInput) -> Option<BroadcastOutcome> {
        for hook in self.broadcast.hooks() {
            let attempt = BroadcastInput { entity: input.entity.clone(), entity_id: input.entity_id.clone(), data: input.data.clone() };
            if let Some(outcome) = hook.on_broadcast(attempt).await {
                return Some(outcome);
            }
        }
        None
    }

    pub async fn on_reconnect(&self, ctx: ReconnectContext) -> Option<Vec<ReconnectResult>> {
        for hook in self.reconnect.hooks() {
            if let Some(results) = hook.on_reconnect(ReconnectContext { client_id: ctx.client_id, subscriptions: ctx.subscriptions.clone() }).await {
                return Some(results);
            }
        }
        None
    }

    pub fn before_send(&self, mut frame: ServerFrame) -> ServerFrame {
        for hook in self.send.hooks() {
            frame = hook.before_send(frame);
        }
        frame
    }

    pub fn after_send(&self, frame: &ServerFrame) {
        for hook in self.send.hooks() {
            hook.after_send(frame);
        }
    }
}
