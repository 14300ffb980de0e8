//! Per-connection bookkeeping and the entity → subscriptions index used for
//! broadcast fan-out (entity_keys are recomputed on every emit, so the
//! index is rebuilt incrementally rather than assumed stable).

use crate::ratelimit::RateLimiter;
use axum::extract::ws::Message;
use dashmap::{DashMap, DashSet};
use lens_core::{LensConfig, Subscription};
use lens_proto::{CallId, ConnectionId, EntityKey, FieldSelector};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;

pub struct SubscriptionState {
    pub operation: String,
    pub input: Value,
    pub fields: FieldSelector,
    pub entity_keys: HashSet<EntityKey>,
    pub last_value: Option<Value>,
    /// Holding this keeps the engine's producer running; dropping it
    /// unsubscribes.
    pub handle: Subscription,
}

pub struct ConnectionState {
    pub id: ConnectionId,
    pub outbox: UnboundedSender<Message>,
    pub subscriptions: DashMap<CallId, SubscriptionState>,
    pub limiter: RateLimiter,
}

impl ConnectionState {
    pub fn new(id: ConnectionId, outbox: UnboundedSender<Message>, config: &LensConfig) -> Self {
        Self { id, outbox, subscriptions: DashMap::new(), limiter: RateLimiter::new(&config.rate_limit) }
    }
}

/// Tracks every live connection and, for each `EntityKey`, the set of
/// `(connection, subscription)` pairs currently watching it — the index the
/// protocol handler walks on every broadcast.
#[derive(Default)]
pub struct Registry {
    connections: DashMap<ConnectionId, std::sync::Arc<ConnectionState>>,
    entity_index: DashMap<EntityKey, DashSet<(ConnectionId, CallId)>>,
    connection_count: Mutex<usize>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    pub fn connection_count(&self) -> usize { *self.connection_count.lock().unwrap() }

    pub fn insert(&self, conn: std::sync::Arc<ConnectionState>) {
        *self.connection_count.lock().unwrap() += 1;
        self.connections.insert(conn.id, conn);
    }

    pub fn remove(&self, id: ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(&id) {
            *self.connection_count.lock().unwrap() -= 1;
            for entry in conn.subscriptions.iter() {
                for key in &entry.value().entity_keys {
                    self.untrack(key, id, entry.key().clone());
                }
            }
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<std::sync::Arc<ConnectionState>> { self.connections.get(&id).map(|e| e.clone()) }

    fn untrack(&self, key: &EntityKey, conn_id: ConnectionId, sub_id: CallId) {
        if let Some(set) = self.entity_index.get(key) {
            set.remove(&(conn_id, sub_id));
        }
    }

    fn track(&self, key: EntityKey, conn_id: ConnectionId, sub_id: CallId) {
        self.entity_index.entry(key).or_default().insert((conn_id, sub_id));
    }

    /// Replace the watched entity set for one subscription, updating the
    /// reverse index with only what changed.
    pub fn update_entity_keys(&self, conn_id: ConnectionId, sub_id: &CallId, previous: &HashSet<EntityKey>, current: &HashSet<EntityKey>) {
        for key in previous.difference(current) {
            self.untrack(key, conn_id, sub_id.clone());
        }
        for key in current.difference(previous) {
            self.track(key.clone(), conn_id, sub_id.clone());
        }
    }

    pub fn remove_subscription(&self, conn_id: ConnectionId, sub_id: &CallId, keys: &HashSet<EntityKey>) {
        for key in keys {
            self.untrack(key, conn_id, sub_id.clone());
        }
    }

    /// Every `(connection, subscription)` currently tracking `key`, except
    /// `exclude` (the subscription that produced the change itself).
    pub fn siblings_for(&self, key: &EntityKey, exclude: (ConnectionId, &CallId)) -> Vec<(std::sync::Arc<ConnectionState>, CallId)> {
        let Some(subscribers) = self.entity_index.get(key) else { return Vec::new() };
        subscribers
            .iter()
            .filter(|entry| !(entry.0 == exclude.0 && &entry.1 == exclude.1))
            .filter_map(|entry| self.get(entry.0).map(|conn| (conn, entry.1.clone())))
            .collect()
    }
}
