use lens_core::observable::Observer;
use lens_core::error::EngineError;
use lens_proto::{CallId, CollectionId, EntityId, FieldSelector};
use serde_json::Value;
use std::collections::HashMap;

/// Mirrors the server's notion of a subscription's lifecycle from the
/// client's side of the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubState {
    Active,
    Reconnecting,
    Closed,
}

/// One tracked subscription: `{state, lastData, version, fields, input}`
/// plus the entity identity needed to build a `reconnect` frame. `entity` is
/// learned from handshake metadata at subscribe time; `entity_id` is learned
/// from the first snapshot or mutation input carrying an `id` field.
pub struct SubscriptionEntry {
    pub operation: String,
    pub input: Option<Value>,
    pub fields: FieldSelector,
    pub entity: Option<CollectionId>,
    pub entity_id: Option<EntityId>,
    pub state: SubState,
    pub last_data: Option<Value>,
    pub version: u64,
    pub observer: Observer<Value>,
}

impl SubscriptionEntry {
    /// A subscription can only be replayed across a reconnect once its
    /// entity identity is known, which happens the first time data arrives.
    pub fn can_replay(&self) -> bool { self.entity.is_some() && self.entity_id.is_some() }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<CallId, SubscriptionEntry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, id: CallId, entry: SubscriptionEntry) { self.entries.insert(id, entry); }

    pub fn get_mut(&mut self, id: &CallId) -> Option<&mut SubscriptionEntry> { self.entries.get_mut(id) }

    pub fn remove(&mut self, id: &CallId) -> Option<SubscriptionEntry> { self.entries.remove(id) }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&CallId, &mut SubscriptionEntry)> { self.entries.iter_mut() }

    /// Subscriptions flipped to `reconnecting` by `mark_all_reconnecting_or_drop`,
    /// ready to be folded into a `reconnect` frame.
    pub fn iter_reconnecting(&self) -> impl Iterator<Item = (&CallId, &SubscriptionEntry)> {
        self.entries.iter().filter(|(_, entry)| entry.state == SubState::Reconnecting)
    }

    /// Flip every active subscription to `reconnecting`, delivering a
    /// terminal error to any that can't possibly be replayed (no known
    /// entity identity yet).
    pub fn mark_all_reconnecting_or_drop(&mut self, reconnect_enabled: bool) {
        for entry in self.entries.values_mut() {
            if entry.state != SubState::Active {
                continue;
            }
            if !reconnect_enabled || !entry.can_replay() {
                entry.state = SubState::Closed;
                entry.observer.error(EngineError::Resolver(anyhow::anyhow!("connection lost; subscription cannot be resumed")));
            } else {
                entry.state = SubState::Reconnecting;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lens_core::observable::{Cleanup, Observable, ObserverBuilder};
    use std::sync::Mutex as StdMutex;

    fn observer_with_capture() -> (Observer<Value>, std::sync::Arc<StdMutex<Vec<Value>>>, std::sync::Arc<StdMutex<bool>>) {
        let slot: std::sync::Arc<StdMutex<Option<Observer<Value>>>> = std::sync::Arc::new(StdMutex::new(None));
        let slot2 = slot.clone();
        let observable = Observable::new(move |observer: Observer<Value>| {
            *slot2.lock().unwrap() = Some(observer);
            Box::new(|| {}) as Cleanup
        });

        let received = std::sync::Arc::new(StdMutex::new(Vec::new()));
        let errored = std::sync::Arc::new(StdMutex::new(false));
        let received2 = received.clone();
        let errored2 = errored.clone();
        let _subscription =
            observable.subscribe(ObserverBuilder::new().on_next(move |v| received2.lock().unwrap().push(v)).on_error(move |_| *errored2.lock().unwrap() = true));

        let observer = slot.lock().unwrap().take().unwrap();
        (observer, received, errored)
    }

    fn entry(observer: Observer<Value>, entity: Option<CollectionId>, entity_id: Option<EntityId>) -> SubscriptionEntry {
        SubscriptionEntry {
            operation: "user.watch".into(),
            input: None,
            fields: FieldSelector::all(),
            entity,
            entity_id,
            state: SubState::Active,
            last_data: None,
            version: 0,
            observer,
        }
    }

    #[test]
    fn replayable_subscription_moves_to_reconnecting() {
        let (observer, _received, errored) = observer_with_capture();
        let mut registry = SubscriptionRegistry::new();
        registry.insert(CallId::new("s1"), entry(observer, Some(CollectionId::from("users")), Some(EntityId::new("u1"))));

        registry.mark_all_reconnecting_or_drop(true);

        assert_eq!(registry.get_mut(&CallId::new("s1")).unwrap().state, SubState::Reconnecting);
        assert!(!*errored.lock().unwrap());
        assert_eq!(registry.iter_reconnecting().count(), 1);
    }

    #[test]
    fn unidentified_subscription_is_closed_with_error() {
        let (observer, _received, errored) = observer_with_capture();
        let mut registry = SubscriptionRegistry::new();
        registry.insert(CallId::new("s1"), entry(observer, None, None));

        registry.mark_all_reconnecting_or_drop(true);

        assert_eq!(registry.get_mut(&CallId::new("s1")).unwrap().state, SubState::Closed);
        assert!(*errored.lock().unwrap());
    }

    #[test]
    fn reconnect_disabled_closes_every_active_subscription() {
        let (observer, _received, errored) = observer_with_capture();
        let mut registry = SubscriptionRegistry::new();
        registry.insert(CallId::new("s1"), entry(observer, Some(CollectionId::from("users")), Some(EntityId::new("u1"))));

        registry.mark_all_reconnecting_or_drop(false);

        assert_eq!(registry.get_mut(&CallId::new("s1")).unwrap().state, SubState::Closed);
        assert!(*errored.lock().unwrap());
    }
}
