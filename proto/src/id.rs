use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use ulid::Ulid;

/// The name of an entity type. Interned as an `Arc<str>` so cloning a
/// `CollectionId` around a subscription index is cheap.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct CollectionId(Arc<str>);

impl CollectionId {
    pub fn new(name: impl Into<Arc<str>>) -> Self { Self(name.into()) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl fmt::Debug for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "CollectionId({})", self.0) }
}

impl From<&str> for CollectionId {
    fn from(s: &str) -> Self { Self(Arc::from(s)) }
}

impl From<String> for CollectionId {
    fn from(s: String) -> Self { Self(Arc::from(s.as_str())) }
}

/// The identity of an entity within a collection. Entity ids are assigned by
/// the application (they come back out of a resolver's output, not out of
/// Lens), so this is a thin wrapper around whatever scalar the application
/// used rather than a Lens-minted id.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct EntityId(Arc<str>);

impl EntityId {
    pub fn new(id: impl Into<Arc<str>>) -> Self { Self(id.into()) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "EntityId({})", self.0) }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self { Self(Arc::from(s)) }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self { Self(Arc::from(s.as_str())) }
}

/// `(collection, id)` — the cache-identity key shared by the operation log,
/// subscription `entity_keys`, and broadcast fan-out.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct EntityKey {
    pub collection: CollectionId,
    pub id: EntityId,
}

impl EntityKey {
    pub fn new(collection: impl Into<CollectionId>, id: impl Into<EntityId>) -> Self { Self { collection: collection.into(), id: id.into() } }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.collection, self.id) }
}

/// Caller-assigned id echoed back on `result`/`update`/`error` frames. Callers
/// may reuse an id (e.g. for `subscribe`, to replace a prior subscription).
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct CallId(Arc<str>);

impl CallId {
    pub fn new(id: impl Into<Arc<str>>) -> Self { Self(id.into()) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl fmt::Debug for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "CallId({})", self.0) }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self { Self(Arc::from(s)) }
}

impl From<String> for CallId {
    fn from(s: String) -> Self { Self(Arc::from(s.as_str())) }
}

/// Caller-assigned id for a `reconnect` round-trip, echoed in `reconnect_ack`.
pub type ReconnectId = CallId;

/// Server-internal id for a connection. Never appears on the wire; used only
/// for logging and to key per-connection state.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId(Ulid);

impl ConnectionId {
    pub fn new() -> Self { Self(Ulid::new()) }
}

impl Default for ConnectionId {
    fn default() -> Self { Self::new() }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "conn_{}", self.0) }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self) }
}
