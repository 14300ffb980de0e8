//! The operation log: per-entity canonical state, a monotonic version
//! counter, and a bounded ring of recent patches.

mod memory;

pub use memory::InMemoryLog;

use crate::error::LogError;
use crate::patch_derive::canonical_eq;
use async_trait::async_trait;
use lens_proto::{EntityKey, Patch};
use serde_json::Value;
use std::time::Duration;

/// How many patches — and for how long — a log retains per entity before a
/// `getPatchesSince` for an evicted version must fall back to a snapshot.
/// Defaults to 1000 patches or 5 minutes, whichever is tighter.
#[derive(Clone, Copy, Debug)]
pub struct PatchWindow {
    pub max_count: usize,
    pub max_age: Duration,
}

impl Default for PatchWindow {
    fn default() -> Self { Self { max_count: 1000, max_age: Duration::from_secs(5 * 60) } }
}

/// The outcome of `OperationLog::emit`.
#[derive(Clone, Debug)]
pub struct EmitOutcome {
    pub version: u64,
    pub patch: Option<Patch>,
    pub changed: bool,
}

/// Storage contract for the operation log. All operations are async so an
/// external backing (Redis-like, a KV store)
/// can implement it; implementations are responsible for per-`(entity, id)`
/// atomicity, including compare-and-swap on `version` when backed by
/// external storage.
#[async_trait]
pub trait OperationLog: Send + Sync {
    async fn emit(&self, key: &EntityKey, new_data: Value) -> Result<EmitOutcome, LogError>;

    async fn get_state(&self, key: &EntityKey) -> Result<Option<Value>, LogError>;

    async fn get_version(&self, key: &EntityKey) -> Result<u64, LogError>;

    async fn get_latest_patch(&self, key: &EntityKey) -> Result<Option<Patch>, LogError>;

    /// Returns the dense sequence `patches(since_version+1 ..= current)`.
    /// `None` when that range has been truncated or the entity is unknown
    /// and `since_version > 0`; `Some(vec![])` when already current.
    async fn get_patches_since(&self, key: &EntityKey, since_version: u64) -> Result<Option<Vec<Patch>>, LogError>;

    /// Explicit removal: entities are removed explicitly, never by implicit
    /// expiry.
    async fn remove(&self, key: &EntityKey) -> Result<(), LogError>;
}

pub(crate) fn unchanged(old: &Value, new: &Value) -> bool { canonical_eq(old, new) }
