use super::{unchanged, EmitOutcome, OperationLog, PatchWindow};
use crate::error::LogError;
use crate::patch_derive::derive_patch;
use async_trait::async_trait;
use dashmap::DashMap;
use lens_proto::{EntityKey, Patch};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

struct Inner {
    data: Value,
    version: u64,
    patches: VecDeque<Patch>,
}

/// The default in-process `OperationLog`, keyed with `dashmap` for
/// lock-free concurrent access across entities. Per-entity atomicity comes
/// from an `Arc<tokio::sync::Mutex<_>>` held per key — concurrent `emit`s on
/// the *same* entity serialize, different entities proceed independently.
pub struct InMemoryLog {
    entries: DashMap<EntityKey, Arc<Mutex<Option<Inner>>>>,
    window: PatchWindow,
}

impl InMemoryLog {
    pub fn new() -> Self { Self::with_window(PatchWindow::default()) }

    pub fn with_window(window: PatchWindow) -> Self { Self { entries: DashMap::new(), window } }

    fn slot(&self, key: &EntityKey) -> Arc<Mutex<Option<Inner>>> {
        self.entries.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(None))).clone()
    }

    fn evict(&self, patches: &mut VecDeque<Patch>) {
        while patches.len() > self.window.max_count {
            patches.pop_front();
        }
        let cutoff = chrono::Utc::now() - chrono::Duration::from_std(self.window.max_age).unwrap_or_default();
        while patches.front().map(|p| p.timestamp < cutoff).unwrap_or(false) {
            patches.pop_front();
        }
    }
}

impl Default for InMemoryLog {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl OperationLog for InMemoryLog {
    async fn emit(&self, key: &EntityKey, new_data: Value) -> Result<EmitOutcome, LogError> {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;

        match guard.as_mut() {
            None => {
                *guard = Some(Inner { data: new_data, version: 1, patches: VecDeque::new() });
                Ok(EmitOutcome { version: 1, patch: None, changed: true })
            }
            Some(inner) => {
                if unchanged(&inner.data, &new_data) {
                    return Ok(EmitOutcome { version: inner.version, patch: None, changed: false });
                }

                let ops = derive_patch(&inner.data, &new_data);
                let version = inner.version + 1;
                let patch = Patch { version, operations: ops, timestamp: chrono::Utc::now() };

                inner.data = new_data;
                inner.version = version;
                inner.patches.push_back(patch.clone());
                self.evict(&mut inner.patches);

                Ok(EmitOutcome { version, patch: Some(patch), changed: true })
            }
        }
    }

    async fn get_state(&self, key: &EntityKey) -> Result<Option<Value>, LogError> {
        let Some(slot) = self.entries.get(key) else { return Ok(None) };
        let guard = slot.lock().await;
        Ok(guard.as_ref().map(|inner| inner.data.clone()))
    }

    async fn get_version(&self, key: &EntityKey) -> Result<u64, LogError> {
        let Some(slot) = self.entries.get(key) else { return Ok(0) };
        let guard = slot.lock().await;
        Ok(guard.as_ref().map(|inner| inner.version).unwrap_or(0))
    }

    async fn get_latest_patch(&self, key: &EntityKey) -> Result<Option<Patch>, LogError> {
        let Some(slot) = self.entries.get(key) else { return Ok(None) };
        let guard = slot.lock().await;
        Ok(guard.as_ref().and_then(|inner| inner.patches.back().cloned()))
    }

    async fn get_patches_since(&self, key: &EntityKey, since_version: u64) -> Result<Option<Vec<Patch>>, LogError> {
        let Some(slot) = self.entries.get(key) else {
            return Ok(if since_version == 0 { Some(Vec::new()) } else { None });
        };
        let guard = slot.lock().await;
        let Some(inner) = guard.as_ref() else {
            return Ok(if since_version == 0 { Some(Vec::new()) } else { None });
        };

        if since_version == inner.version {
            return Ok(Some(Vec::new()));
        }
        if since_version > inner.version {
            return Ok(None);
        }

        let oldest_retained = inner.patches.front().map(|p| p.version).unwrap_or(inner.version + 1);
        if since_version + 1 < oldest_retained {
            return Ok(None);
        }

        Ok(Some(inner.patches.iter().filter(|p| p.version > since_version).cloned().collect()))
    }

    async fn remove(&self, key: &EntityKey) -> Result<(), LogError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> EntityKey { EntityKey::new("User", "u1") }

    #[tokio::test]
    async fn first_emit_is_version_one_with_no_patch() {
        let log = InMemoryLog::new();
        let outcome = log.emit(&key(), json!({"id": "u1", "name": "Alice"})).await.unwrap();
        assert_eq!(outcome.version, 1);
        assert!(outcome.patch.is_none());
        assert!(outcome.changed);
    }

    #[tokio::test]
    async fn unchanged_emit_does_not_bump_version() {
        let log = InMemoryLog::new();
        let data = json!({"id": "u1", "name": "Alice"});
        log.emit(&key(), data.clone()).await.unwrap();
        let outcome = log.emit(&key(), data).await.unwrap();
        assert_eq!(outcome.version, 1);
        assert!(!outcome.changed);
        assert!(outcome.patch.is_none());
    }

    #[tokio::test]
    async fn changed_emit_bumps_version_and_produces_patch() {
        let log = InMemoryLog::new();
        log.emit(&key(), json!({"id": "u1", "name": "Alice"})).await.unwrap();
        let outcome = log.emit(&key(), json!({"id": "u1", "name": "Alice Updated"})).await.unwrap();
        assert_eq!(outcome.version, 2);
        assert!(outcome.changed);
        assert!(outcome.patch.is_some());
    }

    #[tokio::test]
    async fn get_patches_since_is_dense_and_empty_when_current() {
        let log = InMemoryLog::new();
        log.emit(&key(), json!({"id": "u1", "name": "A"})).await.unwrap();
        log.emit(&key(), json!({"id": "u1", "name": "B"})).await.unwrap();
        log.emit(&key(), json!({"id": "u1", "name": "C"})).await.unwrap();

        let since_1 = log.get_patches_since(&key(), 1).await.unwrap().unwrap();
        assert_eq!(since_1.len(), 2);
        assert_eq!(since_1[0].version, 2);
        assert_eq!(since_1[1].version, 3);

        let since_current = log.get_patches_since(&key(), 3).await.unwrap().unwrap();
        assert!(since_current.is_empty());
    }

    #[tokio::test]
    async fn get_patches_since_truncated_window_returns_none() {
        let log = InMemoryLog::with_window(PatchWindow { max_count: 1, max_age: std::time::Duration::from_secs(600) });
        log.emit(&key(), json!({"id": "u1", "name": "A"})).await.unwrap();
        log.emit(&key(), json!({"id": "u1", "name": "B"})).await.unwrap();
        log.emit(&key(), json!({"id": "u1", "name": "C"})).await.unwrap();

        // Only the patch to version 3 is retained; version 1 is out of range.
        assert!(log.get_patches_since(&key(), 1).await.unwrap().is_none());
        assert!(log.get_patches_since(&key(), 2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_entity_with_positive_since_returns_none() {
        let log = InMemoryLog::new();
        assert!(log.get_patches_since(&key(), 3).await.unwrap().is_none());
        assert_eq!(log.get_patches_since(&key(), 0).await.unwrap(), Some(Vec::new()));
    }
}
