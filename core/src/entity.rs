//! Entity definitions and field resolvers. An entity is the unit of cache
//! identity; its fields are either plain scalars, relations to other
//! entities, or resolver-defined (a pure one-shot computation or a
//! long-lived reactive source) — kept as two distinct resolver shapes
//! rather than one function overloaded with both meanings.

use crate::context::Context;
use crate::error::EngineError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use lens_proto::CollectionId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub type ScalarSerialize = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
pub type RelationResolve = Arc<dyn Fn(Value, Value) -> BoxFuture<'static, Result<Value, EngineError>> + Send + Sync>;

/// A pure, one-shot field computation. `resolve_batch` takes every call
/// collected for this field within a single post-processing tick, so an
/// implementation backed by a batching data loader only pays for one round
/// trip per tick regardless of how many parents requested the field.
#[async_trait]
pub trait PureFieldResolver: Send + Sync {
    async fn resolve_batch(&self, calls: Vec<(Value, Value)>) -> Vec<Result<Value, EngineError>>;
}

/// A long-lived field source, used for per-field live data. Speaks the same
/// `Context` vocabulary as an operation-level reactive resolver rather than
/// a second one: the engine hands it a field-scoped context whose `emit`
/// updates this field's cached value and re-triggers the parent operation's
/// post-processing tick, and whose cleanup is chained into the parent's.
pub trait SubscribeFieldResolver: Send + Sync {
    fn subscribe(&self, ctx: Context, parent: Value, args: Value) -> BoxFuture<'static, Result<(), EngineError>>;
}

pub enum FieldKind {
    /// `expose(field)` — pass the underlying scalar through unchanged
    /// (`serialize: None`) or through its declared wire serializer.
    Scalar { serialize: Option<ScalarSerialize> },
    Relation { target: CollectionId, resolve: RelationResolve },
    Resolve(Arc<dyn PureFieldResolver>),
    Subscribe(Arc<dyn SubscribeFieldResolver>),
}

impl FieldKind {
    pub fn has_subscribe(&self) -> bool { matches!(self, FieldKind::Subscribe(_)) }
}

/// The field resolver record for one entity type, keyed by entity name.
pub struct EntityDef {
    pub name: CollectionId,
    fields: HashMap<String, FieldKind>,
}

impl EntityDef {
    pub fn new(name: impl Into<CollectionId>) -> Self { Self { name: name.into(), fields: HashMap::new() } }

    pub fn expose(mut self, field: impl Into<String>) -> Self {
        self.fields.insert(field.into(), FieldKind::Scalar { serialize: None });
        self
    }

    pub fn scalar(mut self, field: impl Into<String>, serialize: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        self.fields.insert(field.into(), FieldKind::Scalar { serialize: Some(Arc::new(serialize)) });
        self
    }

    pub fn relation(
        mut self,
        field: impl Into<String>,
        target: impl Into<CollectionId>,
        resolve: impl Fn(Value, Value) -> BoxFuture<'static, Result<Value, EngineError>> + Send + Sync + 'static,
    ) -> Self {
        self.fields.insert(field.into(), FieldKind::Relation { target: target.into(), resolve: Arc::new(resolve) });
        self
    }

    pub fn resolve(mut self, field: impl Into<String>, resolver: impl PureFieldResolver + 'static) -> Self {
        self.fields.insert(field.into(), FieldKind::Resolve(Arc::new(resolver)));
        self
    }

    pub fn subscribe(mut self, field: impl Into<String>, resolver: impl SubscribeFieldResolver + 'static) -> Self {
        self.fields.insert(field.into(), FieldKind::Subscribe(Arc::new(resolver)));
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldKind> { self.fields.get(name) }

    pub fn field_names(&self) -> impl Iterator<Item = &str> { self.fields.keys().map(|s| s.as_str()) }
}

/// Registry of entity definitions, keyed by entity name.
#[derive(Default)]
pub struct EntitySet {
    entities: HashMap<CollectionId, Arc<EntityDef>>,
}

impl EntitySet {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, def: EntityDef) -> &mut Self {
        self.entities.insert(def.name.clone(), Arc::new(def));
        self
    }

    pub fn get(&self, name: &CollectionId) -> Option<Arc<EntityDef>> { self.entities.get(name).cloned() }
}
