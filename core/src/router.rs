//! Operations and the router tree.

use crate::context::Context;
use crate::error::EngineError;
use futures::future::BoxFuture;
use lens_proto::{CollectionId, Metadata, OperationMeta, OperationType};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

pub type OperationFuture = BoxFuture<'static, Result<(), EngineError>>;
pub type ResolverFn = Arc<dyn Fn(Context, Value) -> OperationFuture + Send + Sync>;
pub type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperationKind {
    Query,
    Mutation,
}

impl From<OperationKind> for OperationType {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Query => OperationType::Query,
            OperationKind::Mutation => OperationType::Mutation,
        }
    }
}

/// A named, addressable unit at a router path. Immutable once registered.
pub struct Operation {
    pub path: String,
    pub kind: OperationKind,
    pub return_entity: Option<CollectionId>,
    pub optimistic: bool,
    pub(crate) validate: Option<Validator>,
    pub(crate) resolver: ResolverFn,
}

impl Operation {
    fn new(path: impl Into<String>, kind: OperationKind, resolver: ResolverFn) -> Self {
        Self { path: path.into(), kind, return_entity: None, optimistic: false, validate: None, resolver }
    }

    pub fn query(path: impl Into<String>, resolver: ResolverFn) -> Self { Self::new(path, OperationKind::Query, resolver) }

    pub fn mutation(path: impl Into<String>, resolver: ResolverFn) -> Self { Self::new(path, OperationKind::Mutation, resolver) }

    pub fn returns(mut self, entity: impl Into<CollectionId>) -> Self {
        self.return_entity = Some(entity.into());
        self
    }

    pub fn optimistic(mut self) -> Self {
        self.optimistic = true;
        self
    }

    pub fn validate(mut self, f: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static) -> Self {
        self.validate = Some(Arc::new(f));
        self
    }
}

/// Wrap a resolver that computes (or awaits) a single value into the
/// `Fn(Context, Value) -> OperationFuture` shape: returns a value once, sync
/// or via a future. The context stays open after the initial emit so
/// `ctx.emit` can still fire later.
pub fn once<F, Fut>(f: F) -> ResolverFn
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, EngineError>> + Send + 'static,
{
    Arc::new(move |ctx, input| {
        let fut = f(input);
        Box::pin(async move {
            let value = fut.await?;
            ctx.emit(value);
            Ok(())
        })
    })
}

/// Wrap a resolver that uses `ctx.emit` directly and never returns a value
/// of its own.
pub fn reactive<F, Fut>(f: F) -> ResolverFn
where
    F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
{
    Arc::new(move |ctx, input| Box::pin(f(ctx, input)))
}

/// Wrap an async-iterable resolver: each item is an emit, and exhaustion of
/// the stream does not complete the observable by itself — only a
/// mutation's exhausted stream does, and that is the engine's call, not
/// this wrapper's.
pub fn stream<F, S>(f: F) -> ResolverFn
where
    F: Fn(Value) -> S + Send + Sync + 'static,
    S: futures::Stream<Item = Result<Value, EngineError>> + Send + 'static,
{
    use futures::StreamExt;
    Arc::new(move |ctx, input| {
        let mut stream = Box::pin(f(input));
        Box::pin(async move {
            while let Some(item) = stream.next().await {
                ctx.emit(item?);
            }
            Ok(())
        })
    })
}

/// A router is a tree whose leaves are operations. `path` is the dot-joined
/// interior keys plus the leaf key; duplicate paths are rejected at
/// `build()` time as a fatal configuration error.
#[derive(Default)]
pub struct RouterBuilder {
    operations: Vec<Operation>,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("duplicate operation path: {0}")]
    DuplicatePath(String),
}

impl RouterBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn merge(mut self, prefix: &str, mut nested: RouterBuilder) -> Self {
        for mut op in nested.operations.drain(..) {
            op.path = format!("{prefix}.{}", op.path);
            self.operations.push(op);
        }
        self
    }

    pub fn add(mut self, mut operation: Operation) -> Self {
        operation.path = operation.path.clone();
        self.operations.push(operation);
        self
    }

    pub fn build(self) -> Result<Router, RouterError> {
        let mut by_path = BTreeMap::new();
        for op in self.operations {
            if by_path.contains_key(&op.path) {
                return Err(RouterError::DuplicatePath(op.path));
            }
            by_path.insert(op.path.clone(), Arc::new(op));
        }
        Ok(Router { operations: by_path })
    }
}

pub struct Router {
    operations: BTreeMap<String, Arc<Operation>>,
}

impl Router {
    pub fn resolve(&self, path: &str) -> Option<Arc<Operation>> { self.operations.get(path).cloned() }

    /// Flatten router paths, kinds, return-entity names, and the optimistic
    /// hint into the metadata document sent on handshake.
    pub fn metadata(&self, version: impl Into<String>) -> Metadata {
        let operations = self
            .operations
            .iter()
            .map(|(path, op)| {
                (
                    path.clone(),
                    OperationMeta {
                        kind: op.kind.into(),
                        return_type: op.return_entity.as_ref().map(|c| c.to_string()),
                        optimistic: op.optimistic.then_some(true),
                    },
                )
            })
            .collect();
        Metadata { version: version.into(), operations }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn duplicate_paths_are_rejected() {
        let builder = RouterBuilder::new()
            .add(Operation::query("user.get", once(|_input| async { Ok(json!({})) })))
            .add(Operation::query("user.get", once(|_input| async { Ok(json!({})) })));
        assert!(matches!(builder.build(), Err(RouterError::DuplicatePath(p)) if p == "user.get"));
    }

    #[test]
    fn merge_prefixes_nested_paths() {
        let nested = RouterBuilder::new().add(Operation::query("get", once(|_input| async { Ok(json!({})) })));
        let router = RouterBuilder::new().merge("user", nested).build().unwrap();
        assert!(router.resolve("user.get").is_some());
    }
}
