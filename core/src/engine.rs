//! The execution pipeline: resolve a path, validate input, run the
//! resolver, post-process the result, and deliver it to the caller's
//! observer while offering every entity it touches to the operation log.

use crate::context::Context;
use crate::entity::{EntitySet, FieldKind};
use crate::error::EngineError;
use crate::observable::{Cleanup, Observable, Observer};
use crate::patch_derive::canonical_eq;
use crate::plugin::{BroadcastInput, BroadcastOutcome, Plugins};
use crate::router::Router;
use crate::selection::{self, Selection, SelectionField};
use lens_proto::EntityKey;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const ENTITY_TAG_KEY: &str = "$entity";

/// What changed in the operation log as a side effect of delivering one
/// value. The protocol handler uses this to fan the change out to sibling
/// subscriptions via their `entity_keys` index; the engine itself never
/// talks to other connections.
#[derive(Clone, Debug)]
pub struct EntityChange {
    pub key: EntityKey,
    pub outcome: Option<BroadcastOutcome>,
}

/// One delivered value, everything the protocol handler needs to both send
/// a frame and keep its subscription bookkeeping current.
pub enum OperationOutcome {
    Data { value: Value, entity_keys: Vec<EntityKey>, changes: Vec<EntityChange> },
    Error(EngineError),
}

/// Ties a `Router`, an `EntitySet`, and the installed `Plugins` together
/// into one `execute()` entry point. Cheap to clone; everything inside is
/// already `Arc`-wrapped.
#[derive(Clone)]
pub struct Engine {
    router: Arc<Router>,
    entities: Arc<EntitySet>,
    plugins: Arc<Plugins>,
}

enum RawEvent {
    Emit(Value),
    ResolverError(EngineError),
    ResolverDone,
    FieldUpdate,
}

impl Engine {
    pub fn new(router: Arc<Router>, entities: Arc<EntitySet>, plugins: Arc<Plugins>) -> Self { Self { router, entities, plugins } }

    /// Run one operation invocation. Returns a cold `Observable`: nothing
    /// happens until the caller subscribes.
    pub fn execute(&self, path: &str, input: Value) -> Observable<OperationOutcome> {
        let router = self.router.clone();
        let entities = self.entities.clone();
        let plugins = self.plugins.clone();
        let path = path.to_string();

        Observable::new(move |observer: Observer<OperationOutcome>| -> Cleanup {
            let Some(operation) = router.resolve(&path) else {
                observer.next(OperationOutcome::Error(EngineError::NotFound(path.clone())));
                observer.complete();
                return Box::new(|| {});
            };

            if let Some(validate) = &operation.validate {
                if let Err(message) = validate(&input) {
                    observer.next(OperationOutcome::Error(EngineError::InvalidInput(message)));
                    observer.complete();
                    return Box::new(|| {});
                }
            }

            let selection = selection::extract(&input);
            let (tx, mut rx) = mpsc::unbounded_channel::<RawEvent>();

            let tx_sink = tx.clone();
            let field_cache: Arc<Mutex<HashMap<String, Value>>> = Arc::new(Mutex::new(HashMap::new()));
            let ctx = Context::new(move |value| {
                let _ = tx_sink.send(RawEvent::Emit(value));
            });

            let is_mutation = matches!(operation.kind, crate::router::OperationKind::Mutation);
            let resolver = operation.resolver.clone();
            let resolve_input = input.clone();
            let resolve_ctx = ctx.clone();
            let tx_done = tx.clone();
            let resolver_task = tokio::spawn(async move {
                let result = (resolver)(resolve_ctx, resolve_input).await;
                match result {
                    Ok(()) => {
                        let _ = tx_done.send(RawEvent::ResolverDone);
                    }
                    Err(err) => {
                        let _ = tx_done.send(RawEvent::ResolverError(err));
                    }
                }
            });

            let entities_for_post = entities.clone();
            let plugins_for_post = plugins.clone();
            let observer_for_post = observer.clone();
            let ctx_for_fields = ctx.clone();
            let field_cache_for_post = field_cache.clone();
            let tx_for_fields = tx.clone();
            let post_task = tokio::spawn(async move {
                let mut last_processed: Option<Value> = None;
                let mut last_raw: Option<Value> = None;

                loop {
                    let Some(event) = rx.recv().await else { break };

                    match event {
                        RawEvent::Emit(raw) => {
                            last_raw = Some(raw.clone());
                            let processed = post_process(
                                &raw,
                                &entities_for_post,
                                &selection,
                                &ctx_for_fields,
                                &field_cache_for_post,
                                &tx_for_fields,
                            )
                            .await;
                            deliver(processed, &mut last_processed, &observer_for_post, &plugins_for_post).await;
                        }
                        RawEvent::FieldUpdate => {
                            let Some(raw) = last_raw.clone() else { continue };
                            let processed = post_process(
                                &raw,
                                &entities_for_post,
                                &selection,
                                &ctx_for_fields,
                                &field_cache_for_post,
                                &tx_for_fields,
                            )
                            .await;
                            deliver(processed, &mut last_processed, &observer_for_post, &plugins_for_post).await;
                        }
                        RawEvent::ResolverError(err) => {
                            observer_for_post.next(OperationOutcome::Error(err));
                            observer_for_post.complete();
                            break;
                        }
                        RawEvent::ResolverDone => {
                            if is_mutation {
                                observer_for_post.complete();
                                break;
                            }
                        }
                    }
                }
            });

            ctx.on_cleanup(move || {
                resolver_task.abort();
            });
            let cleanup_ctx = ctx.clone();
            Box::new(move || {
                post_task.abort();
                cleanup_ctx.run_cleanups();
            })
        })
    }
}

/// Register a field's `subscribe` resolver against the parent operation's
/// `Context`, wiring its emits into the retrigger channel captured by
/// `ctx`'s sink. Exposed so the post-processing pass below can lazily start
/// a field subscription the first time it encounters that field.
fn start_field_subscription(
    field_name: String,
    resolver: Arc<dyn crate::entity::SubscribeFieldResolver>,
    parent: Value,
    args: Value,
    ctx: &Context,
    field_cache: &Arc<Mutex<HashMap<String, Value>>>,
    tx: &mpsc::UnboundedSender<RawEvent>,
) {
    let field_cache = field_cache.clone();
    let field_name_for_sink = field_name.clone();
    let tx_for_sink = tx.clone();
    let field_ctx = Context::new(move |value| {
        field_cache.lock().unwrap().insert(field_name_for_sink.clone(), value);
        let _ = tx_for_sink.send(RawEvent::FieldUpdate);
    });
    let fut = resolver.subscribe(field_ctx.clone(), parent, args);
    let handle = tokio::spawn(async move {
        if let Err(err) = fut.await {
            warn!(field = %field_name, error = %err, "field subscribe resolver failed");
        }
    });
    ctx.on_cleanup(move || {
        field_ctx.run_cleanups();
        handle.abort();
    });
}

async fn post_process(
    raw: &Value,
    entities: &Arc<EntitySet>,
    selection: &Option<Selection>,
    ctx: &Context,
    field_cache: &Arc<Mutex<HashMap<String, Value>>>,
    tx: &mpsc::UnboundedSender<RawEvent>,
) -> Value {
    let loader = Loader::default();
    let mut out = expand(raw, entities, selection, ctx, field_cache, tx, &loader, Vec::new()).await;
    loader.flush(&mut out).await;
    out
}

/// A step of the path from the post-processed root down to one field's
/// position in the tree, recorded so a `Loader`-deferred result can be
/// patched back in once its batch has run.
#[derive(Clone)]
enum PathStep {
    Key(String),
    Index(usize),
}

fn set_at_path(root: &mut Value, path: &[PathStep], value: Value) {
    let mut cur = root;
    for step in path {
        let next = match step {
            PathStep::Key(key) => cur.as_object_mut().and_then(|obj| obj.get_mut(key)),
            PathStep::Index(index) => cur.as_array_mut().and_then(|arr| arr.get_mut(*index)),
        };
        let Some(next) = next else { return };
        cur = next;
    }
    *cur = value;
}

struct PendingBatch {
    resolver: Arc<dyn crate::entity::PureFieldResolver>,
    calls: Vec<(Value, Value)>,
    sites: Vec<Vec<PathStep>>,
}

/// Collects every pure `resolve` field call made while walking one emitted
/// value, keyed by `(collection, field)`, so siblings hit in the same
/// post-processing tick share one `resolve_batch` round trip instead of one
/// each.
#[derive(Default)]
struct Loader {
    pending: Mutex<HashMap<(String, String), PendingBatch>>,
}

impl Loader {
    fn register(
        &self,
        collection: &str,
        field: &str,
        resolver: Arc<dyn crate::entity::PureFieldResolver>,
        parent: Value,
        args: Value,
        site: Vec<PathStep>,
    ) {
        let mut pending = self.pending.lock().unwrap();
        let batch = pending.entry((collection.to_string(), field.to_string())).or_insert_with(|| PendingBatch {
            resolver,
            calls: Vec::new(),
            sites: Vec::new(),
        });
        batch.calls.push((parent, args));
        batch.sites.push(site);
    }

    /// Run every collected batch and patch each call's result back into
    /// `root` at the path it was registered with.
    async fn flush(self, root: &mut Value) {
        for ((_, field), batch) in self.pending.into_inner().unwrap() {
            let results = batch.resolver.resolve_batch(batch.calls).await;
            for (site, result) in batch.sites.into_iter().zip(results) {
                let value = match result {
                    Ok(value) => value,
                    Err(err) => {
                        debug!(field = %field, error = %err, "pure field resolver failed");
                        Value::Null
                    }
                };
                set_at_path(root, &site, value);
            }
        }
    }
}

/// Walk the resolver's raw output, applying `$select`, running field
/// resolvers (pure `resolve`, relations, and lazily-started `subscribe`
/// fields), and expanding related entities. Recurses into arrays
/// element-wise; a bare scalar passes through untouched. Pure `resolve`
/// fields are deferred into `loader` rather than resolved inline, so the
/// caller can batch them once the whole tree has been walked.
fn expand<'a>(
    raw: &'a Value,
    entities: &'a Arc<EntitySet>,
    selection: &'a Option<Selection>,
    ctx: &'a Context,
    field_cache: &'a Arc<Mutex<HashMap<String, Value>>>,
    tx: &'a mpsc::UnboundedSender<RawEvent>,
    loader: &'a Loader,
    path: Vec<PathStep>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Value> + Send + 'a>> {
    Box::pin(async move {
        match raw {
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    let mut item_path = path.clone();
                    item_path.push(PathStep::Index(index));
                    out.push(expand(item, entities, selection, ctx, field_cache, tx, loader, item_path).await);
                }
                Value::Array(out)
            }
            Value::Object(obj) => {
                let entity_name = obj.get(ENTITY_TAG_KEY).and_then(|v| v.as_str());
                let def = entity_name.and_then(|name| entities.get(&name.into()));

                let mut out = Map::with_capacity(obj.len());
                for (key, value) in obj {
                    if key == ENTITY_TAG_KEY {
                        out.insert(key.clone(), value.clone());
                        continue;
                    }
                    if selection::is_excluded(selection, key) {
                        continue;
                    }
                    let nested_selection = match selection::nested_of(selection, key) {
                        Some(SelectionField::Nested { select, .. }) => select.clone(),
                        _ => None,
                    };
                    let mut field_path = path.clone();
                    field_path.push(PathStep::Key(key.clone()));

                    let field_kind = def.as_ref().and_then(|d| d.field(key));
                    let resolved = match field_kind {
                        Some(FieldKind::Scalar { serialize: Some(f) }) => f(value),
                        Some(FieldKind::Scalar { serialize: None }) | None => value.clone(),
                        Some(FieldKind::Relation { resolve, .. }) => {
                            let args = match selection::nested_of(selection, key) {
                                Some(SelectionField::Nested { input, .. }) => input.clone().unwrap_or(Value::Null),
                                _ => Value::Null,
                            };
                            match resolve(value.clone(), args).await {
                                Ok(related) => expand(&related, entities, &nested_selection, ctx, field_cache, tx, loader, field_path.clone()).await,
                                Err(err) => {
                                    debug!(field = %key, error = %err, "relation resolver failed");
                                    Value::Null
                                }
                            }
                        }
                        Some(FieldKind::Resolve(resolver)) => {
                            let args = match selection::nested_of(selection, key) {
                                Some(SelectionField::Nested { input, .. }) => input.clone().unwrap_or(Value::Null),
                                _ => Value::Null,
                            };
                            let collection = def.as_ref().map(|d| d.name.as_str()).unwrap_or_default();
                            loader.register(collection, key, resolver.clone(), value.clone(), args, field_path.clone());
                            // Patched in once `flush` runs this field's batch.
                            Value::Null
                        }
                        Some(FieldKind::Subscribe(resolver)) => {
                            let cached = field_cache.lock().unwrap().get(key).cloned();
                            if cached.is_none() {
                                let args = match selection::nested_of(selection, key) {
                                    Some(SelectionField::Nested { input, .. }) => input.clone().unwrap_or(Value::Null),
                                    _ => Value::Null,
                                };
                                start_field_subscription(key.clone(), resolver.clone(), value.clone(), args, ctx, field_cache, tx);
                            }
                            cached.unwrap_or(Value::Null)
                        }
                    };
                    out.insert(key.clone(), resolved);
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    })
}

fn strip_internal_keys(value: Value) -> Value {
    match value {
        Value::Object(obj) => {
            Value::Object(obj.into_iter().filter(|(k, _)| !k.starts_with('$')).map(|(k, v)| (k, strip_internal_keys(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(strip_internal_keys).collect()),
        other => other,
    }
}

/// Recursively collect every object tagged with `$entity` + `id`, keyed by
/// `(collection, id)`. Used both to offer results to the operation log and
/// to compute the `entity_keys` a subscription is tracking.
fn extract_entities(value: &Value, out: &mut HashMap<EntityKey, Value>) {
    match value {
        Value::Object(obj) => {
            if let (Some(Value::String(collection)), Some(id)) = (obj.get(ENTITY_TAG_KEY), obj.get("id")) {
                let id_str = id.as_str().map(|s| s.to_string()).unwrap_or_else(|| id.to_string());
                let data = strip_internal_keys(Value::Object(obj.clone()));
                out.insert(EntityKey::new(collection.as_str(), id_str.as_str()), data);
            }
            for v in obj.values() {
                extract_entities(v, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                extract_entities(item, out);
            }
        }
        _ => {}
    }
}

async fn deliver(
    tagged: Value,
    last_processed: &mut Option<Value>,
    observer: &Observer<OperationOutcome>,
    plugins: &Arc<Plugins>,
) {
    // Entity extraction must run before `$entity`/other internal keys are
    // stripped, since that's the only place those tags appear.
    let mut touched = HashMap::new();
    extract_entities(&tagged, &mut touched);

    let processed = strip_internal_keys(tagged);
    if let Some(prev) = last_processed {
        if canonical_eq(prev, &processed) {
            return;
        }
    }
    *last_processed = Some(processed.clone());

    let mut changes = Vec::with_capacity(touched.len());
    let mut entity_keys = Vec::with_capacity(touched.len());
    for (key, data) in touched {
        let outcome = plugins.on_broadcast(BroadcastInput { entity: key.collection.clone(), entity_id: key.id.clone(), data }).await;
        entity_keys.push(key.clone());
        changes.push(EntityChange { key, outcome });
    }

    observer.next(OperationOutcome::Data { value: processed, entity_keys, changes });
}
