//! Exercises the whole pipeline in one process: subscribe, mutate, watch
//! the broadcast hook assign a version and a patch, then resolve a resume
//! request against the same operation log via the reconnect hook.

use lens_core::{
    first_value_from, once, reactive, Context, EngineError, Engine, EntityDef, EntitySet, InMemoryLog, ObserverBuilder, OpLogBroadcastHook,
    OpLogReconnectHook, Operation, OperationOutcome, Plugins, ReconnectContext, Router, RouterBuilder,
};
use lens_proto::{EntityKey, ReconnectStatus, ReconnectSubscription};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct CounterStore {
    values: Mutex<HashMap<String, i64>>,
    watchers: Mutex<HashMap<String, Vec<Context>>>,
}

impl CounterStore {
    fn get(&self, id: &str) -> i64 { *self.values.lock().unwrap().get(id).unwrap_or(&0) }

    fn set(&self, id: &str, value: i64) {
        self.values.lock().unwrap().insert(id.to_string(), value);
        if let Some(ctxs) = self.watchers.lock().unwrap().get(id) {
            for ctx in ctxs {
                ctx.emit(entity_json(id, value));
            }
        }
    }

    fn watch(&self, id: &str, ctx: Context) {
        self.watchers.lock().unwrap().entry(id.to_string()).or_default().push(ctx);
    }
}

fn entity_json(id: &str, value: i64) -> Value { json!({"$entity": "counter", "id": id, "value": value}) }

fn build_engine(store: Arc<CounterStore>, log: Arc<InMemoryLog>) -> Engine {
    let mut entities = EntitySet::new();
    entities.register(EntityDef::new("counter").expose("id").expose("value"));

    let watch_store = store.clone();
    let watch_op = Operation::query(
        "counter.watch",
        reactive(move |ctx: Context, input: Value| {
            let store = watch_store.clone();
            async move {
                let id = input.get("id").and_then(Value::as_str).ok_or_else(|| EngineError::InvalidInput("id required".into()))?.to_string();
                ctx.emit(entity_json(&id, store.get(&id)));
                store.watch(&id, ctx);
                Ok(())
            }
        }),
    )
    .returns("counter");

    let incr_store = store.clone();
    let increment_op = Operation::mutation(
        "counter.increment",
        once(move |input: Value| {
            let store = incr_store.clone();
            async move {
                let id = input.get("id").and_then(Value::as_str).ok_or_else(|| EngineError::InvalidInput("id required".into()))?.to_string();
                let next = store.get(&id) + 1;
                store.set(&id, next);
                Ok(entity_json(&id, next))
            }
        }),
    )
    .returns("counter");

    let router: Router = RouterBuilder::new().add(watch_op).add(increment_op).build().unwrap();

    let mut plugins = Plugins::new();
    plugins.broadcast.install(Arc::new(OpLogBroadcastHook::new(log.clone())));
    plugins.reconnect.install(Arc::new(OpLogReconnectHook::new(log)));

    Engine::new(Arc::new(router), Arc::new(entities), Arc::new(plugins))
}

#[tokio::test]
async fn subscribe_mutate_broadcast_then_resume() {
    let store = Arc::new(CounterStore::default());
    let log = Arc::new(InMemoryLog::new());
    let engine = build_engine(store, log.clone());

    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_for_sub = seen.clone();
    let watch = engine.execute("counter.watch", json!({"id": "c1"}));
    let _subscription = watch.subscribe(ObserverBuilder::new().on_next(move |outcome| {
        if let OperationOutcome::Data { value, entity_keys, changes } = outcome {
            assert_eq!(entity_keys, vec![EntityKey::new("counter", "c1")]);
            assert_eq!(changes.len(), 1);
            seen_for_sub.lock().unwrap().push(value);
        }
    }));

    // let the spawned resolver/post-processing tasks run the initial emit
    tokio::time::sleep(Duration::from_millis(20)).await;
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["value"], json!(0));
    }
    assert_eq!(log.get_version(&EntityKey::new("counter", "c1")).await.unwrap(), 1);

    let increment = engine.execute("counter.increment", json!({"id": "c1"}));
    let outcome = first_value_from(&increment).await.unwrap();
    match outcome {
        OperationOutcome::Data { value, .. } => assert_eq!(value["value"], json!(1)),
        OperationOutcome::Error(err) => panic!("increment failed: {err}"),
    }

    // let the watcher's re-triggered post-processing tick run
    tokio::time::sleep(Duration::from_millis(20)).await;
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1]["value"], json!(1));
    }
    let key = EntityKey::new("counter", "c1");
    assert_eq!(log.get_version(&key).await.unwrap(), 2);

    // Unchanged: caller already at the current version.
    let plugins_reconnect = {
        let mut plugins = Plugins::new();
        plugins.reconnect.install(Arc::new(OpLogReconnectHook::new(log.clone())));
        plugins
    };
    let unchanged = plugins_reconnect
        .on_reconnect(ReconnectContext {
            client_id: lens_proto::ConnectionId::new(),
            subscriptions: vec![ReconnectSubscription {
                id: "sub-1".into(),
                entity: key.collection.clone(),
                entity_id: key.id.clone(),
                fields: lens_proto::FieldSelector::all(),
                version: 2,
                data_hash: None,
                input: None,
            }],
        })
        .await
        .unwrap();
    assert!(matches!(unchanged[0].status, ReconnectStatus::Unchanged));

    // Patched: caller missed exactly one version.
    let patched = plugins_reconnect
        .on_reconnect(ReconnectContext {
            client_id: lens_proto::ConnectionId::new(),
            subscriptions: vec![ReconnectSubscription {
                id: "sub-1".into(),
                entity: key.collection.clone(),
                entity_id: key.id.clone(),
                fields: lens_proto::FieldSelector::all(),
                version: 1,
                data_hash: None,
                input: None,
            }],
        })
        .await
        .unwrap();
    match &patched[0].status {
        ReconnectStatus::Patched { version, patches } => {
            assert_eq!(*version, 2);
            assert_eq!(patches.len(), 1);
        }
        other => panic!("expected Patched, got {other:?}"),
    }

    // Gone: entity was never created.
    let gone = plugins_reconnect
        .on_reconnect(ReconnectContext {
            client_id: lens_proto::ConnectionId::new(),
            subscriptions: vec![ReconnectSubscription {
                id: "sub-2".into(),
                entity: key.collection.clone(),
                entity_id: "missing".into(),
                fields: lens_proto::FieldSelector::all(),
                version: 1,
                data_hash: None,
                input: None,
            }],
        })
        .await
        .unwrap();
    assert!(matches!(gone[0].status, ReconnectStatus::Gone));
}

#[tokio::test]
async fn unknown_operation_errors_without_panicking() {
    let store = Arc::new(CounterStore::default());
    let log = Arc::new(InMemoryLog::new());
    let engine = build_engine(store, log);

    let observable = engine.execute("does.not.exist", Value::Null);
    match first_value_from(&observable).await.unwrap() {
        OperationOutcome::Error(EngineError::NotFound(path)) => assert_eq!(path, "does.not.exist"),
        OperationOutcome::Data { .. } => panic!("expected NotFound"),
        OperationOutcome::Error(other) => panic!("expected NotFound, got {other}"),
    }
}
