//! The reactive context handed to resolvers: `ctx = userContext ⊕ { emit,
//! onCleanup }`.

use crate::patch_derive::canonical_eq;
use serde_json::Value;
use std::sync::{Arc, Mutex};

type Disposer = Box<dyn FnOnce() + Send>;

struct ContextInner {
    sink: Box<dyn Fn(Value) + Send + Sync>,
    last_raw: Mutex<Option<Value>>,
    cleanups: Mutex<Vec<Disposer>>,
}

/// Handed to every operation resolver (and, independently, to every
/// field-level `subscribe` resolver). Cloning a `Context` shares the same
/// dedup state and cleanup stack — a resolver may stash a clone and keep
/// calling `emit` long after its own future has returned. Resolver errors
/// are not delivered through the context; a resolver reports failure by
/// returning `Err` from its future, and the engine turns that into the
/// observer's terminal `error`.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn new(sink: impl Fn(Value) + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(ContextInner { sink: Box::new(sink), last_raw: Mutex::new(None), cleanups: Mutex::new(Vec::new()) }) }
    }

    /// Schedule a push of `value` through the post-processing pipeline.
    /// Skipped, with no observer notification, when `value` is deep-equal to
    /// the last successfully emitted value.
    pub fn emit(&self, value: Value) {
        {
            let mut last = self.inner.last_raw.lock().unwrap();
            if let Some(prev) = last.as_ref() {
                if canonical_eq(prev, &value) {
                    return;
                }
            }
            *last = Some(value.clone());
        }
        (self.inner.sink)(value);
    }

    /// LIFO-registered disposer, run in reverse-registration order on
    /// unsubscribe.
    pub fn on_cleanup(&self, f: impl FnOnce() + Send + 'static) { self.inner.cleanups.lock().unwrap().push(Box::new(f)); }

    /// Run every registered cleanup, most-recently-registered first. Called
    /// once by the engine on unsubscribe; subsequent calls are a no-op
    /// because the list has already been drained.
    pub fn run_cleanups(&self) {
        let mut cleanups = self.inner.cleanups.lock().unwrap();
        while let Some(cleanup) = cleanups.pop() {
            cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn emit_dedupes_identical_successive_values() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let ctx = Context::new(move |v| seen2.lock().unwrap().push(v));
        ctx.emit(json!({"id": "u1", "name": "Alice"}));
        ctx.emit(json!({"id": "u1", "name": "Alice"}));
        ctx.emit(json!({"id": "u1", "name": "Bob"}));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn cleanups_run_lifo() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let ctx = Context::new(|_| {});
        for i in 0..3 {
            let order = order.clone();
            ctx.on_cleanup(move || order.lock().unwrap().push(i));
        }
        ctx.run_cleanups();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }
}
