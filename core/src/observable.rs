//! A cold, cancellable, single-producer/single-consumer Observable
//! primitive: id-keyed listener storage behind an `Arc<Inner>`, with a
//! `Drop`-friendly unsubscribe guard, specialised to carry a payload and to
//! run a fresh producer per `subscribe()` call rather than fan a single
//! producer out to many listeners.

use crate::error::EngineError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub type Cleanup = Box<dyn FnOnce() + Send>;

struct ObserverInner<T> {
    next: Option<Box<dyn Fn(T) + Send + Sync>>,
    error: Option<Box<dyn Fn(EngineError) + Send + Sync>>,
    complete: Option<Box<dyn Fn() + Send + Sync>>,
    terminated: AtomicBool,
}

/// The consumer side handed to a producer: `next`/`error`/`complete` are all
/// optional, matching the `observer = { next?, error?, complete? }` shape.
pub struct Observer<T>(Arc<ObserverInner<T>>);

impl<T> Clone for Observer<T> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<T> Observer<T> {
    /// Push a value. A no-op once the observer has terminated (errored or
    /// completed).
    pub fn next(&self, value: T) {
        if self.0.terminated.load(Ordering::Acquire) {
            return;
        }
        if let Some(f) = &self.0.next {
            f(value);
        }
    }

    /// Terminate with an error. Idempotent; only the first call is
    /// delivered — errors are terminal.
    pub fn error(&self, err: EngineError) {
        if self.0.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(f) = &self.0.error {
            f(err);
        }
    }

    /// Terminate normally. Idempotent.
    pub fn complete(&self) {
        if self.0.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(f) = &self.0.complete {
            f();
        }
    }

    pub fn is_terminated(&self) -> bool { self.0.terminated.load(Ordering::Acquire) }
}

/// Builds an `Observer<T>` from whichever of `next`/`error`/`complete` the
/// caller cares about.
pub struct ObserverBuilder<T> {
    next: Option<Box<dyn Fn(T) + Send + Sync>>,
    error: Option<Box<dyn Fn(EngineError) + Send + Sync>>,
    complete: Option<Box<dyn Fn() + Send + Sync>>,
}

impl<T> Default for ObserverBuilder<T> {
    fn default() -> Self { Self { next: None, error: None, complete: None } }
}

impl<T> ObserverBuilder<T> {
    pub fn new() -> Self { Self::default() }

    pub fn on_next(mut self, f: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.next = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(EngineError) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.complete = Some(Box::new(f));
        self
    }

    fn build(self) -> Observer<T> {
        Observer(Arc::new(ObserverInner { next: self.next, error: self.error, complete: self.complete, terminated: AtomicBool::new(false) }))
    }
}

/// A subscription handle. `unsubscribe()` is idempotent and runs the
/// producer's cleanup before returning control.
pub struct Subscription {
    cleanup: Mutex<Option<Cleanup>>,
}

impl Subscription {
    fn new(cleanup: Cleanup) -> Self { Self { cleanup: Mutex::new(Some(cleanup)) } }

    pub fn unsubscribe(&self) {
        let cleanup = self.cleanup.lock().unwrap().take();
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) { self.unsubscribe(); }
}

/// A cold stream: every `subscribe()` call invokes the producer afresh with
/// its own `Observer`, and returns a `Cleanup` the engine runs on
/// unsubscribe. No state is shared between subscribers.
#[derive(Clone)]
pub struct Observable<T> {
    producer: Arc<dyn Fn(Observer<T>) -> Cleanup + Send + Sync>,
}

impl<T: 'static> Observable<T> {
    pub fn new(producer: impl Fn(Observer<T>) -> Cleanup + Send + Sync + 'static) -> Self { Self { producer: Arc::new(producer) } }

    pub fn subscribe(&self, observer: ObserverBuilder<T>) -> Subscription {
        let observer = observer.build();
        let cleanup = (self.producer)(observer);
        Subscription::new(cleanup)
    }
}

/// Resolves to the first value emitted (or the terminal error), then
/// auto-unsubscribes.
pub async fn first_value_from<T: Send + 'static>(observable: &Observable<T>) -> Result<T, EngineError> {
    let (tx, rx) = tokio::sync::oneshot::channel::<Result<T, EngineError>>();
    let tx = Arc::new(Mutex::new(Some(tx)));

    let tx_next = tx.clone();
    let tx_error = tx.clone();

    let subscription = observable.subscribe(
        ObserverBuilder::new()
            .on_next(move |value| {
                if let Some(tx) = tx_next.lock().unwrap().take() {
                    let _ = tx.send(Ok(value));
                }
            })
            .on_error(move |err| {
                if let Some(tx) = tx_error.lock().unwrap().take() {
                    let _ = tx.send(Err(err));
                }
            }),
    );

    let result = rx.await.unwrap_or_else(|_| Err(EngineError::Resolver(anyhow::anyhow!("observable completed with no value"))));
    subscription.unsubscribe();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as O};

    #[test]
    fn cold_observable_runs_producer_per_subscribe() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        let observable = Observable::new(move |observer: Observer<i32>| {
            runs2.fetch_add(1, O::SeqCst);
            observer.next(1);
            observer.complete();
            Box::new(|| {})
        });

        let _s1 = observable.subscribe(ObserverBuilder::new());
        let _s2 = observable.subscribe(ObserverBuilder::new());
        assert_eq!(runs.load(O::SeqCst), 2);
    }

    #[test]
    fn error_is_terminal() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let seen3 = seen.clone();
        let observable = Observable::new(move |observer: Observer<i32>| {
            observer.next(1);
            observer.error(EngineError::InvalidInput("bad".into()));
            observer.next(2); // must be dropped
            observer.complete(); // must be dropped
            Box::new(|| {})
        });
        let _s = observable.subscribe(
            ObserverBuilder::new()
                .on_next(move |v| seen2.lock().unwrap().push(format!("next:{v}")))
                .on_error(move |_| seen3.lock().unwrap().push("error".into())),
        );
        assert_eq!(*seen.lock().unwrap(), vec!["next:1".to_string(), "error".to_string()]);
    }

    #[test]
    fn unsubscribe_runs_cleanup_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let observable = Observable::new(move |_observer: Observer<i32>| {
            let count = count2.clone();
            Box::new(move || {
                count.fetch_add(1, O::SeqCst);
            }) as Cleanup
        });
        let s = observable.subscribe(ObserverBuilder::new());
        s.unsubscribe();
        s.unsubscribe();
        assert_eq!(count.load(O::SeqCst), 1);
    }

    #[tokio::test]
    async fn first_value_from_resolves_and_unsubscribes() {
        let unsubscribed = Arc::new(AtomicBool::new(false));
        let unsubscribed2 = unsubscribed.clone();
        let observable = Observable::new(move |observer: Observer<i32>| {
            observer.next(42);
            let flag = unsubscribed2.clone();
            Box::new(move || flag.store(true, Ordering::SeqCst))
        });
        let value = first_value_from(&observable).await.unwrap();
        assert_eq!(value, 42);
        assert!(unsubscribed.load(Ordering::SeqCst));
    }
}
