use lens_core::observable::{Cleanup, Observable, Observer};
use lens_proto::Metadata;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::ClientError;

/// Connection state machine: `disconnected → connecting → connected →
/// (reconnecting ↔ connecting) → disconnected`.
#[derive(Clone, Debug)]
pub enum ConnectionState {
    Disconnected,
    Connecting { url: String },
    Connected { url: String, metadata: Metadata },
    Reconnecting { url: String },
    Error(ClientError),
}

/// A value cell that notifies registered listeners on every `set`, and hands
/// a fresh `Observable` to each caller that wants to watch it. Grounded on
/// the same id-keyed listener bookkeeping as `lens_core::observable`'s
/// `Observable`, but hot rather than cold: `set` pushes to whoever is
/// currently listening, and a new `observe()` subscriber is caught up with
/// the current value immediately rather than waiting for the next change.
pub struct StateCell<T: Clone + Send + Sync + 'static> {
    value: Mutex<T>,
    listeners: Mutex<Vec<(u64, Box<dyn Fn(&T) + Send + Sync>)>>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> StateCell<T> {
    pub fn new(initial: T) -> Arc<Self> { Arc::new(Self { value: Mutex::new(initial), listeners: Mutex::new(Vec::new()), next_id: AtomicU64::new(0) }) }

    pub fn get(&self) -> T { self.value.lock().unwrap().clone() }

    pub fn set(&self, value: T) {
        *self.value.lock().unwrap() = value.clone();
        for (_, listener) in self.listeners.lock().unwrap().iter() {
            listener(&value);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> StateCell<T> {
    /// Build an `Observable<T>` backed by this cell. Every `subscribe()` call
    /// gets the current value immediately, then every subsequent `set`.
    pub fn observe(self: &Arc<Self>) -> Observable<T> {
        let cell = self.clone();
        Observable::new(move |observer: Observer<T>| {
            observer.next(cell.get());
            let id = cell.next_id.fetch_add(1, Ordering::Relaxed);
            let sink = observer.clone();
            cell.listeners.lock().unwrap().push((id, Box::new(move |value: &T| sink.next(value.clone()))));

            let cell = cell.clone();
            Box::new(move || {
                cell.listeners.lock().unwrap().retain(|(listener_id, _)| *listener_id != id);
            }) as Cleanup
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lens_core::observable::ObserverBuilder;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn new_subscriber_is_caught_up_with_current_value() {
        let cell = StateCell::new(1);
        cell.set(2);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = cell.observe().subscribe(ObserverBuilder::new().on_next(move |v| seen2.lock().unwrap().push(v)));

        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[test]
    fn subsequent_sets_are_forwarded_to_every_subscriber() {
        let cell = StateCell::new(0);
        let a = Arc::new(StdMutex::new(Vec::new()));
        let b = Arc::new(StdMutex::new(Vec::new()));
        let a2 = a.clone();
        let b2 = b.clone();

        let _sub_a = cell.observe().subscribe(ObserverBuilder::new().on_next(move |v| a2.lock().unwrap().push(v)));
        let _sub_b = cell.observe().subscribe(ObserverBuilder::new().on_next(move |v| b2.lock().unwrap().push(v)));

        cell.set(1);
        cell.set(2);

        assert_eq!(*a.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(*b.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn unsubscribe_stops_further_delivery() {
        let cell = StateCell::new(0);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let sub = cell.observe().subscribe(ObserverBuilder::new().on_next(move |v| seen2.lock().unwrap().push(v)));

        cell.set(1);
        sub.unsubscribe();
        cell.set(2);

        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    }
}
