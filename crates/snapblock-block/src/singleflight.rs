//! SingleFlight: coalesce concurrent requests for the same key into one operation.
//!
//! The first caller for a key starts the operation on a detached task and
//! registers a broadcast channel for it. Later callers for the same key
//! subscribe to that channel instead of starting their own operation. When
//! the operation finishes the key is removed from the registry and the
//! result is broadcast, so the next caller starts a fresh attempt.
//!
//! Running the operation on its own task means a caller that gives up
//! (its future is dropped or its context is cancelled) never takes the
//! shared operation down with it.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

type Registry<K, V> = Arc<Mutex<HashMap<K, broadcast::Sender<V>>>>;

/// Why a joined operation produced no value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightError {
    /// The task running the operation ended without a result (panic or abort)
    Abandoned,
}

/// SingleFlight controller keyed by `K`, sharing results of type `V`.
///
/// `V` is typically a `Result` whose value and error are cheap to clone.
pub struct SingleFlight<K, V> {
    in_flight: Registry<K, V>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Create a new SingleFlight controller.
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `start()` for `key` unless an operation for `key` is already in
    /// flight, and wait for the shared result.
    ///
    /// `start` is only invoked by the caller that creates the flight.
    pub async fn execute<F, Fut>(&self, key: K, start: F) -> Result<V, FlightError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let mut rx = self.join_or_start(key, start);
        rx.recv().await.map_err(|_| FlightError::Abandoned)
    }

    fn join_or_start<F, Fut>(&self, key: K, start: F) -> broadcast::Receiver<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let mut guard = self.in_flight.lock();
        if let Some(tx) = guard.get(&key) {
            return tx.subscribe();
        }

        // A single value is ever sent per flight
        let (tx, rx) = broadcast::channel(1);
        guard.insert(key.clone(), tx);
        drop(guard);

        let flight = Flight {
            key: Some(key),
            registry: Arc::clone(&self.in_flight),
        };
        let fut = start();
        tokio::spawn(async move {
            let value = fut.await;
            flight.complete(value);
        });
        rx
    }

    /// Number of keys with an operation currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

/// Registry slot owned by the task running one operation.
///
/// Dropping it without completing (the task panicked or was aborted)
/// removes the slot, which closes the channel for every subscriber.
struct Flight<K: Hash + Eq, V> {
    key: Option<K>,
    registry: Registry<K, V>,
}

impl<K: Hash + Eq, V> Flight<K, V> {
    fn complete(mut self, value: V) {
        if let Some(key) = self.key.take()
            && let Some(tx) = self.registry.lock().remove(&key)
        {
            // No receivers means every caller gave up
            let _ = tx.send(value);
        }
    }
}

impl<K: Hash + Eq, V> Drop for Flight<K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.registry.lock().remove(&key);
        }
    }
}
