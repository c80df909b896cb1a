//! Deduplication of concurrent loads sharing a key.

use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Returned to waiters when the shared work task died without a result.
#[derive(Debug, PartialEq, Eq)]
pub struct FlightFailed;

/// At most one invocation of the work future is in flight per key; every
/// concurrent caller receives a clone of the one result. The work runs on a
/// detached task, so no caller's cancellation can abort it; it completes on
/// its own terms even if every caller has gone away.
pub struct SingleFlight<K, V> {
    inflight: Arc<Mutex<HashMap<K, broadcast::Sender<V>>>>,
}

impl<K, V> Clone for SingleFlight<K, V> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
        }
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Joins the in-flight work for `key`, starting it if none is running.
    /// After the work completes the key becomes eligible for a fresh run.
    pub async fn run<F>(&self, key: K, work: F) -> Result<V, FlightFailed>
    where
        F: Future<Output = V> + Send + 'static,
    {
        let mut rx = {
            let mut inflight = self.inflight.lock().unwrap();
            match inflight.get(&key) {
                Some(tx) => tx.subscribe(),
                None => {
                    let (tx, rx) = broadcast::channel(1);
                    inflight.insert(key.clone(), tx.clone());
                    let registry = Arc::clone(&self.inflight);
                    tokio::spawn(async move {
                        let outcome = AssertUnwindSafe(work).catch_unwind().await;
                        registry.lock().unwrap().remove(&key);
                        if let Ok(value) = outcome {
                            let _ = tx.send(value);
                        }
                    });
                    rx
                }
            }
        };
        rx.recv().await.map_err(|_| FlightFailed)
    }

    /// Number of keys with work currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }
}
