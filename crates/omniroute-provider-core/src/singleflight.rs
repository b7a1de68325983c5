use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};

/// Collapses concurrent calls for the same key into one execution whose
/// result is broadcast to every waiter. Used for token refresh and
/// project-id resolution, keyed by connection id.
pub struct Singleflight<T: Clone + Send + 'static> {
    inflight: Mutex<HashMap<String, broadcast::Sender<T>>>,
}

impl<T: Clone + Send + 'static> Default for Singleflight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Singleflight<T> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run<F, Fut>(&self, key: &str, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send,
    {
        let mut receiver = {
            let mut guard = self.inflight.lock().await;
            match guard.get(key) {
                Some(sender) => Some(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    guard.insert(key.to_string(), sender);
                    None
                }
            }
        };

        if let Some(rx) = receiver.as_mut() {
            if let Ok(value) = rx.recv().await {
                return value;
            }
            // Leader dropped without publishing (cancelled); fall through
            // and run the work ourselves.
        }

        let value = work().await;
        let mut guard = self.inflight.lock().await;
        if let Some(sender) = guard.remove(key) {
            let _ = sender.send(value.clone());
        }
        value
    }

    /// Drop the in-flight slot for a key (connection removed); waiters see a
    /// closed channel and re-run.
    pub async fn abort(&self, key: &str) {
        self.inflight.lock().await.remove(key);
    }
}
