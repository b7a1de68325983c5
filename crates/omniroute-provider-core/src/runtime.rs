//! In-process provider state threaded through the engine.
//!
//! Nothing here is authoritative: the Copilot token and project ids are also
//! persisted into connection `provider_data` so a restarted process (or a
//! per-request edge worker rebuilding this value on cold start) recovers
//! them from the config store.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::singleflight::Singleflight;

const PROJECT_ID_TTL: Duration = Duration::from_secs(60 * 60);
const ORPHAN_FETCH_AGE: Duration = Duration::from_secs(2 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
struct ProjectEntry {
    project_id: String,
    expires_at: Instant,
}

pub struct ProviderRuntime {
    /// Models GitHub Copilot rejected from /chat/completions; they go
    /// straight to /responses next time.
    known_codex_models: RwLock<HashSet<String>>,
    project_cache: RwLock<HashMap<String, ProjectEntry>>,
    project_flight: Singleflight<Result<String, String>>,
    fetch_started: RwLock<HashMap<String, Instant>>,
    /// Token refresh collapse, keyed by connection id.
    pub refresh_flight: Singleflight<Result<Option<crate::machine::ConnectionUpdate>, String>>,
}

impl Default for ProviderRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRuntime {
    pub fn new() -> Self {
        Self {
            known_codex_models: RwLock::new(HashSet::new()),
            project_cache: RwLock::new(HashMap::new()),
            project_flight: Singleflight::new(),
            fetch_started: RwLock::new(HashMap::new()),
            refresh_flight: Singleflight::new(),
        }
    }

    pub async fn remember_codex_model(&self, model: &str) {
        self.known_codex_models
            .write()
            .await
            .insert(model.to_string());
    }

    pub async fn is_known_codex_model(&self, model: &str) -> bool {
        self.known_codex_models.read().await.contains(model)
    }

    pub async fn cached_project_id(&self, connection_id: &str) -> Option<String> {
        let guard = self.project_cache.read().await;
        let entry = guard.get(connection_id)?;
        (entry.expires_at > Instant::now()).then(|| entry.project_id.clone())
    }

    /// Resolve a project id through the cache; cache misses run `fetch`
    /// behind a per-connection singleflight with a 1-hour TTL on the result.
    pub async fn resolve_project_id<F, Fut>(
        &self,
        connection_id: &str,
        fetch: F,
    ) -> Result<String, String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, String>> + Send,
    {
        if let Some(cached) = self.cached_project_id(connection_id).await {
            return Ok(cached);
        }
        self.fetch_started
            .write()
            .await
            .insert(connection_id.to_string(), Instant::now());
        let result = self.project_flight.run(connection_id, fetch).await;
        self.fetch_started.write().await.remove(connection_id);
        if let Ok(project_id) = &result {
            self.project_cache.write().await.insert(
                connection_id.to_string(),
                ProjectEntry {
                    project_id: project_id.clone(),
                    expires_at: Instant::now() + PROJECT_ID_TTL,
                },
            );
        }
        result
    }

    /// Drop all runtime state for a removed connection: evicts the cache row
    /// and aborts any in-flight fetch.
    pub async fn connection_removed(&self, connection_id: &str) {
        self.project_cache.write().await.remove(connection_id);
        self.fetch_started.write().await.remove(connection_id);
        self.project_flight.abort(connection_id).await;
        self.refresh_flight.abort(connection_id).await;
    }

    /// One sweep: evict expired cache rows, abort orphan fetches older than
    /// two minutes.
    pub async fn sweep(&self) {
        let now = Instant::now();
        {
            let mut cache = self.project_cache.write().await;
            cache.retain(|_, entry| entry.expires_at > now);
        }
        let orphans: Vec<String> = {
            let started = self.fetch_started.read().await;
            started
                .iter()
                .filter(|(_, at)| now.duration_since(**at) > ORPHAN_FETCH_AGE)
                .map(|(key, _)| key.clone())
                .collect()
        };
        for key in orphans {
            debug!(event = "project_fetch_orphaned", connection_id = %key);
            self.fetch_started.write().await.remove(&key);
            self.project_flight.abort(&key).await;
        }
    }

    /// Background sweeper, every ten minutes.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                runtime.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn codex_model_set_remembers() {
        let runtime = ProviderRuntime::new();
        assert!(!runtime.is_known_codex_model("gpt-5.1-codex").await);
        runtime.remember_codex_model("gpt-5.1-codex").await;
        assert!(runtime.is_known_codex_model("gpt-5.1-codex").await);
    }

    #[tokio::test]
    async fn project_id_is_cached_after_first_fetch() {
        let runtime = ProviderRuntime::new();
        let fetches = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let fetches = fetches.clone();
            let got = runtime
                .resolve_project_id("conn-1", || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok("proj-9".to_string())
                })
                .await
                .unwrap();
            assert_eq!(got, "proj-9");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn removal_evicts_cache() {
        let runtime = ProviderRuntime::new();
        runtime
            .resolve_project_id("conn-1", || async { Ok("p".to_string()) })
            .await
            .unwrap();
        assert!(runtime.cached_project_id("conn-1").await.is_some());
        runtime.connection_removed("conn-1").await;
        assert!(runtime.cached_project_id("conn-1").await.is_none());
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let runtime = ProviderRuntime::new();
        let result = runtime
            .resolve_project_id("conn-1", || async { Err("boom".to_string()) })
            .await;
        assert!(result.is_err());
        assert!(runtime.cached_project_id("conn-1").await.is_none());
        let got = runtime
            .resolve_project_id("conn-1", || async { Ok("later".to_string()) })
            .await
            .unwrap();
        assert_eq!(got, "later");
    }
}
