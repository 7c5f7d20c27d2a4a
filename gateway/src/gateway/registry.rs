//! Backend registry for tracking inference service instances.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::BackendConfig;

/// Health of a backend as last observed by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendHealth {
    Healthy,
    /// At least one recent probe failed, but not enough to open the circuit.
    Degraded,
    Unreachable,
}

/// Point-in-time snapshot of a registered backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendInstance {
    /// Unique backend identifier.
    pub id: String,
    /// Base URL, e.g. "http://192.168.1.102:11434".
    pub endpoint: String,
    /// Models this backend serves.
    pub supported_models: BTreeSet<String>,
    /// Generations this backend accepts at once.
    pub max_concurrent_requests: u32,
    /// Generations currently running.
    pub current_load: u32,
    pub health: BackendHealth,
    /// While in the future, the backend is excluded from selection.
    pub circuit_open_until: Option<DateTime<Utc>>,
}

impl BackendInstance {
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        models: impl IntoIterator<Item = impl Into<String>>,
        max_concurrent_requests: u32,
    ) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            supported_models: models.into_iter().map(Into::into).collect(),
            max_concurrent_requests,
            current_load: 0,
            health: BackendHealth::Healthy,
            circuit_open_until: None,
        }
    }

    /// Set the initial load counter.
    pub fn with_load(mut self, load: u32) -> Self {
        self.current_load = load;
        self
    }

    pub fn supports(&self, model: &str) -> bool {
        self.supported_models.contains(model)
    }

    pub fn is_at_capacity(&self) -> bool {
        self.current_load >= self.max_concurrent_requests
    }

    pub fn is_circuit_open(&self, now: DateTime<Utc>) -> bool {
        self.circuit_open_until.map(|until| until > now).unwrap_or(false)
    }
}

impl From<&BackendConfig> for BackendInstance {
    fn from(config: &BackendConfig) -> Self {
        BackendInstance::new(
            config.id.clone(),
            config.endpoint.clone(),
            config.models.clone(),
            config.max_concurrent_requests,
        )
    }
}

/// Mutable health bookkeeping, serialized per instance.
#[derive(Debug)]
struct HealthState {
    supported_models: BTreeSet<String>,
    health: BackendHealth,
    circuit_open_until: Option<DateTime<Utc>>,
    unreachable_since: Option<DateTime<Utc>>,
}

/// A registered backend. Load is an atomic so leases can release it
/// without touching the registry lock.
#[derive(Debug)]
pub struct BackendEntry {
    id: String,
    endpoint: String,
    max_concurrent_requests: u32,
    /// Registered without models: the model set comes from probes.
    discover_models: bool,
    load: AtomicU32,
    state: Mutex<HealthState>,
}

impl BackendEntry {
    fn new(instance: BackendInstance) -> Self {
        Self {
            discover_models: instance.supported_models.is_empty(),
            id: instance.id,
            endpoint: instance.endpoint,
            max_concurrent_requests: instance.max_concurrent_requests,
            load: AtomicU32::new(instance.current_load),
            state: Mutex::new(HealthState {
                supported_models: instance.supported_models,
                health: instance.health,
                circuit_open_until: instance.circuit_open_until,
                unreachable_since: None,
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut HealthState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    fn snapshot(&self) -> BackendInstance {
        self.with_state(|state| BackendInstance {
            id: self.id.clone(),
            endpoint: self.endpoint.clone(),
            supported_models: state.supported_models.clone(),
            max_concurrent_requests: self.max_concurrent_requests,
            current_load: self.load.load(Ordering::SeqCst),
            health: state.health,
            circuit_open_until: state.circuit_open_until,
        })
    }

    fn add_load(&self, delta: i32) -> u32 {
        let result = self
            .load
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |load| {
                Some(if delta >= 0 {
                    load.saturating_add(delta as u32)
                } else {
                    load.saturating_sub(delta.unsigned_abs())
                })
            });
        let previous = result.unwrap_or_else(|v| v);
        if delta >= 0 {
            previous.saturating_add(delta as u32)
        } else {
            previous.saturating_sub(delta.unsigned_abs())
        }
    }

    fn try_reserve(&self) -> bool {
        self.load
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |load| {
                (load < self.max_concurrent_requests).then_some(load + 1)
            })
            .is_ok()
    }
}

/// One unit of load held on a backend for the lifetime of a generation.
///
/// Releasing happens exactly once, either through [`LoadGuard::release`] or
/// on drop. The guard only holds a weak reference, so a backend that was
/// deregistered meanwhile is not kept alive.
#[derive(Debug)]
pub struct LoadGuard {
    backend_id: String,
    entry: Option<Weak<BackendEntry>>,
}

impl LoadGuard {
    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// Give the unit of load back. Later calls and the drop are no-ops.
    pub fn release(&mut self) {
        if let Some(entry) = self.entry.take().and_then(|weak| weak.upgrade()) {
            let load = entry.add_load(-1);
            tracing::debug!("Released load on backend {} (now {})", self.backend_id, load);
        }
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Registry of inference backends.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: RwLock<HashMap<String, Arc<BackendEntry>>>,
}

impl BackendRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry seeded with the configured backends.
    pub async fn from_config(backends: &[BackendConfig]) -> Self {
        let registry = Self::new();
        for backend in backends {
            registry.register(BackendInstance::from(backend)).await;
        }
        registry
    }

    /// Register a backend. An existing entry with the same id is replaced.
    pub async fn register(&self, instance: BackendInstance) {
        let id = instance.id.clone();
        let entry = Arc::new(BackendEntry::new(instance));
        let replaced = self.backends.write().await.insert(id.clone(), entry);
        if replaced.is_some() {
            tracing::info!("Replaced backend {}", id);
        } else {
            tracing::info!("Registered backend {}", id);
        }
    }

    /// Remove a backend from the registry.
    pub async fn deregister(&self, id: &str) -> Option<BackendInstance> {
        let removed = self.backends.write().await.remove(id);
        removed.map(|entry| {
            tracing::info!("Deregistered backend {}", id);
            entry.snapshot()
        })
    }

    /// Get a backend snapshot by id.
    pub async fn get(&self, id: &str) -> Option<BackendInstance> {
        self.backends.read().await.get(id).map(|e| e.snapshot())
    }

    /// All backends, ordered by id.
    pub async fn all(&self) -> Vec<BackendInstance> {
        let mut all: Vec<_> = self
            .backends
            .read()
            .await
            .values()
            .map(|e| e.snapshot())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Backends serving `model` whose circuit is closed.
    pub async fn list(&self, model: &str) -> Vec<BackendInstance> {
        let now = Utc::now();
        self.backends
            .read()
            .await
            .values()
            .map(|e| e.snapshot())
            .filter(|b| b.supports(model) && !b.is_circuit_open(now))
            .collect()
    }

    /// Adjust a backend's load counter. Saturates at zero.
    pub async fn update_load(&self, id: &str, delta: i32) {
        match self.backends.read().await.get(id) {
            Some(entry) => {
                entry.add_load(delta);
            }
            None => tracing::warn!("update_load on unknown backend {}", id),
        }
    }

    /// Record a health observation.
    pub async fn update_health(&self, id: &str, health: BackendHealth) {
        let Some(entry) = self.backends.read().await.get(id).cloned() else {
            tracing::warn!("update_health on unknown backend {}", id);
            return;
        };
        entry.with_state(|state| {
            if health == BackendHealth::Unreachable {
                state.unreachable_since.get_or_insert_with(Utc::now);
            } else {
                state.unreachable_since = None;
            }
            state.health = health;
        });
    }

    /// Open the circuit until `until`, or close it with `None`.
    pub async fn set_circuit(&self, id: &str, until: Option<DateTime<Utc>>) {
        if let Some(entry) = self.backends.read().await.get(id) {
            entry.with_state(|state| state.circuit_open_until = until);
        }
    }

    /// Replace the model set of a backend registered without models.
    /// Returns whether the set changed.
    pub async fn discover_models(&self, id: &str, models: Vec<String>) -> bool {
        let Some(entry) = self.backends.read().await.get(id).cloned() else {
            return false;
        };
        if !entry.discover_models {
            return false;
        }
        let models: BTreeSet<String> = models.into_iter().collect();
        entry.with_state(|state| {
            if state.supported_models == models {
                false
            } else {
                state.supported_models = models;
                true
            }
        })
    }

    /// Reserve one unit of load on `id` if it is below capacity.
    pub async fn try_acquire(&self, id: &str) -> Option<LoadGuard> {
        let entry = self.backends.read().await.get(id).cloned()?;
        if !entry.try_reserve() {
            return None;
        }
        Some(LoadGuard {
            backend_id: entry.id.clone(),
            entry: Some(Arc::downgrade(&entry)),
        })
    }

    /// Sorted, de-duplicated union of models served by reachable backends.
    pub async fn all_models(&self) -> Vec<String> {
        let models: BTreeSet<String> = self
            .backends
            .read()
            .await
            .values()
            .map(|e| e.snapshot())
            .filter(|b| b.health != BackendHealth::Unreachable)
            .flat_map(|b| b.supported_models)
            .collect();
        models.into_iter().collect()
    }

    /// Ids of all registered backends.
    pub async fn ids(&self) -> Vec<String> {
        self.backends.read().await.keys().cloned().collect()
    }

    /// Count registered backends.
    pub async fn count(&self) -> usize {
        self.backends.read().await.len()
    }

    /// Count backends not currently unreachable.
    pub async fn reachable_count(&self) -> usize {
        self.backends
            .read()
            .await
            .values()
            .filter(|e| e.with_state(|s| s.health != BackendHealth::Unreachable))
            .count()
    }

    /// Remove backends that have been unreachable for longer than `ttl`.
    pub async fn remove_unreachable(&self, ttl: Duration) -> Vec<String> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut removed = vec![];
        let mut backends = self.backends.write().await;

        backends.retain(|id, entry| {
            let since = entry.with_state(|s| s.unreachable_since);
            match since {
                Some(since) if now - since > ttl => {
                    tracing::warn!(
                        "Removing backend {} (unreachable since {})",
                        id,
                        since.to_rfc3339()
                    );
                    removed.push(id.clone());
                    false
                }
                _ => true,
            }
        });

        removed
    }
}
