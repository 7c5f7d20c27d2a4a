//! Periodic backend health probing and circuit breaking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::registry::{BackendHealth, BackendRegistry};
use crate::config::HealthConfig;
use crate::llm::BackendClient;

/// Probe timing and circuit-breaker parameters.
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failures before the backend is marked unreachable.
    pub failure_threshold: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub unreachable_ttl: Duration,
}

impl From<&HealthConfig> for HealthPolicy {
    fn from(config: &HealthConfig) -> Self {
        Self {
            interval: config.interval(),
            probe_timeout: config.probe_timeout(),
            failure_threshold: config.failure_threshold.max(1),
            initial_backoff: Duration::from_secs(config.initial_backoff_secs),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
            unreachable_ttl: Duration::from_secs(config.unreachable_ttl_secs),
        }
    }
}

impl HealthPolicy {
    /// Circuit duration after `failures` consecutive failures. Doubles per
    /// failure past the threshold, capped at `max_backoff`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(self.failure_threshold).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Per-backend probe bookkeeping, owned by that backend's probe loop.
#[derive(Debug, Default)]
pub struct ProbeState {
    pub consecutive_failures: u32,
}

/// Probes every registered backend and keeps its registry state current.
pub struct HealthMonitor {
    registry: Arc<BackendRegistry>,
    client: Arc<dyn BackendClient>,
    policy: HealthPolicy,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<BackendRegistry>,
        client: Arc<dyn BackendClient>,
        policy: HealthPolicy,
    ) -> Self {
        Self {
            registry,
            client,
            policy,
        }
    }

    /// Spawn the supervisor loop. It runs until `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.supervise(shutdown).await })
    }

    /// Keep exactly one probe loop running per registered backend and
    /// deregister backends that stayed unreachable too long.
    async fn supervise(self: Arc<Self>, shutdown: CancellationToken) {
        let mut probes: HashMap<String, JoinHandle<()>> = HashMap::new();
        let mut ticker = tokio::time::interval(self.policy.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let removed = self.registry.remove_unreachable(self.policy.unreachable_ttl).await;
            for id in &removed {
                tracing::warn!("Backend {} unreachable past TTL, deregistered", id);
            }

            let ids = self.registry.ids().await;
            probes.retain(|id, handle| {
                let keep = ids.contains(id) && !handle.is_finished();
                if !keep {
                    handle.abort();
                }
                keep
            });

            for id in ids {
                if !probes.contains_key(&id) {
                    tracing::debug!("Starting health probe loop for backend {}", id);
                    let monitor = self.clone();
                    let loop_id = id.clone();
                    probes.insert(id, tokio::spawn(async move { monitor.probe_loop(loop_id).await }));
                }
            }
        }

        for (_, handle) in probes {
            handle.abort();
        }
        tracing::info!("Health monitor stopped");
    }

    async fn probe_loop(&self, id: String) {
        let mut state = ProbeState::default();
        let mut ticker = tokio::time::interval(self.policy.interval);

        loop {
            ticker.tick().await;
            if !self.probe_once(&id, &mut state).await {
                tracing::debug!("Backend {} gone, stopping probe loop", id);
                return;
            }
        }
    }

    /// Probe one backend and record the outcome.
    ///
    /// Returns `false` once the backend is no longer registered.
    pub async fn probe_once(&self, id: &str, state: &mut ProbeState) -> bool {
        let Some(backend) = self.registry.get(id).await else {
            return false;
        };

        let result =
            tokio::time::timeout(self.policy.probe_timeout, self.client.list_models(&backend.endpoint))
                .await;

        match result {
            Ok(Ok(models)) => {
                if backend.health != BackendHealth::Healthy || backend.circuit_open_until.is_some()
                {
                    tracing::info!("Backend {} recovered, closing circuit", id);
                }
                state.consecutive_failures = 0;
                self.registry.update_health(id, BackendHealth::Healthy).await;
                self.registry.set_circuit(id, None).await;
                if self.registry.discover_models(id, models.clone()).await {
                    tracing::info!("Backend {} serves models {:?}", id, models);
                }
            }
            Ok(Err(e)) => self.record_failure(id, state, &e.to_string()).await,
            Err(_) => {
                let reason = format!("probe timed out after {:?}", self.policy.probe_timeout);
                self.record_failure(id, state, &reason).await
            }
        }
        true
    }

    async fn record_failure(&self, id: &str, state: &mut ProbeState, reason: &str) {
        state.consecutive_failures += 1;
        let failures = state.consecutive_failures;

        if failures < self.policy.failure_threshold {
            tracing::warn!("Health probe failed for backend {} ({}): {}", id, failures, reason);
            self.registry.update_health(id, BackendHealth::Degraded).await;
            return;
        }

        let backoff = self.policy.backoff(failures);
        let until = Utc::now()
            + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::seconds(300));
        tracing::warn!(
            "Backend {} unreachable after {} failures, circuit open for {:?}: {}",
            id,
            failures,
            backoff,
            reason
        );
        self.registry.update_health(id, BackendHealth::Unreachable).await;
        self.registry.set_circuit(id, Some(until)).await;
    }
}
