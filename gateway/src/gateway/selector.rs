//! Weighted-least-load backend selection.

use std::cmp::Ordering;
use std::sync::Arc;

use super::registry::{BackendInstance, BackendRegistry, LoadGuard};
use crate::error::GatewayError;

/// Compare two backends by `current_load / max_concurrent_requests`, then by id.
///
/// Ratios are compared by cross-multiplication so equal ratios tie exactly.
fn by_load_then_id(a: &BackendInstance, b: &BackendInstance) -> Ordering {
    let lhs = a.current_load as u64 * b.max_concurrent_requests as u64;
    let rhs = b.current_load as u64 * a.max_concurrent_requests as u64;
    lhs.cmp(&rhs).then_with(|| a.id.cmp(&b.id))
}

/// Order candidates best-first, dropping those at capacity or in `exclude`.
pub fn rank(mut candidates: Vec<BackendInstance>, exclude: &[String]) -> Vec<BackendInstance> {
    candidates.retain(|b| !b.is_at_capacity() && !exclude.contains(&b.id));
    candidates.sort_by(by_load_then_id);
    candidates
}

/// Picks backends for generation requests.
#[derive(Debug, Clone)]
pub struct Selector {
    registry: Arc<BackendRegistry>,
}

impl Selector {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self { registry }
    }

    /// The best backend for `model`, without reserving it.
    pub async fn select(&self, model: &str) -> Result<BackendInstance, GatewayError> {
        rank(self.registry.list(model).await, &[])
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::NotAvailable(model.to_string()))
    }

    /// Select and reserve a backend for `model`, skipping `exclude`.
    ///
    /// Candidates are tried best-first; one that fills up between the
    /// snapshot and the reservation is skipped in favor of the next.
    pub async fn acquire(
        &self,
        model: &str,
        exclude: &[String],
    ) -> Result<(BackendInstance, LoadGuard), GatewayError> {
        for candidate in rank(self.registry.list(model).await, exclude) {
            if let Some(guard) = self.registry.try_acquire(&candidate.id).await {
                tracing::debug!(
                    "Selected backend {} for model {} (load {}/{})",
                    candidate.id,
                    model,
                    candidate.current_load,
                    candidate.max_concurrent_requests
                );
                return Ok((candidate, guard));
            }
        }
        Err(GatewayError::NotAvailable(model.to_string()))
    }
}
