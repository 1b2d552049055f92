use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Readiness shared between the controller and the health endpoints.
#[derive(Clone, Default)]
pub struct HealthState {
    caches_synced: Arc<AtomicBool>,
}

impl HealthState {
    pub fn mark_ready(&self) {
        self.caches_synced.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.caches_synced.load(Ordering::Acquire)
    }
}
