//! Process-wide state served by the health endpoints

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

/// Snapshot served on `GET /`
#[derive(Clone, Debug, Serialize)]
pub struct Diagnostics {
    /// Time of the last completed reconcile pass
    pub last_event: DateTime<Utc>,
    /// Adapters running after that pass
    pub adapters: usize,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            adapters: 0,
        }
    }
}

struct Inner {
    alive: AtomicBool,
    ready: AtomicBool,
    diagnostics: RwLock<Diagnostics>,
}

/// Liveness, readiness and diagnostics, independent of any adapter's health
#[derive(Clone)]
pub struct ServerState {
    inner: Arc<Inner>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerState {
    /// Alive but not yet ready
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                alive: AtomicBool::new(true),
                ready: AtomicBool::new(false),
                diagnostics: RwLock::new(Diagnostics::default()),
            }),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// The watch cache has completed its initial sync
    pub fn set_ready(&self) {
        self.inner.ready.store(true, Ordering::SeqCst);
    }

    /// Shutting down: both probes start failing
    pub fn set_stopping(&self) {
        self.inner.alive.store(false, Ordering::SeqCst);
        self.inner.ready.store(false, Ordering::SeqCst);
    }

    pub async fn record_pass(&self, adapters: usize) {
        let mut diagnostics = self.inner.diagnostics.write().await;
        diagnostics.last_event = Utc::now();
        diagnostics.adapters = adapters;
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        self.inner.diagnostics.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lifecycle_flags() {
        let state = ServerState::new();
        assert!(state.is_alive());
        assert!(!state.is_ready());

        state.set_ready();
        assert!(state.is_ready());

        state.record_pass(2).await;
        assert_eq!(state.diagnostics().await.adapters, 2);

        state.set_stopping();
        assert!(!state.is_alive());
        assert!(!state.is_ready());
    }
}
