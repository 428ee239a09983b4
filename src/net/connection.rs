//! Tracking of long-lived relayed connections.
//!
//! WebSocket relays and polling channels outlive a single request, so the
//! gateway counts them to give them a bounded drain window on shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counts live relays.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a live relay over `transport`. The guard releases it on drop.
    pub fn track(&self, transport: &'static str) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            active: Arc::clone(&self.active),
            transport,
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait until every relay is gone or `timeout` elapses.
    ///
    /// Returns the number of relays still alive.
    pub async fn drain(&self, timeout: Duration) -> u64 {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.active_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.active_count()
    }
}

/// Releases a tracked relay when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<AtomicU64>,
    transport: &'static str,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let left = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        tracing::trace!(transport = self.transport, active = left, "Relay closed");
    }
}
