//! Watchdog for gateway heartbeats.
//!
//! The monitor arms on the first heartbeat a socket delivers. From then on,
//! a gap longer than `interval * miss_threshold` marks the socket dead.
//! Gateways that never send heartbeats are never timed out.

use std::{future, time::Duration};

use tokio::time::{Instant, sleep_until};

/// Tracks the last heartbeat seen on one socket.
#[derive(Clone, Copy, Debug)]
pub struct HeartbeatMonitor {
    deadline: Option<Duration>,
    last_seen: Option<Instant>,
}

impl HeartbeatMonitor {
    /// Create a monitor; `None` disables it.
    #[must_use]
    pub const fn new(deadline: Option<Duration>) -> Self {
        Self {
            deadline,
            last_seen: None,
        }
    }

    /// Note a heartbeat at the current time.
    pub fn record(&mut self) { self.record_at(Instant::now()); }

    /// Note a heartbeat at `now`.
    pub fn record_at(&mut self, now: Instant) { self.last_seen = Some(now); }

    /// Instant after which the socket counts as dead, once armed.
    #[must_use]
    pub fn expires_at(&self) -> Option<Instant> {
        Some(self.last_seen? + self.deadline?)
    }

    /// Whether the deadline has passed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }

    /// Resolve when the deadline passes; never resolves while unarmed.
    pub async fn expired(&self) {
        match self.expires_at() {
            Some(at) => sleep_until(at).await,
            None => future::pending().await,
        }
    }
}
