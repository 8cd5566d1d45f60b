//! Metric helpers for `gatelink`.
//!
//! This module defines metric names and thin helpers wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. With the `metrics` feature
//! disabled every helper compiles to a no-op.

use derive_more::Display;

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking live connections per side.
pub const CONNECTIONS_ACTIVE: &str = "gatelink_connections_active";
/// Name of the counter tracking processed frames.
pub const FRAMES_PROCESSED: &str = "gatelink_frames_processed_total";
/// Name of the counter tracking fragments rejected by the reassembler.
pub const FRAGMENTS_DROPPED: &str = "gatelink_fragments_dropped_total";
/// Name of the counter tracking partial buffers evicted by the TTL sweep.
pub const REASSEMBLY_EVICTIONS: &str = "gatelink_reassembly_evictions_total";
/// Name of the counter tracking requests that never received a reply.
pub const CORRELATION_TIMEOUTS: &str = "gatelink_correlation_timeouts_total";
/// Name of the counter tracking error occurrences.
pub const ERRORS_TOTAL: &str = "gatelink_errors_total";

/// Which side of the relay a measurement belongs to.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Side {
    /// The chat gateway connection.
    #[display("gateway")]
    Gateway,
    /// The backend service link.
    #[display("backend")]
    Backend,
}

impl Side {
    /// Label value used in metrics and log records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Gateway => "gateway",
            Side::Backend => "backend",
        }
    }
}

/// Direction of frame processing.
#[derive(Clone, Copy, Debug)]
pub enum Direction {
    /// Frames received from a peer.
    Inbound,
    /// Frames sent to a peer.
    Outbound,
}

impl Direction {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the active connections gauge.
pub fn inc_connections(side: Side) {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE, "side" => side.as_str()).increment(1.0);
    #[cfg(not(feature = "metrics"))]
    let _ = side;
}

/// Decrement the active connections gauge.
pub fn dec_connections(side: Side) {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE, "side" => side.as_str()).decrement(1.0);
    #[cfg(not(feature = "metrics"))]
    let _ = side;
}

/// Record a processed frame for the given side and direction.
pub fn inc_frames(side: Side, direction: Direction) {
    #[cfg(feature = "metrics")]
    counter!(
        FRAMES_PROCESSED,
        "side" => side.as_str(),
        "direction" => direction.as_str()
    )
    .increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = (side, direction);
}

/// Record a fragment rejected by the reassembler.
pub fn inc_fragments_dropped() {
    #[cfg(feature = "metrics")]
    counter!(FRAGMENTS_DROPPED).increment(1);
}

/// Record `count` partial buffers evicted by the TTL sweep.
pub fn inc_reassembly_evictions(count: usize) {
    #[cfg(feature = "metrics")]
    if count > 0 {
        counter!(REASSEMBLY_EVICTIONS).increment(u64::try_from(count).unwrap_or(u64::MAX));
    }
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}

/// Record a request that timed out waiting for its reply.
pub fn inc_correlation_timeouts(side: Side) {
    #[cfg(feature = "metrics")]
    counter!(CORRELATION_TIMEOUTS, "side" => side.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = side;
}

/// Record an error occurrence.
pub fn inc_errors() {
    #[cfg(feature = "metrics")]
    counter!(ERRORS_TOTAL).increment(1);
}
