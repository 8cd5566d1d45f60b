//! Retry schedule for failed reverse-mode `accept()` calls.

use std::time::Duration;

use crate::config::GatewayConfig;

const MIN_DELAY: Duration = Duration::from_millis(1);

/// Doubling delay between consecutive accept failures.
///
/// A successful accept drops the delay back to its floor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcceptBackoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl AcceptBackoff {
    /// Schedule running from `initial` up to `max`.
    ///
    /// Bounds under a millisecond are raised to one and inverted bounds are
    /// swapped.
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use gatelink::gateway::AcceptBackoff;
    ///
    /// let backoff = AcceptBackoff::new(Duration::from_millis(5), Duration::ZERO);
    /// assert_eq!(
    ///     backoff.bounds(),
    ///     (Duration::from_millis(1), Duration::from_millis(5))
    /// );
    /// ```
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        let (low, high) = (initial.max(MIN_DELAY), max.max(MIN_DELAY));
        let (floor, ceiling) = if low <= high { (low, high) } else { (high, low) };
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Schedule from the `accept_backoff_*_ms` settings.
    #[must_use]
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            Duration::from_millis(config.accept_backoff_initial_ms),
            Duration::from_millis(config.accept_backoff_max_ms),
        )
    }

    /// Floor and ceiling of the schedule.
    #[must_use]
    pub const fn bounds(&self) -> (Duration, Duration) { (self.floor, self.ceiling) }

    /// Record a failure and return how long to wait before retrying.
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        delay
    }

    /// Record a successful accept.
    pub fn on_success(&mut self) { self.current = self.floor; }
}
