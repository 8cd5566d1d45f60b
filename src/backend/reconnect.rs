//! Attempt accounting for the backend reconnect loop.
//!
//! Every failed connect counts as one attempt. A session that stays up for
//! at least `stable_period` clears the count when it ends; a shorter session
//! counts as a failed attempt. Reaching `max_attempts` gives up.

use std::time::Duration;

/// Reconnect limits taken from configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub stable_period: Duration,
}

/// Next step after a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Try again after `delay`; `attempt` failures have accumulated.
    Retry { attempt: u32, delay: Duration },
    /// The attempt budget is spent.
    GiveUp { attempts: u32 },
}

/// Running failure count for one link.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectTracker {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectTracker {
    #[must_use]
    pub const fn new(policy: ReconnectPolicy) -> Self { Self { policy, attempts: 0 } }

    /// Failures counted since the last stable session.
    #[must_use]
    pub const fn attempts(&self) -> u32 { self.attempts }

    /// Record a connect attempt that failed.
    pub fn on_connect_failure(&mut self) -> Verdict { self.fail() }

    /// Record the end of a session that lasted `lasted`.
    pub fn on_session_end(&mut self, lasted: Duration) -> Verdict {
        if lasted >= self.policy.stable_period {
            self.attempts = 0;
            Verdict::Retry {
                attempt: 0,
                delay: self.policy.delay,
            }
        } else {
            self.fail()
        }
    }

    fn fail(&mut self) -> Verdict {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.policy.max_attempts {
            Verdict::GiveUp {
                attempts: self.attempts,
            }
        } else {
            Verdict::Retry {
                attempt: self.attempts,
                delay: self.policy.delay,
            }
        }
    }
}
