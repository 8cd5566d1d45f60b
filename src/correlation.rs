//! Matching asynchronous replies to the requests that caused them.
//!
//! [`ResponseCorrelator`] keeps one pending entry per request identity. An
//! entry leaves the map exactly once: through [`ResponseCorrelator::resolve`]
//! when a matching reply arrives, through the deadline inside
//! [`Waiter::wait`] or [`ResponseCorrelator::sweep_expired`], or through
//! cancellation. Every path removes the entry under the map's per-key lock
//! before notifying the waiter, so whichever path wins, the others find
//! nothing to do.

use std::{fmt, sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use log::{debug, warn};
use thiserror::Error;
use tokio::{
    sync::oneshot,
    time::{Instant, sleep_until},
};

use crate::metrics::{self, Side};

/// Longest wait a single request may be registered for.
const MAX_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Access the correlation identity carried by a reply.
pub trait Correlatable {
    /// Return the identity this message answers, if any.
    fn correlation_id(&self) -> Option<String>;
}

/// Reasons a pending request ends without a reply.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    /// A request with the same identity is still pending.
    #[error("request {0} is already pending")]
    Duplicate(String),
    /// No reply arrived before the deadline.
    #[error("request {0} timed out")]
    TimedOut(String),
    /// The owning connection stopped before a reply arrived.
    #[error("request {0} was cancelled")]
    Cancelled(String),
}

type Outcome<T> = Result<T, CorrelationError>;

struct Pending<T> {
    deadline: Instant,
    tx: oneshot::Sender<Outcome<T>>,
}

/// Map of outstanding request identities to their waiters.
pub struct ResponseCorrelator<T> {
    side: Side,
    pending: Arc<DashMap<String, Pending<T>>>,
}

impl<T> Clone for ResponseCorrelator<T> {
    fn clone(&self) -> Self {
        Self {
            side: self.side,
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<T> fmt::Debug for ResponseCorrelator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCorrelator")
            .field("side", &self.side)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<T: Correlatable + Send + 'static> ResponseCorrelator<T> {
    /// Create an empty correlator for one side of the relay.
    #[must_use]
    pub fn new(side: Side) -> Self {
        Self {
            side,
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Register `request_id` and return a waiter that resolves within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::Duplicate`] if the identity is already
    /// pending; the existing entry is left untouched.
    pub fn register(
        &self,
        request_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Waiter<T>, CorrelationError> {
        let request_id = request_id.into();
        let deadline = Instant::now() + timeout.min(MAX_WAIT);
        match self.pending.entry(request_id) {
            Entry::Occupied(occupied) => Err(CorrelationError::Duplicate(occupied.key().clone())),
            Entry::Vacant(vacant) => {
                let (tx, rx) = oneshot::channel();
                let request_id = vacant.key().clone();
                vacant.insert(Pending { deadline, tx });
                Ok(Waiter {
                    request_id,
                    deadline,
                    rx,
                    correlator: self.clone(),
                })
            }
        }
    }

    /// Deliver `reply` to its waiter.
    ///
    /// Returns `false` when the reply matches nothing pending; such replies
    /// are discarded.
    pub fn resolve(&self, reply: T) -> bool {
        match self.try_resolve(reply) {
            Ok(()) => true,
            Err(reply) => {
                debug!(
                    "unsolicited reply discarded: side={}, request_id={:?}",
                    self.side,
                    reply.correlation_id()
                );
                false
            }
        }
    }

    /// Deliver `reply` to its waiter, handing it back when nothing matches.
    ///
    /// # Errors
    ///
    /// Returns the reply unchanged when its identity is absent or not
    /// pending.
    pub fn try_resolve(&self, reply: T) -> Result<(), T> {
        let Some(request_id) = reply.correlation_id() else {
            return Err(reply);
        };
        let Some((request_id, pending)) = self.pending.remove(&request_id) else {
            return Err(reply);
        };
        if pending.tx.send(Ok(reply)).is_err() {
            debug!(
                "reply arrived after waiter left: side={}, request_id={request_id}",
                self.side
            );
        }
        Ok(())
    }

    /// Whether `request_id` is still awaiting a reply.
    #[must_use]
    pub fn is_pending(&self, request_id: &str) -> bool { self.pending.contains_key(request_id) }

    /// Number of outstanding requests.
    #[must_use]
    pub fn pending_len(&self) -> usize { self.pending.len() }

    /// Expire entries past their deadline using the current time.
    pub fn sweep_expired(&self) -> usize { self.sweep_expired_at(Instant::now()) }

    /// Expire entries whose deadline is at or before `now`.
    ///
    /// Returns the number of entries expired.
    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();
        expired
            .into_iter()
            .filter(|request_id| self.expire(request_id, now))
            .count()
    }

    /// Fail `request_id` with [`CorrelationError::Cancelled`].
    ///
    /// Returns `false` when it was not pending.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.pending.remove(request_id) {
            Some((request_id, pending)) => {
                let _ = pending.tx.send(Err(CorrelationError::Cancelled(request_id)));
                true
            }
            None => false,
        }
    }

    /// Fail every pending request with [`CorrelationError::Cancelled`].
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let cancelled = ids.iter().filter(|id| self.cancel(id)).count();
        if cancelled > 0 {
            debug!("pending requests cancelled: side={}, count={cancelled}", self.side);
        }
        cancelled
    }

    fn expire(&self, request_id: &str, now: Instant) -> bool {
        let Some((request_id, pending)) = self
            .pending
            .remove_if(request_id, |_, pending| pending.deadline <= now)
        else {
            return false;
        };
        warn!("request timed out: side={}, request_id={request_id}", self.side);
        metrics::inc_correlation_timeouts(self.side);
        let _ = pending.tx.send(Err(CorrelationError::TimedOut(request_id)));
        true
    }
}

/// Handle returned by [`ResponseCorrelator::register`].
///
/// Dropping a waiter without awaiting it leaves the entry in place until a
/// reply or the sweep removes it.
pub struct Waiter<T> {
    request_id: String,
    deadline: Instant,
    rx: oneshot::Receiver<Outcome<T>>,
    correlator: ResponseCorrelator<T>,
}

impl<T> fmt::Debug for Waiter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("request_id", &self.request_id)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl<T: Correlatable + Send + 'static> Waiter<T> {
    /// Identity this waiter is registered under.
    #[must_use]
    pub fn request_id(&self) -> &str { &self.request_id }

    /// Suspend until the reply arrives, the deadline passes, or the request
    /// is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::TimedOut`] or
    /// [`CorrelationError::Cancelled`] when no reply was delivered.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    pub async fn wait(self) -> Result<T, CorrelationError> {
        let Self {
            request_id,
            deadline,
            mut rx,
            correlator,
        } = self;
        tokio::select! {
            biased;

            outcome = &mut rx => flatten(outcome, request_id),
            () = sleep_until(deadline) => {
                if correlator.expire(&request_id, Instant::now()) {
                    Err(CorrelationError::TimedOut(request_id))
                } else {
                    // Another path removed the entry first and owns the outcome.
                    flatten(rx.await, request_id)
                }
            }
        }
    }
}

fn flatten<T>(
    outcome: Result<Outcome<T>, oneshot::error::RecvError>,
    request_id: String,
) -> Result<T, CorrelationError> {
    outcome.unwrap_or_else(|_| Err(CorrelationError::Cancelled(request_id)))
}
