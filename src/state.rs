//! Connection lifecycle state shared by the gateway and backend sides.

use std::fmt;

use log::debug;
use tokio::sync::watch;

/// Lifecycle of one connection manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport and no attempt in progress.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// A transport is live.
    Connected,
    /// The transport failed and a new attempt is pending.
    Reconnecting,
    /// Teardown started; no further transitions happen.
    Closing,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{Closing, Connected, Connecting, Disconnected, Reconnecting};
        matches!(
            (self, next),
            (Disconnected | Reconnecting, Connecting)
                | (Connecting, Connected | Reconnecting)
                | (Connected, Reconnecting)
                | (Disconnected | Connecting | Connected | Reconnecting, Closing)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Closing => "CLOSING",
        };
        f.write_str(name)
    }
}

/// Observable holder of a [`ConnectionState`].
#[derive(Debug)]
pub struct StateCell {
    name: &'static str,
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    /// Create a cell in [`ConnectionState::Disconnected`].
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { name, tx }
    }

    /// Current state.
    #[must_use]
    pub fn get(&self) -> ConnectionState { *self.tx.borrow() }

    /// Move to `next` if the transition is legal.
    ///
    /// Returns `false` and leaves the state unchanged otherwise.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut applied = false;
        self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                debug!("state changed: connection={}, from={state}, to={next}", self.name);
                *state = next;
                applied = true;
            } else {
                debug!(
                    "state change rejected: connection={}, from={state}, to={next}",
                    self.name
                );
            }
            applied
        });
        applied
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> { self.tx.subscribe() }

    /// Wait until the state equals `target`.
    ///
    /// Returns immediately when already there. Returns the state at the time
    /// of the match, or the current state if the cell reaches
    /// [`ConnectionState::Closing`] first.
    pub async fn wait_for(&self, target: ConnectionState) -> ConnectionState {
        let mut rx = self.tx.subscribe();
        match rx
            .wait_for(|state| *state == target || *state == ConnectionState::Closing)
            .await
        {
            Ok(state) => *state,
            Err(_) => self.get(),
        }
    }
}
