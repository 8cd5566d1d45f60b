//! Test doubles for driving `gatelink` components without real peers.
//!
//! [`ScriptedTransport`] stands in for the backend: each connect attempt
//! follows a script, and every accepted session hands the test a
//! [`RemoteEnd`] to read what the link sent and to push replies back.
//! [`Recorder`] implements every handler trait and remembers what it saw.

pub mod frames;
pub mod handlers;
pub mod logging;
pub mod transport;

pub use frames::{heartbeat_event, message_event, notice_event, reply};
pub use handlers::{Recorder, Seen};
pub use logging::{LoggerHandle, logger};
pub use transport::{ConnectStep, RemoteEnd, ScriptedTransport};
