#![doc(html_root_url = "https://docs.rs/gatelink/latest")]
//! Public API for the `gatelink` library.
//!
//! This crate relays traffic between a chat-bot WebSocket gateway and a
//! backend automation service. It provides payload chunking and reassembly,
//! reply correlation, connection managers for both sides with reconnect and
//! heartbeat handling, a dispatch pipeline, and ordered shutdown.

pub mod adapter;
pub mod backend;
pub mod config;
pub mod correlation;
pub mod error;
pub mod fragment;
pub mod frame;
pub mod gateway;
pub mod metrics;
pub mod panic;
pub mod pipeline;
pub mod relay;
pub mod shutdown;
pub mod state;
pub mod sweep;

mod test_helpers;

pub use adapter::Adapter;
pub use backend::{BackendError, BackendHandler, BackendLink, BackendMessage, SendOutcome};
pub use config::AdapterConfig;
pub use correlation::{Correlatable, CorrelationError, ResponseCorrelator};
pub use error::{AdapterError, ProtocolError, TransportError};
pub use fragment::{ChunkCodec, ChunkEnvelope, FragmentError, Reassembler};
pub use frame::{Frame, FrameKind};
pub use gateway::{GatewayConnection, GatewayError};
pub use metrics::{CONNECTIONS_ACTIVE, Direction, ERRORS_TOTAL, FRAMES_PROCESSED, Side};
pub use pipeline::{
    HandlerError,
    Handlers,
    MessageHandler,
    MessagePipeline,
    MetaEventHandler,
    NoticeHandler,
};
pub use shutdown::{ShutdownCoordinator, Teardown};
pub use state::{ConnectionState, StateCell};
