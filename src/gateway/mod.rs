//! Connection to the chat gateway.
//!
//! [`GatewayConnection`] either listens for the gateway's inbound WebSocket
//! (reverse mode) or dials out to it (forward mode). Every socket runs the
//! same receive loop: text frames are routed through the [`InboundRouter`],
//! pings are answered, and a heartbeat watchdog closes sockets whose
//! heartbeats stop. Outbound frames go to the most recently connected socket.

pub mod auth;
pub mod backoff;
mod forward;
pub mod heartbeat;
mod reverse;
pub mod router;

use std::sync::{
    Arc,
    Mutex,
    PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use derive_more::Display;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    select,
    sync::mpsc,
};
use tokio_tungstenite::{WebSocketStream, tungstenite::Message};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use uuid::Uuid;

pub use self::{
    backoff::AcceptBackoff,
    heartbeat::HeartbeatMonitor,
    router::{InboundRouter, Routed},
};
use crate::{
    config::{GatewayConfig, GatewayMode},
    correlation::{CorrelationError, ResponseCorrelator},
    error::TransportError,
    fragment::Reassembler,
    frame::Frame,
    metrics::{self, Direction, Side},
    pipeline::MessagePipeline,
    state::{ConnectionState, StateCell},
};

/// Errors surfaced by the gateway connection.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The reverse-mode listener could not bind.
    #[error("failed to bind gateway listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    /// No gateway socket is live.
    #[error("gateway is not connected")]
    NotConnected,
    /// The socket or upgrade request failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A call did not receive its reply.
    #[error(transparent)]
    Correlation(#[from] CorrelationError),
}

/// Why a socket's receive loop ended.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub(crate) enum SocketEnd {
    #[display("closed by peer")]
    Closed,
    #[display("transport error")]
    Failed,
    #[display("heartbeat lost")]
    HeartbeatLost,
    #[display("shutdown")]
    Shutdown,
}

#[derive(Debug)]
struct Writer {
    socket_id: u64,
    tx: mpsc::Sender<Message>,
}

/// Manages the adapter's connection to the chat gateway.
#[derive(Debug)]
pub struct GatewayConnection {
    config: GatewayConfig,
    state: StateCell,
    router: InboundRouter,
    correlator: ResponseCorrelator<Frame>,
    writer: Mutex<Option<Writer>>,
    next_socket_id: AtomicU64,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl GatewayConnection {
    /// Create a connection that feeds complete event frames into `pipeline`.
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        reassembler: Arc<Reassembler>,
        pipeline: Arc<MessagePipeline>,
    ) -> Self {
        let correlator = ResponseCorrelator::new(Side::Gateway);
        Self {
            config,
            state: StateCell::new("gateway"),
            router: InboundRouter::new(reassembler, correlator.clone(), pipeline),
            correlator,
            writer: Mutex::new(None),
            next_socket_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig { &self.config }

    /// Observable connection state.
    #[must_use]
    pub fn state(&self) -> &StateCell { &self.state }

    /// Correlator matching call replies; swept by the adapter.
    #[must_use]
    pub fn correlator(&self) -> &ResponseCorrelator<Frame> { &self.correlator }

    /// Whether a socket is available for outbound frames.
    #[must_use]
    pub fn is_connected(&self) -> bool { self.writer_tx().is_some() }

    /// Run in the configured mode until [`stop`](Self::stop) is called.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Bind`] when the reverse-mode listener cannot
    /// bind and [`GatewayError::Transport`] when the forward-mode URL is
    /// invalid. Connection failures after startup are retried, not returned.
    pub async fn run(self: &Arc<Self>) -> Result<(), GatewayError> {
        match self.config.mode {
            GatewayMode::Reverse => {
                let listener = reverse::bind(&self.config.listen_addr()).await?;
                self.serve_listener(listener).await;
                Ok(())
            }
            GatewayMode::Forward => forward::dial_loop(self).await,
        }
    }

    /// Accept gateway sockets from an already bound listener until stopped.
    pub async fn serve_listener(self: &Arc<Self>, listener: TcpListener) {
        reverse::accept_loop(self, &listener, AcceptBackoff::from_config(&self.config)).await;
    }

    /// Invoke a gateway action and wait for its reply.
    ///
    /// The request carries a fresh `echo` identity; the reply frame with the
    /// same `echo` is returned whatever its status.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotConnected`] when no socket is live and
    /// [`GatewayError::Correlation`] when the reply does not arrive in time.
    pub async fn call(&self, action: &str, params: Value) -> Result<Frame, GatewayError> {
        let tx = self.writer_tx().ok_or(GatewayError::NotConnected)?;
        let echo = Uuid::new_v4().to_string();
        let waiter = self
            .correlator
            .register(echo.clone(), self.config.response_timeout())?;
        let request = json!({"action": action, "params": params, "echo": echo});
        if tx.send(Message::Text(request.to_string().into())).await.is_err() {
            self.correlator.cancel(&echo);
            return Err(GatewayError::NotConnected);
        }
        debug!("gateway call sent: action={action}, echo={echo}");
        Ok(waiter.wait().await?)
    }

    /// Write a frame to the gateway without waiting for a reply.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotConnected`] when no socket is live.
    pub async fn send_frame(&self, frame: &Value) -> Result<(), GatewayError> {
        let tx = self.writer_tx().ok_or(GatewayError::NotConnected)?;
        tx.send(Message::Text(frame.to_string().into()))
            .await
            .map_err(|_| GatewayError::NotConnected)
    }

    /// Stop accepting or dialling, close live sockets, and fail pending calls.
    ///
    /// Calling this more than once has no further effect.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.transition(ConnectionState::Closing);
        self.shutdown.cancel();
        self.correlator.cancel_all();
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!("gateway connection stopping");
    }

    /// Wait for every socket task to finish. Only meaningful after
    /// [`stop`](Self::stop).
    pub async fn wait_closed(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Run the receive loop for one socket until it ends.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    pub(crate) async fn serve_socket<S>(&self, socket: WebSocketStream<S>, peer: &str) -> SocketEnd
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let socket_id = self.install_writer(tx);
        let mut heartbeat = HeartbeatMonitor::new(self.config.heartbeat_deadline());
        metrics::inc_connections(Side::Gateway);

        let end = loop {
            select! {
                biased;

                () = self.shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break SocketEnd::Shutdown;
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        metrics::inc_frames(Side::Gateway, Direction::Inbound);
                        if self.router.route_text(text.as_str()).await.is_heartbeat() {
                            heartbeat.record();
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        metrics::inc_frames(Side::Gateway, Direction::Inbound);
                        match std::str::from_utf8(&bytes) {
                            Ok(text) => {
                                if self.router.route_text(text).await.is_heartbeat() {
                                    heartbeat.record();
                                }
                            }
                            Err(e) => warn!("gateway frame dropped: peer={peer}, error={e}"),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = sink.send(Message::Pong(payload)).await {
                            warn!("gateway pong failed: peer={peer}, error={e}");
                            break SocketEnd::Failed;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break SocketEnd::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        metrics::inc_errors();
                        warn!("gateway receive failed: peer={peer}, error={e}");
                        break SocketEnd::Failed;
                    }
                },
                Some(outbound) = rx.recv() => {
                    if let Err(e) = sink.send(outbound).await {
                        metrics::inc_errors();
                        warn!("gateway send failed: peer={peer}, error={e}");
                        break SocketEnd::Failed;
                    }
                    metrics::inc_frames(Side::Gateway, Direction::Outbound);
                }
                () = heartbeat.expired() => {
                    warn!(
                        "gateway heartbeat lost: peer={peer}, missed={}",
                        self.config.heartbeat_miss_threshold
                    );
                    let _ = sink.send(Message::Close(None)).await;
                    break SocketEnd::HeartbeatLost;
                }
            }
        };

        self.release_writer(socket_id);
        metrics::dec_connections(Side::Gateway);
        end
    }

    fn install_writer(&self, tx: mpsc::Sender<Message>) -> u64 {
        let socket_id = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if writer.is_some() {
            debug!("gateway writer replaced: socket_id={socket_id}");
        }
        *writer = Some(Writer { socket_id, tx });
        socket_id
    }

    /// Clear the writer if it still belongs to `socket_id`.
    fn release_writer(&self, socket_id: u64) -> bool {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if writer.as_ref().is_some_and(|w| w.socket_id == socket_id) {
            *writer = None;
            true
        } else {
            false
        }
    }

    fn writer_tx(&self) -> Option<mpsc::Sender<Message>> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|w| w.tx.clone())
    }
}
