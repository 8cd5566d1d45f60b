//! Link to the backend automation service.
//!
//! [`BackendLink`] keeps one session open through a [`BackendTransport`].
//! Each session opens with a `HANDSHAKE`, then a single loop multiplexes
//! three duties: writing queued outbound envelopes, emitting a `HEARTBEAT`
//! whenever the queue has been idle for the heartbeat interval, and
//! dispatching inbound envelopes. Lost sessions are retried under a
//! [`ReconnectPolicy`]; exhausting it is fatal.

pub mod message;
pub mod reconnect;
pub mod transport;
pub mod ws;

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{FutureExt, SinkExt, StreamExt};
use leaky_bucket::RateLimiter;
use log::{debug, error, info, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::{
    select,
    sync::{Mutex, mpsc},
    time::{Instant, sleep, sleep_until},
};
use tokio_util::sync::CancellationToken;

pub use self::{
    message::{BackendMessage, MessageKind, ResponseStatus},
    reconnect::{ReconnectPolicy, ReconnectTracker, Verdict},
    transport::{BackendChannel, BackendTransport, MessageSink, MessageStream},
    ws::WsTransport,
};
use crate::{
    config::{BackendConfig, ChunkingConfig},
    correlation::{CorrelationError, ResponseCorrelator},
    error::TransportError,
    fragment::{ChunkCodec, ChunkEnvelope, FragmentError, Reassembler, is_fragment},
    metrics::{self, Direction, Side},
    panic::report_panic,
    pipeline::HandlerError,
    state::{ConnectionState, StateCell},
};

/// Receives complete inbound backend payloads.
#[async_trait]
pub trait BackendHandler: Send + Sync {
    /// Handle one payload; `message` is the envelope that completed it.
    async fn on_backend_message(
        &self,
        message: BackendMessage,
        payload: Value,
    ) -> Result<(), HandlerError>;
}

/// Errors surfaced by the backend link.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Every reconnect attempt failed.
    #[error("backend unreachable after {attempts} attempts")]
    Unreachable { attempts: u32 },
    /// The link was stopped.
    #[error("backend link stopped")]
    Stopped,
    /// The payload could not be serialized.
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
    /// The payload could not be fragmented.
    #[error(transparent)]
    Fragment(#[from] FragmentError),
    /// The acknowledgement could not be awaited.
    #[error(transparent)]
    Correlation(#[from] CorrelationError),
}

/// Result of [`BackendLink::send`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued without requesting an acknowledgement.
    Queued,
    /// The backend acknowledged the message.
    Acknowledged(BackendMessage),
    /// The backend replied with a failure status.
    Rejected(BackendMessage),
    /// No acknowledgement arrived in time.
    TimedOut,
}

impl SendOutcome {
    /// Whether the message was queued or acknowledged.
    #[must_use]
    pub fn is_success(&self) -> bool { matches!(self, Self::Queued | Self::Acknowledged(_)) }
}

/// Manages the adapter's connection to the backend.
pub struct BackendLink {
    platform: String,
    config: BackendConfig,
    codec: ChunkCodec,
    pacer: Option<RateLimiter>,
    transport: Arc<dyn BackendTransport>,
    reassembler: Arc<Reassembler>,
    correlator: ResponseCorrelator<BackendMessage>,
    state: StateCell,
    outbound_tx: mpsc::Sender<BackendMessage>,
    outbound_rx: Mutex<mpsc::Receiver<BackendMessage>>,
    running: AtomicBool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for BackendLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendLink")
            .field("platform", &self.platform)
            .field("state", &self.state.get())
            .field("pending", &self.correlator.pending_len())
            .finish_non_exhaustive()
    }
}

impl BackendLink {
    /// Create a link that reaches the backend through `transport`.
    #[must_use]
    pub fn new(
        platform: impl Into<String>,
        config: BackendConfig,
        chunking: &ChunkingConfig,
        transport: Arc<dyn BackendTransport>,
        reassembler: Arc<Reassembler>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let delay = Duration::from_millis(chunking.inter_fragment_delay_ms);
        let pacer = (!delay.is_zero()).then(|| {
            RateLimiter::builder()
                .initial(1)
                .refill(1)
                .interval(delay)
                .max(1)
                .build()
        });
        Self {
            platform: platform.into(),
            config,
            codec: ChunkCodec::new(chunking.max_fragment_size()),
            pacer,
            transport,
            reassembler,
            correlator: ResponseCorrelator::new(Side::Backend),
            state: StateCell::new("backend"),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
            running: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
        }
    }

    /// Observable connection state.
    #[must_use]
    pub fn state(&self) -> &StateCell { &self.state }

    /// Correlator matching acknowledgements; swept by the adapter.
    #[must_use]
    pub fn correlator(&self) -> &ResponseCorrelator<BackendMessage> { &self.correlator }

    /// Whether the link accepts sends.
    #[must_use]
    pub fn is_running(&self) -> bool { self.running.load(Ordering::Acquire) }

    /// Whether a session is live.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.is_running() && self.state.get() == ConnectionState::Connected
    }

    fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.config.max_reconnect_attempts,
            delay: Duration::from_secs(self.config.reconnect_delay_secs),
            stable_period: Duration::from_secs(self.config.stable_period_secs),
        }
    }

    /// Keep a session open, delivering inbound payloads to `handler`, until
    /// [`stop`](Self::stop) is called.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Unreachable`] once the reconnect budget is
    /// spent.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    pub async fn run(&self, handler: &dyn BackendHandler) -> Result<(), BackendError> {
        let mut outbound = self.outbound_rx.lock().await;
        let mut reconnect = ReconnectTracker::new(self.policy());

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            self.state.transition(ConnectionState::Connecting);
            let connected = select! {
                biased;

                () = self.shutdown.cancelled() => return Ok(()),
                res = self.transport.connect() => res,
            };

            let verdict = match connected {
                Ok(channel) => {
                    self.state.transition(ConnectionState::Connected);
                    info!("backend connected: failed_attempts={}", reconnect.attempts());
                    metrics::inc_connections(Side::Backend);
                    let started = Instant::now();
                    let ended = self.session(channel, &mut outbound, handler).await;
                    metrics::dec_connections(Side::Backend);
                    let Err(e) = ended else {
                        return Ok(());
                    };
                    let lasted = started.elapsed();
                    metrics::inc_errors();
                    warn!("backend connection lost: error={e}, lasted={lasted:?}");
                    reconnect.on_session_end(lasted)
                }
                Err(e) => {
                    metrics::inc_errors();
                    warn!(
                        "backend connect failed: attempt={}, error={e}",
                        reconnect.attempts() + 1
                    );
                    reconnect.on_connect_failure()
                }
            };

            match verdict {
                Verdict::GiveUp { attempts } => {
                    error!("backend unreachable: attempts={attempts}");
                    self.state.transition(ConnectionState::Closing);
                    return Err(BackendError::Unreachable { attempts });
                }
                Verdict::Retry { attempt, delay } => {
                    self.state.transition(ConnectionState::Reconnecting);
                    info!("backend reconnecting: attempt={attempt}, delay={delay:?}");
                    select! {
                        biased;

                        () = self.shutdown.cancelled() => return Ok(()),
                        () = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Drive one session. Returns `Ok` when stopped and `Err` when lost.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    async fn session(
        &self,
        channel: BackendChannel,
        outbound: &mut mpsc::Receiver<BackendMessage>,
        handler: &dyn BackendHandler,
    ) -> Result<(), TransportError> {
        let BackendChannel {
            mut sink,
            mut stream,
        } = channel;
        sink.send(BackendMessage::handshake(&self.platform)).await?;
        debug!("backend handshake sent: platform={}", self.platform);

        let interval = Duration::from_secs(self.config.heartbeat_interval_secs);
        let heartbeat_enabled = !interval.is_zero();
        let mut next_heartbeat = Instant::now() + interval;

        loop {
            select! {
                biased;

                () = self.shutdown.cancelled() => {
                    if let Err(e) = sink.close().await {
                        debug!("backend close failed: error={e}");
                    }
                    return Ok(());
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(message)) => {
                        metrics::inc_frames(Side::Backend, Direction::Inbound);
                        if let Some(ack) = self.on_inbound(message, handler).await {
                            sink.send(ack).await?;
                            metrics::inc_frames(Side::Backend, Direction::Outbound);
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(TransportError::Closed),
                },
                Some(message) = outbound.recv() => {
                    let message_id = message.message_id.clone();
                    if let Err(e) = sink.send(message).await {
                        warn!("backend send failed: message_id={message_id}, error={e}");
                        return Err(e);
                    }
                    metrics::inc_frames(Side::Backend, Direction::Outbound);
                    next_heartbeat = Instant::now() + interval;
                }
                () = sleep_until(next_heartbeat), if heartbeat_enabled => {
                    sink.send(BackendMessage::heartbeat(&self.platform)).await?;
                    next_heartbeat = Instant::now() + interval;
                }
            }
        }
    }

    /// Dispatch one inbound envelope, returning the ACK to send, if any.
    async fn on_inbound(
        &self,
        message: BackendMessage,
        handler: &dyn BackendHandler,
    ) -> Option<BackendMessage> {
        let message = match self.correlator.try_resolve(message) {
            Ok(()) => return None,
            Err(message) => message,
        };
        if message.kind != MessageKind::Normal {
            debug!(
                "backend control message ignored: kind={:?}, message_id={}",
                message.kind, message.message_id
            );
            return None;
        }

        let payload = match message.payload_json() {
            Ok(payload) => payload,
            Err(e) => {
                metrics::inc_errors();
                warn!(
                    "backend payload dropped: message_id={}, error={e}",
                    message.message_id
                );
                return None;
            }
        };
        let ack = message.require_ack.then(|| message.ack(&self.platform));

        let payload = if is_fragment(&payload) {
            let complete = match ChunkEnvelope::from_value(&payload) {
                Ok(envelope) => self.reassembler.add_fragment(envelope),
                Err(e) => {
                    metrics::inc_fragments_dropped();
                    warn!(
                        "backend fragment dropped: message_id={}, error={e}",
                        message.message_id
                    );
                    None
                }
            };
            let Some(complete) = complete else {
                return ack;
            };
            complete
        } else {
            payload
        };

        let message_id = message.message_id.clone();
        let fut = handler.on_backend_message(message, payload);
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                metrics::inc_errors();
                warn!("backend handler failed: message_id={message_id}, error={e}");
            }
            Err(panic) => {
                report_panic(
                    "backend handler panicked",
                    &format!("message_id={message_id}"),
                    panic.as_ref(),
                );
            }
        }
        ack
    }

    /// Send `payload` to `target`, fragmenting it when it exceeds the limit.
    ///
    /// Fragments are queued in index order and paced by the configured
    /// inter-fragment delay. With `require_ack`, the call waits for the
    /// backend to acknowledge the message (for a fragmented payload, its
    /// final fragment) or for the response timeout.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Stopped`] once the link is stopped or stops
    /// while waiting, and [`BackendError::Encode`] or
    /// [`BackendError::Fragment`] when the payload cannot be prepared.
    pub async fn send(
        &self,
        payload: &Value,
        require_ack: bool,
        target: &str,
    ) -> Result<SendOutcome, BackendError> {
        if !self.is_running() {
            return Err(BackendError::Stopped);
        }
        let body = serde_json::to_string(payload).map_err(BackendError::Encode)?;
        let fragmented = self.codec.should_fragment(body.as_bytes());
        let mut messages: Vec<BackendMessage> = if fragmented {
            self.codec
                .fragment(body)?
                .iter()
                .map(|fragment| {
                    BackendMessage::normal(
                        &self.platform,
                        target,
                        fragment.to_value().to_string(),
                        false,
                    )
                })
                .collect()
        } else {
            vec![BackendMessage::normal(&self.platform, target, body, false)]
        };

        let waiter = match messages.last_mut() {
            Some(last) if require_ack => {
                last.require_ack = true;
                Some(
                    self.correlator
                        .register(last.message_id.clone(), self.response_timeout())?,
                )
            }
            _ => None,
        };

        let count = messages.len();
        for message in messages {
            if let Err(e) = self.enqueue(message, fragmented).await {
                if let Some(waiter) = &waiter {
                    self.correlator.cancel(waiter.request_id());
                }
                return Err(e);
            }
        }
        debug!("backend send queued: messages={count}, require_ack={require_ack}, target={target}");

        let Some(waiter) = waiter else {
            return Ok(SendOutcome::Queued);
        };
        let request_id = waiter.request_id().to_owned();
        match waiter.wait().await {
            Ok(reply) if reply.status == Some(ResponseStatus::Failure) => {
                warn!("backend rejected message: message_id={request_id}");
                Ok(SendOutcome::Rejected(reply))
            }
            Ok(reply) => Ok(SendOutcome::Acknowledged(reply)),
            Err(CorrelationError::TimedOut(_)) => {
                warn!("backend acknowledgement timed out: message_id={request_id}");
                Ok(SendOutcome::TimedOut)
            }
            Err(CorrelationError::Cancelled(_)) => Err(BackendError::Stopped),
            Err(e) => Err(e.into()),
        }
    }

    /// Reserve queue space, then wait on the pacer, then enqueue.
    ///
    /// Both waits give way to [`stop`](Self::stop).
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    async fn enqueue(&self, message: BackendMessage, paced: bool) -> Result<(), BackendError> {
        let permit = select! {
            biased;
            () = self.shutdown.cancelled() => return Err(BackendError::Stopped),
            permit = self.outbound_tx.reserve() => permit.map_err(|_| BackendError::Stopped)?,
        };
        if paced && let Some(pacer) = &self.pacer {
            select! {
                biased;
                () = self.shutdown.cancelled() => return Err(BackendError::Stopped),
                () = pacer.acquire(1) => {}
            }
        }
        if !self.is_running() {
            return Err(BackendError::Stopped);
        }
        permit.send(message);
        Ok(())
    }

    fn response_timeout(&self) -> Duration { Duration::from_secs(self.config.response_timeout_secs) }

    /// Stop the link: reject further sends, cancel pending acknowledgements,
    /// and close the live session.
    ///
    /// Calling this more than once has no further effect.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.state.transition(ConnectionState::Closing);
        self.shutdown.cancel();
        let cancelled = self.correlator.cancel_all();
        info!("backend link stopping: cancelled_waiters={cancelled}");
    }
}
