//! Reverse mode: accept the gateway's inbound WebSocket connections.

use std::{net::SocketAddr, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use log::{info, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    time::sleep,
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
    },
};

use super::{AcceptBackoff, GatewayConnection, GatewayError, SocketEnd, auth};
use crate::{panic::report_panic, state::ConnectionState};

pub(super) async fn bind(addr: &str) -> Result<TcpListener, GatewayError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| GatewayError::Bind {
            addr: addr.to_owned(),
            source,
        })?;
    Ok(listener)
}

/// Accept sockets until the connection is stopped.
///
/// Failed `accept()` calls wait out `backoff` before retrying; each
/// accepted socket is upgraded and served on its own tracked task.
pub(super) async fn accept_loop(
    conn: &Arc<GatewayConnection>,
    listener: &TcpListener,
    mut backoff: AcceptBackoff,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("gateway listening: mode=reverse, addr={addr}");
    }
    while accept_iteration(conn, listener, &mut backoff).await {}
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn accept_iteration(
    conn: &Arc<GatewayConnection>,
    listener: &TcpListener,
    backoff: &mut AcceptBackoff,
) -> bool {
    select! {
        biased;

        () = conn.shutdown.cancelled() => false,
        res = listener.accept() => {
            match res {
                Ok((stream, peer_addr)) => {
                    backoff.on_success();
                    spawn_socket_task(Arc::clone(conn), stream, peer_addr);
                }
                Err(e) => {
                    let delay = backoff.on_failure();
                    let local_addr = listener.local_addr().ok();
                    warn!("accept error: error={e:?}, local_addr={local_addr:?}, retry_in={delay:?}");
                    sleep(delay).await;
                }
            }
            true
        }
    }
}

/// Serve one accepted socket on a tracked task, logging and discarding panics.
fn spawn_socket_task(conn: Arc<GatewayConnection>, stream: TcpStream, peer_addr: SocketAddr) {
    let tracker = conn.tracker.clone();
    tracker.spawn(async move {
        let fut = AssertUnwindSafe(handle_stream(conn, stream, peer_addr)).catch_unwind();
        if let Err(panic) = fut.await {
            report_panic(
                "gateway socket task panicked",
                &format!("peer_addr={peer_addr}"),
                panic.as_ref(),
            );
        }
    });
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn handle_stream(conn: Arc<GatewayConnection>, stream: TcpStream, peer_addr: SocketAddr) {
    let token = conn.config.access_token.clone();
    let check = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if auth::is_authorized(request, &token) {
            Ok(response)
        } else {
            warn!("gateway connection rejected: peer_addr={peer_addr}, reason=unauthorized");
            Err(unauthorized())
        }
    };

    let upgraded = select! {
        biased;

        () = conn.shutdown.cancelled() => return,
        res = accept_hdr_async(stream, check) => res,
    };
    let socket = match upgraded {
        Ok(socket) => socket,
        Err(e) => {
            warn!("gateway handshake failed: peer_addr={peer_addr}, error={e}");
            return;
        }
    };

    conn.state.transition(ConnectionState::Connecting);
    conn.state.transition(ConnectionState::Connected);
    info!("gateway connected: mode=reverse, peer_addr={peer_addr}");
    let end = conn.serve_socket(socket, &peer_addr.to_string()).await;
    info!("gateway disconnected: peer_addr={peer_addr}, reason={end}");
    if end != SocketEnd::Shutdown && !conn.is_connected() {
        conn.state.transition(ConnectionState::Reconnecting);
    }
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("unauthorized".to_owned()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}
