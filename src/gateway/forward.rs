//! Forward mode: dial out to the gateway and redial on loss.
//!
//! The gateway is a hard upstream dependency, so there is no attempt cap:
//! the loop retries at a fixed interval until the connection is stopped.

use std::sync::Arc;

use log::{info, warn};
use tokio::{select, time::sleep};
use tokio_tungstenite::connect_async;

use super::{GatewayConnection, GatewayError, SocketEnd, auth};
use crate::state::ConnectionState;

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
pub(super) async fn dial_loop(conn: &Arc<GatewayConnection>) -> Result<(), GatewayError> {
    let url = conn.config.dial_url();
    let interval = conn.config.reconnect_interval();

    loop {
        if conn.shutdown.is_cancelled() {
            return Ok(());
        }
        conn.state.transition(ConnectionState::Connecting);
        let request = auth::client_request(&url, &conn.config.access_token)?;
        let connected = select! {
            biased;

            () = conn.shutdown.cancelled() => return Ok(()),
            res = connect_async(request) => res,
        };

        match connected {
            Ok((socket, _response)) => {
                conn.state.transition(ConnectionState::Connected);
                info!("gateway connected: mode=forward, url={url}");
                let end = conn.serve_socket(socket, &url).await;
                info!("gateway disconnected: url={url}, reason={end}");
                if end == SocketEnd::Shutdown {
                    return Ok(());
                }
            }
            Err(e) => {
                warn!("gateway dial failed: url={url}, error={e}, retry_in={interval:?}");
            }
        }
        conn.state.transition(ConnectionState::Reconnecting);

        select! {
            biased;

            () = conn.shutdown.cancelled() => return Ok(()),
            () = sleep(interval) => {}
        }
    }
}
