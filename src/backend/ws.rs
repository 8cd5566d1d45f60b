//! WebSocket transport carrying JSON envelopes, one per text frame.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, future};
use log::{debug, warn};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{BackendChannel, BackendMessage, BackendTransport};
use crate::{error::TransportError, gateway::auth::client_request};

/// Router-style backend transport over a WebSocket.
#[derive(Clone, Debug)]
pub struct WsTransport {
    url: String,
    access_token: String,
}

impl WsTransport {
    #[must_use]
    pub fn new(url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            access_token: access_token.into(),
        }
    }

    #[must_use]
    pub fn url(&self) -> &str { &self.url }
}

#[async_trait]
impl BackendTransport for WsTransport {
    async fn connect(&self) -> Result<BackendChannel, TransportError> {
        let request = client_request(&self.url, &self.access_token)?;
        let (socket, _response) = connect_async(request).await?;
        debug!("backend socket open: url={}", self.url);
        let (sink, stream) = socket.split();

        let sink = sink
            .sink_map_err(TransportError::from)
            .with(|message: BackendMessage| {
                future::ready(
                    serde_json::to_string(&message)
                        .map(|text| Message::Text(text.into()))
                        .map_err(TransportError::Encode),
                )
            });
        let stream = stream.filter_map(|frame| future::ready(decode(frame)));
        Ok(BackendChannel::new(Box::pin(sink), Box::pin(stream)))
    }
}

fn decode(
    frame: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<BackendMessage, TransportError>> {
    match frame {
        Ok(Message::Text(text)) => match serde_json::from_str(text.as_str()) {
            Ok(message) => Some(Ok(message)),
            Err(e) => {
                warn!("backend envelope dropped: error={e}");
                None
            }
        },
        Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
        Ok(_) => None,
        Err(e) => Some(Err(e.into())),
    }
}

#[cfg(test)]
mod tests {
    use tokio_tungstenite::tungstenite::Message;

    use super::*;
    use crate::backend::MessageKind;

    #[test]
    fn text_frames_decode_to_envelopes() {
        let frame = Message::Text(r#"{"message_id":"m","type":"HEARTBEAT"}"#.into());
        let message = decode(Ok(frame)).expect("item").expect("envelope");
        assert_eq!(message.kind, MessageKind::Heartbeat);
    }

    #[test]
    fn malformed_envelopes_are_skipped() {
        assert!(decode(Ok(Message::Text("nope".into()))).is_none());
        assert!(decode(Ok(Message::Ping(Vec::new().into()))).is_none());
    }

    #[test]
    fn close_ends_the_session() {
        assert!(matches!(
            decode(Ok(Message::Close(None))),
            Some(Err(TransportError::Closed))
        ));
    }
}
