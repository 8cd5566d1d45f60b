//! Gateway connection tests over loopback WebSockets.

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use gatelink::{
    GatewayConnection,
    GatewayError,
    MessagePipeline,
    config::{ChunkingConfig, GatewayConfig, GatewayMode, PipelineConfig},
    fragment::{ChunkCodec, Reassembler},
    state::ConnectionState,
};
use gatelink_testing::{Recorder, Seen, heartbeat_event, message_event, notice_event, reply};
use rstest::rstest;
use serde_json::{Value, json};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_tungstenite::{
    MaybeTlsStream,
    WebSocketStream,
    accept_hdr_async,
    connect_async,
    tungstenite::{
        Error as WsError,
        Message,
        handshake::server::{Request, Response},
        http::{StatusCode, header::AUTHORIZATION},
    },
};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    gateway: Arc<GatewayConnection>,
    recorder: Arc<Recorder>,
    consumer_token: CancellationToken,
    consumer: JoinHandle<()>,
}

impl Harness {
    fn new(config: GatewayConfig) -> Self {
        let pipeline = Arc::new(MessagePipeline::new(&PipelineConfig {
            poll_timeout_ms: 50,
            yield_ms: 0,
            ..PipelineConfig::default()
        }));
        let gateway = Arc::new(GatewayConnection::new(
            config,
            Arc::new(Reassembler::new(
                ChunkingConfig::default().max_message_size(),
                Duration::from_secs(120),
            )),
            Arc::clone(&pipeline),
        ));
        let recorder = Recorder::new();
        let consumer_token = CancellationToken::new();
        let consumer = {
            let handlers = recorder.handlers();
            let token = consumer_token.clone();
            tokio::spawn(async move { pipeline.run(&handlers, &token).await })
        };
        Self {
            gateway,
            recorder,
            consumer_token,
            consumer,
        }
    }

    /// Serve reverse-mode connections on an ephemeral port.
    async fn listen(&self) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let gateway = Arc::clone(&self.gateway);
        let server = tokio::spawn(async move { gateway.serve_listener(listener).await });
        (format!("ws://{addr}"), server)
    }

    async fn wait_connected(&self) {
        timeout(WAIT, async {
            while !self.gateway.is_connected() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("gateway socket installed");
    }

    async fn finish(self) {
        self.gateway.stop();
        timeout(WAIT, self.gateway.wait_closed())
            .await
            .expect("sockets closed");
        self.consumer_token.cancel();
        self.consumer.await.expect("consumer task");
    }
}

fn reverse_config(access_token: &str) -> GatewayConfig {
    GatewayConfig {
        access_token: access_token.into(),
        heartbeat_interval_secs: 0,
        ..GatewayConfig::default()
    }
}

async fn send_json(client: &mut Client, value: &Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("client send");
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let message = timeout(WAIT, client.next())
            .await
            .expect("frame before timeout")
            .expect("stream open")
            .expect("frame");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).expect("json frame");
        }
    }
}

async fn next_close(client: &mut Client) {
    timeout(WAIT, async {
        while let Some(Ok(message)) = client.next().await {
            if message.is_close() {
                return;
            }
        }
    })
    .await
    .expect("socket closed before timeout");
}

/// Accept one forward-mode dial, capturing its authorization header.
async fn accept_dial(listener: &TcpListener) -> (WebSocketStream<TcpStream>, Option<String>) {
    let (stream, _) = timeout(WAIT, listener.accept())
        .await
        .expect("dial before timeout")
        .expect("accept");
    let mut authorization = None;
    let socket = accept_hdr_async(stream, |request: &Request, response: Response| {
        authorization = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        Ok(response)
    })
    .await
    .expect("upgrade");
    (socket, authorization)
}

#[rstest]
#[case::no_credentials("", false)]
#[case::query_token("?access_token=secret", true)]
#[tokio::test]
async fn reverse_upgrade_requires_the_access_token(#[case] query: &str, #[case] admitted: bool) {
    let harness = Harness::new(reverse_config("secret"));
    let (url, server) = harness.listen().await;

    let result = connect_async(format!("{url}/{query}")).await;
    if admitted {
        let (_client, _) = result.expect("authorized upgrade");
        harness.wait_connected().await;
        assert_eq!(harness.gateway.state().get(), ConnectionState::Connected);
    } else {
        match result {
            Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::UNAUTHORIZED),
            other => panic!("expected 401, got {other:?}"),
        }
        assert!(!harness.gateway.is_connected());
    }

    harness.finish().await;
    timeout(WAIT, server).await.expect("listener stopped").expect("listener task");
}

#[tokio::test]
async fn reverse_events_reach_their_handlers_in_order() {
    let harness = Harness::new(reverse_config(""));
    let (url, _server) = harness.listen().await;
    let (mut client, _) = connect_async(url).await.expect("connect");

    send_json(&mut client, &json!({"post_type": "bogus"})).await;
    send_json(&mut client, &message_event("hello")).await;
    send_json(&mut client, &notice_event("group_increase")).await;
    send_json(&mut client, &heartbeat_event()).await;
    client
        .send(Message::Text("not json".into()))
        .await
        .expect("client send");

    let seen = harness.recorder.wait_for(3).await;
    assert_eq!(
        seen,
        vec![
            Seen::Message(message_event("hello")),
            Seen::Notice(notice_event("group_increase")),
            Seen::MetaEvent(heartbeat_event()),
        ]
    );

    harness.finish().await;
    next_close(&mut client).await;
}

#[tokio::test]
async fn reverse_fragmented_event_is_dispatched_once() {
    let harness = Harness::new(reverse_config(""));
    let (url, _server) = harness.listen().await;
    let (mut client, _) = connect_async(url).await.expect("connect");
    let event = message_event(&"z".repeat(600));
    let codec = ChunkCodec::new(NonZeroUsize::new(128).expect("non-zero"));

    let fragments = codec.fragment(event.to_string()).expect("fragment");
    assert!(fragments.len() > 1);
    for fragment in fragments.iter().rev() {
        send_json(&mut client, &fragment.to_value()).await;
    }

    assert_eq!(harness.recorder.wait_for(1).await, vec![Seen::Message(event)]);
    harness.finish().await;
}

#[tokio::test]
async fn reverse_call_returns_the_matching_reply() {
    let harness = Harness::new(reverse_config(""));
    let (url, _server) = harness.listen().await;
    let (mut client, _) = connect_async(url).await.expect("connect");
    harness.wait_connected().await;

    let call = {
        let gateway = Arc::clone(&harness.gateway);
        tokio::spawn(async move { gateway.call("get_login_info", json!({})).await })
    };
    let request = next_json(&mut client).await;
    assert_eq!(request["action"], "get_login_info");
    let echo = request["echo"].as_str().expect("echo").to_owned();

    send_json(&mut client, &reply("someone-else", json!({}))).await;
    send_json(&mut client, &reply(&echo, json!({"user_id": 42}))).await;

    let frame = call.await.expect("call task").expect("reply");
    assert_eq!(frame.get("data"), Some(&json!({"user_id": 42})));
    assert_eq!(harness.gateway.correlator().pending_len(), 0);
    assert!(harness.recorder.seen().is_empty());
    harness.finish().await;
}

#[tokio::test]
async fn reverse_pending_calls_fail_on_stop() {
    let harness = Harness::new(reverse_config(""));
    let (url, _server) = harness.listen().await;
    let (mut client, _) = connect_async(url).await.expect("connect");
    harness.wait_connected().await;

    let call = {
        let gateway = Arc::clone(&harness.gateway);
        tokio::spawn(async move { gateway.call("get_status", json!({})).await })
    };
    let _request = next_json(&mut client).await;
    harness.gateway.stop();

    let result = call.await.expect("call task");
    assert!(matches!(result, Err(GatewayError::Correlation(_))));
    harness.finish().await;
}

#[tokio::test]
async fn reverse_pings_are_answered() {
    let harness = Harness::new(reverse_config(""));
    let (url, _server) = harness.listen().await;
    let (mut client, _) = connect_async(url).await.expect("connect");

    client
        .send(Message::Ping(b"are you there".to_vec().into()))
        .await
        .expect("ping");
    let pong = timeout(WAIT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Pong(payload))) => return payload,
                Some(Ok(_)) => {}
                other => panic!("socket ended before pong: {other:?}"),
            }
        }
    })
    .await
    .expect("pong before timeout");

    assert_eq!(&pong[..], b"are you there");
    harness.finish().await;
}

#[tokio::test]
async fn reverse_socket_closes_when_heartbeats_stop() {
    let harness = Harness::new(GatewayConfig {
        heartbeat_interval_secs: 1,
        heartbeat_miss_threshold: 1,
        ..reverse_config("")
    });
    let (url, _server) = harness.listen().await;
    let (mut client, _) = connect_async(url).await.expect("connect");

    send_json(&mut client, &heartbeat_event()).await;
    next_close(&mut client).await;

    let state = timeout(
        WAIT,
        harness.gateway.state().wait_for(ConnectionState::Reconnecting),
    )
    .await
    .expect("state settled");
    assert_eq!(state, ConnectionState::Reconnecting);
    assert!(!harness.gateway.is_connected());
    harness.finish().await;
}

#[tokio::test]
async fn forward_mode_presents_token_and_redials() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let harness = Harness::new(GatewayConfig {
        mode: GatewayMode::Forward,
        url: format!("ws://{addr}/"),
        access_token: "secret".into(),
        reconnect_interval_secs: 1,
        heartbeat_interval_secs: 0,
        ..GatewayConfig::default()
    });
    let dialer = {
        let gateway = Arc::clone(&harness.gateway);
        tokio::spawn(async move { gateway.run().await })
    };

    let (mut first, authorization) = accept_dial(&listener).await;
    assert_eq!(authorization.as_deref(), Some("Bearer secret"));
    first
        .send(Message::Text(message_event("first").to_string().into()))
        .await
        .expect("server send");
    assert_eq!(
        harness.recorder.wait_for(1).await,
        vec![Seen::Message(message_event("first"))]
    );
    drop(first);

    let (_second, _) = accept_dial(&listener).await;
    harness.wait_connected().await;
    assert_eq!(harness.gateway.state().get(), ConnectionState::Connected);

    harness.finish().await;
    let result = timeout(WAIT, dialer).await.expect("dialer stopped");
    assert!(result.expect("dialer task").is_ok());
}
