use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use duet_relay::{RelayConfig, RelayRegistry, RelayServer};
use duet_session::engine::ScriptedEngine;
use duet_session::{
    call_channel, CallConfig, CallDriver, CallEvent, CallHandle, ConnectionStatus,
    IceCandidate, Negotiator, SignalingClient, SignalingError, SignalingMessage,
};

struct TestRelay {
    url: String,
    registry: RelayRegistry,
    _shutdown: oneshot::Sender<()>,
}

async fn start_relay() -> TestRelay {
    let config = RelayConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ..RelayConfig::default()
    };
    let server = RelayServer::bind(&config, None).await.unwrap();
    let addr = server.local_addr().unwrap();
    let registry = server.registry();
    let (shutdown, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(server.run_until(async move {
        let _ = shutdown_rx.await;
    }));
    TestRelay {
        url: format!("ws://{addr}"),
        registry,
        _shutdown: shutdown,
    }
}

impl TestRelay {
    async fn wait_for_connections(&self, expected: usize) {
        while self.registry.len() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[test_timeout::tokio_timeout_test]
async fn messages_cross_the_relay() {
    let relay = start_relay().await;
    let (alice, mut alice_inbound) = SignalingClient::connect(&relay.url).await.unwrap();
    let (bob, mut bob_inbound) = SignalingClient::connect(&relay.url).await.unwrap();
    relay.wait_for_connections(2).await;

    alice
        .send(SignalingMessage::Offer { sdp: "v=0".into() })
        .unwrap();
    assert_eq!(
        bob_inbound.recv().await,
        Some(SignalingMessage::Offer { sdp: "v=0".into() })
    );

    let candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host", None, "");
    bob.send(SignalingMessage::Candidate(candidate.clone()))
        .unwrap();
    assert_eq!(
        alice_inbound.recv().await,
        Some(SignalingMessage::Candidate(candidate))
    );
}

#[test_timeout::tokio_timeout_test]
async fn undecodable_frames_are_skipped() {
    let relay = start_relay().await;
    let (_listener, mut inbound) = SignalingClient::connect(&relay.url).await.unwrap();
    let (mut raw, _) = connect_async(relay.url.as_str()).await.unwrap();
    relay.wait_for_connections(2).await;

    raw.send(Message::Text("not json at all".into()))
        .await
        .unwrap();
    raw.send(Message::Text(r#"{"type":"bye"}"#.into()))
        .await
        .unwrap();
    raw.send(Message::Text(r#"{"type":"answer"}"#.into()))
        .await
        .unwrap();
    raw.send(Message::Binary(
        br#"{"type":"answer","sdp":"binary-ok"}"#.to_vec(),
    ))
    .await
    .unwrap();

    assert_eq!(
        inbound.recv().await,
        Some(SignalingMessage::Answer {
            sdp: "binary-ok".into()
        })
    );
}

#[test_timeout::tokio_timeout_test]
async fn unreachable_relay_is_reported() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = SignalingClient::connect(&format!("ws://{addr}")).await;
    assert!(matches!(result, Err(SignalingError::Connect(_))));
}

struct RelayPeer {
    handle: CallHandle,
    events: mpsc::UnboundedReceiver<CallEvent>,
    _client: SignalingClient,
}

async fn join_call(relay: &TestRelay, label: &str, local: IceCandidate) -> RelayPeer {
    let (client, mut inbound) = SignalingClient::connect(&relay.url).await.unwrap();
    let (handle, queue) = call_channel();
    let engine = Arc::new(
        ScriptedEngine::new(label)
            .with_sink(handle.engine_events())
            .with_local_candidates(vec![local])
            .with_auto_connect(),
    );
    let (events_tx, events) = mpsc::unbounded_channel();
    let negotiator = Negotiator::new(engine, client.outbound(), events_tx, &CallConfig::default());
    CallDriver::new(negotiator, queue).spawn();

    let inbound_handle = handle.clone();
    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            if inbound_handle.deliver(message).is_err() {
                break;
            }
        }
    });

    RelayPeer {
        handle,
        events,
        _client: client,
    }
}

async fn wait_for_status(peer: &mut RelayPeer, status: ConnectionStatus) {
    while let Some(event) = peer.events.recv().await {
        if event == CallEvent::ConnectionStateChanged(status) {
            return;
        }
    }
    panic!("event stream ended before {status}");
}

#[test_timeout::tokio_timeout_test]
async fn two_peers_connect_through_the_relay() {
    let relay = start_relay().await;
    let mut alice = join_call(
        &relay,
        "alice",
        IceCandidate::new("candidate:a 1 udp 1 10.0.0.1 5000 typ host", Some(0), "0"),
    )
    .await;
    let mut bob = join_call(
        &relay,
        "bob",
        IceCandidate::new("candidate:b 1 udp 1 10.0.0.2 5000 typ host", Some(0), "0"),
    )
    .await;
    relay.wait_for_connections(2).await;

    alice.handle.start_call().unwrap();
    wait_for_status(&mut alice, ConnectionStatus::Connected).await;
    wait_for_status(&mut bob, ConnectionStatus::Connected).await;

    alice.handle.end_call().unwrap();
    wait_for_status(&mut alice, ConnectionStatus::Closed).await;
}
