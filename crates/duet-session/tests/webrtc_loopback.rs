use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use duet_proto::{decode, encode};
use duet_session::engine::WebRtcEngine;
use duet_session::{
    call_channel, CallConfig, CallDriver, CallEvent, CallHandle, ConnectionStatus, MediaKind,
    Negotiator, SignalingMessage,
};

struct Peer {
    handle: CallHandle,
    engine: Arc<WebRtcEngine>,
    events: mpsc::UnboundedReceiver<CallEvent>,
    outbound: Option<mpsc::UnboundedReceiver<SignalingMessage>>,
}

/// Host candidates only; no STUN traffic leaves the machine.
fn loopback_config() -> CallConfig {
    CallConfig::default().with_ice_servers(Vec::<String>::new())
}

async fn spawn_peer() -> Peer {
    let config = loopback_config();
    let (handle, queue) = call_channel();
    let engine = Arc::new(
        WebRtcEngine::new(&config, handle.engine_events())
            .await
            .expect("peer connection"),
    );
    let (outbound_tx, outbound) = mpsc::unbounded_channel();
    let (events_tx, events) = mpsc::unbounded_channel();
    let mut negotiator = Negotiator::new(engine.clone(), outbound_tx, events_tx, &config);
    negotiator.prepare_media().await.expect("local media");
    CallDriver::new(negotiator, queue).spawn();
    Peer {
        handle,
        engine,
        events,
        outbound: Some(outbound),
    }
}

fn wire(from: &mut Peer, to: CallHandle) -> JoinHandle<()> {
    let mut outbound = from.outbound.take().expect("peer already wired");
    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let bytes = encode(&message).expect("encode");
            if to.deliver(decode(&bytes).expect("decode")).is_err() {
                break;
            }
        }
    })
}

async fn wait_for_status(peer: &mut Peer, status: ConnectionStatus) -> Vec<CallEvent> {
    let mut seen = Vec::new();
    while let Some(event) = peer.events.recv().await {
        let done = event == CallEvent::ConnectionStateChanged(status);
        seen.push(event);
        if done {
            return seen;
        }
    }
    panic!("event stream ended before {status}; saw {seen:?}");
}

#[test_timeout::tokio_timeout_test]
async fn two_webrtc_peers_connect() {
    let mut alice = spawn_peer().await;
    let mut bob = spawn_peer().await;
    let _ab = wire(&mut alice, bob.handle.clone());
    let _ba = wire(&mut bob, alice.handle.clone());

    alice.handle.start_call().unwrap();
    let alice_events = wait_for_status(&mut alice, ConnectionStatus::Connected).await;
    wait_for_status(&mut bob, ConnectionStatus::Connected).await;

    assert!(matches!(
        alice_events.first(),
        Some(CallEvent::LocalStreamReady(media))
            if media.video.kind == MediaKind::Video && media.audio.stream_id == "localStream"
    ));
    assert!(alice.engine.local_video_track().is_some());
    assert!(bob.engine.local_audio_track().is_some());

    alice.handle.end_call().unwrap();
    wait_for_status(&mut alice, ConnectionStatus::Closed).await;
}
