use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use duet_proto::{decode, encode};
use duet_session::engine::{EngineCall, ScriptedEngine};
use duet_session::{
    call_channel, CallConfig, CallDriver, CallEvent, CallHandle, Connectivity, ConnectionStatus,
    EngineEvent, EngineOp, IceCandidate, Negotiator, SessionError, SignalingMessage,
};

struct Peer {
    handle: CallHandle,
    engine: Arc<ScriptedEngine>,
    events: mpsc::UnboundedReceiver<CallEvent>,
    outbound: Option<mpsc::UnboundedReceiver<SignalingMessage>>,
    driver: JoinHandle<()>,
}

fn candidate(label: &str, n: u32) -> IceCandidate {
    IceCandidate::new(
        format!("candidate:{label}{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"),
        Some(0),
        "0",
    )
}

fn spawn_peer(label: &str, local_candidates: Vec<IceCandidate>) -> Peer {
    let (handle, queue) = call_channel();
    let engine = Arc::new(
        ScriptedEngine::new(label)
            .with_sink(handle.engine_events())
            .with_local_candidates(local_candidates)
            .with_auto_connect(),
    );
    let (outbound_tx, outbound) = mpsc::unbounded_channel();
    let (events_tx, events) = mpsc::unbounded_channel();
    let negotiator = Negotiator::new(engine.clone(), outbound_tx, events_tx, &CallConfig::default());
    let driver = CallDriver::new(negotiator, queue).spawn();
    Peer {
        handle,
        engine,
        events,
        outbound: Some(outbound),
        driver,
    }
}

/// Forwards everything `from` sends to `to` through the wire codec.
fn wire(from: &mut Peer, to: CallHandle) -> JoinHandle<()> {
    let mut outbound = from.outbound.take().expect("peer already wired");
    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let bytes = encode(&message).expect("encode");
            let decoded = decode(&bytes).expect("codec round trip");
            if to.deliver(decoded).is_err() {
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

async fn eventually(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[test_timeout::tokio_timeout_test]
async fn caller_and_callee_reach_connected() {
    let mut alice = spawn_peer("alice", vec![candidate("a", 1), candidate("a", 2)]);
    let mut bob = spawn_peer("bob", vec![candidate("b", 1)]);
    let _ab = wire(&mut alice, bob.handle.clone());
    let _ba = wire(&mut bob, alice.handle.clone());

    alice.handle.start_call().unwrap();

    let alice_events = wait_for_status(&mut alice, ConnectionStatus::Connected).await;
    let bob_events = wait_for_status(&mut bob, ConnectionStatus::Connected).await;
    assert_eq!(
        alice_events.first(),
        Some(&CallEvent::ConnectionStateChanged(ConnectionStatus::Negotiating))
    );
    assert_eq!(
        bob_events.first(),
        Some(&CallEvent::ConnectionStateChanged(ConnectionStatus::Negotiating))
    );

    assert_eq!(alice.engine.remote_candidates(), vec![candidate("b", 1)]);
    assert_eq!(
        bob.engine.remote_candidates(),
        vec![candidate("a", 1), candidate("a", 2)]
    );

    // Each side applied the other's description before any of its candidates.
    for engine in [&alice.engine, &bob.engine] {
        let calls = engine.calls();
        let remote_at = calls
            .iter()
            .position(|call| call.op() == EngineOp::SetRemoteDescription)
            .unwrap();
        let first_candidate_at = calls
            .iter()
            .position(|call| call.op() == EngineOp::AddRemoteCandidate)
            .unwrap();
        assert!(remote_at < first_candidate_at);
    }

    let offer_sdp = alice
        .engine
        .calls()
        .into_iter()
        .find_map(|call| match call {
            EngineCall::SetLocalDescription(description) => Some(description.sdp),
            _ => None,
        })
        .unwrap();
    assert!(bob.engine.calls().iter().any(|call| matches!(
        call,
        EngineCall::SetRemoteDescription(description) if description.sdp == offer_sdp
    )));
}

#[test_timeout::tokio_timeout_test]
async fn hang_up_before_answer_closes_and_ignores_late_messages() {
    let mut alice = spawn_peer("alice", vec![]);
    let mut outbound = alice.outbound.take().unwrap();

    alice.handle.start_call().unwrap();
    let offer = outbound.recv().await.unwrap();
    assert!(matches!(offer, SignalingMessage::Offer { .. }));

    alice.handle.end_call().unwrap();
    wait_for_status(&mut alice, ConnectionStatus::Closed).await;
    alice.driver.await.unwrap();
    assert!(alice.handle.is_closed());

    assert_eq!(
        alice.handle.deliver(SignalingMessage::Answer { sdp: "late".into() }),
        Err(SessionError::Closed)
    );
    assert_eq!(
        alice
            .handle
            .deliver(SignalingMessage::Candidate(candidate("b", 1))),
        Err(SessionError::Closed)
    );
    assert!(!alice
        .engine
        .report(EngineEvent::Connectivity(Connectivity::Connected)));

    assert!(alice.engine.is_closed());
    assert_eq!(alice.engine.call_count(EngineOp::SetRemoteDescription), 0);
    assert_eq!(alice.engine.call_count(EngineOp::AddRemoteCandidate), 0);
}

#[test_timeout::tokio_timeout_test]
async fn hang_up_cancels_in_flight_offer() {
    let mut alice = spawn_peer("alice", vec![candidate("a", 1)]);
    let mut outbound = alice.outbound.take().unwrap();
    let gate = alice.engine.hold(EngineOp::SetLocalDescription);

    alice.handle.start_call().unwrap();
    gate.entered().await;
    alice.handle.end_call().unwrap();

    alice.driver.await.unwrap();
    assert!(outbound.try_recv().is_err(), "offer must not be sent");
    assert!(alice.engine.is_closed());

    let mut events = Vec::new();
    while let Ok(event) = alice.events.try_recv() {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![CallEvent::ConnectionStateChanged(ConnectionStatus::Closed)]
    );
}

#[test_timeout::tokio_timeout_test]
async fn events_arriving_mid_operation_keep_their_order() {
    let mut bob = spawn_peer("bob", vec![]);
    let mut outbound = bob.outbound.take().unwrap();
    let gate = bob.engine.hold(EngineOp::SetRemoteDescription);

    bob.handle
        .deliver(SignalingMessage::Offer { sdp: "offer".into() })
        .unwrap();
    gate.entered().await;
    bob.handle
        .deliver(SignalingMessage::Candidate(candidate("a", 1)))
        .unwrap();
    bob.handle
        .deliver(SignalingMessage::Candidate(candidate("a", 2)))
        .unwrap();
    gate.release();

    assert!(matches!(
        outbound.recv().await,
        Some(SignalingMessage::Answer { .. })
    ));
    let engine = bob.engine.clone();
    eventually(move || engine.call_count(EngineOp::AddRemoteCandidate) == 2).await;

    let ops: Vec<EngineOp> = bob.engine.calls().iter().map(EngineCall::op).collect();
    assert_eq!(
        ops,
        vec![
            EngineOp::SetRemoteDescription,
            EngineOp::GenerateAnswer,
            EngineOp::SetLocalDescription,
            EngineOp::AddRemoteCandidate,
            EngineOp::AddRemoteCandidate,
        ]
    );
    assert_eq!(
        bob.engine.remote_candidates(),
        vec![candidate("a", 1), candidate("a", 2)]
    );
}

#[test_timeout::tokio_timeout_test]
async fn renegotiation_keeps_the_call_connected() {
    let mut alice = spawn_peer("alice", vec![candidate("a", 1)]);
    let mut bob = spawn_peer("bob", vec![candidate("b", 1)]);
    let _ab = wire(&mut alice, bob.handle.clone());
    let _ba = wire(&mut bob, alice.handle.clone());

    alice.handle.start_call().unwrap();
    wait_for_status(&mut alice, ConnectionStatus::Connected).await;
    wait_for_status(&mut bob, ConnectionStatus::Connected).await;

    bob.handle.renegotiate().unwrap();
    let alice_engine = alice.engine.clone();
    eventually(move || alice_engine.call_count(EngineOp::GenerateAnswer) == 1).await;
    let bob_engine = bob.engine.clone();
    eventually(move || bob_engine.call_count(EngineOp::SetRemoteDescription) == 2).await;

    // Fresh candidates from the new round still reach the other side.
    let alice_engine = alice.engine.clone();
    eventually(move || alice_engine.remote_candidates().len() == 2).await;

    let mut status_changes = Vec::new();
    while let Ok(event) = alice.events.try_recv() {
        if let CallEvent::ConnectionStateChanged(status) = event {
            status_changes.push(status);
        }
    }
    assert!(status_changes.is_empty(), "unexpected {status_changes:?}");

    alice.handle.end_call().unwrap();
    wait_for_status(&mut alice, ConnectionStatus::Closed).await;
}
