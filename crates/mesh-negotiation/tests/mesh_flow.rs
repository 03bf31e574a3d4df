use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mesh_negotiation::engine::{MockConnection, MockOp};
use mesh_negotiation::{
    ConnectionState, EngineConnection, EngineEvent, MockEngine, NegotiationConfig,
    NegotiationCoordinator, PeerEvent, SignalingState,
};
use mesh_signaling::{IceCandidate, LocalRelay, LocalSignaling, PeerId};
use tokio::sync::broadcast::Receiver;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

struct Participant {
    coordinator: Arc<NegotiationCoordinator<LocalSignaling>>,
    engine: Arc<MockEngine>,
}

impl Participant {
    fn join(relay: &LocalRelay, id: &str) -> Self {
        let engine = Arc::new(MockEngine::named(id));
        let coordinator = NegotiationCoordinator::new(
            relay.endpoint(id),
            engine.clone(),
            NegotiationConfig::default().with_ice_servers(Vec::new()),
        );
        let runner = coordinator.clone();
        tokio::spawn(async move {
            let _ = runner.run().await;
        });
        Self {
            coordinator,
            engine,
        }
    }

    async fn connection(&self) -> Arc<MockConnection> {
        wait_for(|| self.engine.last_connection().is_some()).await;
        self.engine.last_connection().expect("connection")
    }
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn next_event(
    events: &mut Receiver<PeerEvent>,
    mut wanted: impl FnMut(&PeerEvent) -> bool,
) -> PeerEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event hub open");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event in time")
}

/// Two participants on one relay; the first becomes the polite side.
async fn connected_pair(
    relay: &LocalRelay,
) -> (Participant, Participant, Arc<MockConnection>, Arc<MockConnection>) {
    let alice = Participant::join(relay, "alice");
    wait_for(|| relay.members().len() == 1).await;
    let bob = Participant::join(relay, "bob");

    let alice_conn = alice.connection().await;
    let bob_conn = bob.connection().await;
    wait_for(|| {
        alice_conn.signaling_state() == SignalingState::Stable
            && bob_conn.signaling_state() == SignalingState::Stable
            && alice_conn.remote_description().is_some()
            && bob_conn.remote_description().is_some()
    })
    .await;
    (alice, bob, alice_conn, bob_conn)
}

#[tokio::test]
async fn negotiation_reaches_stable_with_matching_descriptions() {
    let relay = LocalRelay::new();
    let (alice, bob, alice_conn, bob_conn) = connected_pair(&relay).await;

    assert!(alice
        .coordinator
        .registry()
        .get(&PeerId::from("bob"))
        .expect("alice tracks bob")
        .polite());
    assert!(!bob
        .coordinator
        .registry()
        .get(&PeerId::from("alice"))
        .expect("bob tracks alice")
        .polite());

    let offer = alice_conn.local_description().expect("alice description");
    let answer = bob_conn.local_description().expect("bob description");
    assert!(answer.is_answer());
    assert_eq!(bob_conn.remote_description(), Some(offer));
    assert_eq!(alice_conn.remote_description(), Some(answer));
    assert_eq!(
        alice_conn.ops().first(),
        Some(&MockOp::CreateChannel("updates".into()))
    );
}

#[tokio::test]
async fn candidates_are_relayed_and_applied_in_order() {
    let relay = LocalRelay::new();
    let (_alice, _bob, alice_conn, bob_conn) = connected_pair(&relay).await;

    let mut first = IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.1 50000 typ host");
    first.sdp_mid = Some("0".into());
    let second = IceCandidate::new("candidate:2 1 udp 1686052607 203.0.113.7 50001 typ srflx");
    alice_conn.emit(EngineEvent::IceCandidate(Some(first.clone())));
    alice_conn.emit(EngineEvent::IceCandidate(Some(second.clone())));
    alice_conn.emit(EngineEvent::IceCandidate(None));

    wait_for(|| {
        bob_conn
            .ops()
            .iter()
            .filter(|op| matches!(op, MockOp::AddCandidate(_)))
            .count()
            == 3
    })
    .await;
    let applied: Vec<_> = bob_conn
        .ops()
        .into_iter()
        .filter_map(|op| match op {
            MockOp::AddCandidate(candidate) => Some(candidate),
            _ => None,
        })
        .collect();
    assert_eq!(applied, vec![Some(first), Some(second), None]);
}

#[tokio::test]
async fn channels_become_ready_and_carry_broadcasts() {
    let relay = LocalRelay::new();
    let (alice, bob, alice_conn, bob_conn) = connected_pair(&relay).await;
    let mut alice_events = alice.coordinator.subscribe();
    let mut bob_events = bob.coordinator.subscribe();

    let alice_channel = alice_conn.open_channel("updates").expect("alice channel");
    let ready = next_event(&mut alice_events, |event| {
        matches!(event, PeerEvent::NewPeerReady { .. })
    })
    .await;
    assert_eq!(ready.peer_id().as_str(), "bob");

    let bob_channel = bob_conn.deliver_channel("updates");
    let ready = next_event(&mut bob_events, |event| {
        matches!(event, PeerEvent::NewPeerReady { .. })
    })
    .await;
    assert_eq!(ready.peer_id().as_str(), "alice");

    assert_eq!(alice.coordinator.broadcast(Bytes::from_static(b"ping")).await, 1);
    assert_eq!(alice_channel.sent(), vec![Bytes::from_static(b"ping")]);
    let completed = next_event(&mut alice_events, |event| {
        matches!(event, PeerEvent::PeerSendCompleted { .. })
    })
    .await;
    assert_eq!(completed.peer_id().as_str(), "bob");

    bob.coordinator
        .router()
        .send_to(&PeerId::from("alice"), Bytes::from_static(b"pong"))
        .await
        .expect("direct send");
    assert_eq!(bob_channel.sent(), vec![Bytes::from_static(b"pong")]);

    alice_channel.receive(Bytes::from_static(b"pong"));
    match next_event(&mut alice_events, |event| {
        matches!(event, PeerEvent::PeerDataReceived { .. })
    })
    .await
    {
        PeerEvent::PeerDataReceived { peer_id, data } => {
            assert_eq!(peer_id.as_str(), "bob");
            assert_eq!(data, Bytes::from_static(b"pong"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn failed_connection_retires_the_session() {
    let relay = LocalRelay::new();
    let (_alice, bob, _alice_conn, bob_conn) = connected_pair(&relay).await;
    let mut bob_events = bob.coordinator.subscribe();

    bob_conn.emit(EngineEvent::ConnectionState(ConnectionState::Failed));
    match next_event(&mut bob_events, |event| {
        matches!(event, PeerEvent::ConnectionStateChanged { .. })
    })
    .await
    {
        PeerEvent::ConnectionStateChanged { peer_id, state } => {
            assert_eq!(peer_id.as_str(), "alice");
            assert_eq!(state, ConnectionState::Failed);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(bob.coordinator.registry().is_empty());
    assert!(bob_conn.is_closed());
    assert_eq!(bob.coordinator.broadcast(Bytes::from_static(b"late")).await, 0);
}

#[tokio::test]
async fn leaving_the_relay_removes_the_peer_elsewhere() {
    let relay = LocalRelay::new();
    let (alice, _bob, alice_conn, _bob_conn) = connected_pair(&relay).await;

    relay.leave(&PeerId::from("bob"));
    wait_for(|| alice.coordinator.registry().is_empty()).await;
    wait_for(|| alice_conn.is_closed()).await;
    assert_eq!(relay.members(), vec![PeerId::from("alice")]);
}
