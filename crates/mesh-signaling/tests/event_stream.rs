use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use mesh_signaling::{
    EventStreamSignaling, PeerId, Relay, SessionDescription, SignalingChannel, SignalingEvent,
};

const STEP: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Seen {
    Connect(Option<String>),
    Relay {
        target: String,
        event: String,
        sender: Option<String>,
        body: Value,
    },
}

async fn connect_handler(
    Query(params): Query<HashMap<String, String>>,
    State(seen): State<mpsc::UnboundedSender<Seen>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let _ = seen.send(Seen::Connect(params.get("peerId").cloned()));
    let script = vec![
        Event::default()
            .event("add-peer")
            .data(json!({"peer": "user42", "polite": false}).to_string()),
        Event::default().event("peer-moved").data("{}"),
        Event::default()
            .event("ice-candidate")
            .data(json!({"peer": "user42", "data": null}).to_string()),
    ];
    let events = stream::iter(script.into_iter().map(Ok)).chain(stream::pending());
    Sse::new(events)
}

async fn relay_handler(
    Path((target, event)): Path<(String, String)>,
    State(seen): State<mpsc::UnboundedSender<Seen>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    if target == "reject" {
        return StatusCode::BAD_GATEWAY;
    }
    let sender = headers
        .get("peerId")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let _ = seen.send(Seen::Relay {
        target,
        event,
        sender,
        body,
    });
    StatusCode::NO_CONTENT
}

async fn spawn_relay() -> (String, mpsc::UnboundedReceiver<Seen>) {
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let router = Router::new()
        .route("/mesh/connect", get(connect_handler))
        .route("/mesh/relay/:peer/:event", post(relay_handler))
        .with_state(seen_tx);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    (format!("http://{addr}/mesh"), seen_rx)
}

#[tokio::test]
async fn event_stream_connects_with_identity_and_decodes_named_events() {
    let (base, mut seen) = spawn_relay().await;
    let signaling =
        EventStreamSignaling::with_peer_id(&base, PeerId::from("user7")).expect("signaling");
    let mut events = signaling.connect().await.expect("connect");

    let first = timeout(STEP, events.next())
        .await
        .expect("first event in time")
        .expect("first event");
    assert_eq!(
        first,
        SignalingEvent::AddPeer {
            peer: PeerId::from("user42"),
            polite: false,
        }
    );
    let second = timeout(STEP, events.next())
        .await
        .expect("second event in time")
        .expect("second event");
    assert_eq!(
        second,
        SignalingEvent::IceCandidate {
            peer: PeerId::from("user42"),
            candidate: None,
        }
    );

    match timeout(STEP, seen.recv()).await.expect("connect seen") {
        Some(Seen::Connect(peer)) => assert_eq!(peer.as_deref(), Some("user7")),
        other => panic!("unexpected request {other:?}"),
    }
}

#[tokio::test]
async fn event_stream_posts_relays_with_sender_header() {
    let (base, mut seen) = spawn_relay().await;
    let signaling =
        EventStreamSignaling::with_peer_id(&base, PeerId::from("user7")).expect("signaling");

    signaling
        .send(
            &PeerId::from("user42"),
            Relay::SessionDescription(SessionDescription::answer("v=0 answer")),
        )
        .await
        .expect("post answer");

    match timeout(STEP, seen.recv()).await.expect("relay seen") {
        Some(Seen::Relay {
            target,
            event,
            sender,
            body,
        }) => {
            assert_eq!(target, "user42");
            assert_eq!(event, "session-description");
            assert_eq!(sender.as_deref(), Some("user7"));
            assert_eq!(body, json!({"type": "answer", "sdp": "v=0 answer"}));
        }
        other => panic!("unexpected request {other:?}"),
    }

    let err = signaling
        .send(&PeerId::from("reject"), Relay::IceCandidate(None))
        .await
        .unwrap_err();
    assert!(matches!(err, mesh_signaling::SignalingError::Http(_)));
}
