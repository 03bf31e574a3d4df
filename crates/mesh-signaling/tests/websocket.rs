use std::time::Duration;

use axum::extract::{
    ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    State,
};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use mesh_signaling::{
    IceCandidate, PeerId, Relay, SignalingChannel, SignalingError, SignalingEvent,
    WebSocketSignaling,
};

const STEP: Duration = Duration::from_secs(5);

// Scripted relay: waits for the announce, pushes a few events (one of them junk),
// then reports every client frame it receives.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(frames): State<mpsc::UnboundedSender<Value>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, frames))
}

async fn handle_socket(socket: WebSocket, frames: mpsc::UnboundedSender<Value>) {
    let (mut sender, mut receiver) = socket.split();
    while let Some(Ok(msg)) = receiver.next().await {
        let WsMessage::Text(text) = msg else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let announced = value.get("action").and_then(Value::as_str) == Some("announce");
        let _ = frames.send(value);
        if announced {
            let script = [
                json!({"event": "add-peer", "peer": "remote-1", "polite": true}).to_string(),
                json!({"event": "peer-moved", "peer": "remote-1"}).to_string(),
                "not json".to_string(),
                json!({
                    "event": "session-description",
                    "peer": {"id": "remote-1"},
                    "data": {"type": "offer", "sdp": "v=0 remote"}
                })
                .to_string(),
            ];
            for text in script {
                if sender.send(WsMessage::Text(text)).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn spawn_relay() -> (String, mpsc::UnboundedReceiver<Value>) {
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let router = Router::new()
        .route("/signal", get(ws_handler))
        .with_state(frames_tx);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    (format!("http://{addr}/signal"), frames_rx)
}

#[tokio::test]
async fn websocket_announces_decodes_and_relays() {
    let (url, mut frames) = spawn_relay().await;
    let signaling = WebSocketSignaling::new(&url).expect("signaling url");
    assert_eq!(signaling.url().scheme(), "ws");

    let mut events = signaling.connect().await.expect("connect");

    let announce = timeout(STEP, frames.recv())
        .await
        .expect("announce in time")
        .expect("announce frame");
    assert_eq!(announce, json!({"action": "announce"}));

    let first = timeout(STEP, events.next())
        .await
        .expect("first event in time")
        .expect("first event");
    assert_eq!(
        first,
        SignalingEvent::AddPeer {
            peer: PeerId::from("remote-1"),
            polite: true,
        }
    );

    // Unknown and malformed frames are dropped without ending the stream.
    let second = timeout(STEP, events.next())
        .await
        .expect("second event in time")
        .expect("second event");
    match second {
        SignalingEvent::SessionDescription { peer, description } => {
            assert_eq!(peer.as_str(), "remote-1");
            assert!(description.is_offer());
            assert_eq!(description.sdp, "v=0 remote");
        }
        other => panic!("unexpected event {other:?}"),
    }

    let mut candidate = IceCandidate::new("candidate:1 1 udp 1 127.0.0.1 5000 typ host");
    candidate.sdp_mid = Some("0".into());
    candidate.sdp_mline_index = Some(0);
    signaling
        .send(&PeerId::from("remote-1"), Relay::IceCandidate(Some(candidate)))
        .await
        .expect("relay candidate");
    signaling
        .send(&PeerId::from("remote-1"), Relay::IceCandidate(None))
        .await
        .expect("relay end-of-candidates");

    let relayed = timeout(STEP, frames.recv())
        .await
        .expect("relay in time")
        .expect("relay frame");
    assert_eq!(
        relayed,
        json!({
            "action": "message",
            "connectionId": "remote-1",
            "event": "ice-candidate",
            "data": {
                "candidate": "candidate:1 1 udp 1 127.0.0.1 5000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }
        })
    );
    let end = timeout(STEP, frames.recv())
        .await
        .expect("end in time")
        .expect("end frame");
    assert_eq!(end["data"], Value::Null);
}

#[tokio::test]
async fn websocket_connect_failure_is_setup_error() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let signaling = WebSocketSignaling::new(&format!("ws://{addr}/signal")).expect("url");
    let err = match signaling.connect().await {
        Ok(_) => panic!("connect should fail without a relay"),
        Err(err) => err,
    };
    assert!(matches!(err, SignalingError::Setup(_)));
}
