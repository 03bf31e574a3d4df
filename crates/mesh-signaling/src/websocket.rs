use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use tracing::{debug, trace, warn};
use url::Url;

use crate::channel::{receiver_stream, SignalStream, SignalingChannel};
use crate::error::SignalingError;
use crate::wire::{decode_message, PeerId, Relay, SignalingEvent};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientAction {
    Announce,
    Message {
        #[serde(rename = "connectionId")]
        connection_id: String,
        event: &'static str,
        data: Value,
    },
}

/// Signaling over one persistent WebSocket to the relay.
pub struct WebSocketSignaling {
    url: Url,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientAction>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketSignaling {
    /// Accepts `ws(s)://` URLs directly; `http(s)://` relay addresses are mapped to their
    /// WebSocket scheme.
    pub fn new(relay_url: &str) -> Result<Self, SignalingError> {
        Ok(Self {
            url: websocket_url(relay_url)?,
            outbound: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl SignalingChannel for WebSocketSignaling {
    async fn connect(&self) -> Result<SignalStream, SignalingError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| SignalingError::Setup(format!("websocket connect failed: {err}")))?;
        debug!(
            target = "mesh.signaling",
            url = %self.url,
            "signaling websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientAction>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<SignalingEvent>();
        send_tx
            .send(ClientAction::Announce)
            .map_err(|_| SignalingError::Closed)?;

        let writer = tokio::spawn(async move {
            while let Some(action) = send_rx.recv().await {
                let text = match serde_json::to_string(&action) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(target = "mesh.signaling", error = %err, "failed to encode relay message");
                        continue;
                    }
                };
                trace!(target = "mesh.signaling", event = "ws_out", len = text.len());
                if let Err(err) = ws_write.send(Message::Text(text)).await {
                    debug!(target = "mesh.signaling", error = %err, "signaling websocket writer stopped");
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!(target = "mesh.signaling", "dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!(target = "mesh.signaling", "signaling websocket closed: {err}");
                            }
                            _ => {
                                warn!(target = "mesh.signaling", "signaling websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                trace!(target = "mesh.signaling", event = "ws_in", len = text.len());
                match decode_message(&text) {
                    Ok(event) => {
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(target = "mesh.signaling", error = %err, "dropping signaling message");
                    }
                }
            }
            debug!(target = "mesh.signaling", "signaling websocket reader finished");
        });

        *self.outbound.lock() = Some(send_tx);
        {
            let mut tasks = self.tasks.lock();
            tasks.push(writer);
            tasks.push(reader);
        }
        Ok(receiver_stream(event_rx))
    }

    async fn send(&self, peer: &PeerId, relay: Relay) -> Result<(), SignalingError> {
        let data = relay.payload()?;
        let sender = self
            .outbound
            .lock()
            .clone()
            .ok_or(SignalingError::NotConnected)?;
        sender
            .send(ClientAction::Message {
                connection_id: peer.to_string(),
                event: relay.event().as_str(),
                data,
            })
            .map_err(|_| SignalingError::Closed)
    }
}

impl Drop for WebSocketSignaling {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

fn websocket_url(relay_url: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(relay_url)
        .map_err(|err| SignalingError::Setup(format!("invalid relay url {relay_url}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(SignalingError::Setup(format!(
                "unsupported relay scheme {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::Setup("invalid websocket scheme".into()))?;
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_relay_urls_map_to_websocket_schemes() {
        let plain = websocket_url("http://127.0.0.1:8080/dev").expect("http url");
        assert_eq!(plain.as_str(), "ws://127.0.0.1:8080/dev");
        let secure = websocket_url("https://relay.example/dev").expect("https url");
        assert_eq!(secure.scheme(), "wss");
        assert!(websocket_url("ftp://relay.example").is_err());
    }

    #[test]
    fn relay_messages_carry_connection_id() {
        let action = ClientAction::Message {
            connection_id: "peer-9".into(),
            event: "ice-candidate",
            data: Value::Null,
        };
        let value = serde_json::to_value(&action).expect("encode");
        assert_eq!(
            value,
            serde_json::json!({
                "action": "message",
                "connectionId": "peer-9",
                "event": "ice-candidate",
                "data": null
            })
        );
        let announce = serde_json::to_value(ClientAction::Announce).expect("encode");
        assert_eq!(announce, serde_json::json!({"action": "announce"}));
    }

    #[tokio::test]
    async fn send_before_connect_is_rejected() {
        let signaling = WebSocketSignaling::new("ws://127.0.0.1:9/").expect("url");
        let err = signaling
            .send(&PeerId::from("p"), Relay::IceCandidate(None))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::NotConnected));
    }
}
