use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use reqwest::Client;
use reqwest_eventsource::{Error as EventSourceError, Event, EventSource};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use url::Url;

use crate::channel::{receiver_stream, SignalStream, SignalingChannel};
use crate::error::SignalingError;
use crate::wire::{decode_event, PeerId, Relay, SignalingEvent};

const PEER_HEADER: &str = "peerId";

/// Signaling over a server-sent event stream for inbound traffic and one HTTP `POST`
/// per outbound message.
pub struct EventStreamSignaling {
    base: Url,
    peer_id: PeerId,
    http: Client,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventStreamSignaling {
    /// Picks a random `user<n>` identity, the way browser participants do.
    pub fn new(base_url: &str) -> Result<Self, SignalingError> {
        let suffix: u32 = rand::thread_rng().gen_range(0..100_000);
        Self::with_peer_id(base_url, PeerId::new(format!("user{suffix}")))
    }

    pub fn with_peer_id(base_url: &str, peer_id: PeerId) -> Result<Self, SignalingError> {
        let base = Url::parse(base_url)
            .map_err(|err| SignalingError::Setup(format!("invalid relay url {base_url}: {err}")))?;
        if base.cannot_be_a_base() {
            return Err(SignalingError::Setup(format!(
                "relay url {base_url} cannot carry a path"
            )));
        }
        let http = Client::builder()
            .build()
            .map_err(|err| SignalingError::Setup(format!("http client: {err}")))?;
        Ok(Self {
            base,
            peer_id,
            http,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    fn connect_url(&self) -> Result<Url, SignalingError> {
        let mut url = self.endpoint(&["connect"])?;
        url.query_pairs_mut()
            .append_pair("peerId", self.peer_id.as_str());
        Ok(url)
    }

    fn relay_url(&self, peer: &PeerId, event: &str) -> Result<Url, SignalingError> {
        self.endpoint(&["relay", peer.as_str(), event])
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SignalingError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SignalingError::Setup(format!("relay url {} cannot carry a path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl SignalingChannel for EventStreamSignaling {
    async fn connect(&self) -> Result<SignalStream, SignalingError> {
        let url = self.connect_url()?;
        let mut source = EventSource::new(self.http.get(url.clone()))
            .map_err(|err| SignalingError::Setup(format!("event stream request: {err}")))?;
        let (event_tx, event_rx) = mpsc::unbounded_channel::<SignalingEvent>();
        let peer_id = self.peer_id.clone();

        let reader = tokio::spawn(async move {
            while let Some(next) = source.next().await {
                match next {
                    Ok(Event::Open) => {
                        debug!(
                            target = "mesh.signaling",
                            url = %url,
                            peer = %peer_id,
                            "signaling event stream open"
                        );
                    }
                    Ok(Event::Message(message)) => {
                        trace!(
                            target = "mesh.signaling",
                            event = "sse_in",
                            kind = %message.event,
                            len = message.data.len()
                        );
                        match decode_event(&message.event, &message.data) {
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
                    Err(EventSourceError::StreamEnded) => {
                        debug!(target = "mesh.signaling", "signaling event stream ended");
                        break;
                    }
                    Err(EventSourceError::InvalidStatusCode(status, _)) => {
                        warn!(target = "mesh.signaling", %status, "signaling event stream rejected");
                        break;
                    }
                    Err(EventSourceError::InvalidContentType(content_type, _)) => {
                        warn!(
                            target = "mesh.signaling",
                            content_type = ?content_type,
                            "signaling endpoint is not an event stream"
                        );
                        break;
                    }
                    Err(err) => {
                        // The source reconnects on its own after transport errors.
                        warn!(target = "mesh.signaling", error = %err, "signaling event stream error");
                    }
                }
            }
            source.close();
            debug!(target = "mesh.signaling", "signaling event stream reader finished");
        });

        self.tasks.lock().push(reader);
        Ok(receiver_stream(event_rx))
    }

    async fn send(&self, peer: &PeerId, relay: Relay) -> Result<(), SignalingError> {
        let url = self.relay_url(peer, relay.event().as_str())?;
        let payload = relay.payload()?;
        trace!(target = "mesh.signaling", event = "http_out", url = %url);
        self.http
            .post(url)
            .header(PEER_HEADER, self.peer_id.as_str())
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn local_id(&self) -> Option<PeerId> {
        Some(self.peer_id.clone())
    }
}

impl Drop for EventStreamSignaling {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_identity_has_user_prefix() {
        let signaling = EventStreamSignaling::new("http://127.0.0.1:8080").expect("signaling");
        let id = signaling.peer_id().as_str();
        let suffix: u32 = id
            .strip_prefix("user")
            .and_then(|rest| rest.parse().ok())
            .expect("numeric suffix");
        assert!(suffix < 100_000);
        assert_eq!(signaling.local_id().as_ref(), Some(signaling.peer_id()));
    }

    #[test]
    fn endpoints_extend_the_base_path() {
        let signaling =
            EventStreamSignaling::with_peer_id("http://relay.local/signal/", PeerId::from("me"))
                .expect("signaling");
        assert_eq!(
            signaling.connect_url().expect("connect url").as_str(),
            "http://relay.local/signal/connect?peerId=me"
        );
        assert_eq!(
            signaling
                .relay_url(&PeerId::from("user7"), "ice-candidate")
                .expect("relay url")
                .as_str(),
            "http://relay.local/signal/relay/user7/ice-candidate"
        );
    }
}
