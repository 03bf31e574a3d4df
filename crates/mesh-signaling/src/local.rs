//! In-process relay for tests and single-host meshes.
//!
//! Mirrors what a hosted relay does: on join, every existing member learns about the
//! newcomer (as the polite side) and the newcomer learns about each existing member
//! (as the impolite side). Messages are forwarded in send order.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::channel::{receiver_stream, SignalStream, SignalingChannel};
use crate::error::SignalingError;
use crate::wire::{PeerId, Relay, SignalingEvent};

#[derive(Clone, Default)]
pub struct LocalRelay {
    inner: Arc<Mutex<RelayState>>,
}

#[derive(Default)]
struct RelayState {
    members: Vec<(PeerId, mpsc::UnboundedSender<SignalingEvent>)>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signaling endpoint for one participant. Joining happens on `connect`.
    pub fn endpoint(&self, peer_id: impl Into<PeerId>) -> LocalSignaling {
        LocalSignaling {
            relay: self.clone(),
            peer_id: peer_id.into(),
        }
    }

    pub fn members(&self) -> Vec<PeerId> {
        self.inner
            .lock()
            .members
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Drops a participant and tells everyone else it left.
    pub fn leave(&self, peer_id: &PeerId) {
        let mut state = self.inner.lock();
        let before = state.members.len();
        state.members.retain(|(id, _)| id != peer_id);
        if state.members.len() == before {
            return;
        }
        debug!(target = "mesh.signaling", peer = %peer_id, "local relay member left");
        for (_, tx) in &state.members {
            let _ = tx.send(SignalingEvent::RemovePeer {
                peer: peer_id.clone(),
            });
        }
    }

    fn join(&self, peer_id: &PeerId) -> mpsc::UnboundedReceiver<SignalingEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock();
        state.members.retain(|(id, _)| id != peer_id);
        for (existing, existing_tx) in &state.members {
            let _ = existing_tx.send(SignalingEvent::AddPeer {
                peer: peer_id.clone(),
                polite: true,
            });
            let _ = tx.send(SignalingEvent::AddPeer {
                peer: existing.clone(),
                polite: false,
            });
        }
        state.members.push((peer_id.clone(), tx));
        debug!(
            target = "mesh.signaling",
            peer = %peer_id,
            members = state.members.len(),
            "local relay member joined"
        );
        rx
    }

    fn deliver(&self, from: &PeerId, to: &PeerId, relay: Relay) -> Result<(), SignalingError> {
        let state = self.inner.lock();
        let (_, tx) = state
            .members
            .iter()
            .find(|(id, _)| id == to)
            .ok_or_else(|| SignalingError::UnknownPeer(to.clone()))?;
        trace!(
            target = "mesh.signaling",
            from = %from,
            to = %to,
            event = relay.event().as_str(),
            "local relay forward"
        );
        tx.send(relay.into_event(from.clone()))
            .map_err(|_| SignalingError::UnknownPeer(to.clone()))
    }
}

pub struct LocalSignaling {
    relay: LocalRelay,
    peer_id: PeerId,
}

impl LocalSignaling {
    pub fn relay(&self) -> &LocalRelay {
        &self.relay
    }
}

#[async_trait]
impl SignalingChannel for LocalSignaling {
    async fn connect(&self) -> Result<SignalStream, SignalingError> {
        Ok(receiver_stream(self.relay.join(&self.peer_id)))
    }

    async fn send(&self, peer: &PeerId, relay: Relay) -> Result<(), SignalingError> {
        self.relay.deliver(&self.peer_id, peer, relay)
    }

    fn local_id(&self) -> Option<PeerId> {
        Some(self.peer_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::wire::{IceCandidate, SessionDescription};

    #[tokio::test]
    async fn newcomer_is_impolite_toward_existing_members() {
        let relay = LocalRelay::new();
        let alice = relay.endpoint("alice");
        let bob = relay.endpoint("bob");

        let mut alice_events = alice.connect().await.expect("alice joins");
        let mut bob_events = bob.connect().await.expect("bob joins");

        assert_eq!(
            alice_events.next().await,
            Some(SignalingEvent::AddPeer {
                peer: PeerId::from("bob"),
                polite: true,
            })
        );
        assert_eq!(
            bob_events.next().await,
            Some(SignalingEvent::AddPeer {
                peer: PeerId::from("alice"),
                polite: false,
            })
        );
        assert_eq!(relay.members().len(), 2);
    }

    #[tokio::test]
    async fn messages_arrive_in_send_order_from_the_sender() {
        let relay = LocalRelay::new();
        let alice = relay.endpoint("alice");
        let bob = relay.endpoint("bob");
        let _alice_events = alice.connect().await.expect("alice joins");
        let mut bob_events = bob.connect().await.expect("bob joins");
        let _ = bob_events.next().await;

        let alice_id = PeerId::from("alice");
        let bob_id = PeerId::from("bob");
        alice
            .send(
                &bob_id,
                Relay::SessionDescription(SessionDescription::offer("v=0")),
            )
            .await
            .expect("offer");
        alice
            .send(&bob_id, Relay::IceCandidate(Some(IceCandidate::new("a"))))
            .await
            .expect("candidate a");
        alice
            .send(&bob_id, Relay::IceCandidate(None))
            .await
            .expect("end of candidates");

        let kinds: Vec<_> = bob_events
            .by_ref()
            .take(3)
            .map(|event| {
                assert_eq!(event.peer(), &alice_id);
                event.kind().as_str()
            })
            .collect()
            .await;
        assert_eq!(kinds, ["session-description", "ice-candidate", "ice-candidate"]);
    }

    #[tokio::test]
    async fn leave_notifies_remaining_members() {
        let relay = LocalRelay::new();
        let alice = relay.endpoint("alice");
        let bob = relay.endpoint("bob");
        let mut alice_events = alice.connect().await.expect("alice joins");
        let _bob_events = bob.connect().await.expect("bob joins");
        let _ = alice_events.next().await;

        relay.leave(&PeerId::from("bob"));
        assert_eq!(
            alice_events.next().await,
            Some(SignalingEvent::RemovePeer {
                peer: PeerId::from("bob"),
            })
        );

        let err = alice
            .send(&PeerId::from("bob"), Relay::IceCandidate(None))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::UnknownPeer(peer) if peer.as_str() == "bob"));
    }
}
