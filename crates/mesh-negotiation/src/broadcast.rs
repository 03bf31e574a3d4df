use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use mesh_signaling::PeerId;
use tracing::{trace, warn};

use crate::engine::{ChannelState, DataChannelHandle, EngineError};
use crate::error::NegotiationError;
use crate::events::{PeerEvent, PeerEvents};
use crate::registry::PeerRegistry;

/// A peer's data channel as handed to the application.
///
/// Every successful [`send`](PeerChannel::send) publishes
/// [`PeerEvent::PeerSendCompleted`] for the peer.
#[derive(Clone)]
pub struct PeerChannel {
    peer_id: PeerId,
    handle: Arc<dyn DataChannelHandle>,
    events: PeerEvents,
}

impl PeerChannel {
    pub(crate) fn new(
        peer_id: PeerId,
        handle: Arc<dyn DataChannelHandle>,
        events: PeerEvents,
    ) -> Self {
        Self {
            peer_id,
            handle,
            events,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn label(&self) -> &str {
        self.handle.label()
    }

    pub fn ready_state(&self) -> ChannelState {
        self.handle.ready_state()
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == ChannelState::Open
    }

    pub async fn send(&self, data: Bytes) -> Result<(), EngineError> {
        self.handle.send(&data).await?;
        self.events.emit(PeerEvent::PeerSendCompleted {
            peer_id: self.peer_id.clone(),
        });
        Ok(())
    }

    pub(crate) async fn close(&self) -> Result<(), EngineError> {
        self.handle.close().await
    }
}

impl fmt::Debug for PeerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerChannel")
            .field("peer_id", &self.peer_id)
            .field("label", &self.label())
            .field("state", &self.ready_state())
            .finish()
    }
}

/// Fans application payloads out to every open channel.
#[derive(Debug, Clone)]
pub struct BroadcastRouter {
    registry: Arc<PeerRegistry>,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<PeerRegistry>) -> Self {
        Self { registry }
    }

    /// Sends `payload` to every open channel and returns how many sends succeeded.
    /// Channels that are not open are skipped; a failing channel does not affect others.
    pub async fn broadcast(&self, payload: Bytes) -> usize {
        let channels: Vec<_> = self
            .registry
            .channels()
            .into_iter()
            .filter(PeerChannel::is_open)
            .collect();
        let results = join_all(channels.iter().map(|channel| channel.send(payload.clone()))).await;

        let mut delivered = 0;
        for (channel, result) in channels.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(
                        target = "mesh.broadcast",
                        peer = %channel.peer_id(),
                        error = %err,
                        "broadcast send failed"
                    );
                }
            }
        }
        trace!(
            target = "mesh.broadcast",
            bytes = payload.len(),
            delivered,
            "broadcast complete"
        );
        delivered
    }

    /// Sends to a single peer's channel.
    pub async fn send_to(&self, peer_id: &PeerId, payload: Bytes) -> Result<(), NegotiationError> {
        let channel = self
            .registry
            .get(peer_id)
            .and_then(|session| session.channel())
            .ok_or_else(|| NegotiationError::UnknownPeer(peer_id.clone()))?;
        if !channel.is_open() {
            return Err(NegotiationError::ChannelNotOpen(peer_id.clone()));
        }
        channel.send(payload).await?;
        Ok(())
    }
}
