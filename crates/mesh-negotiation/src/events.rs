use bytes::Bytes;
use mesh_signaling::PeerId;
use tokio::sync::broadcast;

use crate::broadcast::PeerChannel;
use crate::config::DEFAULT_EVENT_CAPACITY;
use crate::engine::ConnectionState;

/// Notifications published to the application layer.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    ConnectionStateChanged {
        peer_id: PeerId,
        state: ConnectionState,
    },
    PeerDataReceived {
        peer_id: PeerId,
        data: Bytes,
    },
    PeerSendCompleted {
        peer_id: PeerId,
    },
    /// The peer's data channel is open and usable.
    NewPeerReady {
        channel: PeerChannel,
    },
}

impl PeerEvent {
    pub fn peer_id(&self) -> &PeerId {
        match self {
            PeerEvent::ConnectionStateChanged { peer_id, .. }
            | PeerEvent::PeerDataReceived { peer_id, .. }
            | PeerEvent::PeerSendCompleted { peer_id } => peer_id,
            PeerEvent::NewPeerReady { channel } => channel.peer_id(),
        }
    }
}

/// Bounded fan-out of [`PeerEvent`]s. Emitting never blocks and never fails; a
/// subscriber that falls more than `capacity` events behind observes a lag.
#[derive(Debug, Clone)]
pub struct PeerEvents {
    tx: broadcast::Sender<PeerEvent>,
}

impl PeerEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PeerEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for PeerEvents {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
