use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

use crate::error::SignalingError;
use crate::wire::{PeerId, Relay, SignalingEvent};

/// Lazy, unbounded sequence of inbound signaling events. Ends when the carrier closes.
pub type SignalStream = BoxStream<'static, SignalingEvent>;

/// Carrier of signaling messages between this participant and the relay.
///
/// Implementations preserve send and receive order for messages exchanged with the
/// same peer. Delivery is best effort: a failed `send` is reported to the caller and
/// leaves no local state behind.
#[async_trait]
pub trait SignalingChannel: Send + Sync + 'static {
    /// Announces this participant to the relay and starts producing inbound events.
    async fn connect(&self) -> Result<SignalStream, SignalingError>;

    /// Delivers one message to one peer.
    async fn send(&self, peer: &PeerId, relay: Relay) -> Result<(), SignalingError>;

    /// Identity this participant announced, when the carrier exposes one.
    fn local_id(&self) -> Option<PeerId> {
        None
    }
}

#[async_trait]
impl<T: SignalingChannel + ?Sized> SignalingChannel for Arc<T> {
    async fn connect(&self) -> Result<SignalStream, SignalingError> {
        (**self).connect().await
    }

    async fn send(&self, peer: &PeerId, relay: Relay) -> Result<(), SignalingError> {
        (**self).send(peer, relay).await
    }

    fn local_id(&self) -> Option<PeerId> {
        (**self).local_id()
    }
}

pub(crate) fn receiver_stream(rx: mpsc::UnboundedReceiver<SignalingEvent>) -> SignalStream {
    stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    })
    .boxed()
}
