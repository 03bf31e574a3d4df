use mesh_signaling::{PeerId, SignalingError};
use thiserror::Error;

use crate::engine::EngineError;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("no session for peer {0}")]
    UnknownPeer(PeerId),
    #[error("data channel for peer {0} is not open")]
    ChannelNotOpen(PeerId),
}

pub type NegotiationResult<T> = Result<T, NegotiationError>;
