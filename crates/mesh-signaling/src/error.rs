use thiserror::Error;

use crate::wire::PeerId;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling setup failed: {0}")]
    Setup(String),
    #[error("signaling channel not connected")]
    NotConnected,
    #[error("signaling channel closed")]
    Closed,
    #[error("unknown signaling peer {0}")]
    UnknownPeer(PeerId),
    #[error("signaling request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to encode signaling payload: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type SignalingResult<T> = Result<T, SignalingError>;
