//! Signaling carriers for a WebRTC peer mesh.
//!
//! A relay introduces participants to each other (`add-peer` / `remove-peer`) and
//! forwards session descriptions and ICE candidates between them. This crate provides
//! the wire model plus three carriers implementing [`SignalingChannel`]:
//!
//! * [`WebSocketSignaling`]: one persistent WebSocket, messages tagged by `action`.
//! * [`EventStreamSignaling`]: server-sent events inbound, HTTP `POST` outbound.
//! * [`LocalRelay`]: in-process relay for tests and single-host meshes.

pub mod channel;
pub mod error;
pub mod event_stream;
pub mod local;
pub mod websocket;
pub mod wire;

pub use channel::{SignalStream, SignalingChannel};
pub use error::{SignalingError, SignalingResult};
pub use event_stream::EventStreamSignaling;
pub use local::{LocalRelay, LocalSignaling};
pub use websocket::WebSocketSignaling;
pub use wire::{
    decode_event, decode_message, DecodeError, EventKind, IceCandidate, PeerId, Relay,
    SdpKind, SessionDescription, SignalingEvent,
};
