//! Perfect-negotiation mesh on top of a pluggable transport engine.
//!
//! [`NegotiationCoordinator`] drives one engine connection per remote peer from the
//! events of a [`SignalingChannel`](mesh_signaling::SignalingChannel), keeps the live
//! sessions in a [`PeerRegistry`] and publishes [`PeerEvent`]s. [`BroadcastRouter`] fans
//! application payloads out to every open data channel.

pub mod broadcast;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod events;
pub mod registry;

pub use broadcast::{BroadcastRouter, PeerChannel};
pub use config::{IceServerConfig, NegotiationConfig};
pub use coordinator::NegotiationCoordinator;
pub use engine::{
    ChannelState, ConnectionState, DataChannelHandle, EngineConnection, EngineError, EngineEvent,
    EngineObserver, MockEngine, SignalingState, TransportEngine, WebRtcEngine,
};
pub use error::{NegotiationError, NegotiationResult};
pub use events::{PeerEvent, PeerEvents};
pub use registry::{NegotiationState, PeerRegistry, PeerSession};
