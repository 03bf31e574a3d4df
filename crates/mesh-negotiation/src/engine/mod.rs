//! Contract between the negotiation core and the engine that actually moves bytes.
//!
//! The engine owns ICE, DTLS and SCTP. The coordinator only sequences descriptions and
//! candidates into it and reacts to what it reports through an [`EngineObserver`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mesh_signaling::{IceCandidate, SessionDescription};
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::IceServerConfig;

pub mod mock;
pub mod rtc;

pub use self::mock::{MockConnection, MockDataChannel, MockEngine, MockOp};
pub use self::rtc::WebRtcEngine;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine setup failed: {0}")]
    Setup(String),
    #[error("operation not valid in signaling state {0}")]
    InvalidState(SignalingState),
    #[error("engine operation failed: {0}")]
    Operation(String),
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::HaveLocalPranswer => "have-local-pranswer",
            SignalingState::HaveRemotePranswer => "have-remote-pranswer",
            SignalingState::Closed => "closed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the connection is torn down and its session retired.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Checking => "checking",
            ConnectionState::Connected => "connected",
            ConnectionState::Completed => "completed",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Everything an engine connection reports back to the negotiation layer.
#[derive(Clone)]
pub enum EngineEvent {
    /// A locally gathered candidate; `None` marks the end of gathering.
    IceCandidate(Option<IceCandidate>),
    NegotiationNeeded,
    ConnectionState(ConnectionState),
    /// A channel opened by the remote side.
    DataChannel(Arc<dyn DataChannelHandle>),
    ChannelOpen {
        label: String,
    },
    ChannelMessage {
        label: String,
        data: Bytes,
    },
}

impl fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::IceCandidate(candidate) => {
                f.debug_tuple("IceCandidate").field(candidate).finish()
            }
            EngineEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            EngineEvent::ConnectionState(state) => {
                f.debug_tuple("ConnectionState").field(state).finish()
            }
            EngineEvent::DataChannel(handle) => f
                .debug_tuple("DataChannel")
                .field(&handle.label())
                .finish(),
            EngineEvent::ChannelOpen { label } => {
                f.debug_struct("ChannelOpen").field("label", label).finish()
            }
            EngineEvent::ChannelMessage { label, data } => f
                .debug_struct("ChannelMessage")
                .field("label", label)
                .field("len", &data.len())
                .finish(),
        }
    }
}

/// Callback sink handed to the engine when a connection is created.
#[derive(Clone)]
pub struct EngineObserver {
    sink: Arc<dyn Fn(EngineEvent) + Send + Sync>,
}

impl EngineObserver {
    pub fn new(sink: impl Fn(EngineEvent) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// Observer that discards everything.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn notify(&self, event: EngineEvent) {
        (self.sink)(event)
    }
}

impl fmt::Debug for EngineObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EngineObserver")
    }
}

#[async_trait]
pub trait TransportEngine: Send + Sync + 'static {
    async fn create_connection(
        &self,
        ice_servers: &[IceServerConfig],
        observer: EngineObserver,
    ) -> Result<Arc<dyn EngineConnection>, EngineError>;
}

#[async_trait]
impl<T: TransportEngine + ?Sized> TransportEngine for Arc<T> {
    async fn create_connection(
        &self,
        ice_servers: &[IceServerConfig],
        observer: EngineObserver,
    ) -> Result<Arc<dyn EngineConnection>, EngineError> {
        (**self).create_connection(ice_servers, observer).await
    }
}

#[async_trait]
pub trait EngineConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    /// Creates and applies whatever local description the signaling state calls for:
    /// an answer while a remote offer is pending, an offer otherwise.
    async fn set_local_description(&self) -> Result<SessionDescription, EngineError>;

    /// Applies a remote description. A remote offer arriving while a local offer is
    /// pending rolls the local offer back first.
    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError>;

    /// `None` signals the remote side finished gathering.
    async fn add_ice_candidate(&self, candidate: Option<&IceCandidate>)
        -> Result<(), EngineError>;

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannelHandle>, EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait DataChannelHandle: Send + Sync {
    fn label(&self) -> &str;

    fn ready_state(&self) -> ChannelState;

    async fn send(&self, data: &Bytes) -> Result<(), EngineError>;

    async fn close(&self) -> Result<(), EngineError>;

    /// Starts reporting messages of an inbound channel, earliest held message first.
    /// Locally created channels report from the start.
    fn accept(&self) {}

    /// Drops everything an inbound channel receives, now and later.
    fn reject(&self) {}
}

/// Routes one channel's messages to the observer.
///
/// Inbound channels start held: their messages queue until the negotiation layer
/// accepts the channel, and are discarded if it rejects it.
pub(crate) struct MessageGate {
    label: String,
    observer: EngineObserver,
    state: Mutex<GateState>,
}

enum GateState {
    Held(Vec<Bytes>),
    Accepted,
    Rejected,
}

impl MessageGate {
    pub(crate) fn open(label: impl Into<String>, observer: EngineObserver) -> Self {
        Self::with_state(label, observer, GateState::Accepted)
    }

    pub(crate) fn held(label: impl Into<String>, observer: EngineObserver) -> Self {
        Self::with_state(label, observer, GateState::Held(Vec::new()))
    }

    fn with_state(label: impl Into<String>, observer: EngineObserver, state: GateState) -> Self {
        Self {
            label: label.into(),
            observer,
            state: Mutex::new(state),
        }
    }

    pub(crate) fn deliver(&self, data: Bytes) {
        let mut state = self.state.lock();
        match &mut *state {
            GateState::Held(held) => held.push(data),
            GateState::Accepted => self.report(data),
            GateState::Rejected => {}
        }
    }

    pub(crate) fn accept(&self) {
        let mut state = self.state.lock();
        if let GateState::Held(held) = &mut *state {
            let held = std::mem::take(held);
            *state = GateState::Accepted;
            for data in held {
                self.report(data);
            }
        }
    }

    pub(crate) fn reject(&self) {
        *self.state.lock() = GateState::Rejected;
    }

    fn report(&self, data: Bytes) {
        self.observer.notify(EngineEvent::ChannelMessage {
            label: self.label.clone(),
            data,
        });
    }
}
