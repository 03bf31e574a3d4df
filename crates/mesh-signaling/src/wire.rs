use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Identity of a remote participant as assigned by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpKind::Offer
    }

    pub fn is_answer(&self) -> bool {
        self.kind == SdpKind::Answer
    }
}

/// Browser-shaped ICE candidate (`RTCIceCandidateInit`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AddPeer,
    RemovePeer,
    SessionDescription,
    IceCandidate,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::AddPeer,
        EventKind::RemovePeer,
        EventKind::SessionDescription,
        EventKind::IceCandidate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::AddPeer => "add-peer",
            EventKind::RemovePeer => "remove-peer",
            EventKind::SessionDescription => "session-description",
            EventKind::IceCandidate => "ice-candidate",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| DecodeError::UnknownEvent(value.to_string()))
    }
}

/// One inbound signaling message, already addressed to us by the relay.
///
/// `peer` is always the remote side: the peer being added or removed, or the
/// sender of a description or candidate.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SignalingEvent {
    AddPeer {
        #[serde(deserialize_with = "peer_ref")]
        peer: PeerId,
        polite: bool,
    },
    RemovePeer {
        #[serde(deserialize_with = "peer_ref")]
        peer: PeerId,
    },
    SessionDescription {
        #[serde(deserialize_with = "peer_ref")]
        peer: PeerId,
        #[serde(rename = "data")]
        description: SessionDescription,
    },
    IceCandidate {
        #[serde(deserialize_with = "peer_ref")]
        peer: PeerId,
        #[serde(rename = "data", default)]
        candidate: Option<IceCandidate>,
    },
}

impl SignalingEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SignalingEvent::AddPeer { .. } => EventKind::AddPeer,
            SignalingEvent::RemovePeer { .. } => EventKind::RemovePeer,
            SignalingEvent::SessionDescription { .. } => EventKind::SessionDescription,
            SignalingEvent::IceCandidate { .. } => EventKind::IceCandidate,
        }
    }

    pub fn peer(&self) -> &PeerId {
        match self {
            SignalingEvent::AddPeer { peer, .. }
            | SignalingEvent::RemovePeer { peer }
            | SignalingEvent::SessionDescription { peer, .. }
            | SignalingEvent::IceCandidate { peer, .. } => peer,
        }
    }
}

// Relays address peers either by bare id or by a peer object carrying `id`.
#[derive(Deserialize)]
#[serde(untagged)]
enum PeerRef {
    Id(PeerId),
    Object { id: PeerId },
}

fn peer_ref<'de, D>(deserializer: D) -> Result<PeerId, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match PeerRef::deserialize(deserializer)? {
        PeerRef::Id(id) => id,
        PeerRef::Object { id } => id,
    })
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unrecognized signaling event `{0}`")]
    UnknownEvent(String),
    #[error("signaling message has no event tag")]
    MissingEvent,
    #[error("signaling body must be a JSON object")]
    NotAnObject,
    #[error("malformed signaling message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Decodes a self-describing message (`{"event": ..., "peer": ..., ...}`).
pub fn decode_message(text: &str) -> Result<SignalingEvent, DecodeError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("event")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingEvent)?;
    kind.parse::<EventKind>()?;
    Ok(serde_json::from_value(value)?)
}

/// Decodes a message body whose kind travelled out of band, e.g. as an SSE event name.
pub fn decode_event(kind: &str, data: &str) -> Result<SignalingEvent, DecodeError> {
    let kind: EventKind = kind.parse()?;
    let mut value: Value = serde_json::from_str(data)?;
    let object = value.as_object_mut().ok_or(DecodeError::NotAnObject)?;
    object.insert("event".into(), Value::String(kind.as_str().into()));
    Ok(serde_json::from_value(value)?)
}

/// Outbound message relayed to a single peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relay {
    SessionDescription(SessionDescription),
    /// `None` marks the end of candidate gathering and is relayed as `null`.
    IceCandidate(Option<IceCandidate>),
}

impl Relay {
    pub fn event(&self) -> EventKind {
        match self {
            Relay::SessionDescription(_) => EventKind::SessionDescription,
            Relay::IceCandidate(_) => EventKind::IceCandidate,
        }
    }

    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Relay::SessionDescription(description) => serde_json::to_value(description),
            Relay::IceCandidate(candidate) => serde_json::to_value(candidate),
        }
    }

    /// The event the target observes when this message arrives from `from`.
    pub fn into_event(self, from: PeerId) -> SignalingEvent {
        match self {
            Relay::SessionDescription(description) => SignalingEvent::SessionDescription {
                peer: from,
                description,
            },
            Relay::IceCandidate(candidate) => SignalingEvent::IceCandidate {
                peer: from,
                candidate,
            },
        }
    }
}
