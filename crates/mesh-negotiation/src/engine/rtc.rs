use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mesh_signaling::{IceCandidate, SdpKind, SessionDescription};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    ChannelState, ConnectionState, DataChannelHandle, EngineConnection, EngineError, EngineEvent,
    EngineObserver, MessageGate, SignalingState, TransportEngine,
};
use crate::config::IceServerConfig;

/// Transport engine backed by the `webrtc` crate.
pub struct WebRtcEngine {
    api: Arc<API>,
}

impl WebRtcEngine {
    pub fn new() -> Self {
        Self {
            api: Arc::new(APIBuilder::new().build()),
        }
    }
}

impl Default for WebRtcEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportEngine for WebRtcEngine {
    async fn create_connection(
        &self,
        ice_servers: &[IceServerConfig],
        observer: EngineObserver,
    ) -> Result<Arc<dyn EngineConnection>, EngineError> {
        let ice_servers: Vec<RTCIceServer> = ice_servers.iter().map(to_rtc_ice_server).collect();
        let generation = Arc::new(AtomicU64::new(0));
        let pc = new_peer_connection(
            &self.api,
            &ice_servers,
            gated(&observer, &generation, 0),
        )
        .await
        .map_err(|err| EngineError::Setup(err.to_string()))?;

        Ok(Arc::new(WebRtcConnection {
            api: self.api.clone(),
            ice_servers,
            observer,
            generation,
            pc: RwLock::new(pc),
            local_channels: Mutex::new(Vec::new()),
        }))
    }
}

/// Wraps `observer` so it only forwards while `generation` still equals `wanted`.
fn gated(observer: &EngineObserver, generation: &Arc<AtomicU64>, wanted: u64) -> EngineObserver {
    let observer = observer.clone();
    let generation = generation.clone();
    EngineObserver::new(move |event| {
        if generation.load(Ordering::SeqCst) == wanted {
            observer.notify(event);
        }
    })
}

async fn new_peer_connection(
    api: &API,
    ice_servers: &[RTCIceServer],
    observer: EngineObserver,
) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
    let config = RTCConfiguration {
        ice_servers: ice_servers.to_vec(),
        ..Default::default()
    };
    let pc = Arc::new(api.new_peer_connection(config).await?);

    let ice_observer = observer.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let observer = ice_observer.clone();
        Box::pin(async move {
            let candidate = match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => Some(from_rtc_candidate(init)),
                    Err(err) => {
                        warn!(target = "mesh.negotiation", error = %err, "failed to serialize local candidate");
                        return;
                    }
                },
                None => None,
            };
            observer.notify(EngineEvent::IceCandidate(candidate));
        })
    }));

    let negotiation_observer = observer.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let observer = negotiation_observer.clone();
        Box::pin(async move {
            observer.notify(EngineEvent::NegotiationNeeded);
        })
    }));

    let state_observer = observer.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let observer = state_observer.clone();
        Box::pin(async move {
            trace!(target = "mesh.negotiation", state = ?state, "ice connection state");
            if let Some(state) = from_rtc_connection_state(state) {
                observer.notify(EngineEvent::ConnectionState(state));
            }
        })
    }));

    let channel_observer = observer;
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let observer = channel_observer.clone();
        Box::pin(async move {
            debug!(target = "mesh.negotiation", channel = %dc.label(), "inbound data channel");
            let gate = Arc::new(MessageGate::held(dc.label(), observer.clone()));
            wire_channel(&dc, &observer, gate.clone());
            observer.notify(EngineEvent::DataChannel(Arc::new(WebRtcDataChannel {
                label: dc.label().to_string(),
                inner: RwLock::new(dc),
                gate: Some(gate),
            })));
        })
    }));

    Ok(pc)
}

struct WebRtcConnection {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
    observer: EngineObserver,
    /// Bumped whenever `pc` is replaced; callbacks of older connections go quiet.
    generation: Arc<AtomicU64>,
    pc: RwLock<Arc<RTCPeerConnection>>,
    local_channels: Mutex<Vec<Arc<WebRtcDataChannel>>>,
}

impl WebRtcConnection {
    fn pc(&self) -> Arc<RTCPeerConnection> {
        self.pc.read().clone()
    }

    /// Discards the pending local offer.
    ///
    /// webrtc-rs has no rollback transition out of `have-local-offer`, so the peer
    /// connection is replaced by a fresh one in `stable`. Locally created channels are
    /// recreated on it under the same handles, and the old connection is closed
    /// without its callbacks reaching the observer.
    async fn rollback(&self) -> Result<(), EngineError> {
        let next = self.generation.load(Ordering::SeqCst) + 1;
        let observer = gated(&self.observer, &self.generation, next);
        let fresh = new_peer_connection(&self.api, &self.ice_servers, observer.clone())
            .await
            .map_err(operation)?;

        let handles = self.local_channels.lock().clone();
        let mut replacements = Vec::with_capacity(handles.len());
        for handle in &handles {
            match fresh.create_data_channel(&handle.label, Some(channel_init())).await {
                Ok(dc) => replacements.push(dc),
                Err(err) => {
                    let _ = fresh.close().await;
                    return Err(operation(err));
                }
            }
        }

        self.generation.store(next, Ordering::SeqCst);
        for (handle, dc) in handles.iter().zip(replacements) {
            let gate = Arc::new(MessageGate::open(handle.label.as_str(), observer.clone()));
            wire_channel(&dc, &observer, gate);
            *handle.inner.write() = dc;
        }
        let stale = std::mem::replace(&mut *self.pc.write(), fresh);
        if let Err(err) = stale.close().await {
            debug!(target = "mesh.negotiation", error = %err, "closing rolled back connection failed");
        }
        debug!(target = "mesh.negotiation", channels = handles.len(), "rolled back local offer");
        Ok(())
    }
}

#[async_trait]
impl EngineConnection for WebRtcConnection {
    fn signaling_state(&self) -> SignalingState {
        match self.pc().signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn set_local_description(&self) -> Result<SessionDescription, EngineError> {
        let pc = self.pc();
        let description = match self.signaling_state() {
            SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPranswer => {
                pc.create_answer(None).await.map_err(operation)?
            }
            SignalingState::Closed => return Err(EngineError::Closed),
            _ => pc.create_offer(None).await.map_err(operation)?,
        };
        let kind = match description.sdp_type {
            RTCSdpType::Answer => SdpKind::Answer,
            _ => SdpKind::Offer,
        };
        let sdp = description.sdp.clone();
        pc.set_local_description(description)
            .await
            .map_err(operation)?;
        Ok(SessionDescription { kind, sdp })
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        let remote = match description.kind {
            SdpKind::Offer => {
                if self.signaling_state() == SignalingState::HaveLocalOffer {
                    self.rollback().await?;
                }
                RTCSessionDescription::offer(description.sdp.clone()).map_err(operation)?
            }
            SdpKind::Answer => {
                RTCSessionDescription::answer(description.sdp.clone()).map_err(operation)?
            }
        };
        self.pc()
            .set_remote_description(remote)
            .await
            .map_err(operation)
    }

    async fn add_ice_candidate(
        &self,
        candidate: Option<&IceCandidate>,
    ) -> Result<(), EngineError> {
        let Some(candidate) = candidate else {
            // End of remote gathering needs no action here.
            return Ok(());
        };
        self.pc()
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(operation)
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannelHandle>, EngineError> {
        let observer = gated(
            &self.observer,
            &self.generation,
            self.generation.load(Ordering::SeqCst),
        );
        let dc = self
            .pc()
            .create_data_channel(label, Some(channel_init()))
            .await
            .map_err(operation)?;
        let gate = Arc::new(MessageGate::open(label, observer.clone()));
        wire_channel(&dc, &observer, gate);
        let handle = Arc::new(WebRtcDataChannel {
            label: label.to_string(),
            inner: RwLock::new(dc),
            gate: None,
        });
        self.local_channels.lock().push(handle.clone());
        Ok(handle)
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.pc().close().await.map_err(operation)
    }
}

struct WebRtcDataChannel {
    label: String,
    /// Swapped when a rollback moves a local channel to a new peer connection.
    inner: RwLock<Arc<RTCDataChannel>>,
    /// Present on inbound channels only.
    gate: Option<Arc<MessageGate>>,
}

impl WebRtcDataChannel {
    fn current(&self) -> Arc<RTCDataChannel> {
        self.inner.read().clone()
    }
}

#[async_trait]
impl DataChannelHandle for WebRtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelState {
        match self.current().ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        }
    }

    async fn send(&self, data: &Bytes) -> Result<(), EngineError> {
        self.current().send(data).await.map(|_| ()).map_err(operation)
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.current().close().await.map_err(operation)
    }

    fn accept(&self) {
        if let Some(gate) = &self.gate {
            gate.accept();
        }
    }

    fn reject(&self) {
        if let Some(gate) = &self.gate {
            gate.reject();
        }
    }
}

fn channel_init() -> RTCDataChannelInit {
    RTCDataChannelInit {
        ordered: Some(true),
        ..Default::default()
    }
}

fn wire_channel(dc: &Arc<RTCDataChannel>, observer: &EngineObserver, gate: Arc<MessageGate>) {
    let open_label = dc.label().to_string();
    let open_observer = observer.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            debug!(target = "mesh.negotiation", channel = %open_label, "data channel open");
            open_observer.notify(EngineEvent::ChannelOpen { label: open_label });
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let gate = gate.clone();
        Box::pin(async move {
            gate.deliver(msg.data);
        })
    }));
}

fn operation(err: webrtc::Error) -> EngineError {
    EngineError::Operation(err.to_string())
}

fn to_rtc_ice_server(server: &IceServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn to_rtc_candidate(candidate: &IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate.clone(),
        sdp_mid: candidate.sdp_mid.clone(),
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment.clone(),
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn from_rtc_connection_state(state: RTCIceConnectionState) -> Option<ConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => ConnectionState::New,
        RTCIceConnectionState::Checking => ConnectionState::Checking,
        RTCIceConnectionState::Connected => ConnectionState::Connected,
        RTCIceConnectionState::Completed => ConnectionState::Completed,
        RTCIceConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCIceConnectionState::Failed => ConnectionState::Failed,
        RTCIceConnectionState::Closed => ConnectionState::Closed,
        _ => return None,
    })
}
