//! Deterministic in-memory engine.
//!
//! Models just enough of the offer/answer state machine to exercise negotiation: it
//! rejects answers without a pending offer, rolls back a local offer when a remote one
//! arrives, refuses candidates before a remote description, and records every call.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mesh_signaling::{IceCandidate, SdpKind, SessionDescription};
use parking_lot::Mutex;

use super::{
    ChannelState, DataChannelHandle, EngineConnection, EngineError, EngineEvent, EngineObserver,
    MessageGate, SignalingState, TransportEngine,
};
use crate::config::IceServerConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    Rollback,
    AddCandidate(Option<IceCandidate>),
    CreateChannel(String),
    Close,
}

pub struct MockEngine {
    name: String,
    next_id: AtomicUsize,
    fail_next_connection: AtomicBool,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::named("mock")
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine whose SDP bodies carry `name`, to tell sides apart in assertions.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next_id: AtomicUsize::new(0),
            fail_next_connection: AtomicBool::new(false),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Every connection created so far, oldest first.
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().clone()
    }

    pub fn last_connection(&self) -> Option<Arc<MockConnection>> {
        self.connections.lock().last().cloned()
    }

    pub fn fail_next_connection(&self) {
        self.fail_next_connection.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportEngine for MockEngine {
    async fn create_connection(
        &self,
        ice_servers: &[IceServerConfig],
        observer: EngineObserver,
    ) -> Result<Arc<dyn EngineConnection>, EngineError> {
        if self.fail_next_connection.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Setup("injected connection failure".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(MockConnection {
            tag: format!("{}-{id}", self.name),
            id,
            observer,
            ice_servers: ice_servers.to_vec(),
            state: Mutex::new(ConnectionModel::default()),
        });
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

pub struct MockConnection {
    tag: String,
    id: usize,
    observer: EngineObserver,
    ice_servers: Vec<IceServerConfig>,
    state: Mutex<ConnectionModel>,
}

struct ConnectionModel {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    ops: Vec<MockOp>,
    seq: u32,
    fail_next_local: bool,
    fail_candidates: bool,
    close_delay: Option<Duration>,
    channels: Vec<Arc<MockDataChannel>>,
}

impl Default for ConnectionModel {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            local: None,
            remote: None,
            ops: Vec::new(),
            seq: 0,
            fail_next_local: false,
            fail_candidates: false,
            close_delay: None,
            channels: Vec::new(),
        }
    }
}

impl MockConnection {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn ops(&self) -> Vec<MockOp> {
        self.state.lock().ops.clone()
    }

    pub fn ice_servers(&self) -> &[IceServerConfig] {
        &self.ice_servers
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().signaling == SignalingState::Closed
    }

    pub fn fail_next_local_description(&self) {
        self.state.lock().fail_next_local = true;
    }

    pub fn fail_candidates(&self, fail: bool) {
        self.state.lock().fail_candidates = fail;
    }

    /// Makes `close` take `delay` before the connection reports closed.
    pub fn delay_close(&self, delay: Duration) {
        self.state.lock().close_delay = Some(delay);
    }

    /// Raises an engine callback as if the engine produced it.
    pub fn emit(&self, event: EngineEvent) {
        self.observer.notify(event);
    }

    /// Channels created locally through `create_data_channel`.
    pub fn channels(&self) -> Vec<Arc<MockDataChannel>> {
        self.state.lock().channels.clone()
    }

    /// Moves the locally created channel `label` to open and reports it.
    pub fn open_channel(&self, label: &str) -> Option<Arc<MockDataChannel>> {
        let channel = self
            .state
            .lock()
            .channels
            .iter()
            .find(|channel| channel.label() == label)
            .cloned()?;
        channel.set_state(ChannelState::Open);
        self.emit(EngineEvent::ChannelOpen {
            label: label.to_string(),
        });
        Some(channel)
    }

    /// Hands an already open, remotely created channel to the observer. Its messages
    /// are held until the channel is accepted.
    pub fn deliver_channel(&self, label: &str) -> Arc<MockDataChannel> {
        let channel = Arc::new(MockDataChannel::inbound(label, self.observer.clone()));
        self.emit(EngineEvent::DataChannel(channel.clone()));
        channel
    }

    fn next_sdp(&self, model: &mut ConnectionModel, kind: SdpKind) -> SessionDescription {
        model.seq += 1;
        match kind {
            SdpKind::Offer => {
                SessionDescription::offer(format!("v=0 offer {} {}", self.tag, model.seq))
            }
            SdpKind::Answer => {
                SessionDescription::answer(format!("v=0 answer {} {}", self.tag, model.seq))
            }
        }
    }
}

#[async_trait]
impl EngineConnection for MockConnection {
    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn set_local_description(&self) -> Result<SessionDescription, EngineError> {
        let mut model = self.state.lock();
        if model.fail_next_local {
            model.fail_next_local = false;
            return Err(EngineError::Operation("injected local description failure".into()));
        }
        let description = match model.signaling {
            SignalingState::Stable | SignalingState::HaveLocalOffer => {
                let offer = self.next_sdp(&mut model, SdpKind::Offer);
                model.signaling = SignalingState::HaveLocalOffer;
                offer
            }
            SignalingState::HaveRemoteOffer => {
                let answer = self.next_sdp(&mut model, SdpKind::Answer);
                model.signaling = SignalingState::Stable;
                answer
            }
            SignalingState::Closed => return Err(EngineError::Closed),
            other => return Err(EngineError::InvalidState(other)),
        };
        model.local = Some(description.clone());
        model.ops.push(MockOp::SetLocal(description.clone()));
        Ok(description)
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        let mut model = self.state.lock();
        match (description.kind, model.signaling) {
            (_, SignalingState::Closed) => return Err(EngineError::Closed),
            (SdpKind::Offer, SignalingState::HaveLocalOffer) => {
                model.ops.push(MockOp::Rollback);
                model.local = None;
                model.signaling = SignalingState::HaveRemoteOffer;
            }
            (SdpKind::Offer, SignalingState::Stable) => {
                model.signaling = SignalingState::HaveRemoteOffer;
            }
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => {
                model.signaling = SignalingState::Stable;
            }
            (_, state) => return Err(EngineError::InvalidState(state)),
        }
        model.remote = Some(description.clone());
        model.ops.push(MockOp::SetRemote(description.clone()));
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        candidate: Option<&IceCandidate>,
    ) -> Result<(), EngineError> {
        let mut model = self.state.lock();
        if model.signaling == SignalingState::Closed {
            return Err(EngineError::Closed);
        }
        if model.fail_candidates {
            return Err(EngineError::Operation("injected candidate failure".into()));
        }
        if model.remote.is_none() {
            return Err(EngineError::Operation(
                "candidate arrived before a remote description".into(),
            ));
        }
        model.ops.push(MockOp::AddCandidate(candidate.cloned()));
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannelHandle>, EngineError> {
        let channel = Arc::new(MockDataChannel::local(label, self.observer.clone()));
        {
            let mut model = self.state.lock();
            if model.signaling == SignalingState::Closed {
                return Err(EngineError::Closed);
            }
            model.channels.push(channel.clone());
            model.ops.push(MockOp::CreateChannel(label.to_string()));
        }
        self.emit(EngineEvent::NegotiationNeeded);
        Ok(channel)
    }

    async fn close(&self) -> Result<(), EngineError> {
        let delay = self.state.lock().close_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let channels = {
            let mut model = self.state.lock();
            if model.signaling == SignalingState::Closed {
                return Ok(());
            }
            model.signaling = SignalingState::Closed;
            model.ops.push(MockOp::Close);
            model.channels.clone()
        };
        for channel in channels {
            channel.set_state(ChannelState::Closed);
        }
        Ok(())
    }
}

pub struct MockDataChannel {
    label: String,
    state: Mutex<ChannelState>,
    sent: Mutex<Vec<Bytes>>,
    fail_sends: AtomicBool,
    gate: Option<MessageGate>,
}

impl MockDataChannel {
    /// A detached channel; `receive` on it reports nothing.
    pub fn new(label: impl Into<String>, state: ChannelState) -> Self {
        Self::build(label.into(), state, None)
    }

    fn local(label: &str, observer: EngineObserver) -> Self {
        let gate = MessageGate::open(label, observer);
        Self::build(label.to_string(), ChannelState::Connecting, Some(gate))
    }

    fn inbound(label: &str, observer: EngineObserver) -> Self {
        let gate = MessageGate::held(label, observer);
        Self::build(label.to_string(), ChannelState::Open, Some(gate))
    }

    fn build(label: String, state: ChannelState, gate: Option<MessageGate>) -> Self {
        Self {
            label,
            state: Mutex::new(state),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            gate,
        }
    }

    /// A message arriving from the remote side of this channel.
    pub fn receive(&self, data: impl Into<Bytes>) {
        if let Some(gate) = &self.gate {
            gate.deliver(data.into());
        }
    }

    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataChannelHandle for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelState {
        *self.state.lock()
    }

    async fn send(&self, data: &Bytes) -> Result<(), EngineError> {
        if self.ready_state() != ChannelState::Open {
            return Err(EngineError::Operation(format!(
                "channel {} is not open",
                self.label
            )));
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(EngineError::Operation("injected send failure".into()));
        }
        self.sent.lock().push(data.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.set_state(ChannelState::Closed);
        Ok(())
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
