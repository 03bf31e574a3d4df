//! Perfect negotiation over an abstract signaling channel.
//!
//! One dispatch loop consumes the signaling stream. Every peer gets its own worker task
//! fed by a FIFO inbox that carries both the signaling events routed to that peer and
//! the callbacks its engine connection raises, so handlers for one peer never overlap
//! while different peers progress independently.
//!
//! Glare is resolved by politeness: the relay makes exactly one side of every pair
//! impolite. On an offer collision the impolite side ignores the incoming offer and
//! keeps its own; the polite side rolls its offer back and answers.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use mesh_signaling::{
    IceCandidate, PeerId, Relay, SessionDescription, SignalingChannel, SignalingEvent,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::broadcast::{BroadcastRouter, PeerChannel};
use crate::config::NegotiationConfig;
use crate::engine::{
    ConnectionState, DataChannelHandle, EngineEvent, EngineObserver, SignalingState,
    TransportEngine,
};
use crate::error::NegotiationError;
use crate::events::{PeerEvent, PeerEvents};
use crate::registry::{PeerRegistry, PeerSession, PeerTask};

pub struct NegotiationCoordinator<S: SignalingChannel> {
    signaling: S,
    engine: Arc<dyn TransportEngine>,
    registry: Arc<PeerRegistry>,
    events: PeerEvents,
    config: NegotiationConfig,
}

impl<S: SignalingChannel> NegotiationCoordinator<S> {
    pub fn new(
        signaling: S,
        engine: Arc<dyn TransportEngine>,
        config: NegotiationConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            signaling,
            engine,
            registry: Arc::new(PeerRegistry::new()),
            events: PeerEvents::new(config.event_capacity),
            config,
        })
    }

    pub fn signaling(&self) -> &S {
        &self.signaling
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &PeerEvents {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &NegotiationConfig {
        &self.config
    }

    pub fn router(&self) -> BroadcastRouter {
        BroadcastRouter::new(self.registry.clone())
    }

    /// Sends `payload` to every open channel; see [`BroadcastRouter::broadcast`].
    pub async fn broadcast(&self, payload: Bytes) -> usize {
        self.router().broadcast(payload).await
    }

    /// Connects the signaling channel and services it until the stream ends.
    pub async fn run(self: &Arc<Self>) -> Result<(), NegotiationError> {
        let mut stream = self.signaling.connect().await?;
        info!(
            target = "mesh.negotiation",
            local_id = ?self.signaling.local_id().map(|id| id.to_string()),
            "signaling connected"
        );
        while let Some(event) = stream.next().await {
            self.dispatch(event).await;
        }
        info!(target = "mesh.negotiation", "signaling stream ended");
        Ok(())
    }

    /// Releases every session.
    pub async fn shutdown(&self) {
        self.registry.clear().await;
    }

    /// Handles one inbound signaling event. Peer-scoped events are queued for that
    /// peer's worker; events for unknown peers are logged and dropped.
    pub async fn dispatch(self: &Arc<Self>, event: SignalingEvent) {
        trace!(target = "mesh.negotiation", kind = %event.kind(), peer = %event.peer(), "signaling event");
        match event {
            SignalingEvent::AddPeer { peer, polite } => self.on_add_peer(peer, polite).await,
            SignalingEvent::RemovePeer { peer } => self.on_remove_peer(&peer),
            SignalingEvent::SessionDescription { .. } | SignalingEvent::IceCandidate { .. } => {
                let Some(session) = self.registry.get(event.peer()) else {
                    warn!(
                        target = "mesh.negotiation",
                        peer = %event.peer(),
                        kind = %event.kind(),
                        "dropping event for unregistered peer"
                    );
                    return;
                };
                if !session.enqueue(PeerTask::Signal(event)) {
                    debug!(target = "mesh.negotiation", peer = %session.peer_id(), "peer worker already stopped");
                }
            }
        }
    }

    async fn on_add_peer(self: &Arc<Self>, peer_id: PeerId, polite: bool) {
        if self.registry.contains(&peer_id) {
            warn!(target = "mesh.negotiation", peer = %peer_id, "ignoring add-peer for live session");
            return;
        }

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let observer_tx = inbox_tx.clone();
        let observer = EngineObserver::new(move |event| {
            let _ = observer_tx.send(PeerTask::Engine(event));
        });
        let connection = match self
            .engine
            .create_connection(&self.config.ice_servers, observer)
            .await
        {
            Ok(connection) => connection,
            Err(err) => {
                warn!(target = "mesh.negotiation", peer = %peer_id, error = %err, "failed to create connection");
                return;
            }
        };

        let session = Arc::new(PeerSession::new(peer_id.clone(), polite, connection, inbox_tx));
        if !self.registry.insert(session.clone()) {
            let _ = session.connection().close().await;
            return;
        }
        info!(target = "mesh.negotiation", peer = %peer_id, polite, "peer added");

        if polite {
            session.enqueue(PeerTask::OpenChannel);
        }
        self.spawn_worker(session, inbox_rx);
    }

    /// Unregisters at once; the peer's worker closes the connection behind any queued work.
    fn on_remove_peer(&self, peer_id: &PeerId) {
        if self.registry.remove(peer_id) {
            info!(target = "mesh.negotiation", peer = %peer_id, "peer removed");
        } else {
            debug!(target = "mesh.negotiation", peer = %peer_id, "remove-peer for unknown peer");
        }
    }

    fn spawn_worker(
        self: &Arc<Self>,
        session: Arc<PeerSession>,
        mut inbox: mpsc::UnboundedReceiver<PeerTask>,
    ) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(task) = inbox.recv().await {
                if matches!(task, PeerTask::Shutdown) {
                    session.release().await;
                    break;
                }
                if !coordinator.registry.is_current(&session) {
                    // Retired; drain until the shutdown arrives.
                    continue;
                }
                let result = match task {
                    PeerTask::Shutdown => break,
                    PeerTask::OpenChannel => coordinator.open_local_channel(&session).await,
                    PeerTask::Signal(event) => coordinator.handle_signal(&session, event).await,
                    PeerTask::Engine(event) => coordinator.handle_engine(&session, event).await,
                };
                if let Err(err) = result {
                    warn!(
                        target = "mesh.negotiation",
                        peer = %session.peer_id(),
                        error = %err,
                        "negotiation step failed"
                    );
                }
            }
            debug!(target = "mesh.negotiation", peer = %session.peer_id(), "peer worker stopped");
        });
    }

    async fn handle_signal(
        &self,
        session: &Arc<PeerSession>,
        event: SignalingEvent,
    ) -> Result<(), NegotiationError> {
        match event {
            SignalingEvent::SessionDescription { description, .. } => {
                self.on_remote_session_description(session, description)
                    .await
            }
            SignalingEvent::IceCandidate { candidate, .. } => {
                self.on_remote_ice_candidate(session, candidate).await
            }
            SignalingEvent::AddPeer { .. } | SignalingEvent::RemovePeer { .. } => Ok(()),
        }
    }

    async fn handle_engine(
        &self,
        session: &Arc<PeerSession>,
        event: EngineEvent,
    ) -> Result<(), NegotiationError> {
        match event {
            EngineEvent::IceCandidate(candidate) => {
                self.on_ice_candidate_generated(session, candidate).await
            }
            EngineEvent::NegotiationNeeded => {
                self.on_negotiation_needed(session).await;
                Ok(())
            }
            EngineEvent::ConnectionState(state) => {
                self.on_connection_state_change(session, state).await;
                Ok(())
            }
            EngineEvent::DataChannel(handle) => {
                self.on_data_channel_received(session, handle);
                Ok(())
            }
            EngineEvent::ChannelOpen { label } => {
                self.on_channel_open(session, &label);
                Ok(())
            }
            EngineEvent::ChannelMessage { data, .. } => {
                self.events.emit(PeerEvent::PeerDataReceived {
                    peer_id: session.peer_id().clone(),
                    data,
                });
                Ok(())
            }
        }
    }

    async fn open_local_channel(&self, session: &Arc<PeerSession>) -> Result<(), NegotiationError> {
        let handle = session
            .connection()
            .create_data_channel(&self.config.channel_label)
            .await?;
        debug!(
            target = "mesh.negotiation",
            peer = %session.peer_id(),
            channel = %handle.label(),
            "created data channel"
        );
        session.attach_channel(PeerChannel::new(
            session.peer_id().clone(),
            handle,
            self.events.clone(),
        ));
        Ok(())
    }

    /// Makes and relays a fresh offer. Failures are logged, never propagated, and
    /// `making_offer` is cleared on every path.
    pub(crate) async fn on_negotiation_needed(&self, session: &Arc<PeerSession>) {
        let _making_offer = session.begin_offer();
        let result = async {
            let description = session.connection().set_local_description().await?;
            trace!(
                target = "mesh.negotiation",
                peer = %session.peer_id(),
                kind = ?description.kind,
                "relaying local description"
            );
            self.signaling
                .send(session.peer_id(), Relay::SessionDescription(description))
                .await?;
            Ok::<_, NegotiationError>(())
        }
        .await;
        if let Err(err) = result {
            warn!(
                target = "mesh.negotiation",
                peer = %session.peer_id(),
                error = %err,
                "failed to make offer"
            );
        }
    }

    pub(crate) async fn on_ice_candidate_generated(
        &self,
        session: &Arc<PeerSession>,
        candidate: Option<IceCandidate>,
    ) -> Result<(), NegotiationError> {
        self.signaling
            .send(session.peer_id(), Relay::IceCandidate(candidate))
            .await?;
        Ok(())
    }

    pub(crate) async fn on_remote_session_description(
        &self,
        session: &Arc<PeerSession>,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let connection = session.connection();
        let signaling_state = connection.signaling_state();
        let is_offer = description.is_offer();
        let polite = session.polite();

        let ignore_offer = session.update_negotiation(|state| {
            let ready_for_offer = !state.making_offer
                && (signaling_state == SignalingState::Stable
                    || state.is_setting_remote_answer_pending);
            let offer_collision = is_offer && !ready_for_offer;
            state.ignore_offer = !polite && offer_collision;
            if !state.ignore_offer {
                state.is_setting_remote_answer_pending = description.is_answer();
            }
            state.ignore_offer
        });
        if ignore_offer {
            debug!(
                target = "mesh.negotiation",
                peer = %session.peer_id(),
                signaling_state = %signaling_state,
                "ignoring colliding offer"
            );
            return Ok(());
        }

        let applied = connection.set_remote_description(&description).await;
        session.update_negotiation(|state| state.is_setting_remote_answer_pending = false);
        applied?;

        if is_offer {
            let answer = connection.set_local_description().await?;
            self.signaling
                .send(session.peer_id(), Relay::SessionDescription(answer))
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn on_remote_ice_candidate(
        &self,
        session: &Arc<PeerSession>,
        candidate: Option<IceCandidate>,
    ) -> Result<(), NegotiationError> {
        match session.connection().add_ice_candidate(candidate.as_ref()).await {
            Ok(()) => Ok(()),
            Err(err) if session.negotiation().ignore_offer => {
                debug!(
                    target = "mesh.negotiation",
                    peer = %session.peer_id(),
                    error = %err,
                    "suppressed candidate for ignored offer"
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) async fn on_connection_state_change(
        &self,
        session: &Arc<PeerSession>,
        state: ConnectionState,
    ) {
        debug!(target = "mesh.negotiation", peer = %session.peer_id(), %state, "connection state");
        if state.is_terminal() && self.registry.remove_session(session) {
            info!(target = "mesh.negotiation", peer = %session.peer_id(), %state, "peer connection ended");
            session.release().await;
        }
        self.events.emit(PeerEvent::ConnectionStateChanged {
            peer_id: session.peer_id().clone(),
            state,
        });
    }

    /// Inbound channels are already usable when the engine hands them over. Their
    /// messages reach subscribers only once the channel is accepted here.
    pub(crate) fn on_data_channel_received(
        &self,
        session: &Arc<PeerSession>,
        handle: Arc<dyn DataChannelHandle>,
    ) {
        if session.polite() {
            debug!(
                target = "mesh.negotiation",
                peer = %session.peer_id(),
                channel = %handle.label(),
                "polite side ignores inbound channel"
            );
            handle.reject();
            return;
        }
        let channel = PeerChannel::new(session.peer_id().clone(), handle.clone(), self.events.clone());
        session.attach_channel(channel.clone());
        handle.accept();
        if session.mark_ready() {
            info!(target = "mesh.negotiation", peer = %session.peer_id(), "peer ready");
            self.events.emit(PeerEvent::NewPeerReady { channel });
        }
    }

    /// Surfaces a locally created channel once it opens.
    pub(crate) fn on_channel_open(&self, session: &Arc<PeerSession>, label: &str) {
        let Some(channel) = session.channel() else {
            return;
        };
        if channel.label() != label || !session.mark_ready() {
            return;
        }
        info!(target = "mesh.negotiation", peer = %session.peer_id(), "peer ready");
        self.events.emit(PeerEvent::NewPeerReady { channel });
    }
}
