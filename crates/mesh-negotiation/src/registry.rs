use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mesh_signaling::{PeerId, SignalingEvent};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

use crate::broadcast::PeerChannel;
use crate::engine::{EngineConnection, EngineEvent};

/// Perfect-negotiation flags for one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiationState {
    pub making_offer: bool,
    pub ignore_offer: bool,
    pub is_setting_remote_answer_pending: bool,
}

/// Work serviced in order by a peer's worker.
#[derive(Debug)]
pub(crate) enum PeerTask {
    /// Create the local data channel (polite side only).
    OpenChannel,
    Signal(SignalingEvent),
    Engine(EngineEvent),
    Shutdown,
}

pub struct PeerSession {
    peer_id: PeerId,
    polite: bool,
    negotiation: Mutex<NegotiationState>,
    connection: Arc<dyn EngineConnection>,
    channel: RwLock<Option<PeerChannel>>,
    ready: AtomicBool,
    released: AtomicBool,
    inbox: mpsc::UnboundedSender<PeerTask>,
}

impl PeerSession {
    pub(crate) fn new(
        peer_id: PeerId,
        polite: bool,
        connection: Arc<dyn EngineConnection>,
        inbox: mpsc::UnboundedSender<PeerTask>,
    ) -> Self {
        Self {
            peer_id,
            polite,
            negotiation: Mutex::new(NegotiationState::default()),
            connection,
            channel: RwLock::new(None),
            ready: AtomicBool::new(false),
            released: AtomicBool::new(false),
            inbox,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn polite(&self) -> bool {
        self.polite
    }

    pub fn negotiation(&self) -> NegotiationState {
        *self.negotiation.lock()
    }

    pub(crate) fn update_negotiation<R>(&self, f: impl FnOnce(&mut NegotiationState) -> R) -> R {
        f(&mut self.negotiation.lock())
    }

    pub fn connection(&self) -> &Arc<dyn EngineConnection> {
        &self.connection
    }

    pub fn channel(&self) -> Option<PeerChannel> {
        self.channel.read().clone()
    }

    /// True once the channel has been surfaced to the application.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub(crate) fn attach_channel(&self, channel: PeerChannel) {
        *self.channel.write() = Some(channel);
    }

    /// Flags the channel as surfaced; returns false when it already was.
    pub(crate) fn mark_ready(&self) -> bool {
        !self.ready.swap(true, Ordering::SeqCst)
    }

    /// Sets `making_offer` until the returned guard drops.
    pub(crate) fn begin_offer(&self) -> MakingOfferGuard<'_> {
        self.negotiation.lock().making_offer = true;
        MakingOfferGuard { session: self }
    }

    pub(crate) fn enqueue(&self, task: PeerTask) -> bool {
        self.inbox.send(task).is_ok()
    }

    /// Hands the close to the worker behind the inbox, or to a spawned task once that
    /// worker is gone. Never waits on the engine.
    pub(crate) fn retire(self: &Arc<Self>) {
        if self.inbox.send(PeerTask::Shutdown).is_err() {
            let session = self.clone();
            tokio::spawn(async move { session.release().await });
        }
    }

    /// Closes the channel and connection. Only the first call does any work.
    pub(crate) async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let channel = self.channel.write().take();
        if let Some(channel) = channel {
            if let Err(err) = channel.close().await {
                debug!(target = "mesh.negotiation", peer = %self.peer_id, error = %err, "channel close failed");
            }
        }
        if let Err(err) = self.connection.close().await {
            debug!(target = "mesh.negotiation", peer = %self.peer_id, error = %err, "connection close failed");
        }
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer_id", &self.peer_id)
            .field("polite", &self.polite)
            .field("negotiation", &self.negotiation())
            .field("ready", &self.is_ready())
            .finish()
    }
}

pub(crate) struct MakingOfferGuard<'a> {
    session: &'a PeerSession,
}

impl Drop for MakingOfferGuard<'_> {
    fn drop(&mut self) {
        self.session.negotiation.lock().making_offer = false;
    }
}

/// Live sessions keyed by peer. At most one session per peer.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    sessions: RwLock<HashMap<PeerId, Arc<PeerSession>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts unless the peer already has a session; returns whether it was inserted.
    pub(crate) fn insert(&self, session: Arc<PeerSession>) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(session.peer_id()) {
            return false;
        }
        sessions.insert(session.peer_id().clone(), session);
        true
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<Arc<PeerSession>> {
        self.sessions.read().get(peer_id).cloned()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.sessions.read().contains_key(peer_id)
    }

    /// Unregisters the peer's session and retires it in the background. Absent peers
    /// are a no-op.
    pub fn remove(&self, peer_id: &PeerId) -> bool {
        let removed = self.sessions.write().remove(peer_id);
        match removed {
            Some(session) => {
                session.retire();
                true
            }
            None => false,
        }
    }

    /// Removes `session` only if it is still the live session for its peer, so a stale
    /// worker cannot retire a newer session for the same id.
    pub(crate) fn remove_session(&self, session: &Arc<PeerSession>) -> bool {
        let removed = {
            let mut sessions = self.sessions.write();
            match sessions.get(session.peer_id()) {
                Some(current) if Arc::ptr_eq(current, session) => {
                    sessions.remove(session.peer_id())
                }
                _ => None,
            }
        };
        match removed {
            Some(session) => {
                session.retire();
                true
            }
            None => false,
        }
    }

    pub fn is_current(&self, session: &Arc<PeerSession>) -> bool {
        self.sessions
            .read()
            .get(session.peer_id())
            .is_some_and(|current| Arc::ptr_eq(current, session))
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Every attached channel, whatever its state.
    pub fn channels(&self) -> Vec<PeerChannel> {
        self.sessions
            .read()
            .values()
            .filter_map(|session| session.channel())
            .collect()
    }

    /// Removes every session and waits for each to close.
    pub(crate) async fn clear(&self) {
        let drained: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in drained {
            session.enqueue(PeerTask::Shutdown);
            session.release().await;
        }
    }
}
