//! Exposes every ready peer channel as a Unix socket, `<dir>/<peer>.sock`.
//!
//! Bytes written by a socket client go to that peer's data channel and data received
//! from the peer is written back to the client. One client is served at a time per
//! socket; the next one is accepted when it disconnects.

use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use mesh_negotiation::{NegotiationCoordinator, PeerChannel, PeerEvent};
use mesh_signaling::{PeerId, SignalingChannel};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::peer::{signaling_finished, spawn_signaling};

const READ_CHUNK: usize = 16 * 1024;
const INBOUND_BACKLOG: usize = 256;
const PRUNE_INTERVAL: Duration = Duration::from_secs(1);

/// Runs the coordinator and bridges each ready peer to a socket under `dir` until
/// `shutdown` resolves or signaling ends. `dir` is emptied first.
pub async fn serve<S: SignalingChannel>(
    coordinator: Arc<NegotiationCoordinator<S>>,
    dir: PathBuf,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    prepare_dir(&dir).await?;
    info!(target = "mesh.peer", dir = %dir.display(), "serving peer sockets");

    let mut events = coordinator.subscribe();
    let mut signaling = spawn_signaling(&coordinator);
    let mut bridges: HashMap<PeerId, PeerSocket> = HashMap::new();
    let mut prune = tokio::time::interval(PRUNE_INTERVAL);
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(target = "mesh.peer", "shutdown requested");
                break Ok(());
            }
            joined = &mut signaling => break signaling_finished(joined),
            _ = prune.tick() => {
                // Peers removed through signaling leave no state event behind.
                bridges.retain(|peer, _| coordinator.registry().contains(peer));
            }
            event = events.recv() => match event {
                Ok(PeerEvent::NewPeerReady { channel }) => {
                    let peer = channel.peer_id().clone();
                    match PeerSocket::bind(&dir, channel) {
                        Ok(socket) => {
                            info!(target = "mesh.peer", peer = %peer, path = %socket.path.display(), "peer socket ready");
                            bridges.insert(peer, socket);
                        }
                        Err(err) => {
                            warn!(target = "mesh.peer", peer = %peer, error = %err, "failed to bind peer socket");
                        }
                    }
                }
                Ok(PeerEvent::PeerDataReceived { peer_id, data }) => match bridges.get(&peer_id) {
                    Some(socket) => socket.forward(data),
                    None => trace!(target = "mesh.peer", peer = %peer_id, "data for peer without socket"),
                },
                Ok(PeerEvent::ConnectionStateChanged { peer_id, state }) => {
                    debug!(target = "mesh.peer", peer = %peer_id, %state, "connection state changed");
                    if state.is_terminal() && bridges.remove(&peer_id).is_some() {
                        info!(target = "mesh.peer", peer = %peer_id, "peer socket removed");
                    }
                }
                Ok(PeerEvent::PeerSendCompleted { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target = "mesh.peer", skipped, "dropped peer notifications");
                }
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    signaling.abort();
    bridges.clear();
    coordinator.shutdown().await;
    outcome
}

async fn prepare_dir(dir: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to clear {}", dir.display()));
        }
    }
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))
}

/// File name for a peer's socket; characters outside `[A-Za-z0-9._-]` become `_`.
fn socket_name(peer: &PeerId) -> String {
    let mut name: String = peer
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.starts_with('.') {
        name.replace_range(..1, "_");
    }
    name.push_str(".sock");
    name
}

/// A bound socket and the task serving it. Dropping it stops the task and unlinks
/// the socket file.
struct PeerSocket {
    path: PathBuf,
    inbound: mpsc::Sender<Bytes>,
    task: JoinHandle<()>,
}

impl PeerSocket {
    fn bind(dir: &Path, channel: PeerChannel) -> anyhow::Result<Self> {
        let path = dir.join(socket_name(channel.peer_id()));
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to remove {}", path.display()));
            }
        }
        let listener = UnixListener::bind(&path)
            .with_context(|| format!("failed to bind {}", path.display()))?;
        let (inbound, inbound_rx) = mpsc::channel(INBOUND_BACKLOG);
        let task = tokio::spawn(accept_clients(listener, channel, inbound_rx));
        Ok(Self {
            path,
            inbound,
            task,
        })
    }

    /// Queues peer data for the attached client, or the next one to attach.
    fn forward(&self, data: Bytes) {
        match self.inbound.try_send(data) {
            Ok(()) => {}
            Err(TrySendError::Full(data)) => {
                warn!(target = "mesh.peer", path = %self.path.display(), bytes = data.len(), "socket backlog full, dropping data");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(target = "mesh.peer", path = %self.path.display(), "socket task stopped");
            }
        }
    }
}

impl Drop for PeerSocket {
    fn drop(&mut self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn accept_clients(
    listener: UnixListener,
    channel: PeerChannel,
    mut inbound: mpsc::Receiver<Bytes>,
) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(err) => {
                warn!(target = "mesh.peer", peer = %channel.peer_id(), error = %err, "socket accept failed");
                break;
            }
        };
        debug!(target = "mesh.peer", peer = %channel.peer_id(), "socket client attached");
        if let Err(err) = pump(stream, &channel, &mut inbound).await {
            warn!(target = "mesh.peer", peer = %channel.peer_id(), error = %err, "socket client terminated");
        }
        debug!(target = "mesh.peer", peer = %channel.peer_id(), "socket client detached");
    }
}

/// Copies bytes both ways until the client hangs up or the peer goes away.
async fn pump(
    stream: UnixStream,
    channel: &PeerChannel,
    inbound: &mut mpsc::Receiver<Bytes>,
) -> anyhow::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = read.context("failed to read from socket client")?;
                if n == 0 {
                    return Ok(());
                }
                channel
                    .send(Bytes::copy_from_slice(&buf[..n]))
                    .await
                    .context("failed to send to peer")?;
            }
            data = inbound.recv() => {
                let Some(data) = data else {
                    let _ = writer.shutdown().await;
                    return Ok(());
                };
                writer
                    .write_all(&data)
                    .await
                    .context("failed to write to socket client")?;
            }
        }
    }
}
