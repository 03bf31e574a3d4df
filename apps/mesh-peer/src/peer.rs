//! Couples a running coordinator to line-oriented input and output.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use mesh_negotiation::{NegotiationCoordinator, NegotiationError, PeerEvent};
use mesh_signaling::SignalingChannel;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, trace, warn};

/// Runs the coordinator's signaling loop on its own task.
pub(crate) fn spawn_signaling<S: SignalingChannel>(
    coordinator: &Arc<NegotiationCoordinator<S>>,
) -> JoinHandle<Result<(), NegotiationError>> {
    let runner = coordinator.clone();
    tokio::spawn(async move { runner.run().await })
}

/// Maps the end of the signaling task to the front end's result.
pub(crate) fn signaling_finished(
    joined: Result<Result<(), NegotiationError>, JoinError>,
) -> anyhow::Result<()> {
    match joined {
        Ok(result) => result.context("signaling failed"),
        Err(err) => Err(err).context("signaling task aborted"),
    }
}

/// Runs the coordinator and pumps data until `shutdown` resolves or signaling ends.
///
/// Every input line is broadcast to all open channels. Inbound channel data is written
/// to `output`, one payload per line.
pub async fn serve<S, R, W>(
    coordinator: Arc<NegotiationCoordinator<S>>,
    input: R,
    mut output: W,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()>
where
    S: SignalingChannel,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut events = coordinator.subscribe();
    let mut signaling = spawn_signaling(&coordinator);
    let mut lines = input.lines();
    let mut input_open = true;
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(target = "mesh.peer", "shutdown requested");
                break Ok(());
            }
            joined = &mut signaling => break signaling_finished(joined),
            line = lines.next_line(), if input_open => match line {
                Ok(Some(line)) => {
                    let delivered = coordinator.broadcast(Bytes::from(line.into_bytes())).await;
                    debug!(target = "mesh.peer", delivered, "broadcast input line");
                }
                Ok(None) => {
                    debug!(target = "mesh.peer", "input closed");
                    input_open = false;
                }
                Err(err) => break Err(err).context("failed to read input"),
            },
            event = events.recv() => match event {
                Ok(event) => {
                    if let Err(err) = report(&mut output, event).await {
                        break Err(err);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target = "mesh.peer", skipped, "dropped peer notifications");
                }
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    signaling.abort();
    coordinator.shutdown().await;
    outcome
}

async fn report<W: AsyncWrite + Unpin>(output: &mut W, event: PeerEvent) -> anyhow::Result<()> {
    match event {
        PeerEvent::PeerDataReceived { peer_id, data } => {
            trace!(target = "mesh.peer", peer = %peer_id, bytes = data.len(), "data received");
            let mut line = String::from_utf8_lossy(&data).into_owned();
            line.push('\n');
            output
                .write_all(line.as_bytes())
                .await
                .context("failed to write output")?;
            output.flush().await.context("failed to flush output")?;
        }
        PeerEvent::NewPeerReady { channel } => {
            info!(
                target = "mesh.peer",
                peer = %channel.peer_id(),
                channel = %channel.label(),
                "peer ready"
            );
        }
        PeerEvent::ConnectionStateChanged { peer_id, state } => {
            info!(target = "mesh.peer", peer = %peer_id, %state, "connection state changed");
        }
        PeerEvent::PeerSendCompleted { peer_id } => {
            trace!(target = "mesh.peer", peer = %peer_id, "send completed");
        }
    }
    Ok(())
}
