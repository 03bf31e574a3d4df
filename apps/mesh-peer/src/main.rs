mod cli;
mod peer;
#[cfg(unix)]
mod sockets;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mesh_negotiation::{NegotiationConfig, NegotiationCoordinator, TransportEngine, WebRtcEngine};
use mesh_signaling::{EventStreamSignaling, SignalingChannel, WebSocketSignaling};
use tokio::io::BufReader;
use tracing::{info, warn};

use crate::cli::{Cli, SignalingKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry::init(&cli.logging.to_config())?;

    let mut config = NegotiationConfig::from_env();
    if let Some(label) = &cli.channel_label {
        config = config.with_channel_label(label.clone());
    }
    info!(
        target = "mesh.peer",
        relay = %cli.signal_url,
        ice_servers = config.ice_servers.len(),
        channel = %config.channel_label,
        log_level = cli.logging.level.as_str(),
        "starting"
    );

    let engine: Arc<dyn TransportEngine> = Arc::new(WebRtcEngine::default());
    match cli.signaling_kind()? {
        SignalingKind::Websocket => {
            if cli.peer_id.is_some() {
                warn!(target = "mesh.peer", "--peer-id is ignored by the websocket carrier");
            }
            let signaling = WebSocketSignaling::new(&cli.signal_url)
                .context("invalid websocket relay url")?;
            run(signaling, engine, config, cli.socket_dir).await
        }
        SignalingKind::EventStream => {
            let signaling = match &cli.peer_id {
                Some(id) => EventStreamSignaling::with_peer_id(&cli.signal_url, id.as_str().into()),
                None => EventStreamSignaling::new(&cli.signal_url),
            }
            .context("invalid event-stream relay url")?;
            info!(target = "mesh.peer", peer_id = %signaling.peer_id(), "event-stream identity");
            run(signaling, engine, config, cli.socket_dir).await
        }
    }
}

async fn run<S: SignalingChannel>(
    signaling: S,
    engine: Arc<dyn TransportEngine>,
    config: NegotiationConfig,
    socket_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let coordinator = NegotiationCoordinator::new(signaling, engine, config);
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = "mesh.peer", error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    if let Some(dir) = socket_dir {
        #[cfg(unix)]
        {
            return sockets::serve(coordinator, dir, shutdown).await;
        }
        #[cfg(not(unix))]
        {
            anyhow::bail!("--socket-dir {} needs Unix domain sockets", dir.display());
        }
    }
    peer::serve(
        coordinator,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        shutdown,
    )
    .await
}
