use std::path::PathBuf;

use clap::{Args, Parser, ValueEnum};
use url::Url;

use crate::telemetry::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "mesh-peer",
    about = "Join a signaling relay and exchange data with every peer over WebRTC",
    version
)]
pub struct Cli {
    #[arg(
        long = "signal-url",
        env = "MESH_RELAY_URL",
        value_name = "URL",
        help = "Base address of the signaling relay (ws://, wss://, http:// or https://)"
    )]
    pub signal_url: String,

    #[arg(
        long,
        value_enum,
        help = "Signaling carrier; defaults to websocket for ws/wss URLs and event-stream otherwise"
    )]
    pub signaling: Option<SignalingKind>,

    #[arg(
        long = "peer-id",
        env = "MESH_PEER_ID",
        help = "Identity announced on the event-stream carrier (random when omitted)"
    )]
    pub peer_id: Option<String>,

    #[arg(long = "channel-label", env = "MESH_CHANNEL_LABEL")]
    pub channel_label: Option<String>,

    #[arg(
        long = "socket-dir",
        value_name = "DIR",
        env = "MESH_SOCKET_DIR",
        help = "Serve each peer as a Unix socket <DIR>/<peer>.sock (e.g. /tmp/webrtc) instead of stdin/stdout; DIR is emptied first"
    )]
    pub socket_dir: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingKind {
    Websocket,
    EventStream,
}

impl Cli {
    /// The explicit `--signaling` choice, else the one implied by the URL scheme.
    pub fn signaling_kind(&self) -> anyhow::Result<SignalingKind> {
        if let Some(kind) = self.signaling {
            return Ok(kind);
        }
        let url = Url::parse(&self.signal_url)?;
        match url.scheme() {
            "ws" | "wss" => Ok(SignalingKind::Websocket),
            "http" | "https" => Ok(SignalingKind::EventStream),
            other => anyhow::bail!("unsupported relay scheme {other:?}"),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "MESH_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "MESH_LOG_FILE",
        help = "Append logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("mesh-peer").chain(args.iter().copied()))
            .expect("valid arguments")
    }

    #[test]
    fn carrier_follows_the_url_scheme() {
        let cli = parse(&["--signal-url", "wss://relay.example/dev"]);
        assert_eq!(cli.signaling_kind().unwrap(), SignalingKind::Websocket);

        let cli = parse(&["--signal-url", "https://relay.example/mesh"]);
        assert_eq!(cli.signaling_kind().unwrap(), SignalingKind::EventStream);
    }

    #[test]
    fn explicit_carrier_wins() {
        let cli = parse(&[
            "--signal-url",
            "http://127.0.0.1:8080",
            "--signaling",
            "websocket",
        ]);
        assert_eq!(cli.signaling_kind().unwrap(), SignalingKind::Websocket);
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let cli = parse(&["--signal-url", "ftp://relay.example"]);
        assert!(cli.signaling_kind().is_err());
    }

    #[test]
    fn socket_dir_selects_the_socket_front_end() {
        let cli = parse(&["--signal-url", "ws://localhost:1"]);
        assert_eq!(cli.socket_dir, None);

        let cli = parse(&["--signal-url", "ws://localhost:1", "--socket-dir", "/tmp/webrtc"]);
        assert_eq!(cli.socket_dir, Some(PathBuf::from("/tmp/webrtc")));
    }

    #[test]
    fn logging_flags_map_to_config() {
        let cli = parse(&[
            "--signal-url",
            "ws://localhost:1",
            "--log-level",
            "debug",
            "--log-file",
            "/tmp/mesh.log",
        ]);
        let config = cli.logging.to_config();
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.file, Some(PathBuf::from("/tmp/mesh.log")));
    }
}
