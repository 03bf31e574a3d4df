use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

const FILTER_VAR: &str = "MESH_LOG_FILTER";
const TRACE_DEPS_VAR: &str = "MESH_TRACE_DEPS";

/// Crates whose events follow `--log-level`.
const WORKSPACE_TARGETS: &[&str] = &["mesh_peer", "mesh_negotiation", "mesh_signaling"];

/// Chatty dependencies held at warn unless `MESH_TRACE_DEPS` is set.
const DEP_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_sctp",
    "webrtc_dtls",
    "webrtc_srtp",
    "webrtc_mdns",
    "webrtc_data",
    "tungstenite",
    "tokio_tungstenite",
    "hyper",
    "reqwest",
    "rustls",
    "h2",
];

static INIT: OnceLock<()> = OnceLock::new();
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if INIT.get().is_some() {
        return Ok(());
    }
    inner_init(config)?;
    INIT.set(()).ok();
    Ok(())
}

fn inner_init(config: &LogConfig) -> Result<(), InitError> {
    let (env_filter, throttled_deps) = build_env_filter(config.level.to_filter());

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_level(true)
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_ids(config.level >= LogLevel::Trace)
        .with_thread_names(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    if throttled_deps && config.level >= LogLevel::Debug {
        eprintln!(
            "[mesh-log] holding dependency logs at warn; set {TRACE_DEPS_VAR}=1 or {FILTER_VAR} to override"
        );
    }
    Ok(())
}

fn build_env_filter(level: LevelFilter) -> (EnvFilter, bool) {
    if let Ok(filter) = std::env::var(FILTER_VAR) {
        return (EnvFilter::new(filter), false);
    }
    let throttle = !env_truthy(TRACE_DEPS_VAR).unwrap_or(false);
    (EnvFilter::new(default_filter_for(level, throttle)), throttle)
}

fn default_filter_for(level: LevelFilter, throttle_deps: bool) -> String {
    let level = level.to_string().to_lowercase();
    if !throttle_deps {
        return level;
    }
    let mut filter = String::from("warn");
    for target in WORKSPACE_TARGETS {
        filter.push_str(&format!(",{target}={level}"));
    }
    for target in DEP_TARGETS {
        filter.push_str(&format!(",{target}=warn"));
    }
    filter
}

fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_crates_follow_the_requested_level() {
        let filter = default_filter_for(LevelFilter::DEBUG, true);
        assert!(filter.starts_with("warn,"));
        assert!(filter.contains("mesh_negotiation=debug"));
        assert!(filter.contains("mesh_signaling=debug"));
        assert!(filter.contains("webrtc_ice=warn"));
        assert!(filter.contains("tungstenite=warn"));
    }

    #[test]
    fn dependency_traces_can_be_released() {
        assert_eq!(default_filter_for(LevelFilter::TRACE, false), "trace");
    }

    #[test]
    fn levels_are_ordered_by_verbosity() {
        assert!(LogLevel::Trace > LogLevel::Debug);
        assert!(LogLevel::Warn > LogLevel::Error);
        assert_eq!(LogLevel::default().as_str(), "warn");
        assert_eq!(LogLevel::Info.to_filter(), LevelFilter::INFO);
    }
}
