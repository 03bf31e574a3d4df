use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_CHANNEL_LABEL: &str = "updates";
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    pub ice_servers: Vec<IceServerConfig>,
    /// Label of the data channel the polite side opens toward each peer.
    pub channel_label: String,
    /// Capacity of the notification hub; slow subscribers past this lag behind.
    pub event_capacity: usize,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig::new(DEFAULT_STUN_URL)],
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl NegotiationConfig {
    /// Defaults adjusted by `MESH_DISABLE_STUN` and `MESH_ICE_SERVERS`.
    ///
    /// `MESH_ICE_SERVERS` is either a comma separated URL list or a JSON array of
    /// `{"urls": [...], "username": ..., "credential": ...}` objects.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("MESH_ICE_SERVERS") {
            match parse_ice_servers(&raw) {
                Ok(servers) => config.ice_servers = servers,
                Err(err) => {
                    warn!(target = "mesh.negotiation", error = %err, "ignoring MESH_ICE_SERVERS");
                }
            }
        }
        if env_truthy("MESH_DISABLE_STUN") {
            config.ice_servers.clear();
        }
        config
    }

    pub fn with_ice_servers(mut self, ice_servers: Vec<IceServerConfig>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    pub fn with_channel_label(mut self, label: impl Into<String>) -> Self {
        self.channel_label = label.into();
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

fn env_truthy(var: &str) -> bool {
    std::env::var(var)
        .map(|value| value != "0" && !value.is_empty())
        .unwrap_or(false)
}

pub fn parse_ice_servers(raw: &str) -> Result<Vec<IceServerConfig>, serde_json::Error> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed);
    }
    Ok(trimmed
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(IceServerConfig::new)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_public_stun() {
        let config = NegotiationConfig::default();
        assert_eq!(config.ice_servers, vec![IceServerConfig::new(DEFAULT_STUN_URL)]);
        assert_eq!(config.channel_label, "updates");
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn ice_servers_parse_from_list_or_json() {
        let list = parse_ice_servers("stun:a.example:3478, stun:b.example:3478,").expect("list");
        assert_eq!(
            list.iter().map(|s| s.urls[0].as_str()).collect::<Vec<_>>(),
            ["stun:a.example:3478", "stun:b.example:3478"]
        );

        let json = parse_ice_servers(
            r#"[{"urls":["turn:t.example:3478"],"username":"u","credential":"c"}]"#,
        )
        .expect("json");
        assert_eq!(json[0].username.as_deref(), Some("u"));
        assert_eq!(json[0].credential.as_deref(), Some("c"));

        assert!(parse_ice_servers("[{").is_err());
    }

    #[test]
    fn builders_override_fields() {
        let config = NegotiationConfig::default()
            .with_ice_servers(Vec::new())
            .with_channel_label("chat")
            .with_event_capacity(0);
        assert!(config.ice_servers.is_empty());
        assert_eq!(config.channel_label, "chat");
        assert_eq!(config.event_capacity, 1);
    }
}
