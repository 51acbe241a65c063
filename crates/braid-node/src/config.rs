//! Node configuration

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use braid_router::RouterConfig;

/// Top-level node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Local peer name, announced to peers that log in here
    pub name: String,

    /// Address to accept peer channels on; omit for client-only nodes
    #[serde(default)]
    pub listen: Option<String>,

    /// Peer name → token map for inbound logins
    #[serde(default)]
    pub acl: HashMap<String, String>,

    /// Outbound channels to establish on startup
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    /// Heartbeat tuning
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Upper bound on a frame body
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    /// SOCKS5 front-end
    #[serde(default)]
    pub socks: Option<SocksConfig>,

    /// Read-only HTTP state endpoint
    #[serde(default)]
    pub state: Option<StateConfig>,
}

/// One outbound peer to log in to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Remote `host:port`
    pub remote: String,

    /// Token presented for this node's name
    pub token: String,

    /// Number of bonded channels to establish
    #[serde(default = "default_channel_count")]
    pub count: u32,
}

fn default_channel_count() -> u32 {
    1
}

/// Heartbeat tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between outgoing Heartbeat frames
    #[serde(default = "default_heartbeat_period_ms")]
    pub period_ms: u64,

    /// Silence after which a channel is reaped; defaults to 5x the period
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_heartbeat_period_ms() -> u64 {
    5000
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            period_ms: default_heartbeat_period_ms(),
            timeout_ms: None,
        }
    }
}

fn default_max_frame_len() -> usize {
    braid_common::protocol::DEFAULT_MAX_FRAME_LEN
}

/// SOCKS5 front-end configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocksConfig {
    /// Address to accept SOCKS5 clients on
    #[serde(default = "default_socks_addr")]
    pub listen: String,

    /// Path template; `${HOST}` is replaced with the requested `host:port`
    #[serde(default = "default_socks_template")]
    pub template: String,
}

fn default_socks_addr() -> String {
    "127.0.0.1:1080".to_string()
}

fn default_socks_template() -> String {
    "tcp://${HOST}".to_string()
}

/// State endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Address to serve `GET /state` on
    pub listen: SocketAddr,
}

impl NodeConfig {
    /// Load configuration from a TOML file layered with `BRAID_`-prefixed
    /// environment overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("BRAID")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: NodeConfig = builder.build()?.try_deserialize()?;
        if config.name.is_empty() {
            anyhow::bail!("node name must not be empty");
        }
        Ok(config)
    }

    /// Router configuration derived from this node configuration.
    pub fn router_config(&self) -> RouterConfig {
        let mut config = RouterConfig::new(&self.name);
        config.acl = self.acl.clone();
        config.heartbeat_period = Duration::from_millis(self.heartbeat.period_ms);
        config.heartbeat_timeout = self.heartbeat.timeout_ms.map(Duration::from_millis);
        config.max_frame_len = self.max_frame_len;
        config
    }

    /// Sample configuration for `generate-config`.
    pub fn generate_sample_config() -> String {
        r#"# Braid node configuration

# Local peer name; peers logging in here are checked against [acl],
# and this name is what upstream nodes route to.
name = "master"

# Accept peer channels here. Omit for client-only nodes.
listen = "0.0.0.0:9232"

# Peers allowed to log in: name = token
[acl]
slaver = "change-me"

# Outbound channels to establish on startup.
# count > 1 bonds several connections to the same peer.
#[[channels]]
#remote = "master.example.com:9232"
#token = "change-me"
#count = 2

[heartbeat]
period_ms = 5000
# timeout_ms defaults to 5x period_ms

# SOCKS5 front-end: local applications dial through the mesh.
#[socks]
#listen = "127.0.0.1:1080"
#template = "master->tcp://${HOST}"

# Read-only JSON state endpoint.
#[state]
#listen = "127.0.0.1:9060"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_config_parses() {
        let sample = NodeConfig::generate_sample_config();
        let config: NodeConfig = toml_from_str(&sample);
        assert_eq!(config.name, "master");
        assert_eq!(config.listen.as_deref(), Some("0.0.0.0:9232"));
        assert_eq!(config.acl.get("slaver").unwrap(), "change-me");
        assert_eq!(config.heartbeat.period_ms, 5000);
        assert!(config.socks.is_none());
    }

    #[test]
    fn test_router_config_derivation() {
        let sample = NodeConfig::generate_sample_config();
        let config: NodeConfig = toml_from_str(&sample);
        let router = config.router_config();
        assert_eq!(router.name, "master");
        assert_eq!(router.heartbeat_period, Duration::from_secs(5));
        assert!(router.heartbeat_timeout.is_none());
    }

    #[test]
    fn test_defaults() {
        let config: NodeConfig = toml_from_str("name = \"solo\"");
        assert!(config.listen.is_none());
        assert!(config.channels.is_empty());
        assert_eq!(config.max_frame_len, default_max_frame_len());
    }

    fn toml_from_str(s: &str) -> NodeConfig {
        config::Config::builder()
            .add_source(config::File::from_str(s, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }
}
