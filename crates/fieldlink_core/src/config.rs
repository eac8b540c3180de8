use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

// ---------------------------------------------------------------------------
// Link mode
// ---------------------------------------------------------------------------

/// Which of the two mutually exclusive links carries traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    /// Peer-to-peer UDP broadcast/unicast on the LAN.
    #[default]
    Local,
    /// Publish/subscribe through an MQTT broker.
    Broker,
}

impl fmt::Display for LinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Broker => write!(f, "broker"),
        }
    }
}

// ---------------------------------------------------------------------------
// Link configs
// ---------------------------------------------------------------------------

/// Connection settings for the broker link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Wrap the connection in TLS.
    ///
    /// The broker certificate is accepted WITHOUT validation when this is on,
    /// so self-signed field brokers work out of the box. This trades away
    /// server authentication and must stay visible to operators.
    pub use_tls: bool,
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            use_tls: false,
            username: None,
            password: None,
            client_id: String::new(),
            keep_alive_secs: 30,
        }
    }
}

/// Socket settings for the local UDP link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalLinkConfig {
    pub port: u16,
    pub broadcast_address: String,
    /// Static `host:port` peers that always receive broadcasts, for segments
    /// where directed broadcast does not reach.
    pub peers: Vec<String>,
}

impl Default for LocalLinkConfig {
    fn default() -> Self {
        Self {
            port: 4242,
            broadcast_address: "255.255.255.255".into(),
            peers: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// FieldConfig
// ---------------------------------------------------------------------------

/// Longest sync acceptance window honoured; larger values are capped.
pub const MAX_SYNC_WINDOW_SECS: u64 = 3600;

/// Application configuration stored at `~/.fieldlink/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldConfig {
    pub callsign: String,
    pub link_mode: LinkMode,
    pub broker: BrokerConfig,
    pub local: LocalLinkConfig,
    /// Root of the broker topic tree, e.g. `fieldlink/v1/pos`.
    pub topic_namespace: String,
    /// Inbound messages older than this are dropped. `0` disables the check.
    pub max_message_age_minutes: i64,
    /// How long a "request all" round trip keeps accepting marker replies.
    pub sync_window_secs: u64,
    pub log_level: String,
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            callsign: String::new(),
            link_mode: LinkMode::Local,
            broker: BrokerConfig::default(),
            local: LocalLinkConfig::default(),
            topic_namespace: "fieldlink".into(),
            max_message_age_minutes: 360,
            sync_window_secs: 30,
            log_level: "info".into(),
        }
    }
}

impl FieldConfig {
    /// Returns the base config directory: `~/.fieldlink/`
    pub fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".fieldlink"))
    }

    /// Returns the config file path: `~/.fieldlink/config.json`
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.json"))
    }

    /// Returns the logs directory: `~/.fieldlink/logs/`
    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("logs"))
    }

    /// Returns the delivery-state database path: `~/.fieldlink/delivery.db`
    pub fn db_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("delivery.db"))
    }

    /// Returns the device identity path: `~/.fieldlink/identity.json`
    pub fn identity_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("identity.json"))
    }

    /// Returns the local peer directory path: `~/.fieldlink/peers.json`
    pub fn peers_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("peers.json"))
    }

    /// Load config from a JSON file, or return defaults if the file is
    /// missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<FieldConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => warn!("Corrupt config file, using defaults: {e}"),
                },
                Err(e) => warn!("Cannot read config file, using defaults: {e}"),
            }
        }
        Self::default()
    }

    /// Save the config as pretty JSON, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Human-readable problems with this config. Empty means usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.callsign.trim().is_empty() {
            problems.push("callsign must not be empty".to_string());
        }
        if self.local.port == 0 {
            problems.push("local link port must be non-zero".to_string());
        }
        if self.link_mode == LinkMode::Broker {
            if self.broker.host.trim().is_empty() {
                problems.push("broker host must not be empty in broker mode".to_string());
            }
            if self.broker.port == 0 {
                problems.push("broker port must be non-zero".to_string());
            }
            if self.broker.client_id.trim().is_empty() {
                problems.push("broker client_id must not be empty".to_string());
            }
        }
        if self.sync_window_secs > MAX_SYNC_WINDOW_SECS {
            problems.push(format!(
                "sync_window_secs {} exceeds {MAX_SYNC_WINDOW_SECS} and will be capped",
                self.sync_window_secs
            ));
        }
        if self.topic_namespace.trim().is_empty() || self.topic_namespace.contains(['#', '+']) {
            problems.push("topic namespace must be a plain, non-empty topic level".to_string());
        }
        problems
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
