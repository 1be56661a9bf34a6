//! Configuration system for Hycast.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $HYCAST_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/hycast/config.toml
//!   3. ~/.config/hycast/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HycastConfig {
    pub mcast: McastConfig,
    pub store: StoreConfig,
    pub p2p: P2pConfig,
    /// Candidate remote peers, tried in order.
    pub peers: Vec<PeerAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McastConfig {
    /// Multicast group address.
    pub group_addr: String,
    /// UDP port of the multicast group.
    pub port: u16,
    /// Source address for source-specific multicast. Empty = any-source.
    pub source_addr: String,
    /// IP hop limit / TTL for sent datagrams.
    pub hop_limit: u8,
    /// Whether sent datagrams loop back to local receivers.
    pub loopback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Minimum residence time of a product in the store, in seconds.
    pub residence_seconds: f64,
    /// Snapshot file the store persists to between runs. Empty = no
    /// persistence.
    pub snapshot_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Address the peer-session listener binds. Empty = don't listen.
    pub listen_addr: String,
}

/// One candidate remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

impl Default for McastConfig {
    fn default() -> Self {
        Self {
            group_addr: "232.16.1.1".to_string(),
            port: 38800,
            source_addr: String::new(),
            hop_limit: 1,
            loopback: true,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            residence_seconds: 3600.0,
            snapshot_path: PathBuf::new(),
        }
    }
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:38801".to_string(),
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ──────────────────────────────────────────────────────────────────

impl HycastConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            HycastConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from an explicit file, with env overrides applied on top.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let mut config: HycastConfig =
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("HYCAST_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&HycastConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply HYCAST_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("HYCAST_MCAST__GROUP_ADDR") {
            self.mcast.group_addr = v;
        }
        if let Ok(v) = std::env::var("HYCAST_MCAST__PORT") {
            if let Ok(p) = v.parse() {
                self.mcast.port = p;
            }
        }
        if let Ok(v) = std::env::var("HYCAST_MCAST__HOP_LIMIT") {
            if let Ok(h) = v.parse() {
                self.mcast.hop_limit = h;
            }
        }
        if let Ok(v) = std::env::var("HYCAST_STORE__RESIDENCE_SECONDS") {
            if let Ok(s) = v.parse() {
                self.store.residence_seconds = s;
            }
        }
        if let Ok(v) = std::env::var("HYCAST_STORE__SNAPSHOT_PATH") {
            self.store.snapshot_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("HYCAST_P2P__LISTEN_ADDR") {
            self.p2p.listen_addr = v;
        }
    }
}

// ── Path helpers ─────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("hycast")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
