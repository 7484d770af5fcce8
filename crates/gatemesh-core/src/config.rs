//! Configuration system for gatemesh.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $GATEMESH_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/gatemesh/config.toml
//!   3. ~/.config/gatemesh/config.toml
//!
//! Read once at startup. Nothing re-reads it while the node runs.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatemeshConfig {
    pub node: NodeConfig,
    pub metrics: MetricsConfig,
    pub balancer: BalancerConfig,
    pub nat: NatConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable node id. Empty = generate one at startup.
    pub node_id: String,
    /// Overlay listen address.
    pub listen_addr: String,
    /// Overlay address announced to peers. Empty = listen_addr.
    pub advertise_addr: String,
    /// Public HTTP port: status API plus gateway traffic.
    pub http_port: u16,
    /// Backend that requests served on this node are proxied to
    /// (`http://host:port`). Empty = no local backend; every request is
    /// relayed to a peer.
    pub upstream_url: String,
    /// Maximum number of peers in the directory.
    pub max_peers: usize,
    /// Overlay addresses to join at startup.
    pub seed_peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Sliding window for load statistics and staleness.
    pub window_secs: u64,
    pub weights: WeightsConfig,
}

/// Score coefficients. Not normalized; pick values that sum sensibly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightsConfig {
    pub cpu: f64,
    pub memory: f64,
    pub rps: f64,
    pub latency: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Forward only when the best peer beats the local score by more
    /// than this.
    pub score_threshold: f64,
    /// Timeout for a relayed HTTP request.
    pub relay_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    /// This node cannot accept unsolicited inbound traffic.
    pub behind_nat: bool,
    pub punch_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Timeout for one overlay request/response exchange.
    pub request_timeout_ms: u64,
    /// How long a Stale peer is kept before it is removed.
    pub stale_grace_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            listen_addr: "0.0.0.0:7400".to_string(),
            advertise_addr: String::new(),
            http_port: 8080,
            upstream_url: String::new(),
            max_peers: 16,
            seed_peers: Vec::new(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            weights: WeightsConfig::default(),
        }
    }
}

impl Default for WeightsConfig {
    fn default() -> Self {
        Self {
            cpu: 0.25,
            memory: 0.25,
            rps: 0.25,
            latency: 0.25,
        }
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.1,
            relay_timeout_ms: 10_000,
        }
    }
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            behind_nat: false,
            punch_timeout_ms: 2_000,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 3_000,
            stale_grace_secs: 120,
        }
    }
}

// ── Accessors ─────────────────────────────────────────────────────────────────

impl GatemeshConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.metrics.window_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.network.request_timeout_ms)
    }

    pub fn stale_grace(&self) -> Duration {
        Duration::from_secs(self.network.stale_grace_secs)
    }

    pub fn punch_timeout(&self) -> Duration {
        Duration::from_millis(self.nat.punch_timeout_ms)
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.balancer.relay_timeout_ms)
    }

    /// Address announced to peers.
    pub fn advertise_addr(&self) -> &str {
        if self.node.advertise_addr.is_empty() {
            &self.node.listen_addr
        } else {
            &self.node.advertise_addr
        }
    }

    /// HTTP address announced to peers in metrics: the advertised host
    /// with the HTTP port.
    pub fn http_advertise_addr(&self) -> String {
        let overlay = self.advertise_addr();
        let host = overlay.rsplit_once(':').map(|(h, _)| h).unwrap_or(overlay);
        format!("{host}:{}", self.node.http_port)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("gatemesh")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

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

// ── Loading ───────────────────────────────────────────────────────────────────

impl GatemeshConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            GatemeshConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("GATEMESH_CONFIG")
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
            let text = toml::to_string_pretty(&GatemeshConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply GATEMESH_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("GATEMESH_NODE__NODE_ID") {
            self.node.node_id = v;
        }
        if let Some(v) = var("GATEMESH_NODE__LISTEN_ADDR") {
            self.node.listen_addr = v;
        }
        if let Some(v) = var("GATEMESH_NODE__ADVERTISE_ADDR") {
            self.node.advertise_addr = v;
        }
        if let Some(p) = var("GATEMESH_NODE__HTTP_PORT").and_then(|v| v.parse().ok()) {
            self.node.http_port = p;
        }
        if let Some(v) = var("GATEMESH_NODE__UPSTREAM_URL") {
            self.node.upstream_url = v;
        }
        if let Some(n) = var("GATEMESH_NODE__MAX_PEERS").and_then(|v| v.parse().ok()) {
            self.node.max_peers = n;
        }
        if let Some(v) = var("GATEMESH_NODE__SEED_PEERS") {
            self.node.seed_peers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(w) = var("GATEMESH_METRICS__WINDOW_SECS").and_then(|v| v.parse().ok()) {
            self.metrics.window_secs = w;
        }
        if let Some(t) = var("GATEMESH_BALANCER__SCORE_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.balancer.score_threshold = t;
        }
        if let Some(v) = var("GATEMESH_NAT__BEHIND_NAT") {
            self.nat.behind_nat = v == "true" || v == "1";
        }
    }
}
