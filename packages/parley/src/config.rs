use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [websocket]
//                    ping_interval_secs = 15
//
//   env var:         PARLEY_WEBSOCKET__PING_INTERVAL_SECS=15   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub websocket: WebSocketFileConfig,
    #[serde(default)]
    pub push: PushFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Duplex connection tunables (lives under `[websocket]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebSocketFileConfig {
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_max_envelope_kb")]
    pub max_envelope_kb: usize,
}

impl Default for WebSocketFileConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            max_envelope_kb: default_max_envelope_kb(),
        }
    }
}

/// Server-push (SSE) tunables (lives under `[push]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PushFileConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl Default for PushFileConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

fn default_ping_interval_secs() -> u64 {
    30
}
fn default_read_timeout_secs() -> u64 {
    60
}
fn default_write_timeout_secs() -> u64 {
    10
}
fn default_max_envelope_kb() -> usize {
    1024
}
fn default_queue_capacity() -> usize {
    10
}
fn default_keepalive_secs() -> u64 {
    15
}

/// Build a figment that layers: defaults → config.toml → PARLEY_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `PARLEY_WEBSOCKET__WRITE_TIMEOUT_SECS=5`  →  `websocket.write_timeout_secs = 5`
///   `PARLEY_PUSH__QUEUE_CAPACITY=32`  →  `push.queue_capacity = 32`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("PARLEY_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Per-connection pump settings.
#[derive(Clone, Debug)]
pub struct WebSocketConfig {
    /// Interval between liveness probes
    pub ping_interval: Duration,
    /// Silence longer than this is a dead connection
    pub read_timeout: Duration,
    /// Deadline applied to every outbound write
    pub write_timeout: Duration,
    /// Largest inbound envelope accepted
    pub max_envelope_bytes: usize,
}

#[derive(Clone, Debug)]
pub struct PushConfig {
    /// Per-subscriber queue depth before events are dropped
    pub queue_capacity: usize,
    pub keepalive: Duration,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub websocket: WebSocketConfig,
    pub push: PushConfig,
}

impl ServerConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            websocket: WebSocketConfig {
                ping_interval: Duration::from_secs(fc.websocket.ping_interval_secs.max(1)),
                read_timeout: Duration::from_secs(fc.websocket.read_timeout_secs.max(1)),
                write_timeout: Duration::from_secs(fc.websocket.write_timeout_secs.max(1)),
                max_envelope_bytes: fc.websocket.max_envelope_kb * 1024,
            },
            push: PushConfig {
                queue_capacity: fc.push.queue_capacity.max(1),
                keepalive: Duration::from_secs(fc.push.keepalive_secs.max(1)),
            },
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

// =============================================================================
// Directory layout config (derived from --data-dir, not tunable via figment)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ParleyConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl ParleyConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".parley"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let db_path = data_dir.join("parley.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, db_path })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
