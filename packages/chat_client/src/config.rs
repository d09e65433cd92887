use anyhow::{Context, Result};
use chat_sync::SyncConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [typing]
//                    inactivity_ms = 2000
//
//   env var:         CHAT_TYPING__INACTIVITY_MS=2000   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub typing: TypingFileConfig,
    #[serde(default)]
    pub composer: ComposerFileConfig,
    #[serde(default)]
    pub transport: TransportFileConfig,
}

/// Where the chat server lives (`[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            api_url: default_api_url(),
        }
    }
}

/// Typing indicator timings (`[typing]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TypingFileConfig {
    #[serde(default = "default_inactivity_ms")]
    pub inactivity_ms: u64,
    #[serde(default = "default_remote_ceiling_ms")]
    pub remote_ceiling_ms: u64,
}

impl Default for TypingFileConfig {
    fn default() -> Self {
        Self {
            inactivity_ms: default_inactivity_ms(),
            remote_ceiling_ms: default_remote_ceiling_ms(),
        }
    }
}

/// Outbound composer limits (`[composer]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComposerFileConfig {
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: usize,
}

impl Default for ComposerFileConfig {
    fn default() -> Self {
        Self {
            max_attachment_bytes: default_max_attachment_bytes(),
        }
    }
}

/// Websocket and HTTP tunables (`[transport]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportFileConfig {
    /// First reconnect delay; doubles on every failed attempt.
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Frames queued for the websocket writer before emits are refused.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for TransportFileConfig {
    fn default() -> Self {
        Self {
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            outbound_capacity: default_outbound_capacity(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_ws_url() -> String {
    "ws://127.0.0.1:5005/ws".to_string()
}

fn default_api_url() -> String {
    "http://127.0.0.1:5005".to_string()
}

fn default_inactivity_ms() -> u64 {
    3000
}

fn default_remote_ceiling_ms() -> u64 {
    10_000
}

fn default_max_attachment_bytes() -> usize {
    chat_sync::MAX_ATTACHMENT_BYTES
}

fn default_reconnect_initial_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    10_000
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_request_timeout_secs() -> u64 {
    15
}

/// Build the figment stack: struct defaults, then `config.toml` in
/// `config_dir`, then `CHAT_*` environment variables.
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("CHAT_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Transport settings shared by the websocket channel and the REST client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    pub ws_url: String,
    pub api_url: String,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub outbound_capacity: usize,
    pub request_timeout: Duration,
}

impl TransportConfig {
    pub fn from_file(server: &ServerFileConfig, fc: &TransportFileConfig) -> Self {
        let reconnect_initial = Duration::from_millis(fc.reconnect_initial_ms.max(1));
        Self {
            ws_url: server.ws_url.clone(),
            api_url: server.api_url.trim_end_matches('/').to_string(),
            reconnect_initial,
            reconnect_max: Duration::from_millis(fc.reconnect_max_ms).max(reconnect_initial),
            outbound_capacity: fc.outbound_capacity.max(1),
            request_timeout: Duration::from_secs(fc.request_timeout_secs),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from_file(
            &ServerFileConfig::default(),
            &TransportFileConfig::default(),
        )
    }
}

fn sync_config_from_file(fc: &FileConfig) -> SyncConfig {
    SyncConfig {
        typing_inactivity: Duration::from_millis(fc.typing.inactivity_ms),
        remote_typing_ceiling: Duration::from_millis(fc.typing.remote_ceiling_ms),
        max_attachment_bytes: fc.composer.max_attachment_bytes,
        ..SyncConfig::default()
    }
}

/// Everything the `chat` binary needs, resolved from one config directory.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub config_dir: PathBuf,
    pub sync: SyncConfig,
    pub transport: TransportConfig,
}

impl ClientConfig {
    pub fn from_file(config_dir: PathBuf, fc: &FileConfig) -> Self {
        Self {
            config_dir,
            sync: sync_config_from_file(fc),
            transport: TransportConfig::from_file(&fc.server, &fc.transport),
        }
    }

    /// Load from `custom_dir`, or `<config dir>/chat` when none is given.
    /// A missing `config.toml` is fine; defaults and env still apply.
    pub fn load(custom_dir: Option<PathBuf>) -> Result<Self> {
        let config_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::config_dir()
                .context("Could not determine the user config directory")?
                .join("chat"),
        };

        let fc: FileConfig = load_config(&config_dir)
            .extract()
            .with_context(|| format!("Failed to load config from {}", config_dir.display()))?;

        debug!(config_dir = %config_dir.display(), "Loaded configuration");
        Ok(Self::from_file(config_dir, &fc))
    }
}
