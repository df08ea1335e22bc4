use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// =============================================================================
// Session configuration (figment-deserialized from defaults / TOML / env vars)
// =============================================================================
//
//   rtc.toml:   [connection]
//               max_backoff_ms = 10000
//
//   env var:    HIRELINE_CONNECTION__MAX_BACKOFF_MS=10000   (double underscore = nesting)

const ENV_PREFIX: &str = "HIRELINE_";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RtcConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub messages: MessagesConfig,
    #[serde(default)]
    pub typing: TypingConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
}

/// Reconnect tunables (lives under `[connection]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Doubling stops after this many attempts; later attempts reuse the cap.
    #[serde(default = "default_max_backoff_exponent")]
    pub max_backoff_exponent: u32,
    /// 0 = retry forever
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_backoff_exponent: default_max_backoff_exponent(),
            max_reconnect_attempts: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ConnectionConfig {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(self.max_backoff_exponent);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent.min(63));
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Message and directory paging (lives under `[messages]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessagesConfig {
    #[serde(default = "default_history_page_size")]
    pub history_page_size: u32,
    #[serde(default = "default_conversation_page_size")]
    pub conversation_page_size: u32,
    /// Issue mark-as-read when a conversation is opened.
    #[serde(default = "default_true")]
    pub mark_read_on_view: bool,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            history_page_size: default_history_page_size(),
            conversation_page_size: default_conversation_page_size(),
            mark_read_on_view: true,
        }
    }
}

/// Typing indicator timers (lives under `[typing]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TypingConfig {
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Clear a remote indicator if no stop event arrives in time. 0 disables.
    #[serde(default = "default_remote_expiry_ms")]
    pub remote_expiry_ms: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            remote_expiry_ms: default_remote_expiry_ms(),
        }
    }
}

impl TypingConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn remote_expiry(&self) -> Option<Duration> {
        (self.remote_expiry_ms > 0).then(|| Duration::from_millis(self.remote_expiry_ms))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    /// Minimum change in whole percent before a progress event is published.
    #[serde(default = "default_progress_step")]
    pub progress_step_percent: u8,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            mime_type: default_mime_type(),
            progress_step_percent: default_progress_step(),
        }
    }
}

fn default_initial_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_max_backoff_exponent() -> u32 {
    6
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_history_page_size() -> u32 {
    10
}
fn default_conversation_page_size() -> u32 {
    20
}
fn default_true() -> bool {
    true
}
fn default_idle_timeout_ms() -> u64 {
    3000
}
fn default_remote_expiry_ms() -> u64 {
    8000
}
fn default_mime_type() -> String {
    "video/webm".to_string()
}
fn default_progress_step() -> u8 {
    5
}

/// Build a figment that layers: defaults → TOML file (if given) → HIRELINE_* env vars.
pub fn load_config(path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(RtcConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
}

impl RtcConfig {
    pub fn from_figment(figment: &figment::Figment) -> Result<Self> {
        figment
            .extract()
            .context("failed to extract session configuration")
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::from_figment(&load_config(path))
    }
}
