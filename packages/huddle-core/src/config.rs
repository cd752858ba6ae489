//! # Configuration
//!
//! All tunables live in [`HuddleConfig`]. The host either builds it in code,
//! loads it from a JSON file (`huddle_config.json`), or starts from defaults
//! and applies environment overrides.
//!
//! Durations are stored as milliseconds so the file format stays plain JSON;
//! the accessor methods return [`Duration`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// STUN servers used for ICE candidate gathering when none are configured.
const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HuddleConfig {
    /// REST backend location and credentials
    pub backend: BackendConfig,
    /// Push channel endpoint and reconnect policy
    pub push: PushConfig,
    /// Conversation sync tunables
    pub sync: SyncConfig,
    /// Scroll anchoring thresholds
    pub scroll: ScrollConfig,
    /// Call signaling tunables
    pub calls: CallConfig,
}

/// REST backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL, e.g. `https://api.example.com/api`
    pub api_url: String,
    /// Bearer token sent with every request
    pub api_token: Option<String>,
    /// Per-request timeout
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:5000/api".to_string(),
            api_token: None,
            request_timeout_ms: 15_000,
        }
    }
}

impl BackendConfig {
    /// Per-request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Push channel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// WebSocket endpoint, e.g. `wss://api.example.com/ws`
    pub url: String,
    /// First reconnect delay
    pub reconnect_initial_ms: u64,
    /// Upper bound for the doubling backoff
    pub reconnect_max_ms: u64,
    /// Attempts before giving up and reporting `Disconnected`
    pub max_reconnect_attempts: u32,
    /// Silence from the server longer than this closes the link
    pub ping_timeout_ms: u64,
    /// Capacity of the broadcast channel feeding subscribers
    pub event_buffer: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:5000/ws".to_string(),
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            max_reconnect_attempts: 10,
            ping_timeout_ms: 60_000,
            event_buffer: 256,
        }
    }
}

impl PushConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Delay before reconnect attempt `attempt` (1-based), doubling and capped
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let millis = self
            .reconnect_initial_ms
            .saturating_mul(1u64 << exponent)
            .min(self.reconnect_max_ms);
        Duration::from_millis(millis)
    }
}

/// Conversation sync settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Messages per history page
    pub page_size: u32,
    /// Window in which identical sends are suppressed
    pub dedup_window_ms: u64,
    /// Pause after a failed read-receipt pass
    pub read_cooldown_ms: u64,
    /// Period of the visibility-gated read-receipt timer
    pub read_poll_interval_ms: u64,
    /// Coalescing window for conversation-preview refresh signals
    pub preview_debounce_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 30,
            dedup_window_ms: 3_000,
            read_cooldown_ms: 30_000,
            read_poll_interval_ms: 10_000,
            preview_debounce_ms: 500,
        }
    }
}

impl SyncConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn read_cooldown(&self) -> Duration {
        Duration::from_millis(self.read_cooldown_ms)
    }

    pub fn read_poll_interval(&self) -> Duration {
        Duration::from_millis(self.read_poll_interval_ms)
    }

    pub fn preview_debounce(&self) -> Duration {
        Duration::from_millis(self.preview_debounce_ms)
    }
}

/// Scroll anchoring thresholds, in pixels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrollConfig {
    /// Distance from the top that triggers loading an older page
    pub top_threshold_px: f64,
    /// Distance from the bottom still treated as "at the bottom"
    pub bottom_threshold_px: f64,
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            top_threshold_px: 100.0,
            bottom_threshold_px: 150.0,
        }
    }
}

/// Call signaling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Delay before the single join retry when the channel is down
    pub join_retry_delay_ms: u64,
    /// Buffer ICE candidates that arrive before their peer connection
    pub buffer_early_candidates: bool,
    /// ICE servers handed to the peer connection factory
    pub ice_servers: Vec<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            join_retry_delay_ms: 1_000,
            buffer_early_candidates: false,
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl CallConfig {
    pub fn join_retry_delay(&self) -> Duration {
        Duration::from_millis(self.join_retry_delay_ms)
    }
}

impl HuddleConfig {
    /// Load from a JSON file; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(Error::Internal(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let config: Self = serde_json::from_slice(&bytes)?;
        Ok(config)
    }

    /// Defaults with process environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `HUDDLE_*` overrides from an arbitrary lookup.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup("HUDDLE_API_URL") {
            self.backend.api_url = url;
        }
        if let Some(token) = lookup("HUDDLE_API_TOKEN") {
            self.backend.api_token = Some(token);
        }
        if let Some(url) = lookup("HUDDLE_PUSH_URL") {
            self.push.url = url;
        }
        if let Some(size) = lookup("HUDDLE_PAGE_SIZE") {
            match size.parse::<u32>() {
                Ok(size) if size > 0 => self.sync.page_size = size,
                _ => tracing::warn!(value = %size, "Ignoring invalid HUDDLE_PAGE_SIZE"),
            }
        }
        self
    }
}
