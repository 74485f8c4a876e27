//! Watchlist configuration
//!
//! TOML-backed, every field defaulted. `from_env` reads the file named by
//! `OMM_WATCHLIST_CONFIG` (falling back to defaults) and then applies `OMM_*` overrides.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::rest::discovery::{DataFormat, DiscoveryTransport};
use crate::session::{HostDescriptor, PreferredHostOptions};
use crate::watchlist::dictionary::DictionaryDownloadMode;

/// Role the application plays on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    #[default]
    Consumer,
    InteractiveProvider,
    NonInteractiveProvider,
}

impl ChannelRole {
    /// Consumers run the directory, dictionary and item handlers; providers only log in.
    #[inline]
    pub fn consumes(&self) -> bool {
        matches!(self, Self::Consumer)
    }
}

/// Top-level watchlist configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistConfig {
    #[serde(default)]
    pub role: ChannelRole,

    #[serde(default)]
    pub dictionary_download: DictionaryDownloadMode,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub merge: MergeConfig,

    /// Ack deadline for posts that request one (ms)
    #[serde(default = "default_post_ack_timeout_ms")]
    pub post_ack_timeout_ms: u64,

    /// Initial timer slots; the pool grows past this on demand
    #[serde(default = "default_timer_pool_capacity")]
    pub timer_pool_capacity: usize,

    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub token: TokenConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,
}

fn default_post_ack_timeout_ms() -> u64 {
    15_000
}
fn default_timer_pool_capacity() -> usize {
    64
}

impl Default for WatchlistConfig {
    fn default() -> Self {
        Self {
            role: ChannelRole::default(),
            dictionary_download: DictionaryDownloadMode::default(),
            recovery: RecoveryConfig::default(),
            merge: MergeConfig::default(),
            post_ack_timeout_ms: default_post_ack_timeout_ms(),
            timer_pool_capacity: default_timer_pool_capacity(),
            session: SessionSettings::default(),
            token: TokenConfig::default(),
            discovery: DiscoveryConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl WatchlistConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self).context("rendering watchlist config")?;
        std::fs::write(path, contents).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Load from `OMM_WATCHLIST_CONFIG` (or defaults), then apply environment overrides
    pub fn from_env() -> Self {
        let path = std::env::var("OMM_WATCHLIST_CONFIG")
            .unwrap_or_else(|_| "watchlist.toml".to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default watchlist config ({}): {}", path, e);
            Self::default()
        });
        config.apply_env();
        config
    }

    /// Apply `OMM_*` overrides on top of whatever was loaded
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("OMM_HOST") {
            self.session.primary.host = v;
        }
        if let Ok(v) = std::env::var("OMM_PORT") {
            self.session.primary.port = v.parse().unwrap_or(self.session.primary.port);
        }
        if let Ok(v) = std::env::var("OMM_POST_ACK_TIMEOUT_MS") {
            self.post_ack_timeout_ms = v.parse().unwrap_or(self.post_ack_timeout_ms);
        }
        if let Ok(v) = std::env::var("OMM_RECONNECT_ATTEMPT_LIMIT") {
            self.session.reconnect_attempt_limit =
                v.parse().unwrap_or(self.session.reconnect_attempt_limit);
        }
        if let Ok(v) = std::env::var("OMM_TOKEN_URL") {
            self.token.token_url = Some(v);
        }
        if let Ok(v) = std::env::var("OMM_CLIENT_ID") {
            self.token.client_id = Some(v);
        }
        if let Ok(v) = std::env::var("OMM_CLIENT_SECRET") {
            self.token.client_secret = Some(v);
        }
        if let Ok(v) = std::env::var("OMM_DISCOVERY_URL") {
            self.discovery.url = v;
        }
    }
}

/// Recoverability defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Requests without an explicit flag recover automatically
    #[serde(default = "default_true")]
    pub default_recoverable: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            default_recoverable: true,
        }
    }
}

/// Request merge policy and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(default = "default_true")]
    pub batch_enabled: bool,

    #[serde(default = "default_max_requests_per_stream")]
    pub max_requests_per_stream: usize,

    #[serde(default = "default_max_view_elements")]
    pub max_view_elements: usize,
}

fn default_max_requests_per_stream() -> usize {
    1_000
}
fn default_max_view_elements() -> usize {
    1_024
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            batch_enabled: true,
            max_requests_per_stream: default_max_requests_per_stream(),
            max_view_elements: default_max_view_elements(),
        }
    }
}

/// Channel session: hosts, fallback and reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default)]
    pub primary: HostDescriptor,

    #[serde(default)]
    pub preferred: PreferredHostOptions,

    /// -1 retries forever; 0 never reconnects
    #[serde(default = "default_reconnect_attempt_limit")]
    pub reconnect_attempt_limit: i64,

    #[serde(default = "default_reconnect_min_delay_ms")]
    pub reconnect_min_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// ±fraction applied to each reconnect delay
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Seed for the jitter RNG
    #[serde(default)]
    pub jitter_seed: u64,
}

fn default_reconnect_attempt_limit() -> i64 {
    -1
}
fn default_reconnect_min_delay_ms() -> u64 {
    500
}
fn default_reconnect_max_delay_ms() -> u64 {
    5_000
}
fn default_jitter_factor() -> f64 {
    0.2
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            primary: HostDescriptor::default(),
            preferred: PreferredHostOptions::default(),
            reconnect_attempt_limit: default_reconnect_attempt_limit(),
            reconnect_min_delay_ms: default_reconnect_min_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
            jitter_seed: 0,
        }
    }
}

/// Token renewal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    #[serde(default)]
    pub token_url: Option<String>,

    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub client_secret: Option<String>,

    #[serde(default = "default_scope")]
    pub scope: String,

    /// Renew this long before expiry (ms)
    #[serde(default = "default_renewal_margin_ms")]
    pub renewal_margin_ms: u64,

    /// Renew at this fraction of the token lifetime instead of using the margin
    #[serde(default)]
    pub reissue_ratio: Option<f64>,

    /// Attempts per renewal before giving up
    #[serde(default = "default_attempt_limit")]
    pub attempt_limit: u32,

    /// Delay before the first retry; doubles per attempt
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Cap on the retry delay
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

fn default_scope() -> String {
    "trapi.streaming.pricing.read".to_string()
}
fn default_renewal_margin_ms() -> u64 {
    30_000
}
fn default_attempt_limit() -> u32 {
    5
}
fn default_retry_interval_ms() -> u64 {
    1_000
}
fn default_retry_max_ms() -> u64 {
    30_000
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            token_url: None,
            client_id: None,
            client_secret: None,
            scope: default_scope(),
            renewal_margin_ms: default_renewal_margin_ms(),
            reissue_ratio: None,
            attempt_limit: default_attempt_limit(),
            retry_interval_ms: default_retry_interval_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

/// Service discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_url")]
    pub url: String,

    #[serde(default)]
    pub transport: Option<DiscoveryTransport>,

    #[serde(default)]
    pub data_format: Option<DataFormat>,
}

fn default_discovery_url() -> String {
    "https://api.refinitiv.com/streaming/pricing/v1/".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            url: default_discovery_url(),
            transport: None,
            data_format: None,
        }
    }
}

/// Dispatch loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Events drained per dispatch pass
    #[serde(default = "default_max_events_per_pass")]
    pub max_events_per_pass: usize,
}

fn default_max_events_per_pass() -> usize {
    1_000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_events_per_pass: default_max_events_per_pass(),
        }
    }
}
