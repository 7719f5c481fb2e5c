//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (session cookie, webhook URL) are referenced by env-var name
//! in the config and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub session: SessionConfig,
    pub settlement: SettlementConfig,
    pub market: MarketConfig,
    pub premium: PremiumConfig,
    pub alerts: AlertsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Game world base URL, e.g. `https://en130.example-world.net`.
    pub base_url: String,
    /// Env var holding the session cookie header value.
    pub cookie_env: String,
    /// Env var holding the csrf validation token sent on mutating posts.
    pub csrf_token_env: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SettlementConfig {
    pub id: u64,
}

/// Market trading limits and thresholds.
#[derive(Debug, Deserialize, Clone)]
pub struct MarketConfig {
    /// Surplus threshold divisor: a resource counts as plentiful above
    /// `storage / ratio` (2.5 = above 40% of capacity).
    #[serde(default = "default_ratio")]
    pub ratio: f64,
    /// Hard cap on the amount requested in one offer.
    #[serde(default = "default_max_trade_amount")]
    pub max_trade_amount: i64,
    // not allowed to bias
    #[serde(default = "default_trade_bias")]
    pub trade_bias: f64,
    /// Minimum hours between own offers.
    #[serde(default = "default_trade_max_per_hour")]
    pub trade_max_per_hour: f64,
    /// Maximum lifetime of an own offer, in hours.
    #[serde(default = "default_trade_max_duration")]
    pub trade_max_duration_hours: u32,
    /// Local-time window during which no trades are placed.
    /// `None` disables the window entirely (used by tests).
    #[serde(default = "default_quiet_window")]
    pub quiet_window: Option<QuietWindow>,
}

/// Refuses trading when the local hour is `>= start` or `< end`.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct QuietWindow {
    pub start: u32,
    pub end: u32,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            ratio: default_ratio(),
            max_trade_amount: default_max_trade_amount(),
            trade_bias: default_trade_bias(),
            trade_max_per_hour: default_trade_max_per_hour(),
            trade_max_duration_hours: default_trade_max_duration(),
            quiet_window: default_quiet_window(),
        }
    }
}

fn default_ratio() -> f64 {
    2.5
}

fn default_max_trade_amount() -> i64 {
    4000
}

fn default_trade_bias() -> f64 {
    1.0
}

fn default_trade_max_per_hour() -> f64 {
    1.0
}

fn default_trade_max_duration() -> u32 {
    2
}

fn default_quiet_window() -> Option<QuietWindow> {
    Some(QuietWindow { start: 23, end: 6 })
}

#[derive(Debug, Deserialize, Clone)]
pub struct PremiumConfig {
    /// Whether surplus may be converted to premium currency.
    pub trade_enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AlertsConfig {
    pub discord_webhook_env: Option<String>,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
