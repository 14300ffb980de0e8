//! Runtime configuration shared by the websocket server, the HTTP adapter,
//! and the client transport. Deserializable from whatever config format the
//! embedding application already uses (TOML, JSON, env); `Default` matches
//! the documented defaults so omitting a section is always safe.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_max_message_size() -> usize { 1024 * 1024 }
fn default_max_subscriptions_per_client() -> usize { 100 }
fn default_max_connections() -> usize { 10_000 }
fn default_rate_limit_max_messages() -> u32 { 100 }
fn default_rate_limit_window_ms() -> u64 { 1_000 }
fn default_timeout_ms() -> u64 { 30_000 }
fn default_reconnect_base_delay_ms() -> u64 { 200 }
fn default_reconnect_max_attempts() -> u32 { 10 }
fn default_health_path() -> String { "/__lens/health".into() }
fn default_true() -> bool { true }

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub max_messages: u32,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self { Self { max_messages: default_rate_limit_max_messages(), window_ms: default_rate_limit_window_ms() } }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration { Duration::from_millis(self.window_ms) }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub base_delay_ms: u64,
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { enabled: true, base_delay_ms: default_reconnect_base_delay_ms(), max_attempts: default_reconnect_max_attempts(), jitter: true }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration { Duration::from_millis(self.base_delay_ms) }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CorsConfig {
    pub origin: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorsConfig {
    /// When set, wire errors carry the full message instead of the
    /// sanitized generic string.
    pub development: bool,
}

impl Default for ErrorsConfig {
    fn default() -> Self { Self { development: false } }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthConfig {
    pub enabled: bool,
    pub path: String,
    pub checks: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self { Self { enabled: true, path: default_health_path(), checks: Vec::new() } }
}

/// Top-level config for a Lens server. Construct with `LensConfig::default()`
/// and override the fields that matter, or deserialize one from the
/// embedding application's config file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LensConfig {
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_max_subscriptions_per_client")]
    pub max_subscriptions_per_client: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub rate_limit: RateLimitConfig,
    pub reconnect: ReconnectConfig,
    pub cors: CorsConfig,
    pub errors: ErrorsConfig,
    pub health: HealthConfig,
    #[serde(default = "default_true")]
    pub log_requests: bool,
}

impl Default for LensConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            max_subscriptions_per_client: default_max_subscriptions_per_client(),
            max_connections: default_max_connections(),
            timeout_ms: default_timeout_ms(),
            rate_limit: RateLimitConfig::default(),
            reconnect: ReconnectConfig::default(),
            cors: CorsConfig::default(),
            errors: ErrorsConfig::default(),
            health: HealthConfig::default(),
            log_requests: true,
        }
    }
}

impl LensConfig {
    pub fn timeout(&self) -> Duration { Duration::from_millis(self.timeout_ms) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_values() {
        let config = LensConfig::default();
        assert_eq!(config.max_message_size, 1024 * 1024);
        assert_eq!(config.max_subscriptions_per_client, 100);
        assert_eq!(config.rate_limit.max_messages, 100);
        assert!(config.reconnect.enabled);
        assert!(!config.errors.development);
        assert!(config.health.enabled);
    }

    #[test]
    fn deserializes_partial_overrides_with_defaults() {
        let parsed: LensConfig = serde_json::from_str(r#"{"maxMessageSize": 2048}"#).unwrap();
        assert_eq!(parsed.max_message_size, 2048);
        assert_eq!(parsed.max_subscriptions_per_client, 100);
    }
}
