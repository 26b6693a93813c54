use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18920;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Top-level config (chorus.toml + CHORUS_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChorusConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub frequency: FrequencyConfig,
    #[serde(default)]
    pub offline: OfflineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// OpenAI-compatible chat-completions endpoint used for all LLM calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Retry attempts after the first failure.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_base_url(),
            api_key: String::new(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout_secs(),
            retry_attempts: default_retry_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_cache_ttl(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_content_truncate_chars")]
    pub content_truncate_chars: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: default_batch_interval_ms(),
            max_batch_size: default_max_batch_size(),
            content_truncate_chars: default_content_truncate_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_presence_monitor_interval")]
    pub monitor_interval_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            monitor_interval_secs: default_presence_monitor_interval(),
        }
    }
}

/// Tunables for the proactive expression pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrequencyConfig {
    /// Priority score at or above which an expression fires (before the
    /// probabilistic escape hatch).
    #[serde(default = "default_expression_threshold")]
    pub expression_threshold: f64,
    /// Minimum seconds between two proactive expressions per sense core.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Monitoring loop period.
    #[serde(default = "default_monitoring_interval_secs")]
    pub monitoring_interval_secs: u64,
    /// Weighted-random selection weights per expression type.
    #[serde(default = "default_type_weights")]
    pub type_weights: HashMap<String, f64>,
    /// Relative weights of the five context signal groups.
    #[serde(default = "default_signal_weights")]
    pub signal_weights: HashMap<String, f64>,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            expression_threshold: default_expression_threshold(),
            cooldown_secs: default_cooldown_secs(),
            monitoring_interval_secs: default_monitoring_interval_secs(),
            type_weights: default_type_weights(),
            signal_weights: default_signal_weights(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineConfig {
    #[serde(default = "default_max_offline_notifications")]
    pub max_notifications_per_user: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            max_notifications_per_user: default_max_offline_notifications(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Chunk size for bulk fan-in reads.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

fn default_max_offline_notifications() -> usize {
    100
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.chorus/chorus.db", home)
}
fn default_provider_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_temperature() -> f64 {
    0.7
}
fn default_request_timeout_secs() -> u64 {
    60
}
fn default_retry_attempts() -> u32 {
    2
}
fn default_cache_ttl() -> u64 {
    300
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_batch_interval_ms() -> u64 {
    100
}
fn default_max_batch_size() -> usize {
    20
}
fn default_content_truncate_chars() -> usize {
    1000
}
fn default_heartbeat_timeout() -> u64 {
    30
}
fn default_presence_monitor_interval() -> u64 {
    10
}
fn default_expression_threshold() -> f64 {
    0.7
}
fn default_cooldown_secs() -> u64 {
    300
}
fn default_monitoring_interval_secs() -> u64 {
    60
}
fn default_batch_size() -> usize {
    50
}
fn default_type_weights() -> HashMap<String, f64> {
    HashMap::from([
        ("greeting".to_string(), 0.2),
        ("question".to_string(), 0.3),
        ("suggestion".to_string(), 0.25),
        ("reminder".to_string(), 0.15),
        ("observation".to_string(), 0.1),
    ])
}
fn default_signal_weights() -> HashMap<String, f64> {
    HashMap::from([
        ("user_activity".to_string(), 10.0),
        ("time_elapsed".to_string(), 6.0),
        ("conversation_context".to_string(), 8.0),
        ("system_state".to_string(), 5.0),
        ("external_events".to_string(), 7.0),
    ])
}

impl ChorusConfig {
    /// Load config from a TOML file with CHORUS_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.chorus/chorus.toml
    ///
    /// Env keys use a double underscore between the section and the
    /// field, so single underscores inside field names survive:
    /// `CHORUS_CACHE__TTL_SECONDS` → `cache.ttl_seconds`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ChorusConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CHORUS_").split("__"))
            .extract()
            .map_err(|e| crate::error::ChorusError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.chorus/chorus.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ChorusConfig::default();
        assert_eq!(cfg.cache.ttl_seconds, 300);
        assert_eq!(cfg.optimizer.batch_interval_ms, 100);
        assert_eq!(cfg.optimizer.max_batch_size, 20);
        assert_eq!(cfg.optimizer.content_truncate_chars, 1000);
        assert_eq!(cfg.presence.heartbeat_timeout_secs, 30);
        assert_eq!(cfg.presence.monitor_interval_secs, 10);
        assert_eq!(cfg.frequency.expression_threshold, 0.7);
        assert_eq!(cfg.frequency.cooldown_secs, 300);
        assert_eq!(cfg.frequency.monitoring_interval_secs, 60);
        assert_eq!(cfg.offline.max_notifications_per_user, 100);
        assert_eq!(cfg.storage.batch_size, 50);
        assert_eq!(cfg.provider.retry_attempts, 2);
    }

    #[test]
    fn env_overrides_reach_multi_word_fields() {
        std::env::set_var("CHORUS_CACHE__TTL_SECONDS", "42");
        std::env::set_var("CHORUS_OPTIMIZER__MAX_BATCH_SIZE", "7");
        std::env::set_var("CHORUS_GATEWAY__PORT", "19001");

        // no TOML file at this path; only env vars apply
        let cfg = ChorusConfig::load(Some("/nonexistent/chorus.toml")).unwrap();
        assert_eq!(cfg.cache.ttl_seconds, 42);
        assert_eq!(cfg.optimizer.max_batch_size, 7);
        assert_eq!(cfg.gateway.port, 19001);
        // untouched fields keep their defaults
        assert_eq!(cfg.optimizer.batch_interval_ms, 100);

        std::env::remove_var("CHORUS_CACHE__TTL_SECONDS");
        std::env::remove_var("CHORUS_OPTIMIZER__MAX_BATCH_SIZE");
        std::env::remove_var("CHORUS_GATEWAY__PORT");
    }

    #[test]
    fn type_weights_cover_all_expression_types() {
        let weights = default_type_weights();
        for key in ["greeting", "question", "suggestion", "reminder", "observation"] {
            assert!(weights.contains_key(key), "missing weight for {key}");
        }
        let sum: f64 = weights.values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }
}
