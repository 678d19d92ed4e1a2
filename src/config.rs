use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::constants;

/// Start-up configuration errors. These are the only errors that abort the
/// process; everything downstream of start-up is handled in place.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub upstream: UpstreamConfig,
    pub programs: ProgramsConfig,
    pub monitor: MonitorConfig,
    pub supervisor: SupervisorConfig,
    pub pipeline: PipelineConfig,
    pub batcher: BatcherConfig,
    pub cache: CacheConfig,
    pub oracle: OracleConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub endpoint: String,
    /// Auth token; normally supplied via CURVESCOPE_UPSTREAM_TOKEN
    pub token: String,
    pub commitment: String,
    /// Number of parallel feed connections the supervisor maintains
    pub connections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramsConfig {
    pub bonding_curve: String,
    pub amm_pool: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub save_all_tokens: bool,
    pub bc_save_threshold_usd: f64,
    pub amm_save_threshold_usd: f64,
    pub bc_max_market_cap_usd: f64,
    pub amm_max_market_cap_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub half_open_requests: u32,
    pub monitoring_window_ms: u64,
    pub checkpoint_interval_ms: u64,
    pub max_recovery_attempts: u32,
    pub recovery_backoff_ms: u64,
    pub parse_rate_alert_threshold: f64,
    pub latency_alert_ms: f64,
    pub healthy_parse_rate_floor: f64,
    pub checkpoint_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Per-mint shard count; correctness does not depend on it, throughput does
    pub shards: usize,
    /// Bounded depth of each shard queue; a full queue stalls the reader
    pub shard_queue_depth: usize,
    pub event_bus_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    pub min_batch: usize,
    pub max_batch: usize,
    pub batch_timeout_ms: u64,
    pub max_queue_size: usize,
    /// Flush-latency goal the adaptive batch size steers toward
    pub target_flush_latency_ms: f64,
    /// Low-priority items older than this are drained ahead of new High items
    pub aging_window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_bytes: usize,
    pub default_ttl_ms: u64,
    pub compression_threshold: usize,
    pub eviction_policy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub endpoint: String,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    pub fallback_usd: f64,
    /// Reject a reading that moved more than this factor from the last good one
    pub max_change_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// SQLite path; normally supplied via CURVESCOPE_DATABASE
    pub connection_string: String,
    pub pool_size: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:10000".to_string(),
            token: String::new(),
            commitment: "confirmed".to_string(),
            connections: 2,
        }
    }
}

impl Default for ProgramsConfig {
    fn default() -> Self {
        Self {
            bonding_curve: constants::BONDING_CURVE_PROGRAM.to_string(),
            amm_pool: constants::AMM_POOL_PROGRAM.to_string(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            save_all_tokens: false,
            bc_save_threshold_usd: 8_888.0,
            amm_save_threshold_usd: 1_000.0,
            bc_max_market_cap_usd: constants::BC_MAX_MARKET_CAP_USD,
            amm_max_market_cap_usd: constants::AMM_MAX_MARKET_CAP_USD,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_ms: 30_000,
            half_open_requests: 2,
            monitoring_window_ms: 60_000,
            checkpoint_interval_ms: 60_000,
            max_recovery_attempts: 5,
            recovery_backoff_ms: 5_000,
            parse_rate_alert_threshold: 0.5,
            latency_alert_ms: 5_000.0,
            healthy_parse_rate_floor: 0.3,
            checkpoint_path: "data/checkpoint.json".to_string(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shards: 8,
            shard_queue_depth: 512,
            event_bus_capacity: 1024,
        }
    }
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            min_batch: 10,
            max_batch: 500,
            batch_timeout_ms: 1_000,
            max_queue_size: 10_000,
            target_flush_latency_ms: 50.0,
            aging_window_ms: 5_000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024,
            default_ttl_ms: 300_000,
            compression_threshold: 4_096,
            eviction_policy: "lru".to_string(),
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://lite-api.jup.ag/price/v3?ids=So11111111111111111111111111111111111111112"
                .to_string(),
            poll_interval_ms: 30_000,
            timeout_ms: 10_000,
            fallback_usd: 150.0,
            max_change_factor: 1.5,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            connection_string: "data/curvescope.db".to_string(),
            pool_size: 4,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            programs: ProgramsConfig::default(),
            monitor: MonitorConfig::default(),
            supervisor: SupervisorConfig::default(),
            pipeline: PipelineConfig::default(),
            batcher: BatcherConfig::default(),
            cache: CacheConfig::default(),
            oracle: OracleConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration: defaults, then the JSON file if given, then
    /// environment overrides for secrets.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|source| ConfigError::Io {
                    path: p.display().to_string(),
                    source,
                })?;
                serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: p.display().to_string(),
                    source,
                })?
            }
            None => AppConfig::default(),
        };

        if let Ok(token) = std::env::var("CURVESCOPE_UPSTREAM_TOKEN") {
            config.upstream.token = token;
        }
        if let Ok(db) = std::env::var("CURVESCOPE_DATABASE") {
            config.persistence.connection_string = db;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bonding_curve_program()?;
        self.amm_pool_program()?;

        if self.upstream.connections == 0 {
            return Err(ConfigError::Invalid("upstream.connections must be > 0".into()));
        }
        if self.upstream.commitment != "confirmed" {
            return Err(ConfigError::Invalid(format!(
                "upstream.commitment must be \"confirmed\", got {:?}",
                self.upstream.commitment
            )));
        }
        if self.supervisor.failure_threshold == 0 {
            return Err(ConfigError::Invalid("supervisor.failure_threshold must be > 0".into()));
        }
        if self.supervisor.half_open_requests == 0 {
            return Err(ConfigError::Invalid("supervisor.half_open_requests must be > 0".into()));
        }
        if self.batcher.min_batch == 0 || self.batcher.min_batch > self.batcher.max_batch {
            return Err(ConfigError::Invalid(format!(
                "batcher batch bounds invalid: min {} max {}",
                self.batcher.min_batch, self.batcher.max_batch
            )));
        }
        if self.pipeline.shards == 0 {
            return Err(ConfigError::Invalid("pipeline.shards must be > 0".into()));
        }
        if !(self.oracle.fallback_usd > 0.0) {
            return Err(ConfigError::Invalid("oracle.fallback_usd must be positive".into()));
        }
        if self.monitor.bc_max_market_cap_usd <= 0.0 || self.monitor.amm_max_market_cap_usd <= 0.0 {
            return Err(ConfigError::Invalid("market-cap ceilings must be positive".into()));
        }
        if self.persistence.pool_size == 0 {
            return Err(ConfigError::Invalid("persistence.pool_size must be > 0".into()));
        }
        Ok(())
    }

    pub fn bonding_curve_program(&self) -> Result<Pubkey, ConfigError> {
        Pubkey::from_str(&self.programs.bonding_curve).map_err(|e| {
            ConfigError::Invalid(format!(
                "programs.bonding_curve {:?}: {e}",
                self.programs.bonding_curve
            ))
        })
    }

    pub fn amm_pool_program(&self) -> Result<Pubkey, ConfigError> {
        Pubkey::from_str(&self.programs.amm_pool)
            .map_err(|e| ConfigError::Invalid(format!("programs.amm_pool {:?}: {e}", self.programs.amm_pool)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.upstream.commitment, "confirmed");
        assert_eq!(
            config.bonding_curve_program().unwrap(),
            *constants::BONDING_CURVE_PROGRAM_ID
        );
    }

    #[test]
    fn test_bad_program_id_rejected() {
        let mut config = AppConfig::default();
        config.programs.bonding_curve = "not-a-key".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_batch_bounds_checked() {
        let mut config = AppConfig::default();
        config.batcher.min_batch = 600;
        config.batcher.max_batch = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_overlays_defaults() {
        let raw = r#"{ "monitor": { "save_all_tokens": true } }"#;
        let config: AppConfig = serde_json::from_str(raw).unwrap();
        assert!(config.monitor.save_all_tokens);
        // Untouched sections keep their defaults
        assert_eq!(config.batcher.max_batch, 500);
        assert_eq!(config.supervisor.failure_threshold, 3);
    }

    #[test]
    fn test_zero_connections_rejected() {
        let mut config = AppConfig::default();
        config.upstream.connections = 0;
        assert!(config.validate().is_err());
    }
}
