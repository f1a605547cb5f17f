//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::cache::ReadCacheConfig;
use crate::checkpoint::{CheckpointSettings, CheckpointType};
use crate::store::{FasterKvConfig, LockingConfig, LockingMode};

/// Environment variable naming a TOML configuration file.
pub const CONFIG_PATH_ENV: &str = "OXIFASTER_LOCKING_CONFIG";

/// Prefix of `section__field` environment overrides.
pub const ENV_OVERRIDE_PREFIX: &str = "OXIFASTER_LOCKING__";

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    /// Missing required configuration field.
    #[error("missing required field: {0}")]
    MissingField(String),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OxifasterConfig {
    /// Store configuration.
    pub store: Option<StoreConfig>,
    /// Locking configuration.
    pub locking: Option<LockingConfigSpec>,
    /// Read cache configuration.
    pub cache: Option<ReadCacheConfigSpec>,
    /// Checkpoint configuration.
    pub checkpoint: Option<CheckpointConfigSpec>,
}

impl OxifasterConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `OXIFASTER_LOCKING_CONFIG` env var (if
    /// set), then apply `OXIFASTER_LOCKING__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config_path = env::var(CONFIG_PATH_ENV).ok();
        let mut config = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with(ENV_OVERRIDE_PREFIX) {
                continue;
            }
            let path = key[ENV_OVERRIDE_PREFIX.len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["store", "table_size"] => {
                    self.store_mut().table_size = Some(parse_value(&key, &value)?);
                }
                ["store", "log_capacity"] => {
                    self.store_mut().log_capacity = Some(parse_value(&key, &value)?);
                }
                ["store", "mutable_records"] => {
                    self.store_mut().mutable_records = Some(parse_value(&key, &value)?);
                }
                ["store", "copy_reads_to_tail"] => {
                    self.store_mut().copy_reads_to_tail = Some(parse_value(&key, &value)?);
                }
                ["locking", "mode"] => {
                    self.locking_mut().mode = Some(parse_value(&key, &value)?);
                }
                ["locking", "lock_table_enabled"] => {
                    self.locking_mut().lock_table_enabled = Some(parse_value(&key, &value)?);
                }
                ["locking", "lock_spin_count"] => {
                    self.locking_mut().lock_spin_count = Some(parse_value(&key, &value)?);
                }
                ["locking", "tentative_wait_spins"] => {
                    self.locking_mut().tentative_wait_spins = Some(parse_value(&key, &value)?);
                }
                ["locking", "close_wait_spins"] => {
                    self.locking_mut().close_wait_spins = Some(parse_value(&key, &value)?);
                }
                ["locking", "lock_table_shards"] => {
                    self.locking_mut().lock_table_shards = Some(parse_value(&key, &value)?);
                }
                ["cache", "enabled"] => {
                    self.cache_mut().enabled = Some(parse_value(&key, &value)?);
                }
                ["cache", "capacity"] => {
                    self.cache_mut().capacity = Some(parse_value(&key, &value)?);
                }
                ["cache", "copy_to_tail"] => {
                    self.cache_mut().copy_to_tail = Some(parse_value(&key, &value)?);
                }
                ["checkpoint", "checkpoint_type"] => {
                    self.checkpoint_mut().checkpoint_type = Some(parse_value(&key, &value)?);
                }
                ["checkpoint", "checkpoint_dir"] => {
                    self.checkpoint_mut().checkpoint_dir = Some(PathBuf::from(value));
                }
                ["checkpoint", "remove_outdated"] => {
                    self.checkpoint_mut().remove_outdated = Some(parse_value(&key, &value)?);
                }
                ["checkpoint", "throttle_flush_delay_ms"] => {
                    self.checkpoint_mut().throttle_flush_delay_ms = Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Build a `FasterKvConfig` using defaults plus every configured section.
    pub fn to_faster_kv_config(&self) -> Result<FasterKvConfig, ConfigError> {
        let mut config = FasterKvConfig::default();
        if let Some(store) = &self.store {
            store.apply_to(&mut config);
        }
        config.locking = self.to_locking_config();
        config.read_cache = self.to_read_cache_config();
        config.checkpoint = self.to_checkpoint_settings()?;
        Ok(config)
    }

    /// Build a `LockingConfig` using defaults plus overrides.
    pub fn to_locking_config(&self) -> LockingConfig {
        let mut config = LockingConfig::default();
        if let Some(locking) = &self.locking {
            locking.apply_to(&mut config);
        }
        config
    }

    /// Build a `ReadCacheConfig` when cache is enabled.
    pub fn to_read_cache_config(&self) -> Option<ReadCacheConfig> {
        let cache = self.cache.as_ref()?;
        if cache.enabled != Some(true) {
            return None;
        }

        let mut config = ReadCacheConfig::default();
        cache.apply_to(&mut config);
        Some(config)
    }

    /// Build `CheckpointSettings` using defaults plus overrides.
    pub fn to_checkpoint_settings(&self) -> Result<CheckpointSettings, ConfigError> {
        let mut settings = CheckpointSettings::default();
        if let Some(checkpoint) = &self.checkpoint {
            checkpoint.apply_to(&mut settings)?;
        }
        Ok(settings)
    }

    fn store_mut(&mut self) -> &mut StoreConfig {
        self.store.get_or_insert_with(StoreConfig::default)
    }

    fn locking_mut(&mut self) -> &mut LockingConfigSpec {
        self.locking.get_or_insert_with(LockingConfigSpec::default)
    }

    fn cache_mut(&mut self) -> &mut ReadCacheConfigSpec {
        self.cache.get_or_insert_with(ReadCacheConfigSpec::default)
    }

    fn checkpoint_mut(&mut self) -> &mut CheckpointConfigSpec {
        self.checkpoint.get_or_insert_with(CheckpointConfigSpec::default)
    }
}

/// Store configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Hash table size.
    pub table_size: Option<u64>,
    /// Main log capacity in records.
    pub log_capacity: Option<usize>,
    /// Number of newest records kept mutable.
    pub mutable_records: Option<u64>,
    /// Copy evicted reads to the log tail when the read cache is off.
    pub copy_reads_to_tail: Option<bool>,
}

impl StoreConfig {
    fn apply_to(&self, config: &mut FasterKvConfig) {
        if let Some(value) = self.table_size {
            config.table_size = value;
        }
        if let Some(value) = self.log_capacity {
            config.log.capacity = value;
        }
        if let Some(value) = self.mutable_records {
            config.log.mutable_records = value;
        }
        if let Some(value) = self.copy_reads_to_tail {
            config.copy_reads_to_tail = value;
        }
    }
}

/// Locking configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockingConfigSpec {
    /// Session locking mode.
    pub mode: Option<LockingMode>,
    /// Whether the lock table is used.
    pub lock_table_enabled: Option<bool>,
    /// Spin budget of one lock attempt.
    pub lock_spin_count: Option<u32>,
    /// Wait budget for tentative records.
    pub tentative_wait_spins: Option<u32>,
    /// Wait budget for the close of an evicted record.
    pub close_wait_spins: Option<u32>,
    /// Number of lock table shards.
    pub lock_table_shards: Option<usize>,
}

impl LockingConfigSpec {
    fn apply_to(&self, config: &mut LockingConfig) {
        if let Some(value) = self.mode {
            config.mode = value;
        }
        if let Some(value) = self.lock_table_enabled {
            config.lock_table_enabled = value;
        }
        if let Some(value) = self.lock_spin_count {
            config.lock_spin_count = value;
        }
        if let Some(value) = self.tentative_wait_spins {
            config.tentative_wait_spins = value;
        }
        if let Some(value) = self.close_wait_spins {
            config.close_wait_spins = value;
        }
        if let Some(value) = self.lock_table_shards {
            config.lock_table_shards = value.max(1);
        }
    }
}

/// Read cache configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadCacheConfigSpec {
    /// Whether to enable read cache.
    pub enabled: Option<bool>,
    /// Cache capacity in records.
    pub capacity: Option<usize>,
    /// Whether to copy records into the cache on read.
    pub copy_to_tail: Option<bool>,
}

impl ReadCacheConfigSpec {
    fn apply_to(&self, config: &mut ReadCacheConfig) {
        if let Some(value) = self.capacity {
            config.capacity = value;
        }
        if let Some(value) = self.copy_to_tail {
            config.copy_to_tail = value;
        }
    }
}

/// Checkpoint configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfigSpec {
    /// Checkpoint type.
    pub checkpoint_type: Option<CheckpointType>,
    /// Directory for the local checkpoint manager.
    pub checkpoint_dir: Option<PathBuf>,
    /// Purge all but the newest checkpoint after each commit.
    pub remove_outdated: Option<bool>,
    /// Delay before each checkpoint flush, in milliseconds.
    pub throttle_flush_delay_ms: Option<u64>,
}

impl CheckpointConfigSpec {
    fn apply_to(&self, settings: &mut CheckpointSettings) -> Result<(), ConfigError> {
        if let Some(value) = self.checkpoint_type {
            settings.checkpoint_type = value;
        }
        if let Some(value) = &self.checkpoint_dir {
            settings.checkpoint_dir = Some(value.clone());
        }
        if let Some(value) = self.remove_outdated {
            if value && settings.checkpoint_dir.is_none() {
                return Err(ConfigError::MissingField("checkpoint.checkpoint_dir".to_string()));
            }
            settings.remove_outdated = value;
        }
        if let Some(value) = self.throttle_flush_delay_ms {
            settings.throttle_checkpoint_flush_delay = Some(Duration::from_millis(value));
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
