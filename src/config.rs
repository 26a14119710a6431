use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core_types::ServerId;
use crate::error::TmError;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// Per-module level overrides, e.g. `xa_coordinator::journal: debug`
    #[serde(default)]
    pub log_targets: BTreeMap<String, String>,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    /// Pools registered at startup
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

/// Coordinator Configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Embedded in every gtrid; must be unique among coordinators sharing resources
    pub server_id: ServerId,
    pub transaction_timeout_secs: u64,
    /// Spacing between phase-2 retries of a failing branch
    pub retry_interval_ms: u64,
    /// Background retries per failing branch before it is left in doubt
    pub max_retry_count: u32,
    /// Commit single-branch transactions with one-phase commit
    pub one_phase_commit: bool,
    /// Minimum age of an uncorrelated branch before recovery presumes abort
    pub recovery_safety_margin_ms: u64,
    /// 0 disables background recovery
    pub background_recovery_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            server_id: 1,
            transaction_timeout_secs: 60,
            retry_interval_ms: 1000,
            max_retry_count: 5,
            one_phase_commit: false,
            recovery_safety_margin_ms: 60_000,
            background_recovery_interval_ms: 0,
        }
    }
}

impl CoordinatorConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn recovery_safety_margin(&self) -> Duration {
        Duration::from_millis(self.recovery_safety_margin_ms)
    }

    pub fn background_recovery_interval(&self) -> Option<Duration> {
        (self.background_recovery_interval_ms > 0)
            .then(|| Duration::from_millis(self.background_recovery_interval_ms))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JournalKind {
    Memory,
    Disk,
}

/// Journal Configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct JournalConfig {
    pub kind: JournalKind,
    pub path: String,
    /// fsync records at or beyond PREPARING
    pub force_sync: bool,
    /// Disk journal size that triggers compaction; 0 disables it
    pub compact_threshold_bytes: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            kind: JournalKind::Disk,
            path: "./data/journal/tm.journal".to_string(),
            force_sync: true,
            compact_threshold_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Resource Pool Configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    pub unique_name: String,
    #[serde(default)]
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    /// Run on every connection leaving IN_POOL; absent skips testing
    #[serde(default)]
    pub test_query: Option<String>,
    /// Park released connections in NOT_ACCESSIBLE until their transaction completes
    #[serde(default)]
    pub keep_connection_open_until_after_2pc: bool,
    #[serde(default = "default_acquisition_timeout_ms")]
    pub acquisition_timeout_ms: u64,
    #[serde(default = "default_max_idle_time_ms")]
    pub max_idle_time_ms: u64,
}

fn default_acquisition_timeout_ms() -> u64 {
    30_000
}

fn default_max_idle_time_ms() -> u64 {
    60_000
}

impl PoolConfig {
    pub fn new(unique_name: impl Into<String>, min_pool_size: usize, max_pool_size: usize) -> Self {
        Self {
            unique_name: unique_name.into(),
            min_pool_size,
            max_pool_size,
            test_query: None,
            keep_connection_open_until_after_2pc: false,
            acquisition_timeout_ms: default_acquisition_timeout_ms(),
            max_idle_time_ms: default_max_idle_time_ms(),
        }
    }

    pub fn acquisition_timeout(&self) -> Duration {
        Duration::from_millis(self.acquisition_timeout_ms)
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_time_ms)
    }

    pub fn validate(&self) -> Result<(), TmError> {
        if self.unique_name.is_empty() {
            return Err(TmError::Config("pool unique_name must not be empty".into()));
        }
        if self.max_pool_size == 0 {
            return Err(TmError::Config(format!(
                "pool {}: max_pool_size must be positive",
                self.unique_name
            )));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(TmError::Config(format!(
                "pool {}: min_pool_size {} exceeds max_pool_size {}",
                self.unique_name, self.min_pool_size, self.max_pool_size
            )));
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TmError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            TmError::Config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        let config: AppConfig = serde_yaml::from_str(&content)
            .map_err(|e| TmError::Config(format!("failed to parse config yaml: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `config/<env>.yaml`
    pub fn load_env(env: &str) -> Result<Self, TmError> {
        Self::load(format!("config/{}.yaml", env))
    }

    pub fn validate(&self) -> Result<(), TmError> {
        let mut names = std::collections::HashSet::new();
        for pool in &self.pools {
            pool.validate()?;
            if !names.insert(pool.unique_name.as_str()) {
                return Err(TmError::DuplicateResource(pool.unique_name.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
log_level: info
log_dir: ./logs
log_file: tm.log
use_json: false
rotation: daily
coordinator:
  server_id: 3
  retry_interval_ms: 250
journal:
  kind: memory
pools:
  - unique_name: pds1
    min_pool_size: 1
    max_pool_size: 4
    test_query: "SELECT 1"
"#;

    #[test]
    fn test_parse_with_defaults() {
        let config: AppConfig = serde_yaml::from_str(YAML).unwrap();
        config.validate().unwrap();

        assert_eq!(config.coordinator.server_id, 3);
        assert_eq!(config.coordinator.retry_interval(), Duration::from_millis(250));
        assert_eq!(config.coordinator.max_retry_count, 5);
        assert_eq!(config.coordinator.background_recovery_interval(), None);
        assert_eq!(config.journal.kind, JournalKind::Memory);
        assert!(config.journal.force_sync);

        let pool = &config.pools[0];
        assert_eq!(pool.test_query.as_deref(), Some("SELECT 1"));
        assert_eq!(pool.acquisition_timeout(), Duration::from_secs(30));
        assert!(!pool.keep_connection_open_until_after_2pc);
    }

    #[test]
    fn test_pool_validation() {
        assert!(PoolConfig::new("a", 0, 0).validate().is_err());
        assert!(PoolConfig::new("a", 5, 2).validate().is_err());
        assert!(PoolConfig::new("", 0, 2).validate().is_err());
        assert!(PoolConfig::new("a", 2, 2).validate().is_ok());
    }

    #[test]
    fn test_duplicate_pool_names_rejected() {
        let mut config: AppConfig = serde_yaml::from_str(YAML).unwrap();
        config.pools.push(PoolConfig::new("pds1", 0, 1));
        assert!(matches!(
            config.validate(),
            Err(TmError::DuplicateResource(name)) if name == "pds1"
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = AppConfig::load("does/not/exist.yaml").unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
