//! Configuration types for Reclaim
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then environment variables prefixed with `RECLAIM__` (highest priority),
//! e.g. `RECLAIM__PURGE_QUEUE__MAX_PURGE_FILES=16`.

use crate::error::{Error, Result};
use crate::types::PoolId;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "RECLAIM";

/// Root configuration for Reclaim
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Purge queue throttles and policies
    pub purge_queue: PurgeQueueConfig,
    /// Static cluster description
    pub cluster: ClusterConfig,
}

impl Config {
    /// Load defaults overlaid with environment overrides
    pub fn load() -> Result<Self> {
        Self::load_layers(None)
    }

    /// Load defaults, then `path`, then environment overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_layers(Some(path.as_ref()))
    }

    fn load_layers(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can run with
    pub fn validate(&self) -> Result<()> {
        self.purge_queue.validate()?;
        self.cluster.validate()
    }
}

/// What to do when a queue entry cannot be decoded
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptEntryPolicy {
    /// Log, count as dropped and continue with the next entry
    #[default]
    Skip,
    /// Stop consuming and leave the entry in the log for an operator
    Halt,
}

/// Purge queue throttles and policies
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgeQueueConfig {
    /// Maximum number of items executing at once (0 pauses consumption)
    pub max_purge_files: u64,
    /// Absolute cap on backend operations in flight (0 = no cap)
    pub max_purge_ops: u64,
    /// Backend operations allowed per placement group, spread over the
    /// active metadata servers
    pub max_purge_ops_per_pg: f64,
    /// Maximum striped objects a single range purge is charged for
    pub filer_max_purge_ops: u64,
    /// Handling of undecodable entries
    pub corrupt_entry_policy: CorruptEntryPolicy,
    /// Seconds between op-limit refreshes from the cluster view (0 = only
    /// on demand)
    pub op_limit_refresh_secs: u64,
}

impl Default for PurgeQueueConfig {
    fn default() -> Self {
        Self {
            max_purge_files: 64,
            max_purge_ops: 8192,
            max_purge_ops_per_pg: 0.5,
            filer_max_purge_ops: 10,
            corrupt_entry_policy: CorruptEntryPolicy::Skip,
            op_limit_refresh_secs: 0,
        }
    }
}

/// A purge queue setting that can change at runtime
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigKey {
    MaxPurgeFiles,
    MaxPurgeOps,
    MaxPurgeOpsPerPg,
    FilerMaxPurgeOps,
    CorruptEntryPolicy,
    OpLimitRefresh,
}

impl PurgeQueueConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.max_purge_ops_per_pg.is_finite() || self.max_purge_ops_per_pg < 0.0 {
            return Err(Error::configuration(format!(
                "max_purge_ops_per_pg must be a non-negative number, got {}",
                self.max_purge_ops_per_pg
            )));
        }
        Ok(())
    }

    /// Settings whose value differs between `self` and `other`
    #[must_use]
    pub fn diff(&self, other: &Self) -> Vec<ConfigKey> {
        let mut changed = Vec::new();
        if self.max_purge_files != other.max_purge_files {
            changed.push(ConfigKey::MaxPurgeFiles);
        }
        if self.max_purge_ops != other.max_purge_ops {
            changed.push(ConfigKey::MaxPurgeOps);
        }
        if self.max_purge_ops_per_pg.to_bits() != other.max_purge_ops_per_pg.to_bits() {
            changed.push(ConfigKey::MaxPurgeOpsPerPg);
        }
        if self.filer_max_purge_ops != other.filer_max_purge_ops {
            changed.push(ConfigKey::FilerMaxPurgeOps);
        }
        if self.corrupt_entry_policy != other.corrupt_entry_policy {
            changed.push(ConfigKey::CorruptEntryPolicy);
        }
        if self.op_limit_refresh_secs != other.op_limit_refresh_secs {
            changed.push(ConfigKey::OpLimitRefresh);
        }
        changed
    }
}

/// A data pool in a static cluster description
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub id: PoolId,
    /// Placement groups in the pool
    pub pg_num: u32,
}

/// Static cluster description
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Pool holding directory fragments and the queue log
    pub metadata_pool: PoolId,
    /// Data pools used by the filesystem
    pub data_pools: Vec<PoolConfig>,
    /// Active metadata servers sharing the purge load
    pub active_servers: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            metadata_pool: PoolId::new(1),
            data_pools: vec![PoolConfig {
                id: PoolId::new(2),
                pg_num: 128,
            }],
            active_servers: 1,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.data_pools.iter().any(|p| p.id == self.metadata_pool) {
            return Err(Error::configuration(format!(
                "metadata pool {} is also listed as a data pool",
                self.metadata_pool
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PurgeQueueConfig::default();
        assert_eq!(config.max_purge_files, 64);
        assert_eq!(config.max_purge_ops, 8192);
        assert_eq!(config.filer_max_purge_ops, 10);
        assert_eq!(config.corrupt_entry_policy, CorruptEntryPolicy::Skip);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_diff() {
        let old = PurgeQueueConfig::default();
        let mut new = old.clone();
        assert!(old.diff(&new).is_empty());

        new.max_purge_files = 0;
        new.max_purge_ops_per_pg = 1.0;
        assert_eq!(
            old.diff(&new),
            vec![ConfigKey::MaxPurgeFiles, ConfigKey::MaxPurgeOpsPerPg]
        );
    }

    #[test]
    fn test_rejects_negative_multiplier() {
        let config = PurgeQueueConfig {
            max_purge_ops_per_pg: -1.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[purge_queue]
max_purge_files = 8
corrupt_entry_policy = "halt"

[cluster]
metadata_pool = 10
active_servers = 3
data_pools = [{{ id = 11, pg_num = 64 }}, {{ id = 12, pg_num = 32 }}]
"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.purge_queue.max_purge_files, 8);
        assert_eq!(config.purge_queue.corrupt_entry_policy, CorruptEntryPolicy::Halt);
        // Unset keys keep their defaults
        assert_eq!(config.purge_queue.max_purge_ops, 8192);
        assert_eq!(config.cluster.active_servers, 3);
        assert_eq!(config.cluster.data_pools[1].pg_num, 32);
    }

    #[test]
    fn test_load_rejects_overlapping_pools() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[cluster]\nmetadata_pool = 5\ndata_pools = [{{ id = 5, pg_num = 8 }}]"
        )
        .unwrap();
        assert!(Config::load_from(file.path()).is_err());
    }
}
