//! Cluster topology as seen by the purge queue
//!
//! Only consulted to size the op throttle. The pool list and the placement
//! map may be at different epochs, so a data pool can be missing from the
//! map for a while.

use parking_lot::RwLock;
use reclaim_common::config::ClusterConfig;
use reclaim_common::PoolId;
use std::collections::HashMap;

/// Read-only view of pools, placement groups and active servers
pub trait ClusterView: Send + Sync {
    /// Pools holding file data
    fn data_pools(&self) -> Vec<PoolId>;

    /// Placement groups in `pool`, or `None` if the pool is not in the
    /// cached placement map yet
    fn pg_num(&self, pool: PoolId) -> Option<u32>;

    /// Metadata servers sharing the purge load
    fn active_servers(&self) -> u32;
}

#[derive(Debug, Default)]
struct Topology {
    data_pools: Vec<PoolId>,
    pg_nums: HashMap<PoolId, u32>,
    active_servers: u32,
}

/// A cluster view that changes only when told to
#[derive(Debug, Default)]
pub struct StaticClusterView {
    topology: RwLock<Topology>,
}

impl StaticClusterView {
    #[must_use]
    pub fn new(active_servers: u32) -> Self {
        Self {
            topology: RwLock::new(Topology {
                active_servers,
                ..Topology::default()
            }),
        }
    }

    #[must_use]
    pub fn from_config(config: &ClusterConfig) -> Self {
        let view = Self::new(config.active_servers);
        for pool in &config.data_pools {
            view.add_data_pool(pool.id, pool.pg_num);
        }
        view
    }

    /// Add (or resize) a data pool present in the placement map
    pub fn add_data_pool(&self, pool: PoolId, pg_num: u32) {
        let mut topology = self.topology.write();
        if !topology.data_pools.contains(&pool) {
            topology.data_pools.push(pool);
        }
        topology.pg_nums.insert(pool, pg_num);
    }

    /// Add a data pool the placement map does not know about yet
    pub fn add_unmapped_data_pool(&self, pool: PoolId) {
        let mut topology = self.topology.write();
        if !topology.data_pools.contains(&pool) {
            topology.data_pools.push(pool);
        }
        topology.pg_nums.remove(&pool);
    }

    pub fn set_active_servers(&self, active_servers: u32) {
        self.topology.write().active_servers = active_servers;
    }
}

impl ClusterView for StaticClusterView {
    fn data_pools(&self) -> Vec<PoolId> {
        self.topology.read().data_pools.clone()
    }

    fn pg_num(&self, pool: PoolId) -> Option<u32> {
        self.topology.read().pg_nums.get(&pool).copied()
    }

    fn active_servers(&self) -> u32 {
        self.topology.read().active_servers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reclaim_common::config::PoolConfig;

    #[test]
    fn test_from_config() {
        let config = ClusterConfig {
            metadata_pool: PoolId::new(1),
            data_pools: vec![
                PoolConfig {
                    id: PoolId::new(2),
                    pg_num: 64,
                },
                PoolConfig {
                    id: PoolId::new(3),
                    pg_num: 32,
                },
            ],
            active_servers: 2,
        };
        let view = StaticClusterView::from_config(&config);
        assert_eq!(view.data_pools(), vec![PoolId::new(2), PoolId::new(3)]);
        assert_eq!(view.pg_num(PoolId::new(3)), Some(32));
        assert_eq!(view.active_servers(), 2);
    }

    #[test]
    fn test_unmapped_pool() {
        let view = StaticClusterView::new(1);
        view.add_data_pool(PoolId::new(2), 8);
        view.add_unmapped_data_pool(PoolId::new(2));
        assert_eq!(view.data_pools(), vec![PoolId::new(2)]);
        assert_eq!(view.pg_num(PoolId::new(2)), None);
    }
}
