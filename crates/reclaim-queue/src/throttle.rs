//! Admission control for the purge queue
//!
//! Two independent budgets: items executing (bounded by `max_purge_files`)
//! and estimated backend ops in flight (bounded by a limit derived from the
//! cluster size).

use crate::cluster::ClusterView;
use reclaim_common::PurgeQueueConfig;
use tracing::{debug, warn};

/// Op budget of the purge queue
#[derive(Debug, Default)]
pub struct Throttle {
    ops_in_flight: u64,
    max_purge_ops: u64,
}

impl Throttle {
    #[must_use]
    pub const fn new(max_purge_ops: u64) -> Self {
        Self {
            ops_in_flight: 0,
            max_purge_ops,
        }
    }

    #[must_use]
    pub const fn ops_in_flight(&self) -> u64 {
        self.ops_in_flight
    }

    #[must_use]
    pub const fn max_purge_ops(&self) -> u64 {
        self.max_purge_ops
    }

    pub const fn set_max_purge_ops(&mut self, max_purge_ops: u64) {
        self.max_purge_ops = max_purge_ops;
    }

    /// Whether another item may start executing
    ///
    /// With nothing in flight an item is always admitted, so no op limit
    /// can stall the queue; a `max_purge_files` of zero pauses it.
    #[must_use]
    pub fn can_consume(&self, items_in_flight: usize, max_purge_files: u64) -> bool {
        debug!(
            "{}/{} ops, {}/{} files",
            self.ops_in_flight, self.max_purge_ops, items_in_flight, max_purge_files
        );

        if items_in_flight == 0 && max_purge_files > 0 {
            return true;
        }

        if self.ops_in_flight >= self.max_purge_ops {
            debug!(
                "Throttling on op limit {}/{}",
                self.ops_in_flight, self.max_purge_ops
            );
            return false;
        }

        if items_in_flight as u64 >= max_purge_files {
            debug!(
                "Throttling on item limit {}/{}",
                items_in_flight, max_purge_files
            );
            return false;
        }

        true
    }

    /// Account for an admitted item
    pub const fn charge(&mut self, ops: u64) {
        self.ops_in_flight += ops;
    }

    /// Return the charge of a finished or dropped item
    pub fn refund(&mut self, ops: u64) {
        debug_assert!(
            ops <= self.ops_in_flight,
            "refund of {ops} ops exceeds {} in flight",
            self.ops_in_flight
        );
        self.ops_in_flight = self.ops_in_flight.saturating_sub(ops);
    }
}

/// Op limit for the current cluster size
///
/// Placement groups across all mapped data pools, divided among the active
/// servers, times `max_purge_ops_per_pg`; capped by `max_purge_ops` when
/// that is nonzero.
#[must_use]
pub fn recompute_max_ops(cluster: &dyn ClusterView, config: &PurgeQueueConfig) -> u64 {
    let mut pg_count = 0u64;
    for pool in cluster.data_pools() {
        match cluster.pg_num(pool) {
            Some(pg_num) => pg_count += u64::from(pg_num),
            // The pool list can be newer than the placement map
            None => debug!("Data pool {} not found in placement map", pool),
        }
    }

    let active_servers = match cluster.active_servers() {
        0 => {
            warn!("No active servers in cluster view, assuming one");
            1
        }
        n => n,
    };

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let mut max_ops =
        (pg_count as f64 / f64::from(active_servers) * config.max_purge_ops_per_pg) as u64;

    if config.max_purge_ops > 0 {
        max_ops = max_ops.min(config.max_purge_ops);
    }
    max_ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticClusterView;
    use reclaim_common::PoolId;

    #[test]
    fn test_progress_floor() {
        let mut throttle = Throttle::new(0);
        assert!(throttle.can_consume(0, 4));

        // One item admitted: the zero op limit now applies
        throttle.charge(3);
        assert!(!throttle.can_consume(1, 4));

        throttle.refund(3);
        assert!(throttle.can_consume(0, 4));
    }

    #[test]
    fn test_zero_files_pauses() {
        let throttle = Throttle::new(1000);
        assert!(!throttle.can_consume(0, 0));
    }

    #[test]
    fn test_item_and_op_limits() {
        let mut throttle = Throttle::new(10);
        throttle.charge(4);
        assert!(throttle.can_consume(1, 2));
        assert!(!throttle.can_consume(2, 2));

        throttle.charge(6);
        assert!(!throttle.can_consume(1, 64));
    }

    #[test]
    fn test_recompute_max_ops() {
        let view = StaticClusterView::new(2);
        view.add_data_pool(PoolId::new(2), 64);
        view.add_data_pool(PoolId::new(3), 64);
        // A pool not yet in the placement map is skipped
        view.add_unmapped_data_pool(PoolId::new(4));

        let config = PurgeQueueConfig {
            max_purge_ops: 0,
            max_purge_ops_per_pg: 0.5,
            ..Default::default()
        };
        assert_eq!(recompute_max_ops(&view, &config), 32);

        let capped = PurgeQueueConfig {
            max_purge_ops: 20,
            ..config.clone()
        };
        assert_eq!(recompute_max_ops(&view, &capped), 20);

        view.set_active_servers(0);
        assert_eq!(recompute_max_ops(&view, &config), 64);
    }

    #[test]
    fn test_recompute_floors() {
        let view = StaticClusterView::new(3);
        view.add_data_pool(PoolId::new(2), 10);
        let config = PurgeQueueConfig {
            max_purge_ops_per_pg: 1.0,
            ..Default::default()
        };
        // 10 / 3 = 3.33
        assert_eq!(recompute_max_ops(&view, &config), 3);
    }
}
