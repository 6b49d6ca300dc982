//! Synthetic purge items

use rand::Rng;
use rand::seq::SliceRandom;
use reclaim_common::{ClusterConfig, FileLayout, Frag, FragTree, InodeNo, PoolId, SnapContext};
use reclaim_queue::PurgeItem;

/// Mix of actions and sizes to generate
#[derive(Clone, Debug)]
pub struct WorkloadMix {
    pub dir_ratio: f64,
    pub truncate_ratio: f64,
    pub max_file_size: u64,
    /// Chance a purged file also has a backtrace in an older pool
    pub migrated_ratio: f64,
}

pub struct Workload {
    mix: WorkloadMix,
    data_pools: Vec<PoolId>,
    next_ino: u64,
}

impl Workload {
    pub fn new(mix: WorkloadMix, cluster: &ClusterConfig) -> Self {
        let mut data_pools: Vec<PoolId> = cluster.data_pools.iter().map(|p| p.id).collect();
        if data_pools.is_empty() {
            data_pools.push(PoolId::default());
        }
        Self {
            mix: WorkloadMix {
                dir_ratio: mix.dir_ratio.clamp(0.0, 1.0),
                truncate_ratio: mix.truncate_ratio.clamp(0.0, 1.0),
                migrated_ratio: mix.migrated_ratio.clamp(0.0, 1.0),
                ..mix
            },
            data_pools,
            // Leave room below for system inodes
            next_ino: 0x1000,
        }
    }

    pub fn next_item(&mut self, rng: &mut impl Rng) -> PurgeItem {
        let ino = InodeNo::new(self.next_ino);
        self.next_ino += 1;

        let roll: f64 = rng.gen_range(0.0..1.0);
        if roll < self.mix.dir_ratio {
            return PurgeItem::purge_dir(ino, random_fragtree(rng));
        }

        let pool = *self.data_pools.choose(rng).unwrap_or(&PoolId::default());
        let layout = FileLayout::default_for_pool(pool);
        let size = rng.gen_range(0..=self.mix.max_file_size);
        let snapc = SnapContext::new(1, vec![1]);

        if roll < self.mix.dir_ratio + self.mix.truncate_ratio {
            return PurgeItem::truncate_file(ino, size, layout, snapc);
        }

        let old_pools = if rng.gen_bool(self.mix.migrated_ratio) {
            self.data_pools
                .iter()
                .copied()
                .filter(|p| *p != pool)
                .take(1)
                .collect()
        } else {
            Vec::new()
        };
        PurgeItem::purge_file(ino, size, layout, old_pools, snapc)
    }
}

/// Mostly unsplit directories, some split once or twice
fn random_fragtree(rng: &mut impl Rng) -> FragTree {
    let mut tree = FragTree::new();
    match rng.gen_range(0..10) {
        0..=6 => {}
        7 | 8 => {
            let _ = tree.split(Frag::ROOT, rng.gen_range(1..=3));
        }
        _ => {
            if tree.split(Frag::ROOT, 1).is_ok() {
                let _ = tree.split(Frag::ROOT.make_child(1, 1), 2);
            }
        }
    }
    tree
}
