//! Backend operation cost of executing a purge item

use crate::item::{PurgeAction, PurgeItem};
use crate::striper::striped_object_count;
use reclaim_common::Frag;

/// Number of backend operations `item` will keep in flight
///
/// `filer_max_purge_ops` caps what a single range purge is charged, since
/// the backend client never runs more than that many removes of one range
/// at once. Unrecognized actions are costed like files so the charge taken
/// on admission can be refunded exactly when they are dropped.
#[must_use]
pub fn estimate_ops(item: &PurgeItem, filer_max_purge_ops: u64) -> u64 {
    if item.action == PurgeAction::PurgeDir {
        // The root, plus each leaf when it has been split
        let leaves = if item.fragtree.is_leaf(Frag::ROOT) {
            0
        } else {
            item.fragtree.leaf_count() as u64
        };
        return 1 + leaves;
    }

    let objects = if item.size > 0 {
        striped_object_count(&item.layout, item.size)
    } else {
        1
    };

    // Range purge, plus the backtrace remove or zero
    let mut ops = objects.min(filer_max_purge_ops) + 1;
    if item.action != PurgeAction::TruncateFile {
        ops += item.old_pools.len() as u64;
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::three_leaf_tree;
    use reclaim_common::{FileLayout, FragTree, InodeNo, PoolId, SnapContext};

    fn file(size: u64, old_pools: usize) -> PurgeItem {
        PurgeItem::purge_file(
            InodeNo::new(1),
            size,
            FileLayout::default_for_pool(PoolId::new(2)),
            (0..old_pools).map(|p| PoolId::new(p as i64 + 10)).collect(),
            SnapContext::empty(),
        )
    }

    #[test]
    fn test_dir_cost() {
        let unsplit = PurgeItem::purge_dir(InodeNo::new(1), FragTree::new());
        assert_eq!(estimate_ops(&unsplit, 10), 1);

        let split = PurgeItem::purge_dir(InodeNo::new(1), three_leaf_tree());
        assert_eq!(estimate_ops(&split, 10), 4);
        assert_eq!(estimate_ops(&split, 10), estimate_ops(&split, 10));
    }

    #[test]
    fn test_file_cost() {
        assert_eq!(estimate_ops(&file(0, 0), 10), 2);
        // 5 objects + backtrace + 2 old pools
        assert_eq!(estimate_ops(&file((16 << 20) + 1, 2), 10), 8);
        // Capped by the per-purge limit
        assert_eq!(estimate_ops(&file(1 << 30, 0), 10), 11);
    }

    #[test]
    fn test_truncate_ignores_old_pools() {
        let mut item = file((16 << 20) + 1, 3);
        item.action = PurgeAction::TruncateFile;
        assert_eq!(estimate_ops(&item, 10), 6);
    }

    #[test]
    fn test_unrecognized_costs_like_file() {
        let mut item = file(4 << 20, 1);
        item.action = PurgeAction::Unrecognized(9);
        assert_eq!(estimate_ops(&item, 10), 3);
    }
}
