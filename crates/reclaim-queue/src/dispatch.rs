//! Translating purge items into backend operations
//!
//! [`plan_ops`] decides which objects an item touches; a [`Gather`] issues
//! them concurrently and reports once all have finished.

use crate::backend::ObjectBackend;
use crate::error::PurgeResult;
use crate::item::{PurgeAction, PurgeItem};
use crate::striper::striped_object_count;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use reclaim_common::{FileLayout, Frag, InodeNo, ObjectLocator, ObjectName, PoolId, SnapContext};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;

/// One backend call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendOp {
    PurgeRange {
        ino: InodeNo,
        layout: FileLayout,
        snapc: SnapContext,
        first_object: u64,
        num_objects: u64,
    },
    Zero {
        ino: InodeNo,
        layout: FileLayout,
        snapc: SnapContext,
        offset: u64,
        length: u64,
        keep_first: bool,
    },
    Remove {
        oid: ObjectName,
        locator: ObjectLocator,
        snapc: SnapContext,
    },
}

impl BackendOp {
    /// Issue this operation against `backend`
    pub fn issue(
        self,
        backend: Arc<dyn ObjectBackend>,
        mtime: SystemTime,
    ) -> BoxFuture<'static, PurgeResult<()>> {
        async move {
            match self {
                Self::PurgeRange {
                    ino,
                    layout,
                    snapc,
                    first_object,
                    num_objects,
                } => {
                    backend
                        .purge_range(ino, &layout, &snapc, first_object, num_objects, mtime, 0)
                        .await
                }
                Self::Zero {
                    ino,
                    layout,
                    snapc,
                    offset,
                    length,
                    keep_first,
                } => {
                    backend
                        .zero(ino, &layout, &snapc, offset, length, mtime, 0, keep_first)
                        .await
                }
                Self::Remove {
                    oid,
                    locator,
                    snapc,
                } => backend.remove(&oid, &locator, &snapc, mtime, 0).await,
            }
        }
        .boxed()
    }
}

impl fmt::Display for BackendOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PurgeRange {
                ino,
                snapc,
                first_object,
                num_objects,
                ..
            } => write!(
                f,
                "purge {ino} objects {first_object}~{num_objects} snapc {snapc}"
            ),
            Self::Zero {
                ino, offset, length, ..
            } => write!(f, "zero {ino} {offset}~{length}"),
            Self::Remove { oid, locator, .. } => write!(f, "remove {oid} in {locator}"),
        }
    }
}

/// Backend operations that execute `item`
///
/// Unrecognized actions produce no operations.
#[must_use]
pub fn plan_ops(item: &PurgeItem, metadata_pool: PoolId) -> Vec<BackendOp> {
    let mut ops = Vec::new();
    match item.action {
        PurgeAction::PurgeFile => {
            if item.size > 0 {
                ops.push(BackendOp::PurgeRange {
                    ino: item.ino,
                    layout: item.layout.clone(),
                    snapc: item.snapc.clone(),
                    first_object: 0,
                    num_objects: striped_object_count(&item.layout, item.size),
                });
            }

            // Backtraces live in the pool's default namespace, which a range
            // purge in another namespace does not reach
            let oid = ObjectName::for_inode(item.ino, Frag::ROOT);
            if ops.is_empty() || !item.layout.pool_ns.is_empty() {
                ops.push(BackendOp::Remove {
                    oid: oid.clone(),
                    locator: ObjectLocator::new(item.layout.pool_id),
                    snapc: item.snapc.clone(),
                });
            }

            for pool in &item.old_pools {
                ops.push(BackendOp::Remove {
                    oid: oid.clone(),
                    locator: ObjectLocator::new(*pool),
                    snapc: item.snapc.clone(),
                });
            }
        }
        PurgeAction::PurgeDir => {
            let mut frags = if item.fragtree.is_leaf(Frag::ROOT) {
                Vec::new()
            } else {
                item.fragtree.leaves()
            };
            frags.push(Frag::ROOT);

            for frag in frags {
                ops.push(BackendOp::Remove {
                    oid: ObjectName::for_inode(item.ino, frag),
                    locator: ObjectLocator::new(metadata_pool),
                    snapc: SnapContext::empty(),
                });
            }
        }
        PurgeAction::TruncateFile => {
            // Object 0 holds the backtrace and is kept
            let num = striped_object_count(&item.layout, item.size);
            if num > 1 {
                ops.push(BackendOp::PurgeRange {
                    ino: item.ino,
                    layout: item.layout.clone(),
                    snapc: item.snapc.clone(),
                    first_object: 1,
                    num_objects: num - 1,
                });
            }
            ops.push(BackendOp::Zero {
                ino: item.ino,
                layout: item.layout.clone(),
                snapc: item.snapc.clone(),
                offset: 0,
                length: u64::from(item.layout.object_size),
                keep_first: true,
            });
        }
        PurgeAction::Unrecognized(_) => {}
    }
    ops
}

/// Fan-out of independent sub-operations joined into one result
///
/// Resolves once every sub-operation has finished, with the first failure
/// (in submission order) if any failed.
#[derive(Default)]
pub struct Gather {
    subs: Vec<BoxFuture<'static, PurgeResult<()>>>,
}

impl Gather {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gather that issues `ops` against `backend`
    #[must_use]
    pub fn from_ops(ops: Vec<BackendOp>, backend: &Arc<dyn ObjectBackend>, mtime: SystemTime) -> Self {
        let mut gather = Self::new();
        for op in ops {
            gather.new_sub(op.issue(Arc::clone(backend), mtime));
        }
        gather
    }

    pub fn new_sub(&mut self, sub: impl Future<Output = PurgeResult<()>> + Send + 'static) {
        self.subs.push(sub.boxed());
    }

    #[must_use]
    pub fn has_subs(&self) -> bool {
        !self.subs.is_empty()
    }

    #[must_use]
    pub fn num_subs(&self) -> usize {
        self.subs.len()
    }

    /// Run every sub-operation to completion
    pub async fn activate(self) -> PurgeResult<()> {
        join_all(self.subs)
            .await
            .into_iter()
            .find(Result::is_err)
            .unwrap_or(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PurgeError;
    use crate::test_support::three_leaf_tree;
    use reclaim_common::FragTree;
    use tokio::sync::oneshot;

    const DATA_POOL: PoolId = PoolId::new(2);
    const METADATA_POOL: PoolId = PoolId::new(1);

    fn file(size: u64, ns: &str, old_pools: Vec<PoolId>) -> PurgeItem {
        PurgeItem::purge_file(
            InodeNo::new(0x10),
            size,
            FileLayout {
                pool_ns: ns.to_string(),
                ..FileLayout::default_for_pool(DATA_POOL)
            },
            old_pools,
            SnapContext::new(3, vec![3]),
        )
    }

    fn removed_pools(ops: &[BackendOp]) -> Vec<PoolId> {
        ops.iter()
            .filter_map(|op| match op {
                BackendOp::Remove { locator, .. } => Some(locator.pool),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_purge_file_ranges_cover_backtrace() {
        let ops = plan_ops(&file(9 << 20, "", vec![PoolId::new(7)]), METADATA_POOL);
        assert_eq!(ops.len(), 2);
        assert!(matches!(
            ops[0],
            BackendOp::PurgeRange {
                first_object: 0,
                num_objects: 3,
                ..
            }
        ));
        // Only the old pool's backtrace needs an explicit remove
        assert_eq!(removed_pools(&ops), vec![PoolId::new(7)]);
    }

    #[test]
    fn test_empty_file_removes_backtrace() {
        let ops = plan_ops(&file(0, "", Vec::new()), METADATA_POOL);
        assert_eq!(ops.len(), 1);
        let BackendOp::Remove { oid, locator, snapc } = &ops[0] else {
            panic!("expected a remove, got {}", ops[0]);
        };
        assert_eq!(oid.as_str(), "10.00000000");
        assert_eq!(locator, &ObjectLocator::new(DATA_POOL));
        assert_eq!(snapc.seq, 3);
    }

    #[test]
    fn test_namespaced_file_removes_default_namespace_backtrace() {
        let ops = plan_ops(&file(1, "tenant", Vec::new()), METADATA_POOL);
        assert_eq!(ops.len(), 2);
        let BackendOp::Remove { locator, .. } = &ops[1] else {
            panic!("expected a remove, got {}", ops[1]);
        };
        assert!(locator.namespace.is_empty());
    }

    #[test]
    fn test_purge_dir_removes_root_and_leaves() {
        let ops = plan_ops(
            &PurgeItem::purge_dir(InodeNo::new(0x20), three_leaf_tree()),
            METADATA_POOL,
        );
        assert_eq!(ops.len(), 4);
        assert!(removed_pools(&ops).iter().all(|p| *p == METADATA_POOL));
        assert!(ops.iter().all(|op| matches!(
            op,
            BackendOp::Remove { snapc, .. } if snapc.is_empty()
        )));
        let BackendOp::Remove { oid, .. } = &ops[3] else {
            panic!("expected a remove");
        };
        assert_eq!(oid.as_str(), "20.00000000");

        let unsplit = plan_ops(
            &PurgeItem::purge_dir(InodeNo::new(0x20), FragTree::new()),
            METADATA_POOL,
        );
        assert_eq!(unsplit.len(), 1);
    }

    #[test]
    fn test_truncate_keeps_first_object() {
        let item = PurgeItem::truncate_file(
            InodeNo::new(0x30),
            (16 << 20) + 1,
            FileLayout::default_for_pool(DATA_POOL),
            SnapContext::empty(),
        );
        let ops = plan_ops(&item, METADATA_POOL);
        assert_eq!(ops.len(), 2);
        assert!(matches!(
            ops[0],
            BackendOp::PurgeRange {
                first_object: 1,
                num_objects: 4,
                ..
            }
        ));
        assert!(matches!(
            ops[1],
            BackendOp::Zero {
                offset: 0,
                length: 0x40_0000,
                keep_first: true,
                ..
            }
        ));

        // A single object is only zeroed
        let small = PurgeItem::truncate_file(
            InodeNo::new(0x30),
            100,
            FileLayout::default_for_pool(DATA_POOL),
            SnapContext::empty(),
        );
        assert_eq!(plan_ops(&small, METADATA_POOL).len(), 1);
    }

    #[test]
    fn test_unrecognized_plans_nothing() {
        let mut item = file(1, "", Vec::new());
        item.action = PurgeAction::Unrecognized(0);
        assert!(plan_ops(&item, METADATA_POOL).is_empty());
    }

    #[tokio::test]
    async fn test_gather_waits_for_all_and_keeps_first_error() {
        let (slow_tx, slow_rx) = oneshot::channel::<()>();
        let mut gather = Gather::new();
        gather.new_sub(async move {
            let _ = slow_rx.await;
            Err(PurgeError::backend("first"))
        });
        gather.new_sub(async { Err(PurgeError::backend("second")) });
        gather.new_sub(async { Ok(()) });
        assert_eq!(gather.num_subs(), 3);

        let task = tokio::spawn(gather.activate());
        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        slow_tx.send(()).unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, PurgeError::Backend(msg) if msg == "first"));
    }

    #[tokio::test]
    async fn test_empty_gather_succeeds() {
        assert!(!Gather::new().has_subs());
        Gather::new().activate().await.unwrap();
    }
}
