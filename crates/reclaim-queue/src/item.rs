//! Purge items: one unit of deferred delete or truncate work
//!
//! Encoding (inside a versioned envelope, see [`reclaim_common::codec`]):
//! ```text
//! +--------+-----+------+--------+-----------+-------+----------+
//! | Action | Ino | Size | Layout | Old pools | Snapc | Fragtree |
//! | 1B     | 8B  | 8B   | var    | var       | var   | var      |
//! +--------+-----+------+--------+-----------+-------+----------+
//! ```
//! The layout is written in its legacy form when the reader may not
//! understand [`FEATURE_FILE_LAYOUT_V2`](reclaim_common::codec::FEATURE_FILE_LAYOUT_V2).

use crate::error::{PurgeError, PurgeResult};
use bytes::{BufMut, Bytes, BytesMut};
use reclaim_common::codec::{
    decode_versioned, encode_versioned, get_count, get_i64, get_u8, get_u64, put_count,
};
use reclaim_common::{FileLayout, FragTree, InodeNo, PoolId, Result, SnapContext};
use std::fmt;

const PURGE_ITEM_STRUCT_V: u8 = 1;
const PURGE_ITEM_COMPAT_V: u8 = 1;

/// What to do with an inode's objects
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PurgeAction {
    /// Delete all data objects and the backtrace
    PurgeFile,
    /// Delete data objects past the first and zero the first
    TruncateFile,
    /// Delete every directory fragment object
    PurgeDir,
    /// A code this build does not know; dropped on execution
    Unrecognized(u8),
}

impl PurgeAction {
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::PurgeFile => 1,
            Self::TruncateFile => 2,
            Self::PurgeDir => 3,
            Self::Unrecognized(code) => code,
        }
    }

    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            1 => Self::PurgeFile,
            2 => Self::TruncateFile,
            3 => Self::PurgeDir,
            other => Self::Unrecognized(other),
        }
    }
}

impl fmt::Display for PurgeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PurgeFile => f.write_str("purge_file"),
            Self::TruncateFile => f.write_str("truncate_file"),
            Self::PurgeDir => f.write_str("purge_dir"),
            Self::Unrecognized(code) => write!(f, "unrecognized({code})"),
        }
    }
}

/// A deferred delete or truncate of one inode's backend objects
///
/// Which fields matter depends on `action`: directories only use `ino` and
/// `fragtree`, truncation ignores `old_pools`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurgeItem {
    pub action: PurgeAction,
    pub ino: InodeNo,
    /// Logical file size in bytes
    pub size: u64,
    pub layout: FileLayout,
    /// Pools that previously held the file's backtrace, oldest first
    pub old_pools: Vec<PoolId>,
    pub snapc: SnapContext,
    pub fragtree: FragTree,
}

impl PurgeItem {
    /// Delete a file's data objects and backtraces
    #[must_use]
    pub fn purge_file(
        ino: InodeNo,
        size: u64,
        layout: FileLayout,
        old_pools: Vec<PoolId>,
        snapc: SnapContext,
    ) -> Self {
        Self {
            action: PurgeAction::PurgeFile,
            ino,
            size,
            layout,
            old_pools,
            snapc,
            fragtree: FragTree::new(),
        }
    }

    /// Drop a file's data while keeping its first object
    #[must_use]
    pub fn truncate_file(ino: InodeNo, size: u64, layout: FileLayout, snapc: SnapContext) -> Self {
        Self {
            action: PurgeAction::TruncateFile,
            ino,
            size,
            layout,
            old_pools: Vec::new(),
            snapc,
            fragtree: FragTree::new(),
        }
    }

    /// Delete all fragments of a directory
    #[must_use]
    pub fn purge_dir(ino: InodeNo, fragtree: FragTree) -> Self {
        Self {
            action: PurgeAction::PurgeDir,
            ino,
            size: 0,
            layout: FileLayout::default(),
            old_pools: Vec::new(),
            snapc: SnapContext::empty(),
            fragtree,
        }
    }

    /// Encode for the queue log
    #[must_use]
    pub fn encode(&self, features: u64) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf, features);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut, features: u64) {
        encode_versioned(buf, PURGE_ITEM_STRUCT_V, PURGE_ITEM_COMPAT_V, |b| {
            b.put_u8(self.action.code());
            b.put_u64_le(self.ino.get());
            b.put_u64_le(self.size);
            self.layout.encode(b, features);
            put_count(b, self.old_pools.len());
            for pool in &self.old_pools {
                b.put_i64_le(pool.get());
            }
            self.snapc.encode(b);
            self.fragtree.encode(b);
        });
    }

    /// Reject file items whose layout or snap context no backend op could
    /// be computed from
    pub fn validate(&self) -> PurgeResult<()> {
        if !matches!(self.action, PurgeAction::PurgeFile | PurgeAction::TruncateFile) {
            return Ok(());
        }
        if !self.layout.is_valid() {
            return Err(PurgeError::InvalidItem(format!(
                "{} of inode {} has layout {:?}",
                self.action, self.ino, self.layout
            )));
        }
        if !self.snapc.is_valid() {
            return Err(PurgeError::InvalidItem(format!(
                "{} of inode {} has snap context {}",
                self.action, self.ino, self.snapc
            )));
        }
        Ok(())
    }

    /// Decode one item; truncated or malformed input is a corruption error.
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        decode_versioned(buf, PURGE_ITEM_COMPAT_V, "purge_item", |_, b| {
            let action = PurgeAction::from_code(get_u8(b, "purge_item.action")?);
            let ino = InodeNo::new(get_u64(b, "purge_item.ino")?);
            let size = get_u64(b, "purge_item.size")?;
            let layout = FileLayout::decode(b)?;

            let count = get_count(b, 8, "purge_item.old_pools")?;
            let mut old_pools = Vec::with_capacity(count);
            for _ in 0..count {
                old_pools.push(PoolId::new(get_i64(b, "purge_item.old_pools")?));
            }

            Ok(Self {
                action,
                ino,
                size,
                layout,
                old_pools,
                snapc: SnapContext::decode(b)?,
                fragtree: FragTree::decode(b)?,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::three_leaf_tree;
    use reclaim_common::codec::FEATURES_ALL;

    fn layout() -> FileLayout {
        FileLayout {
            pool_ns: "scratch".to_string(),
            ..FileLayout::default_for_pool(PoolId::new(3))
        }
    }

    fn roundtrip(item: &PurgeItem) -> PurgeItem {
        let mut bytes = item.encode(FEATURES_ALL);
        let decoded = PurgeItem::decode(&mut bytes).unwrap();
        assert!(bytes.is_empty());
        decoded
    }

    #[test]
    fn test_purge_file_roundtrip() {
        let item = PurgeItem::purge_file(
            InodeNo::new(0x1000_0000_001),
            10 << 20,
            layout(),
            vec![PoolId::new(1), PoolId::new(2)],
            SnapContext::new(5, vec![5, 3]),
        );
        assert_eq!(roundtrip(&item), item);
    }

    #[test]
    fn test_purge_dir_roundtrip() {
        let item = PurgeItem::purge_dir(InodeNo::new(0x1000_0000_002), three_leaf_tree());
        let decoded = roundtrip(&item);
        assert_eq!(decoded, item);
        assert_eq!(decoded.fragtree.leaf_count(), 3);
    }

    #[test]
    fn test_truncate_roundtrip() {
        // Five 4 MiB objects
        let item = PurgeItem::truncate_file(
            InodeNo::new(0x1000_0000_003),
            (4 << 22) + 1,
            FileLayout::default_for_pool(PoolId::new(3)),
            SnapContext::empty(),
        );
        assert_eq!(roundtrip(&item), item);
    }

    #[test]
    fn test_legacy_layout_loses_namespace() {
        let item = PurgeItem::purge_file(
            InodeNo::new(7),
            1,
            layout(),
            Vec::new(),
            SnapContext::empty(),
        );
        let decoded = PurgeItem::decode(&mut item.encode(0)).unwrap();
        assert_eq!(decoded.layout.pool_id, PoolId::new(3));
        assert!(decoded.layout.pool_ns.is_empty());
        assert_eq!(decoded.ino, item.ino);
    }

    #[test]
    fn test_unrecognized_action_survives_decode() {
        let mut item = PurgeItem::purge_dir(InodeNo::new(9), FragTree::new());
        item.action = PurgeAction::Unrecognized(42);
        assert_eq!(roundtrip(&item).action, PurgeAction::Unrecognized(42));
    }

    #[test]
    fn test_truncated_entry_is_corrupt() {
        let item = PurgeItem::purge_dir(InodeNo::new(9), three_leaf_tree());
        let full = item.encode(FEATURES_ALL);
        for cut in [1, 6, 12, full.len() - 1] {
            let mut truncated = full.slice(..cut);
            let err = PurgeItem::decode(&mut truncated).unwrap_err();
            assert!(err.is_corruption(), "cut at {cut}: {err}");
        }
    }

    #[test]
    fn test_validate_file_items() {
        let item = PurgeItem::purge_file(
            InodeNo::new(1),
            10,
            layout(),
            Vec::new(),
            SnapContext::new(4, vec![4, 1]),
        );
        item.validate().unwrap();

        let bad_layout = PurgeItem {
            layout: FileLayout {
                stripe_unit: 0,
                ..layout()
            },
            ..item.clone()
        };
        assert!(matches!(bad_layout.validate(), Err(PurgeError::InvalidItem(_))));

        let bad_snapc = PurgeItem::truncate_file(
            InodeNo::new(1),
            10,
            layout(),
            SnapContext::new(1, vec![4]),
        );
        assert!(matches!(bad_snapc.validate(), Err(PurgeError::InvalidItem(_))));

        // Directories carry no layout
        PurgeItem::purge_dir(InodeNo::new(2), three_leaf_tree())
            .validate()
            .unwrap();
    }
}
