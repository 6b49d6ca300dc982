//! Core type definitions for Reclaim
//!
//! Identifiers, file layouts, snapshot contexts and object naming shared by
//! the purge queue and its collaborators.

use crate::codec::{
    FEATURE_FILE_LAYOUT_V2, decode_versioned, encode_versioned, get_count, get_i32, get_i64,
    get_string, get_u32, get_u64, has_feature, put_count, put_string,
};
use crate::error::{Error, Result};
use crate::frag::Frag;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inode number of a file or directory
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, From, Into)]
pub struct InodeNo(u64);

impl InodeNo {
    #[must_use]
    pub const fn new(ino: u64) -> Self {
        Self(ino)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for InodeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InodeNo({:#x})", self.0)
    }
}

impl fmt::Display for InodeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identifier of a storage pool
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Display,
    From,
    Into,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct PoolId(i64);

impl PoolId {
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

/// Snapshot context an object mutation must respect
///
/// `snaps` is kept in descending order, newest snapshot first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapContext {
    /// Most recent snapshot sequence number
    pub seq: u64,
    /// Existing snapshot ids, newest first
    pub snaps: Vec<u64>,
}

impl SnapContext {
    #[must_use]
    pub const fn new(seq: u64, snaps: Vec<u64>) -> Self {
        Self { seq, snaps }
    }

    /// A context with no snapshots
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            seq: 0,
            snaps: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seq == 0 && self.snaps.is_empty()
    }

    /// A context is valid if its snaps are strictly descending and none is
    /// newer than `seq`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.snaps.first().is_none_or(|&newest| newest <= self.seq)
            && self.snaps.windows(2).all(|w| w[0] > w[1])
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.seq);
        put_count(buf, self.snaps.len());
        for snap in &self.snaps {
            buf.put_u64_le(*snap);
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let seq = get_u64(buf, "snapc.seq")?;
        let count = get_count(buf, 8, "snapc.snaps")?;
        let mut snaps = Vec::with_capacity(count);
        for _ in 0..count {
            snaps.push(get_u64(buf, "snapc.snaps")?);
        }
        Ok(Self { seq, snaps })
    }
}

impl fmt::Display for SnapContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}=[", self.seq)?;
        for (i, snap) in self.snaps.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{snap:#x}")?;
        }
        f.write_str("]")
    }
}

/// Leading byte of a legacy (pre-namespace) layout encoding
const LAYOUT_LEGACY_TAG: u8 = 0;

/// Version of the namespaced layout envelope
const LAYOUT_STRUCT_V: u8 = 2;

/// Default object size and stripe unit: 4 MiB
pub const DEFAULT_OBJECT_SIZE: u32 = 4 * 1024 * 1024;

/// Striping and placement description of a file's data objects
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileLayout {
    /// Bytes written to one object before moving to the next in a stripe
    pub stripe_unit: u32,
    /// Number of objects a stripe spans
    pub stripe_count: u32,
    /// Maximum size of one backing object
    pub object_size: u32,
    /// Pool holding the data objects
    pub pool_id: PoolId,
    /// Namespace within the pool (empty = default namespace)
    pub pool_ns: String,
}

impl Default for FileLayout {
    /// Default layout with no pool assigned
    fn default() -> Self {
        Self::default_for_pool(PoolId::new(-1))
    }
}

impl FileLayout {
    /// Default layout (one 4 MiB object per stripe) in the given pool
    #[must_use]
    pub const fn default_for_pool(pool_id: PoolId) -> Self {
        Self {
            stripe_unit: DEFAULT_OBJECT_SIZE,
            stripe_count: 1,
            object_size: DEFAULT_OBJECT_SIZE,
            pool_id,
            pool_ns: String::new(),
        }
    }

    /// Bytes covered by one full round of stripes across `stripe_count` objects
    #[must_use]
    pub const fn period(&self) -> u64 {
        self.object_size as u64 * self.stripe_count as u64
    }

    /// A layout is valid if every dimension is nonzero and the object size
    /// is a whole multiple of the stripe unit.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.stripe_unit > 0
            && self.stripe_count > 0
            && self.object_size > 0
            && self.object_size % self.stripe_unit == 0
    }

    /// Encode, using the legacy fixed-width form when the peer lacks
    /// [`FEATURE_FILE_LAYOUT_V2`]. The legacy form cannot carry a namespace
    /// or a pool id outside the `i32` range.
    pub fn encode(&self, buf: &mut BytesMut, features: u64) {
        if !has_feature(features, FEATURE_FILE_LAYOUT_V2) {
            buf.put_u8(LAYOUT_LEGACY_TAG);
            buf.put_u32_le(self.stripe_unit);
            buf.put_u32_le(self.stripe_count);
            buf.put_u32_le(self.object_size);
            buf.put_i32_le(i32::try_from(self.pool_id.get()).unwrap_or(-1));
            return;
        }

        encode_versioned(buf, LAYOUT_STRUCT_V, LAYOUT_STRUCT_V, |b| {
            b.put_u32_le(self.stripe_unit);
            b.put_u32_le(self.stripe_count);
            b.put_u32_le(self.object_size);
            b.put_i64_le(self.pool_id.get());
            put_string(b, &self.pool_ns);
        });
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.first() == Some(&LAYOUT_LEGACY_TAG) {
            buf.advance(1);
            return Ok(Self {
                stripe_unit: get_u32(buf, "layout.stripe_unit")?,
                stripe_count: get_u32(buf, "layout.stripe_count")?,
                object_size: get_u32(buf, "layout.object_size")?,
                pool_id: PoolId::new(i64::from(get_i32(buf, "layout.pool_id")?)),
                pool_ns: String::new(),
            });
        }

        decode_versioned(buf, LAYOUT_STRUCT_V, "layout", |_, b| {
            Ok(Self {
                stripe_unit: get_u32(b, "layout.stripe_unit")?,
                stripe_count: get_u32(b, "layout.stripe_count")?,
                object_size: get_u32(b, "layout.object_size")?,
                pool_id: PoolId::new(get_i64(b, "layout.pool_id")?),
                pool_ns: get_string(b, "layout.pool_ns")?,
            })
        })
    }
}

/// Name of a backend object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub struct ObjectName(String);

impl ObjectName {
    /// Name of the object holding fragment `frag` of inode `ino`
    ///
    /// Fragment 0 of a file is its first data object and backtrace holder.
    #[must_use]
    pub fn for_inode(ino: InodeNo, frag: Frag) -> Self {
        Self(format!("{:x}.{:08x}", ino.get(), frag.raw()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Where a backend object lives
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectLocator {
    pub pool: PoolId,
    pub namespace: String,
}

impl ObjectLocator {
    /// Locator in the default namespace of `pool`
    #[must_use]
    pub const fn new(pool: PoolId) -> Self {
        Self {
            pool,
            namespace: String::new(),
        }
    }
}

impl fmt::Display for ObjectLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "pool {}", self.pool)
        } else {
            write!(f, "pool {} ns {}", self.pool, self.namespace)
        }
    }
}

/// Fail with a corruption error unless `cond` holds
pub fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<()> {
    if cond { Ok(()) } else { Err(Error::corrupt(msg())) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FEATURES_ALL;

    fn namespaced_layout() -> FileLayout {
        FileLayout {
            stripe_unit: 1 << 20,
            stripe_count: 4,
            object_size: 4 << 20,
            pool_id: PoolId::new(7),
            pool_ns: "tenant-a".to_string(),
        }
    }

    #[test]
    fn test_layout_v2_keeps_namespace() {
        let layout = namespaced_layout();
        let mut buf = BytesMut::new();
        layout.encode(&mut buf, FEATURES_ALL);
        let decoded = FileLayout::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, layout);
    }

    #[test]
    fn test_layout_legacy_drops_namespace() {
        let layout = namespaced_layout();
        let mut buf = BytesMut::new();
        layout.encode(&mut buf, 0);
        assert_eq!(buf[0], LAYOUT_LEGACY_TAG);

        let decoded = FileLayout::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.pool_id, PoolId::new(7));
        assert_eq!(decoded.stripe_count, 4);
        assert!(decoded.pool_ns.is_empty());
    }

    #[test]
    fn test_layout_validity() {
        assert!(FileLayout::default_for_pool(PoolId::new(1)).is_valid());
        let mut layout = namespaced_layout();
        layout.stripe_unit = 3 << 20;
        assert!(!layout.is_valid());
        assert_eq!(namespaced_layout().period(), 16 << 20);
    }

    #[test]
    fn test_snapc_validity() {
        assert!(SnapContext::empty().is_empty());
        assert!(SnapContext::new(10, vec![10, 4, 2]).is_valid());
        assert!(!SnapContext::new(3, vec![10]).is_valid());
        assert!(!SnapContext::new(10, vec![2, 4]).is_valid());
        assert_eq!(SnapContext::new(16, vec![16, 2]).to_string(), "0x10=[0x10,0x2]");
    }

    #[test]
    fn test_object_name() {
        let oid = ObjectName::for_inode(InodeNo::new(0x1000_0000_0ab), Frag::ROOT);
        assert_eq!(oid.as_str(), "100000000ab.00000000");
    }

    #[test]
    fn test_locator_display() {
        assert_eq!(ObjectLocator::new(PoolId::new(2)).to_string(), "pool 2");
        assert_eq!(
            ObjectLocator {
                pool: PoolId::new(2),
                namespace: "tenant".to_string(),
            }
            .to_string(),
            "pool 2 ns tenant"
        );
    }
}
