//! Directory fragments and fragment trees
//!
//! A directory's entries are hashed into a 24-bit space. A [`Frag`] names a
//! contiguous slice of that space by a prefix `value` of `bits` significant
//! bits (top-aligned). A [`FragTree`] records which fragments have been split
//! and by how many bits; its leaves are the fragments that actually exist as
//! objects.

use crate::codec::{get_count, get_i32, get_u32, put_count};
use crate::error::{Error, Result};
use crate::types::ensure;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::fmt;

/// Width of the fragment hash space in bits
pub const FRAG_HASH_BITS: u8 = 24;

const FRAG_VALUE_MASK: u32 = 0x00ff_ffff;

/// A directory fragment: `bits` in the top byte, top-aligned value below it
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Frag(u32);

impl Frag {
    /// The whole hash space
    pub const ROOT: Self = Self(0);

    /// Create a fragment; `value` bits below the prefix are masked off.
    #[must_use]
    pub const fn new(value: u32, bits: u8) -> Self {
        let bits = if bits > FRAG_HASH_BITS { FRAG_HASH_BITS } else { bits };
        let keep = if bits == 0 {
            0
        } else {
            FRAG_VALUE_MASK & !((1u32 << (FRAG_HASH_BITS - bits)) - 1)
        };
        Self(((bits as u32) << FRAG_HASH_BITS) | (value & keep))
    }

    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        (self.0 >> FRAG_HASH_BITS) as u8
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0 & FRAG_VALUE_MASK
    }

    #[must_use]
    pub const fn is_root(self) -> bool {
        self.bits() == 0
    }

    /// Child `i` of this fragment when split by `nb` bits
    #[must_use]
    pub const fn make_child(self, i: u32, nb: u8) -> Self {
        let bits = self.bits() + nb;
        Self::new(self.value() | (i << (FRAG_HASH_BITS - bits)), bits)
    }

    /// All children of this fragment when split by `nb` bits
    pub fn children(self, nb: u8) -> impl Iterator<Item = Self> {
        (0..(1u32 << nb)).map(move |i| self.make_child(i, nb))
    }
}

impl fmt::Display for Frag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str("*");
        }
        write!(f, "{:x}/{}", self.value(), self.bits())
    }
}

/// Split state of a directory's fragments
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FragTree {
    /// Split fragment -> number of bits it was split by
    splits: BTreeMap<Frag, u8>,
}

impl FragTree {
    /// A tree with only the root fragment
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `frag` has not been split
    #[must_use]
    pub fn is_leaf(&self, frag: Frag) -> bool {
        !self.splits.contains_key(&frag)
    }

    /// Split the leaf `frag` by `by` bits
    pub fn split(&mut self, frag: Frag, by: u8) -> Result<()> {
        if by == 0 || frag.bits() + by > FRAG_HASH_BITS {
            return Err(Error::internal(format!("cannot split {frag} by {by} bits")));
        }
        if !self.leaves().contains(&frag) {
            return Err(Error::internal(format!("{frag} is not a leaf")));
        }
        self.splits.insert(frag, by);
        Ok(())
    }

    /// All leaf fragments in hash order
    #[must_use]
    pub fn leaves(&self) -> Vec<Frag> {
        let mut leaves = Vec::new();
        let mut stack = vec![Frag::ROOT];
        while let Some(frag) = stack.pop() {
            match self.splits.get(&frag) {
                Some(&by) => {
                    let children: Vec<_> = frag.children(by).collect();
                    stack.extend(children.into_iter().rev());
                }
                None => leaves.push(frag),
            }
        }
        leaves
    }

    /// Number of leaf fragments
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.leaves().len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put_count(buf, self.splits.len());
        for (frag, by) in &self.splits {
            buf.put_u32_le(frag.raw());
            buf.put_i32_le(i32::from(*by));
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let count = get_count(buf, 8, "fragtree")?;
        let mut splits = BTreeMap::new();
        for _ in 0..count {
            let frag = Frag::from_raw(get_u32(buf, "fragtree.frag")?);
            let by = get_i32(buf, "fragtree.bits")?;
            ensure(
                frag.bits() <= FRAG_HASH_BITS
                    && by > 0
                    && i32::from(frag.bits()) + by <= i32::from(FRAG_HASH_BITS),
                || format!("fragtree: invalid split of {frag:?} by {by}"),
            )?;
            splits.insert(frag, u8::try_from(by).unwrap_or(FRAG_HASH_BITS));
        }
        Ok(Self { splits })
    }
}
