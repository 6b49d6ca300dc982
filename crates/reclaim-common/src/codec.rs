//! Versioned little-endian binary codec helpers
//!
//! Every structured value is wrapped in an envelope:
//!
//! ```text
//! +-----------+-----------+----------+---------+
//! | struct_v  | compat_v  | Length   | Payload |
//! | 1B        | 1B        | 4B (LE)  | var     |
//! +-----------+-----------+----------+---------+
//! ```
//!
//! A reader accepts any envelope whose `compat_v` it understands and ignores
//! payload bytes past the fields it knows, so newer writers can append fields
//! without breaking older readers.
//!
//! All `get_*` helpers check the remaining length first: `bytes::Buf` panics
//! on underflow, and truncated input must surface as [`Error::Corrupt`].

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the envelope header (struct_v + compat_v + length)
pub const ENVELOPE_HEADER_SIZE: usize = 6;

/// Encode feature: file layouts carry a pool namespace and 64-bit pool id.
pub const FEATURE_FILE_LAYOUT_V2: u64 = 1 << 0;

/// Every encode feature this build understands
pub const FEATURES_ALL: u64 = FEATURE_FILE_LAYOUT_V2;

/// Check whether `features` contains `feature`
#[must_use]
pub const fn has_feature(features: u64, feature: u64) -> bool {
    features & feature == feature
}

/// Write a versioned envelope, filling the payload with `body`
pub fn encode_versioned(
    buf: &mut BytesMut,
    struct_v: u8,
    compat_v: u8,
    body: impl FnOnce(&mut BytesMut),
) {
    buf.put_u8(struct_v);
    buf.put_u8(compat_v);
    let len_at = buf.len();
    buf.put_u32_le(0);
    body(buf);

    let len = u32::try_from(buf.len() - len_at - 4).unwrap_or(u32::MAX);
    buf[len_at..len_at + 4].copy_from_slice(&len.to_le_bytes());
}

/// Read a versioned envelope and decode its payload with `body`
///
/// `body` receives the writer's `struct_v` and a buffer bounded to the
/// payload; anything it leaves unread is skipped.
pub fn decode_versioned<T>(
    buf: &mut Bytes,
    supported: u8,
    what: &'static str,
    body: impl FnOnce(u8, &mut Bytes) -> Result<T>,
) -> Result<T> {
    ensure_remaining(buf, ENVELOPE_HEADER_SIZE, what)?;
    let struct_v = get_u8(buf, what)?;
    let compat_v = get_u8(buf, what)?;
    if compat_v > supported {
        return Err(Error::UnsupportedVersion {
            what,
            compat: compat_v,
            supported,
        });
    }

    let len = get_u32(buf, what)? as usize;
    ensure_remaining(buf, len, what)?;
    let mut payload = buf.split_to(len);
    body(struct_v, &mut payload)
}

fn ensure_remaining(buf: &Bytes, needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::corrupt(format!(
            "{what}: need {needed} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

pub fn get_u8(buf: &mut Bytes, what: &str) -> Result<u8> {
    ensure_remaining(buf, 1, what)?;
    Ok(buf.get_u8())
}

pub fn get_u32(buf: &mut Bytes, what: &str) -> Result<u32> {
    ensure_remaining(buf, 4, what)?;
    Ok(buf.get_u32_le())
}

pub fn get_i32(buf: &mut Bytes, what: &str) -> Result<i32> {
    ensure_remaining(buf, 4, what)?;
    Ok(buf.get_i32_le())
}

pub fn get_u64(buf: &mut Bytes, what: &str) -> Result<u64> {
    ensure_remaining(buf, 8, what)?;
    Ok(buf.get_u64_le())
}

pub fn get_i64(buf: &mut Bytes, what: &str) -> Result<i64> {
    ensure_remaining(buf, 8, what)?;
    Ok(buf.get_i64_le())
}

/// Write a length-prefixed UTF-8 string
pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(u32::try_from(s.len()).unwrap_or(u32::MAX));
    buf.put_slice(s.as_bytes());
}

/// Read a length-prefixed UTF-8 string
pub fn get_string(buf: &mut Bytes, what: &str) -> Result<String> {
    let len = get_u32(buf, what)? as usize;
    ensure_remaining(buf, len, what)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| Error::corrupt(format!("{what}: invalid UTF-8: {e}")))
}

/// Read a sequence count, rejecting counts the remaining input cannot hold
///
/// `min_elem_size` is the smallest encoding of one element; it keeps a
/// corrupt count from triggering a huge allocation.
pub fn get_count(buf: &mut Bytes, min_elem_size: usize, what: &str) -> Result<usize> {
    let count = get_u32(buf, what)? as usize;
    if count.saturating_mul(min_elem_size) > buf.remaining() {
        return Err(Error::corrupt(format!(
            "{what}: count {count} exceeds remaining {} bytes",
            buf.remaining()
        )));
    }
    Ok(count)
}

/// Write a sequence count
pub fn put_count(buf: &mut BytesMut, count: usize) {
    buf.put_u32_le(u32::try_from(count).unwrap_or(u32::MAX));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_skips_unknown_trailing_fields() {
        let mut buf = BytesMut::new();
        encode_versioned(&mut buf, 3, 1, |b| {
            b.put_u64_le(42);
            b.put_u64_le(0xdead_beef); // field added by a newer writer
        });
        buf.put_u8(7); // next value in the stream

        let mut bytes = buf.freeze();
        let value = decode_versioned(&mut bytes, 1, "test", |v, b| {
            assert_eq!(v, 3);
            get_u64(b, "test")
        })
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(get_u8(&mut bytes, "next").unwrap(), 7);
    }

    #[test]
    fn test_envelope_rejects_newer_compat() {
        let mut buf = BytesMut::new();
        encode_versioned(&mut buf, 5, 5, |b| b.put_u8(1));

        let err = decode_versioned(&mut buf.freeze(), 1, "test", |_, b| get_u8(b, "x"))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion { compat: 5, .. }));
    }

    #[test]
    fn test_truncated_input_is_corrupt() {
        let mut buf = BytesMut::new();
        encode_versioned(&mut buf, 1, 1, |b| b.put_u64_le(9));
        let full = buf.freeze();
        let mut truncated = full.slice(..full.len() - 3);

        let err = decode_versioned(&mut truncated, 1, "test", |_, b| get_u64(b, "x"))
            .unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_get_count_bounds_allocation() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1_000_000);
        buf.put_u64_le(1);
        let err = get_count(&mut buf.freeze(), 8, "pools").unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_string_roundtrip() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "fsdata_ns");
        let mut bytes = buf.freeze();
        assert_eq!(get_string(&mut bytes, "ns").unwrap(), "fsdata_ns");
        assert!(bytes.is_empty());
    }
}
