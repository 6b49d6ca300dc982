//! Durable queue log
//!
//! The purge queue writes and reads its entries through [`PurgeJournal`].
//! Positions are byte offsets into the log; an entry's *end* position is the
//! expire boundary the queue trims to once the entry has been executed.
//!
//! Entries are framed on the log as:
//! ```text
//! +--------+---------+--------+
//! | Length | Payload | CRC32C |
//! | 4B     | var     | 4B     |
//! +--------+---------+--------+
//! ```
//!
//! Cursor calls are synchronous and never wait on storage, so the queue can
//! make them while holding its state lock; only recovery and header writes
//! are `async`. Completions are `'static` futures that resolve independently
//! of the caller.

mod file;
mod mem;

pub use file::FileJournal;
pub use mem::{MemJournal, MemJournalStore};

use crate::error::{PurgeError, PurgeResult};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::FutureExt;
use futures::future::BoxFuture;
use reclaim_common::PoolId;
use tokio::sync::oneshot;

/// Framing bytes around each entry payload (length + CRC)
pub const FRAME_OVERHEAD: u64 = 8;

/// Largest payload a frame may carry; anything longer is a torn frame
pub const MAX_ENTRY_SIZE: u32 = 16 * 1024 * 1024;

/// Resolves once the operation it was returned for has finished
pub type Completion = BoxFuture<'static, PurgeResult<()>>;

/// A completion that has already finished with `result`
#[must_use]
pub fn completed(result: PurgeResult<()>) -> Completion {
    futures::future::ready(result).boxed()
}

/// A completion fed by a oneshot; a dropped sender means shutdown
#[must_use]
pub fn completion_channel() -> (oneshot::Sender<PurgeResult<()>>, Completion) {
    let (tx, rx) = oneshot::channel();
    let completion = async move { rx.await.unwrap_or(Err(PurgeError::ShutDown)) }.boxed();
    (tx, completion)
}

/// On-log format of a journal
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum JournalFormat {
    /// Entries framed with a length and checksum
    #[default]
    Resilient = 1,
}

impl JournalFormat {
    pub fn from_u32(value: u32) -> PurgeResult<Self> {
        match value {
            1 => Ok(Self::Resilient),
            other => Err(PurgeError::journal(format!("unknown journal format {other}"))),
        }
    }
}

/// Append-only log with one reader cursor and a trimmable tail
///
/// Lifecycle: either `recover` an existing log, or `create` + `write_head` a
/// new one. A journal starts read-only; `set_writeable` enables appends.
#[async_trait]
pub trait PurgeJournal: Send + Sync {
    /// Load the header and find the end of the durable entries.
    ///
    /// Fails with [`PurgeError::JournalNotFound`] if no log exists.
    async fn recover(&self) -> PurgeResult<()>;

    /// Start an empty log in memory; `write_head` makes it durable
    fn create(&self, pool: PoolId, format: JournalFormat);

    /// Persist the header
    async fn write_head(&self) -> PurgeResult<()>;

    fn is_readonly(&self) -> bool;

    fn set_writeable(&self);

    /// Buffer one entry; returns the write position just past it.
    fn append_entry(&self, payload: Bytes) -> u64;

    /// Make every entry appended so far durable and readable.
    ///
    /// The completion fires once the entries are persisted; dropping it
    /// does not cancel the flush.
    fn flush(&self) -> Completion;

    /// Whether a durable entry is waiting at the read position
    fn is_readable(&self) -> bool;

    /// Read the entry at the read position and advance past it.
    ///
    /// Returns `Ok(None)` when nothing is readable. An entry the log holds
    /// but whose bytes are damaged fails with [`PurgeError::Corrupt`] at its
    /// end position; the cursor still moves past it.
    fn try_read_entry(&self) -> PurgeResult<Option<Bytes>>;

    /// Register the single readable waiter.
    ///
    /// Fails with [`PurgeError::WaiterBusy`] if one is already registered.
    /// The completion fails with [`PurgeError::ShutDown`] if the journal
    /// shuts down first.
    fn wait_for_readable(&self) -> PurgeResult<Completion>;

    fn have_waiter(&self) -> bool;

    fn read_pos(&self) -> u64;

    fn write_pos(&self) -> u64;

    fn expire_pos(&self) -> u64;

    /// Mark everything before `pos` as executed
    fn set_expire_pos(&self, pos: u64);

    /// Discard entries before the expire position.
    ///
    /// The completion fires once the discard is persisted; dropping it does
    /// not cancel the trim.
    fn trim(&self) -> Completion;

    /// Stop all activity and fail any waiter
    fn shutdown(&self);
}

/// Frame one payload
pub(crate) fn encode_frame(buf: &mut BytesMut, payload: &[u8]) {
    buf.put_u32_le(u32::try_from(payload.len()).unwrap_or(u32::MAX));
    buf.put_slice(payload);
    buf.put_u32_le(crc32c::crc32c(payload));
}

/// Bytes a frame carrying `len` payload bytes occupies
pub(crate) const fn frame_len(len: usize) -> u64 {
    len as u64 + FRAME_OVERHEAD
}

/// The single readable waiter of a journal
#[derive(Debug, Default)]
pub(crate) struct ReadableWaiter {
    tx: Option<oneshot::Sender<PurgeResult<()>>>,
}

impl ReadableWaiter {
    /// Register, completing at once if the journal is already readable
    pub(crate) fn register(&mut self, readable: bool) -> PurgeResult<Completion> {
        if self.tx.is_some() {
            return Err(PurgeError::WaiterBusy);
        }
        if readable {
            return Ok(completed(Ok(())));
        }
        let (tx, completion) = completion_channel();
        self.tx = Some(tx);
        Ok(completion)
    }

    pub(crate) const fn is_registered(&self) -> bool {
        self.tx.is_some()
    }

    /// Fire the waiter, if any
    pub(crate) fn wake(&mut self, result: PurgeResult<()>) {
        if let Some(tx) = self.tx.take() {
            // The receiver may already be gone after a shutdown
            let _ = tx.send(result);
        }
    }
}
