//! In-memory journal
//!
//! The durable part of the log lives in a [`MemJournalStore`] that can be
//! shared between journals: opening a second [`MemJournal`] on the same store
//! behaves like a restart, since only flushed entries and the persisted
//! expire position survive.

use super::{
    Completion, JournalFormat, PurgeJournal, ReadableWaiter, completed, completion_channel,
    frame_len,
};
use crate::error::{PurgeError, PurgeResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reclaim_common::PoolId;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Debug)]
struct StoredHeader {
    pool: PoolId,
    format: JournalFormat,
    expire_pos: u64,
}

#[derive(Debug, Default)]
struct StoreInner {
    header: Option<StoredHeader>,
    /// Durable entries by start position
    entries: BTreeMap<u64, Bytes>,
    /// End of the durable entries
    end: u64,
    /// Every expire position persisted by a trim, in order
    trims: Vec<u64>,
}

/// Durable state of an in-memory journal
#[derive(Clone, Debug, Default)]
pub struct MemJournalStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemJournalStore {
    /// A store with no log yet
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding an existing log with the given raw entries
    pub fn with_entries(pool: PoolId, entries: impl IntoIterator<Item = Bytes>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.lock();
            inner.header = Some(StoredHeader {
                pool,
                format: JournalFormat::Resilient,
                expire_pos: 0,
            });
            for entry in entries {
                let start = inner.end;
                inner.end += frame_len(entry.len());
                inner.entries.insert(start, entry);
            }
        }
        store
    }

    /// A journal over this store
    #[must_use]
    pub fn journal(&self) -> MemJournal {
        MemJournal::new(self.clone())
    }

    /// Whether a header has been written
    #[must_use]
    pub fn exists(&self) -> bool {
        self.inner.lock().header.is_some()
    }

    /// Pool recorded in the header
    #[must_use]
    pub fn pool(&self) -> Option<PoolId> {
        self.inner.lock().header.as_ref().map(|h| h.pool)
    }

    /// Persisted expire position
    #[must_use]
    pub fn expire_pos(&self) -> u64 {
        self.inner.lock().header.as_ref().map_or(0, |h| h.expire_pos)
    }

    /// End of the durable entries
    #[must_use]
    pub fn end(&self) -> u64 {
        self.inner.lock().end
    }

    /// Durable entries not yet trimmed
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Expire positions persisted so far, oldest first
    #[must_use]
    pub fn trim_history(&self) -> Vec<u64> {
        self.inner.lock().trims.clone()
    }
}

#[derive(Debug, Default)]
struct MemState {
    pool: PoolId,
    format: JournalFormat,
    readonly: bool,
    read_pos: u64,
    write_pos: u64,
    flushed_pos: u64,
    expire_pos: u64,
    /// Appended but not yet flushed, by start position
    pending: Vec<(u64, Bytes)>,
    /// Flushes parked by `hold_flushes`
    held: Option<Vec<oneshot::Sender<PurgeResult<()>>>>,
    waiter: ReadableWaiter,
    shut_down: bool,
}

impl MemState {
    const fn is_readable(&self) -> bool {
        !self.shut_down && self.read_pos < self.flushed_pos
    }
}

/// Journal whose durable state lives in a [`MemJournalStore`]
#[derive(Debug)]
pub struct MemJournal {
    store: MemJournalStore,
    state: Mutex<MemState>,
}

impl MemJournal {
    #[must_use]
    pub fn new(store: MemJournalStore) -> Self {
        Self {
            store,
            state: Mutex::new(MemState {
                readonly: true,
                ..MemState::default()
            }),
        }
    }

    /// Park flushes until [`release_flushes`](Self::release_flushes)
    pub fn hold_flushes(&self) {
        let mut state = self.state.lock();
        state.held.get_or_insert_with(Vec::new);
    }

    /// Persist everything appended and complete the parked flushes
    pub fn release_flushes(&self) {
        let mut state = self.state.lock();
        let held = state.held.take().unwrap_or_default();
        self.persist(&mut state);
        for tx in held {
            let _ = tx.send(Ok(()));
        }
    }

    fn persist(&self, state: &mut MemState) {
        let mut store = self.store.inner.lock();
        for (start, entry) in state.pending.drain(..) {
            store.entries.insert(start, entry);
        }
        store.end = state.write_pos;
        state.flushed_pos = state.write_pos;

        if state.is_readable() {
            state.waiter.wake(Ok(()));
        }
    }
}

#[async_trait]
impl PurgeJournal for MemJournal {
    async fn recover(&self) -> PurgeResult<()> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(PurgeError::ShutDown);
        }

        let store = self.store.inner.lock();
        let header = store.header.as_ref().ok_or(PurgeError::JournalNotFound)?;
        state.pool = header.pool;
        state.format = header.format;
        state.expire_pos = header.expire_pos;
        state.read_pos = header.expire_pos;
        state.write_pos = store.end;
        state.flushed_pos = store.end;
        Ok(())
    }

    fn create(&self, pool: PoolId, format: JournalFormat) {
        let mut state = self.state.lock();
        state.pool = pool;
        state.format = format;
        state.read_pos = 0;
        state.write_pos = 0;
        state.flushed_pos = 0;
        state.expire_pos = 0;
        state.pending.clear();
    }

    async fn write_head(&self) -> PurgeResult<()> {
        let state = self.state.lock();
        if state.shut_down {
            return Err(PurgeError::ShutDown);
        }

        let mut store = self.store.inner.lock();
        let fresh = store.header.is_none();
        store.header = Some(StoredHeader {
            pool: state.pool,
            format: state.format,
            expire_pos: state.expire_pos,
        });
        if fresh {
            store.entries.clear();
            store.end = state.flushed_pos;
        }
        Ok(())
    }

    fn is_readonly(&self) -> bool {
        self.state.lock().readonly
    }

    fn set_writeable(&self) {
        self.state.lock().readonly = false;
    }

    fn append_entry(&self, payload: Bytes) -> u64 {
        let mut state = self.state.lock();
        debug_assert!(!state.readonly, "append to a read-only journal");
        let start = state.write_pos;
        state.write_pos += frame_len(payload.len());
        state.pending.push((start, payload));
        state.write_pos
    }

    fn flush(&self) -> Completion {
        let mut state = self.state.lock();
        if state.shut_down {
            return completed(Err(PurgeError::ShutDown));
        }
        if let Some(held) = state.held.as_mut() {
            let (tx, completion) = completion_channel();
            held.push(tx);
            return completion;
        }

        self.persist(&mut state);
        completed(Ok(()))
    }

    fn is_readable(&self) -> bool {
        self.state.lock().is_readable()
    }

    fn try_read_entry(&self) -> PurgeResult<Option<Bytes>> {
        let mut state = self.state.lock();
        if !state.is_readable() {
            return Ok(None);
        }

        let entry = self
            .store
            .inner
            .lock()
            .entries
            .get(&state.read_pos)
            .cloned()
            .ok_or_else(|| {
                PurgeError::journal(format!("no entry at position {:#x}", state.read_pos))
            })?;
        state.read_pos += frame_len(entry.len());
        Ok(Some(entry))
    }

    fn wait_for_readable(&self) -> PurgeResult<Completion> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(PurgeError::ShutDown);
        }
        let readable = state.is_readable();
        state.waiter.register(readable)
    }

    fn have_waiter(&self) -> bool {
        self.state.lock().waiter.is_registered()
    }

    fn read_pos(&self) -> u64 {
        self.state.lock().read_pos
    }

    fn write_pos(&self) -> u64 {
        self.state.lock().write_pos
    }

    fn expire_pos(&self) -> u64 {
        self.state.lock().expire_pos
    }

    fn set_expire_pos(&self, pos: u64) {
        self.state.lock().expire_pos = pos;
    }

    fn trim(&self) -> Completion {
        let state = self.state.lock();
        let mut store = self.store.inner.lock();
        let expire_pos = state.expire_pos;
        if let Some(header) = store.header.as_mut() {
            header.expire_pos = expire_pos;
        }
        store.entries = store.entries.split_off(&expire_pos);
        store.trims.push(expire_pos);
        completed(Ok(()))
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shut_down = true;
        state.waiter.wake(Err(PurgeError::ShutDown));
        for tx in state.held.take().unwrap_or_default() {
            let _ = tx.send(Err(PurgeError::ShutDown));
        }
    }
}
