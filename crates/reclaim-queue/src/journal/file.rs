//! File-backed journal
//!
//! A single file:
//! ```text
//! +-------------------+---------+---------+-----
//! | Header (64B)      | Frame 0 | Frame 1 | ...
//! +-------------------+---------+---------+-----
//! ```
//! Header fields: magic (8B), version (4B), format (4B), pool id (8B),
//! expire position (8B), base position (8B), CRC32C of the preceding
//! 40 bytes (4B).
//!
//! Positions are logical: the frame at file offset [`HEADER_SIZE`] starts at
//! the base position. Compaction copies the live frames into a fresh file
//! under a new base, so positions handed out earlier stay valid.
//!
//! Recovery loads the frames from the expire position into memory, and
//! flushes add theirs, so reads never touch the file. A frame that fails
//! its checksum but is followed by intact frames is kept and reported as
//! corrupt when read; damaged frames at the end are a torn write and are
//! truncated. Flushes and trims run on the blocking pool. A trim rewrites
//! the header without syncing; losing it only replays executed entries.

use super::{
    Completion, JournalFormat, MAX_ENTRY_SIZE, PurgeJournal, ReadableWaiter, completed,
    encode_frame, frame_len,
};
use crate::error::{PurgeError, PurgeResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use parking_lot::Mutex;
use reclaim_common::PoolId;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Magic number for journal file header
const JOURNAL_MAGIC: u64 = 0x5243_4c4d_5051_4a31; // "RCLMPQJ1"

/// Journal file version
const JOURNAL_VERSION: u32 = 1;

/// Bytes reserved for the header; the first frame starts here
pub const HEADER_SIZE: u64 = 64;

/// Offset of the header checksum (magic + version + format + pool + expire + base)
const HEADER_CHECKSUM_OFFSET: usize = 40;

/// Expired bytes a file may carry before a trim compacts it
pub const DEFAULT_COMPACT_THRESHOLD: u64 = 4 * 1024 * 1024;

#[derive(Clone, Copy, Debug)]
struct JournalHeader {
    format: JournalFormat,
    pool: PoolId,
    expire_pos: u64,
    /// Position of the frame at file offset `HEADER_SIZE`
    base_pos: u64,
}

impl JournalHeader {
    const fn new(pool: PoolId, format: JournalFormat) -> Self {
        Self {
            format,
            pool,
            expire_pos: HEADER_SIZE,
            base_pos: HEADER_SIZE,
        }
    }

    const fn file_offset(self, pos: u64) -> u64 {
        pos - self.base_pos + HEADER_SIZE
    }

    const fn position(self, offset: u64) -> u64 {
        offset - HEADER_SIZE + self.base_pos
    }

    fn to_bytes(self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(&JOURNAL_MAGIC.to_le_bytes());
        buf[8..12].copy_from_slice(&JOURNAL_VERSION.to_le_bytes());
        buf[12..16].copy_from_slice(&(self.format as u32).to_le_bytes());
        buf[16..24].copy_from_slice(&self.pool.get().to_le_bytes());
        buf[24..32].copy_from_slice(&self.expire_pos.to_le_bytes());
        buf[32..40].copy_from_slice(&self.base_pos.to_le_bytes());
        let crc = crc32c::crc32c(&buf[..HEADER_CHECKSUM_OFFSET]);
        buf[40..44].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; HEADER_SIZE as usize]) -> PurgeResult<Self> {
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let u64_at = |at: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(word)
        };

        if u64_at(0) != JOURNAL_MAGIC {
            return Err(PurgeError::journal("invalid journal magic"));
        }
        let version = u32_at(8);
        if version != JOURNAL_VERSION {
            return Err(PurgeError::journal(format!(
                "unsupported journal version: {version}"
            )));
        }
        if u32_at(40) != crc32c::crc32c(&buf[..HEADER_CHECKSUM_OFFSET]) {
            return Err(PurgeError::journal("journal header checksum mismatch"));
        }

        let expire_pos = u64_at(24);
        let base_pos = u64_at(32);
        if base_pos < HEADER_SIZE || expire_pos < base_pos {
            return Err(PurgeError::journal(format!(
                "expire position {expire_pos:#x} before base {base_pos:#x}"
            )));
        }

        Ok(Self {
            format: JournalFormat::from_u32(u32_at(12))?,
            pool: PoolId::new(u64_at(16).cast_signed()),
            expire_pos,
            base_pos,
        })
    }

    fn write_to(self, file: &mut File) -> io::Result<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.to_bytes())
    }
}

/// A durable frame waiting to be read
#[derive(Debug)]
enum LoggedFrame {
    Intact(Bytes),
    /// Failed its checksum during recovery
    Damaged { len: usize },
}

impl LoggedFrame {
    fn size(&self) -> u64 {
        match self {
            Self::Intact(payload) => frame_len(payload.len()),
            Self::Damaged { len } => frame_len(*len),
        }
    }
}

#[derive(Debug)]
struct FileState {
    header: JournalHeader,
    readonly: bool,
    read_pos: u64,
    write_pos: u64,
    flushed_pos: u64,
    /// Payloads appended since the last flush started
    pending: Vec<Bytes>,
    /// Position of the first frame of `pending`
    pending_start: u64,
    /// Durable frames from the read position on
    unread: VecDeque<LoggedFrame>,
    waiter: ReadableWaiter,
    shut_down: bool,
}

impl FileState {
    fn is_readable(&self) -> bool {
        !self.shut_down && !self.unread.is_empty()
    }

    fn reset(&mut self, header: JournalHeader, end: u64, unread: VecDeque<LoggedFrame>) {
        self.header = header;
        self.read_pos = header.expire_pos;
        self.write_pos = end;
        self.flushed_pos = end;
        self.pending.clear();
        self.pending_start = end;
        self.unread = unread;
    }
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    compact_threshold: u64,
    state: Mutex<FileState>,
    /// Lock order: `file` may be taken before `state`, never while holding it
    file: Mutex<Option<File>>,
}

/// Journal stored in a single local file
#[derive(Debug, Clone)]
pub struct FileJournal {
    inner: Arc<Inner>,
}

/// Run blocking file work off the async workers when a runtime is available
fn run_blocking(work: impl FnOnce() -> PurgeResult<()> + Send + 'static) -> Completion {
    match Handle::try_current() {
        Ok(handle) => {
            let task = handle.spawn_blocking(work);
            async move {
                task.await
                    .map_err(|e| PurgeError::journal(format!("journal task failed: {e}")))?
            }
            .boxed()
        }
        Err(_) => completed(work()),
    }
}

impl FileJournal {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_compact_threshold(path, DEFAULT_COMPACT_THRESHOLD)
    }

    /// A journal that compacts once `threshold` expired bytes pile up
    pub fn with_compact_threshold(path: impl AsRef<Path>, threshold: u64) -> Self {
        let header = JournalHeader::new(PoolId::default(), JournalFormat::Resilient);
        Self {
            inner: Arc::new(Inner {
                path: path.as_ref().to_path_buf(),
                compact_threshold: threshold,
                state: Mutex::new(FileState {
                    header,
                    readonly: true,
                    read_pos: HEADER_SIZE,
                    write_pos: HEADER_SIZE,
                    flushed_pos: HEADER_SIZE,
                    pending: Vec::new(),
                    pending_start: HEADER_SIZE,
                    unread: VecDeque::new(),
                    waiter: ReadableWaiter::default(),
                    shut_down: false,
                }),
                file: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl Inner {
    fn recover_sync(&self) -> PurgeResult<()> {
        let mut file = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PurgeError::JournalNotFound);
            }
            Err(e) => return Err(e.into()),
        };

        let mut raw = [0u8; HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut raw)
            .map_err(|e| PurgeError::journal(format!("failed to read header: {e}")))?;
        let header = JournalHeader::from_bytes(&raw)?;

        let file_len = file.metadata()?.len();
        let scan = scan_frames(&mut file, header.file_offset(header.expire_pos), file_len)?;
        if scan.end < file_len {
            warn!(
                "Discarding {} bytes of torn journal tail at {:#x} in {:?}",
                file_len - scan.end,
                header.position(scan.end),
                self.path
            );
            file.set_len(scan.end)?;
            file.sync_all()?;
        }

        let end = header.position(scan.end);
        let damaged = scan
            .frames
            .iter()
            .filter(|frame| matches!(frame, LoggedFrame::Damaged { .. }))
            .count();
        if damaged > 0 {
            error!(
                "Journal {:?} holds {} damaged frames before intact ones",
                self.path, damaged
            );
        }
        info!(
            "Recovered journal {:?}: {} entries, expire {:#x}, write {:#x}",
            self.path,
            scan.frames.len(),
            header.expire_pos,
            end
        );

        {
            let mut state = self.state.lock();
            if state.shut_down {
                return Err(PurgeError::ShutDown);
            }
            state.reset(header, end, scan.frames);
        }
        *self.file.lock() = Some(file);
        Ok(())
    }

    fn write_head_sync(&self) -> PurgeResult<()> {
        let mut file_guard = self.file.lock();
        let header = self.state.lock().header;

        if file_guard.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.path)?;
            *file_guard = Some(file);
            info!("Created journal {:?} in pool {}", self.path, header.pool);
        }

        let file = file_guard
            .as_mut()
            .ok_or_else(|| PurgeError::journal("journal file not open"))?;
        header.write_to(file)?;
        file.sync_all()?;
        Ok(())
    }

    fn flush_sync(&self) -> PurgeResult<()> {
        let mut file_guard = self.file.lock();
        let (offset, entries) = {
            let mut state = self.state.lock();
            let entries = std::mem::take(&mut state.pending);
            let offset = state.header.file_offset(state.pending_start);
            state.pending_start += entries.iter().map(|e| frame_len(e.len())).sum::<u64>();
            (offset, entries)
        };

        if !entries.is_empty() {
            let mut data = BytesMut::new();
            for entry in &entries {
                encode_frame(&mut data, entry);
            }
            let written = file_guard
                .as_mut()
                .ok_or_else(|| PurgeError::journal("journal file not open"))
                .and_then(|file| {
                    file.seek(SeekFrom::Start(offset))?;
                    file.write_all(&data)?;
                    file.sync_data()?;
                    Ok(())
                });
            if let Err(e) = written {
                error!(
                    "Journal flush of {} bytes at offset {:#x} failed, refusing further appends: {}",
                    data.len(),
                    offset,
                    e
                );
                self.state.lock().readonly = true;
                return Err(e);
            }
        }

        let mut state = self.state.lock();
        let flushed: u64 = entries.iter().map(|e| frame_len(e.len())).sum();
        state.flushed_pos += flushed;
        state
            .unread
            .extend(entries.into_iter().map(LoggedFrame::Intact));
        if state.is_readable() {
            state.waiter.wake(Ok(()));
        }
        Ok(())
    }

    /// Persist the expire position, compacting when enough has expired
    fn trim_sync(&self) -> PurgeResult<()> {
        let mut file_guard = self.file.lock();
        let (header, flushed_pos) = {
            let state = self.state.lock();
            if state.shut_down {
                return Ok(());
            }
            (state.header, state.flushed_pos)
        };
        let Some(file) = file_guard.as_mut() else {
            return Ok(());
        };

        let expired = header.expire_pos.saturating_sub(header.base_pos);
        let live = flushed_pos.saturating_sub(header.expire_pos);
        if expired >= self.compact_threshold && expired >= live {
            match self.compact(file, header, live) {
                Ok(compacted) => {
                    *file_guard = Some(compacted);
                    self.state.lock().header.base_pos = header.expire_pos;
                    return Ok(());
                }
                Err(e) => warn!("Journal compaction of {:?} failed: {}", self.path, e),
            }
        }

        match header.write_to(file) {
            Ok(()) => {
                debug!("Journal expire position now {:#x}", header.expire_pos);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Failed to persist expire position {:#x}: {}",
                    header.expire_pos, e
                );
                Err(e.into())
            }
        }
    }

    /// Copy the `live` bytes after the expire position into a new file and
    /// rename it over the journal; returns the new file.
    fn compact(&self, old: &mut File, header: JournalHeader, live: u64) -> PurgeResult<File> {
        let tmp_path = self.path.with_extension("compact");
        let copied = copy_live(old, &tmp_path, header, live);
        let tmp = match copied {
            Ok(tmp) => tmp,
            Err(e) => {
                if let Err(e) = std::fs::remove_file(&tmp_path) {
                    debug!("Failed to remove {:?}: {}", tmp_path, e);
                }
                return Err(e.into());
            }
        };

        std::fs::rename(&tmp_path, &self.path)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty())
            && let Err(e) = File::open(parent).and_then(|dir| dir.sync_all())
        {
            warn!("Failed to sync {:?} after compaction: {}", parent, e);
        }

        info!(
            "Compacted journal {:?}: dropped {} expired bytes, kept {}",
            self.path,
            header.expire_pos - header.base_pos,
            live
        );
        Ok(tmp)
    }
}

fn copy_live(old: &mut File, tmp_path: &Path, header: JournalHeader, live: u64) -> io::Result<File> {
    let mut tmp = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp_path)?;
    JournalHeader {
        base_pos: header.expire_pos,
        ..header
    }
    .write_to(&mut tmp)?;

    old.seek(SeekFrom::Start(header.file_offset(header.expire_pos)))?;
    let copied = io::copy(&mut std::io::Read::by_ref(old).take(live), &mut tmp)?;
    if copied != live {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("copied {copied} of {live} live bytes"),
        ));
    }
    tmp.sync_all()?;
    Ok(tmp)
}

#[derive(Debug)]
struct Scan {
    /// Frames up to and including the last intact one
    frames: VecDeque<LoggedFrame>,
    /// File offset just past the last intact frame
    end: u64,
}

/// Walk frames from file offset `start`
///
/// A frame whose checksum fails is stepped over as long as its length fits
/// the file; whether it was a torn write only shows once the scan finds (or
/// does not find) an intact frame after it.
fn scan_frames(file: &mut File, start: u64, file_len: u64) -> io::Result<Scan> {
    file.seek(SeekFrom::Start(start))?;
    let mut reader = BufReader::new(file);
    let mut frames = VecDeque::new();
    let mut pos = start;
    let mut end = start;

    loop {
        let mut len_buf = [0u8; 4];
        if pos + 4 > file_len || reader.read_exact(&mut len_buf).is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_ENTRY_SIZE || pos + frame_len(len as usize) > file_len {
            break;
        }

        let mut payload = vec![0u8; len as usize];
        let mut crc_buf = [0u8; 4];
        if reader.read_exact(&mut payload).is_err() || reader.read_exact(&mut crc_buf).is_err() {
            break;
        }

        pos += frame_len(len as usize);
        if u32::from_le_bytes(crc_buf) == crc32c::crc32c(&payload) {
            frames.push_back(LoggedFrame::Intact(Bytes::from(payload)));
            end = pos;
        } else {
            warn!("Journal frame ending at offset {:#x} failed checksum", pos);
            frames.push_back(LoggedFrame::Damaged { len: len as usize });
        }
    }

    while matches!(frames.back(), Some(LoggedFrame::Damaged { .. })) {
        frames.pop_back();
    }
    Ok(Scan { frames, end })
}

#[async_trait]
impl PurgeJournal for FileJournal {
    async fn recover(&self) -> PurgeResult<()> {
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.recover_sync()).await
    }

    fn create(&self, pool: PoolId, format: JournalFormat) {
        let header = JournalHeader::new(pool, format);
        self.inner
            .state
            .lock()
            .reset(header, header.expire_pos, VecDeque::new());
    }

    async fn write_head(&self) -> PurgeResult<()> {
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.write_head_sync()).await
    }

    fn is_readonly(&self) -> bool {
        self.inner.state.lock().readonly
    }

    fn set_writeable(&self) {
        self.inner.state.lock().readonly = false;
    }

    fn append_entry(&self, payload: Bytes) -> u64 {
        let mut state = self.inner.state.lock();
        debug_assert!(!state.readonly, "append to a read-only journal");
        state.write_pos += frame_len(payload.len());
        state.pending.push(payload);
        state.write_pos
    }

    fn flush(&self) -> Completion {
        if self.inner.state.lock().shut_down {
            return completed(Err(PurgeError::ShutDown));
        }
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.flush_sync())
    }

    fn is_readable(&self) -> bool {
        self.inner.state.lock().is_readable()
    }

    fn try_read_entry(&self) -> PurgeResult<Option<Bytes>> {
        let mut state = self.inner.state.lock();
        if !state.is_readable() {
            return Ok(None);
        }
        let Some(frame) = state.unread.pop_front() else {
            return Ok(None);
        };

        let start = state.read_pos;
        state.read_pos += frame.size();
        match frame {
            LoggedFrame::Intact(payload) => Ok(Some(payload)),
            LoggedFrame::Damaged { .. } => Err(PurgeError::Corrupt {
                position: state.read_pos,
                source: reclaim_common::Error::corrupt(format!(
                    "journal frame at {start:#x} failed its checksum"
                )),
            }),
        }
    }

    fn wait_for_readable(&self) -> PurgeResult<Completion> {
        let mut state = self.inner.state.lock();
        if state.shut_down {
            return Err(PurgeError::ShutDown);
        }
        let readable = state.is_readable();
        state.waiter.register(readable)
    }

    fn have_waiter(&self) -> bool {
        self.inner.state.lock().waiter.is_registered()
    }

    fn read_pos(&self) -> u64 {
        self.inner.state.lock().read_pos
    }

    fn write_pos(&self) -> u64 {
        self.inner.state.lock().write_pos
    }

    fn expire_pos(&self) -> u64 {
        self.inner.state.lock().header.expire_pos
    }

    fn set_expire_pos(&self, pos: u64) {
        self.inner.state.lock().header.expire_pos = pos;
    }

    fn trim(&self) -> Completion {
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.trim_sync())
    }

    fn shutdown(&self) {
        let mut file_guard = self.inner.file.lock();
        let header = {
            let mut state = self.inner.state.lock();
            state.shut_down = true;
            state.waiter.wake(Err(PurgeError::ShutDown));
            state.header
        };

        // Trims still queued see the shutdown and leave the file alone
        if let Some(file) = file_guard.as_mut()
            && let Err(e) = header.write_to(file).and_then(|()| file.sync_all())
        {
            warn!("Failed to sync journal {:?} on shutdown: {}", self.inner.path, e);
        }
    }
}
