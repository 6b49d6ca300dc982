//! Shared fixtures for unit tests

use crate::backend::ObjectBackend;
use crate::error::{PurgeError, PurgeResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use reclaim_common::{FileLayout, Frag, FragTree, InodeNo, ObjectLocator, ObjectName, SnapContext};
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// A directory split into three leaves: 0/2, 4/2 and 8/1
pub fn three_leaf_tree() -> FragTree {
    let mut tree = FragTree::new();
    tree.split(Frag::ROOT, 1).unwrap();
    tree.split(Frag::ROOT.make_child(0, 1), 1).unwrap();
    tree
}

/// Poll `cond` until it holds, failing the test after five seconds
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Default)]
struct BackendInner {
    auto_complete: bool,
    issued: Vec<(InodeNo, String)>,
    pending: Vec<(InodeNo, oneshot::Sender<PurgeResult<()>>)>,
}

/// Backend whose operations finish only when the test says so
///
/// In auto mode every operation succeeds at once. Remove operations are
/// attributed to the inode encoded in the object name.
#[derive(Default)]
pub struct ControlledBackend {
    inner: Mutex<BackendInner>,
}

impl ControlledBackend {
    pub fn held() -> Self {
        Self::default()
    }

    pub fn auto() -> Self {
        let backend = Self::default();
        backend.inner.lock().auto_complete = true;
        backend
    }

    /// Complete every pending operation of `ino` with `result`
    fn finish(&self, ino: InodeNo, result: impl Fn() -> PurgeResult<()>) -> usize {
        let mut inner = self.inner.lock();
        let (matched, rest): (Vec<_>, Vec<_>) =
            inner.pending.drain(..).partition(|(op_ino, _)| *op_ino == ino);
        inner.pending = rest;
        let count = matched.len();
        for (_, tx) in matched {
            let _ = tx.send(result());
        }
        count
    }

    /// Let every pending operation of `ino` succeed
    pub fn release(&self, ino: InodeNo) -> usize {
        self.finish(ino, || Ok(()))
    }

    /// Fail every pending operation of `ino`
    pub fn fail(&self, ino: InodeNo) -> usize {
        self.finish(ino, || Err(PurgeError::backend("injected failure")))
    }

    /// Switch to auto mode, releasing everything pending
    pub fn release_all(&self) {
        let mut inner = self.inner.lock();
        inner.auto_complete = true;
        for (_, tx) in inner.pending.drain(..) {
            let _ = tx.send(Ok(()));
        }
    }

    pub fn has_pending(&self, ino: InodeNo) -> bool {
        self.inner.lock().pending.iter().any(|(op_ino, _)| *op_ino == ino)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Every operation issued so far
    pub fn issued(&self) -> Vec<(InodeNo, String)> {
        self.inner.lock().issued.clone()
    }

    /// Inodes with at least one issued operation, in first-issue order
    pub fn issued_inos(&self) -> Vec<InodeNo> {
        let mut inos = Vec::new();
        for (ino, _) in self.inner.lock().issued.iter() {
            if !inos.contains(ino) {
                inos.push(*ino);
            }
        }
        inos
    }

    async fn op(&self, ino: InodeNo, what: String) -> PurgeResult<()> {
        let rx = {
            let mut inner = self.inner.lock();
            inner.issued.push((ino, what));
            if inner.auto_complete {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            inner.pending.push((ino, tx));
            rx
        };
        rx.await.unwrap_or(Err(PurgeError::ShutDown))
    }
}

fn ino_of(oid: &ObjectName) -> InodeNo {
    let hex = oid.as_str().split('.').next().unwrap_or_default();
    InodeNo::new(u64::from_str_radix(hex, 16).unwrap_or(0))
}

#[async_trait]
impl ObjectBackend for ControlledBackend {
    async fn purge_range(
        &self,
        ino: InodeNo,
        _layout: &FileLayout,
        _snapc: &SnapContext,
        first_object: u64,
        num_objects: u64,
        _mtime: SystemTime,
        _flags: u32,
    ) -> PurgeResult<()> {
        self.op(ino, format!("purge {first_object}~{num_objects}"))
            .await
    }

    async fn zero(
        &self,
        ino: InodeNo,
        _layout: &FileLayout,
        _snapc: &SnapContext,
        offset: u64,
        length: u64,
        _mtime: SystemTime,
        _flags: u32,
        _keep_first: bool,
    ) -> PurgeResult<()> {
        self.op(ino, format!("zero {offset}~{length}")).await
    }

    async fn remove(
        &self,
        oid: &ObjectName,
        locator: &ObjectLocator,
        _snapc: &SnapContext,
        _mtime: SystemTime,
        _flags: u32,
    ) -> PurgeResult<()> {
        self.op(ino_of(oid), format!("remove {oid} in {locator}"))
            .await
    }
}
