//! Backend object I/O used to execute purge items
//!
//! The client owns retries and timeouts; every call here eventually
//! completes, and re-issuing the same remove or purge is harmless.

use crate::error::PurgeResult;
use async_trait::async_trait;
use reclaim_common::{FileLayout, InodeNo, ObjectLocator, ObjectName, SnapContext};
use std::time::SystemTime;

/// Object store operations the purge queue issues
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Remove `num_objects` striped data objects of `ino`, starting at
    /// object index `first_object`
    #[allow(clippy::too_many_arguments)]
    async fn purge_range(
        &self,
        ino: InodeNo,
        layout: &FileLayout,
        snapc: &SnapContext,
        first_object: u64,
        num_objects: u64,
        mtime: SystemTime,
        flags: u32,
    ) -> PurgeResult<()>;

    /// Zero `length` bytes of file data at `offset`; with `keep_first` the
    /// first object is zeroed in place instead of removed
    #[allow(clippy::too_many_arguments)]
    async fn zero(
        &self,
        ino: InodeNo,
        layout: &FileLayout,
        snapc: &SnapContext,
        offset: u64,
        length: u64,
        mtime: SystemTime,
        flags: u32,
        keep_first: bool,
    ) -> PurgeResult<()>;

    /// Remove one named object
    async fn remove(
        &self,
        oid: &ObjectName,
        locator: &ObjectLocator,
        snapc: &SnapContext,
        mtime: SystemTime,
        flags: u32,
    ) -> PurgeResult<()>;
}
