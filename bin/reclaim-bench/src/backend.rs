//! Simulated object store
//!
//! Every call sleeps for a jittered latency and fails with a configurable
//! probability. Counters record what the purge queue asked for and the
//! peak number of concurrent calls.

use async_trait::async_trait;
use rand::Rng;
use reclaim_common::{FileLayout, InodeNo, ObjectLocator, ObjectName, SnapContext};
use reclaim_queue::{ObjectBackend, PurgeError, PurgeResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tracing::trace;

#[derive(Debug, Default)]
pub struct BackendCounters {
    pub purge_ranges: AtomicU64,
    pub objects_purged: AtomicU64,
    pub zeros: AtomicU64,
    pub removes: AtomicU64,
    pub failures: AtomicU64,
    in_flight: AtomicU64,
    pub peak_in_flight: AtomicU64,
}

pub struct SimulatedBackend {
    latency: Duration,
    jitter: Duration,
    failure_rate: f64,
    pub counters: BackendCounters,
}

impl SimulatedBackend {
    pub fn new(latency: Duration, jitter: Duration, failure_rate: f64) -> Self {
        Self {
            latency,
            jitter,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            counters: BackendCounters::default(),
        }
    }

    fn sample(&self) -> (Duration, bool) {
        let mut rng = rand::thread_rng();
        let jitter = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            self.jitter.mul_f64(rng.gen_range(0.0..1.0))
        };
        (self.latency + jitter, rng.gen_bool(self.failure_rate))
    }

    async fn simulate(&self) -> PurgeResult<()> {
        let (delay, fail) = self.sample();
        let now = self.counters.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters.peak_in_flight.fetch_max(now, Ordering::Relaxed);

        tokio::time::sleep(delay).await;
        self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);

        if fail {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            return Err(PurgeError::backend("simulated failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectBackend for SimulatedBackend {
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
        self.counters.purge_ranges.fetch_add(1, Ordering::Relaxed);
        self.counters
            .objects_purged
            .fetch_add(num_objects, Ordering::Relaxed);
        trace!("purge {} {}~{}", ino, first_object, num_objects);
        self.simulate().await
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
        self.counters.zeros.fetch_add(1, Ordering::Relaxed);
        trace!("zero {} {}~{}", ino, offset, length);
        self.simulate().await
    }

    async fn remove(
        &self,
        oid: &ObjectName,
        locator: &ObjectLocator,
        _snapc: &SnapContext,
        _mtime: SystemTime,
        _flags: u32,
    ) -> PurgeResult<()> {
        self.counters.removes.fetch_add(1, Ordering::Relaxed);
        trace!("remove {} in {}", oid, locator);
        self.simulate().await
    }
}
