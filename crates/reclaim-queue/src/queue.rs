//! The purge queue
//!
//! Deletion work is pushed onto a durable journal and executed in the
//! background, bounded by two budgets (items and estimated backend ops).
//! Items may finish in any order; the journal is only trimmed up to the
//! oldest item still executing, so a restart replays at most the work that
//! was in flight.
//!
//! All state transitions happen under one lock. Backend completions,
//! readable notifications and timer ticks are delivered to a finisher task
//! that re-enters the queue through that lock.

use crate::backend::ObjectBackend;
use crate::cluster::ClusterView;
use crate::cost::estimate_ops;
use crate::dispatch::{Gather, plan_ops};
use crate::error::{PurgeError, PurgeResult};
use crate::item::{PurgeAction, PurgeItem};
use crate::journal::{Completion, JournalFormat, PurgeJournal};
use crate::metrics::{PurgeQueueMetrics, PurgeQueueStats};
use crate::throttle::{Throttle, recompute_max_ops};
use parking_lot::Mutex;
use reclaim_common::codec::FEATURES_ALL;
use reclaim_common::config::ConfigKey;
use reclaim_common::{CorruptEntryPolicy, InodeNo, PoolId, PurgeQueueConfig};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, Span, debug, error, info, info_span, trace, warn};

/// Work for the finisher task
#[derive(Debug)]
enum QueueEvent {
    /// The journal became readable, or the wait was abandoned
    Readable(PurgeResult<()>),
    /// Every backend op of the item ending at `position` has finished
    ItemComplete {
        position: u64,
        result: PurgeResult<()>,
    },
    Consume,
    RefreshOpLimit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    ShutDown,
}

/// Why consumption stopped short of the throttle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Halt {
    /// An entry ending at `position` did not decode
    CorruptEntry { position: u64 },
    /// The journal could not read the entry starting at `position`
    ReadError { position: u64 },
}

impl Halt {
    const fn position(self) -> u64 {
        match self {
            Self::CorruptEntry { position } | Self::ReadError { position } => position,
        }
    }
}

/// An entry between admission and completion
#[derive(Debug)]
struct InFlight {
    /// `None` for entries dropped without execution
    ino: Option<InodeNo>,
    ops: u64,
}

#[derive(Debug)]
struct QueueState {
    config: PurgeQueueConfig,
    lifecycle: Lifecycle,
    /// Set once `open` or `create` claims the journal
    opened: bool,
    /// Executing items keyed by the journal position just past their entry
    in_flight: BTreeMap<u64, InFlight>,
    throttle: Throttle,
    halt: Option<Halt>,
    runtime: Option<Handle>,
    events: Option<mpsc::UnboundedSender<QueueEvent>>,
    finisher: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl QueueState {
    fn check_running(&self) -> PurgeResult<()> {
        match self.lifecycle {
            Lifecycle::Created => Err(PurgeError::NotInitialized),
            Lifecycle::Running => Ok(()),
            Lifecycle::ShutDown => Err(PurgeError::ShutDown),
        }
    }

    /// Take the journal for this queue; cleared again if opening fails
    fn claim_open(&mut self) -> PurgeResult<()> {
        self.check_running()?;
        if self.opened {
            return Err(PurgeError::AlreadyOpen);
        }
        self.opened = true;
        Ok(())
    }

    fn send_event(&self, event: QueueEvent) {
        if let Some(events) = &self.events {
            // The finisher is gone only after shutdown
            let _ = events.send(event);
        }
    }

    /// Deliver the outcome of `future` to the finisher as an event
    fn forward<F>(&self, future: F, into_event: impl FnOnce(F::Output) -> QueueEvent + Send + 'static)
    where
        F: Future + Send + 'static,
    {
        let (Some(runtime), Some(events)) = (&self.runtime, &self.events) else {
            return;
        };
        let events = events.clone();
        runtime.spawn(async move {
            let output = future.await;
            let _ = events.send(into_event(output));
        });
    }
}

/// Journaled queue of deletion work for one metadata server rank
pub struct PurgeQueue {
    rank: u32,
    metadata_pool: PoolId,
    features: u64,
    journal: Arc<dyn PurgeJournal>,
    backend: Arc<dyn ObjectBackend>,
    cluster: Arc<dyn ClusterView>,
    metrics: Arc<PurgeQueueMetrics>,
    span: Span,
    state: Mutex<QueueState>,
}

impl PurgeQueue {
    pub fn new(
        rank: u32,
        metadata_pool: PoolId,
        config: PurgeQueueConfig,
        journal: Arc<dyn PurgeJournal>,
        backend: Arc<dyn ObjectBackend>,
        cluster: Arc<dyn ClusterView>,
    ) -> Self {
        Self {
            rank,
            metadata_pool,
            features: FEATURES_ALL,
            journal,
            backend,
            cluster,
            metrics: Arc::new(PurgeQueueMetrics::new()),
            span: info_span!("purge_queue", rank),
            state: Mutex::new(QueueState {
                config,
                lifecycle: Lifecycle::Created,
                opened: false,
                in_flight: BTreeMap::new(),
                throttle: Throttle::default(),
                halt: None,
                runtime: None,
                events: None,
                finisher: None,
                timer: None,
            }),
        }
    }

    /// Encode pushed items for peers with only `features`
    #[must_use]
    pub const fn with_encode_features(mut self, features: u64) -> Self {
        self.features = features;
        self
    }

    /// Start the background tasks and size the op throttle.
    ///
    /// Must be called from within a tokio runtime, before `open`.
    pub fn init(self: &Arc<Self>) -> PurgeResult<()> {
        let _guard = self.span.enter();
        let runtime = Handle::try_current().map_err(|e| {
            reclaim_common::Error::internal(format!("purge queue needs a tokio runtime: {e}"))
        })?;

        let mut state = self.state.lock();
        match state.lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Running => return Err(PurgeError::AlreadyInitialized),
            Lifecycle::ShutDown => return Err(PurgeError::ShutDown),
        }

        let (events, rx) = mpsc::unbounded_channel();
        state.finisher = Some(runtime.spawn(run_finisher(Arc::downgrade(self), rx)));
        state.events = Some(events);
        state.runtime = Some(runtime);
        state.lifecycle = Lifecycle::Running;
        self.restart_timer(&mut state);
        self.update_op_limit_locked(&mut state);

        info!("Initialized in pool {}", self.metadata_pool);
        Ok(())
    }

    /// Recover the journal, creating it if there is none, and start
    /// executing whatever it holds.
    ///
    /// A queue opens its journal once; later calls to `open` or `create`
    /// fail with [`PurgeError::AlreadyOpen`].
    pub async fn open(&self) -> PurgeResult<()> {
        self.open_inner().instrument(self.span.clone()).await
    }

    async fn open_inner(&self) -> PurgeResult<()> {
        info!("Opening");
        self.state.lock().claim_open()?;

        let opened = match self.journal.recover().await {
            Ok(()) => self.finish_open(),
            Err(PurgeError::JournalNotFound) => {
                info!("Purge queue not found, creating it");
                self.create_journal().await
            }
            Err(e) => {
                error!("Error {} loading journal", e);
                Err(e)
            }
        };
        if opened.is_err() {
            self.state.lock().opened = false;
        }
        opened
    }

    fn finish_open(&self) -> PurgeResult<()> {
        let mut state = self.state.lock();
        state.check_running()?;
        self.journal.set_writeable();
        info!(
            "Open complete, read {:#x} write {:#x}",
            self.journal.read_pos(),
            self.journal.write_pos()
        );
        // Work journaled before a restart starts straight away
        self.consume(&mut state);
        Ok(())
    }

    /// Write a new, empty journal in the metadata pool
    pub async fn create(&self) -> PurgeResult<()> {
        self.create_inner().instrument(self.span.clone()).await
    }

    async fn create_inner(&self) -> PurgeResult<()> {
        info!("Creating");
        self.state.lock().claim_open()?;

        let created = self.create_journal().await;
        if created.is_err() {
            self.state.lock().opened = false;
        }
        created
    }

    async fn create_journal(&self) -> PurgeResult<()> {
        self.journal.create(self.metadata_pool, JournalFormat::Resilient);
        if let Err(e) = self.journal.write_head().await {
            error!("Failed to write purge queue header: {}", e);
            return Err(e);
        }
        self.journal.set_writeable();
        info!("Created");
        Ok(())
    }

    /// Journal `item` and return a completion that fires once it is durable.
    ///
    /// Execution starts independently of the completion, as soon as the
    /// throttle admits it.
    pub fn push(&self, item: &PurgeItem) -> PurgeResult<Completion> {
        let _guard = self.span.enter();
        debug!("Pushing {} for inode {}", item.action, item.ino);
        if let Err(e) = item.validate() {
            error!("Refusing push: {}", e);
            return Err(e);
        }

        let mut state = self.state.lock();
        state.check_running()?;
        if self.journal.is_readonly() {
            error!("Push of inode {} before the journal is writeable", item.ino);
            return Err(PurgeError::ReadOnly);
        }

        self.journal.append_entry(item.encode(self.features));
        let flushed = self.journal.flush();

        // Fast path: this item may be admitted right away
        self.consume(&mut state);
        Ok(flushed)
    }

    /// Stop the background tasks and the journal.
    ///
    /// Completions of items still executing are ignored afterwards; their
    /// entries stay in the journal and run again on the next open.
    pub fn shutdown(&self) {
        let _guard = self.span.enter();
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::ShutDown {
            return;
        }
        state.lifecycle = Lifecycle::ShutDown;
        self.journal.shutdown();

        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if let Some(finisher) = state.finisher.take() {
            finisher.abort();
        }
        state.events = None;
        info!("Shut down with {} items executing", state.in_flight.len());
    }

    /// Recompute the op limit from the current cluster view
    pub fn update_op_limit(&self) {
        let _guard = self.span.enter();
        let mut state = self.state.lock();
        self.update_op_limit_locked(&mut state);
    }

    fn update_op_limit_locked(&self, state: &mut QueueState) {
        let max_purge_ops = recompute_max_ops(self.cluster.as_ref(), &state.config);
        if max_purge_ops != state.throttle.max_purge_ops() {
            info!(
                "Op limit {} -> {}",
                state.throttle.max_purge_ops(),
                max_purge_ops
            );
        }
        state.throttle.set_max_purge_ops(max_purge_ops);
        self.metrics.set_max_purge_ops(max_purge_ops);
    }

    /// Apply a new configuration.
    ///
    /// Op limit settings recompute the limit; raising the item limit of an
    /// idle queue restarts consumption.
    pub fn handle_conf_change(&self, config: PurgeQueueConfig) -> PurgeResult<()> {
        let _guard = self.span.enter();
        if let Err(e) = config.validate() {
            warn!("Rejecting purge queue config: {}", e);
            return Err(e.into());
        }

        let mut state = self.state.lock();
        let changed = state.config.diff(&config);
        if changed.is_empty() {
            return Ok(());
        }
        debug!("Config keys changed: {:?}", changed);
        state.config = config;

        if changed.contains(&ConfigKey::MaxPurgeOps)
            || changed.contains(&ConfigKey::MaxPurgeOpsPerPg)
        {
            self.update_op_limit_locked(&mut state);
        } else if changed.contains(&ConfigKey::MaxPurgeFiles) && state.in_flight.is_empty() {
            // Nothing executing means nothing will call consume for us
            info!(
                "Item limit now {}, resuming",
                state.config.max_purge_files
            );
            state.send_event(QueueEvent::Consume);
        }

        if changed.contains(&ConfigKey::OpLimitRefresh) {
            self.restart_timer(&mut state);
        }

        if changed.contains(&ConfigKey::CorruptEntryPolicy)
            && state.config.corrupt_entry_policy == CorruptEntryPolicy::Skip
            && let Some(Halt::CorruptEntry { position }) = state.halt
        {
            warn!("Corrupt entries are now skipped, resuming past {:#x}", position);
            self.skip_halted_entry(&mut state, position);
        }
        Ok(())
    }

    /// Drop the corrupt entry consumption halted on and carry on.
    ///
    /// A no-op when not halted. An entry the journal cannot read at all
    /// cannot be skipped.
    pub fn skip_corrupt_entry(&self) -> PurgeResult<()> {
        let _guard = self.span.enter();
        let mut state = self.state.lock();
        state.check_running()?;

        match state.halt {
            None => Ok(()),
            Some(Halt::ReadError { position }) => Err(PurgeError::journal(format!(
                "entry at {position:#x} is unreadable"
            ))),
            Some(Halt::CorruptEntry { position }) => {
                warn!("Skipping corrupt entry ending at {:#x}", position);
                self.skip_halted_entry(&mut state, position);
                Ok(())
            }
        }
    }

    fn skip_halted_entry(&self, state: &mut QueueState, position: u64) {
        state.halt = None;
        self.drop_entry(state, position);
        self.consume(state);
    }

    /// Nothing executing and nothing left to read
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.halt.is_none()
            && state.in_flight.is_empty()
            && self.journal.read_pos() == self.journal.write_pos()
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.state.lock().halt.is_some()
    }

    /// Journal position consumption stopped at, if halted
    #[must_use]
    pub fn halted_at(&self) -> Option<u64> {
        self.state.lock().halt.map(Halt::position)
    }

    /// Whether the throttle would admit another item now
    #[must_use]
    pub fn can_consume(&self) -> bool {
        let state = self.state.lock();
        state
            .throttle
            .can_consume(state.in_flight.len(), state.config.max_purge_files)
    }

    #[must_use]
    pub fn items_in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    #[must_use]
    pub fn ops_in_flight(&self) -> u64 {
        self.state.lock().throttle.ops_in_flight()
    }

    #[must_use]
    pub fn max_purge_ops(&self) -> u64 {
        self.state.lock().throttle.max_purge_ops()
    }

    #[must_use]
    pub fn config(&self) -> PurgeQueueConfig {
        self.state.lock().config.clone()
    }

    #[must_use]
    pub const fn rank(&self) -> u32 {
        self.rank
    }

    #[must_use]
    pub const fn metrics(&self) -> &Arc<PurgeQueueMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn stats(&self) -> PurgeQueueStats {
        self.metrics.snapshot()
    }

    /// Counters in Prometheus text format
    #[must_use]
    pub fn render_metrics(&self) -> String {
        self.metrics.render_prometheus(self.rank)
    }

    /// Admit entries from the journal until the throttle or the journal
    /// says stop.
    fn consume(&self, state: &mut QueueState) {
        while state.lifecycle == Lifecycle::Running
            && state.halt.is_none()
            && state
                .throttle
                .can_consume(state.in_flight.len(), state.config.max_purge_files)
        {
            if !self.journal.is_readable() {
                debug!("Not readable right now");
                if !self.journal.have_waiter() {
                    match self.journal.wait_for_readable() {
                        Ok(readable) => state.forward(readable, QueueEvent::Readable),
                        Err(e) => warn!("Cannot wait for journal: {}", e),
                    }
                }
                return;
            }

            let start = self.journal.read_pos();
            let mut entry = match self.journal.try_read_entry() {
                Ok(Some(entry)) => entry,
                Ok(None) => return,
                Err(PurgeError::Corrupt { position, source }) => {
                    self.handle_corrupt_entry(state, position, source);
                    continue;
                }
                Err(e) => {
                    error!("Error reading entry at {:#x}, halting: {}", start, e);
                    state.halt = Some(Halt::ReadError { position: start });
                    return;
                }
            };

            let position = self.journal.read_pos();
            match PurgeItem::decode(&mut entry) {
                Ok(item) => self.execute_item(state, item, position),
                Err(source) => self.handle_corrupt_entry(state, position, source),
            }
        }
        debug!("Cannot consume right now");
    }

    fn handle_corrupt_entry(
        &self,
        state: &mut QueueState,
        position: u64,
        source: reclaim_common::Error,
    ) {
        let err = PurgeError::Corrupt { position, source };
        match state.config.corrupt_entry_policy {
            CorruptEntryPolicy::Skip => {
                error!("Dropping entry: {}", err);
                self.drop_entry(state, position);
            }
            CorruptEntryPolicy::Halt => {
                error!("Halting on entry: {}", err);
                state.halt = Some(Halt::CorruptEntry { position });
            }
        }
    }

    /// Account an entry that will never execute, so the journal trims past it
    fn drop_entry(&self, state: &mut QueueState, position: u64) {
        state
            .in_flight
            .insert(position, InFlight { ino: None, ops: 0 });
        self.finish_entry(state, position);
        self.metrics.inc_item_dropped();
    }

    fn execute_item(&self, state: &mut QueueState, item: PurgeItem, position: u64) {
        let ops = estimate_ops(&item, state.config.filer_max_purge_ops);
        state.in_flight.insert(
            position,
            InFlight {
                ino: Some(item.ino),
                ops,
            },
        );
        state.throttle.charge(ops);
        self.publish_counters(state);

        if let PurgeAction::Unrecognized(code) = item.action {
            error!(
                "Invalid action {} for inode {} at {:#x}, dropping it",
                code, item.ino, position
            );
            self.finish_entry(state, position);
            self.metrics.inc_item_dropped();
            return;
        }

        let plan = plan_ops(&item, self.metadata_pool);
        for op in &plan {
            trace!("  {}", op);
        }
        let gather = Gather::from_ops(plan, &self.backend, SystemTime::now());
        debug!(
            "Executing {} for inode {} ending at {:#x}: {} ops",
            item.action,
            item.ino,
            position,
            gather.num_subs()
        );

        debug_assert!(gather.has_subs(), "{} of inode {} planned no ops", item.action, item.ino);
        if !gather.has_subs() {
            error!(
                "No backend ops for {} of inode {}, dropping it",
                item.action, item.ino
            );
            self.finish_entry(state, position);
            self.metrics.inc_item_dropped();
            return;
        }

        state.forward(gather.activate(), move |result| QueueEvent::ItemComplete {
            position,
            result,
        });
    }

    /// Remove a finished entry, trimming the journal if it was the oldest
    fn finish_entry(&self, state: &mut QueueState, position: u64) -> Option<InFlight> {
        let oldest = state.in_flight.first_key_value().map(|(pos, _)| *pos);
        let entry = state.in_flight.remove(&position)?;
        if oldest == Some(position) {
            debug!("Expiring journal to {:#x}", position);
            self.journal.set_expire_pos(position);
            // Persists in the background; a lost trim only replays executed items
            drop(self.journal.trim());
        }
        state.throttle.refund(entry.ops);
        self.publish_counters(state);
        Some(entry)
    }

    fn execute_item_complete(&self, position: u64, result: PurgeResult<()>) {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Running {
            debug!("Ignoring completion at {:#x} after shutdown", position);
            return;
        }

        debug_assert!(
            state.in_flight.contains_key(&position),
            "completion for unknown position {position:#x}"
        );
        let Some(entry) = self.finish_entry(&mut state, position) else {
            error!("Completion for unknown position {:#x}", position);
            return;
        };

        let ino = entry.ino.map_or_else(String::new, |ino| ino.to_string());
        match result {
            Ok(()) => debug!("Completed inode {} at {:#x}", ino, position),
            // Removing objects that are already gone is not an error to
            // the backend; anything else is left for scrub
            Err(e) => warn!("Backend ops for inode {} failed: {}", ino, e),
        }
        self.metrics.inc_executed();
        self.consume(&mut state);
    }

    fn handle_event(&self, event: QueueEvent) {
        let _guard = self.span.enter();
        match event {
            QueueEvent::Readable(Ok(())) | QueueEvent::Consume => {
                let mut state = self.state.lock();
                self.consume(&mut state);
            }
            QueueEvent::Readable(Err(e)) => debug!("Readable wait ended: {}", e),
            QueueEvent::ItemComplete { position, result } => {
                self.execute_item_complete(position, result);
            }
            QueueEvent::RefreshOpLimit => self.update_op_limit(),
        }
    }

    fn publish_counters(&self, state: &QueueState) {
        self.metrics.set_executing(state.in_flight.len() as u64);
        self.metrics.set_executing_ops(state.throttle.ops_in_flight());
    }

    fn restart_timer(&self, state: &mut QueueState) {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let secs = state.config.op_limit_refresh_secs;
        if secs == 0 {
            return;
        }
        let (Some(runtime), Some(events)) = (&state.runtime, &state.events) else {
            return;
        };
        debug!("Refreshing op limit every {}s", secs);
        state.timer = Some(runtime.spawn(
            run_timer(events.clone(), Duration::from_secs(secs)).instrument(self.span.clone()),
        ));
    }
}

async fn run_finisher(queue: Weak<PurgeQueue>, mut rx: mpsc::UnboundedReceiver<QueueEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(queue) = queue.upgrade() else {
            break;
        };
        queue.handle_event(event);
    }
}

async fn run_timer(events: mpsc::UnboundedSender<QueueEvent>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        if events.send(QueueEvent::RefreshOpLimit).is_err() {
            break;
        }
    }
}
