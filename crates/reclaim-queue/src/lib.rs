//! Reclaim Purge Queue
//!
//! A durable, throttled queue of deletion work for a metadata server.
//! Unlinked files, truncations and removed directories are journaled as
//! purge items and executed in the background against the object store,
//! so clients never wait for data objects to be deleted.
//!
//! # Architecture
//!
//! ```text
//! push ──► PurgeJournal ──► consume ──► Throttle ──► plan_ops ──► Gather
//!             ▲                                                    │
//!             └──────────── trim (oldest finished) ◄── finisher ◄──┘
//! ```
//!
//! - [`journal`]: the append-only log, file-backed or in-memory
//! - [`throttle`]: item and op budgets, sized from the [`cluster`] view
//! - [`dispatch`]: item to backend operation fan-out
//! - [`queue`]: the engine tying them together

pub mod backend;
pub mod cluster;
pub mod cost;
pub mod dispatch;
pub mod error;
pub mod item;
pub mod journal;
pub mod metrics;
pub mod queue;
pub mod striper;
pub mod throttle;

#[cfg(test)]
mod test_support;

pub use backend::ObjectBackend;
pub use cluster::{ClusterView, StaticClusterView};
pub use error::{PurgeError, PurgeResult};
pub use item::{PurgeAction, PurgeItem};
pub use journal::{Completion, FileJournal, JournalFormat, MemJournal, MemJournalStore, PurgeJournal};
pub use metrics::{PurgeQueueMetrics, PurgeQueueStats};
pub use queue::PurgeQueue;
