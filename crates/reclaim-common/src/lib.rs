//! Reclaim Common - Shared types and utilities
//!
//! This crate provides the identifiers, file layouts, binary codec helpers,
//! error definitions and configuration used across all Reclaim components.

pub mod codec;
pub mod config;
pub mod error;
pub mod frag;
pub mod types;

pub use config::{ClusterConfig, Config, CorruptEntryPolicy, PurgeQueueConfig};
pub use error::{Error, Result};
pub use frag::{Frag, FragTree};
pub use types::*;
