//! Named cache partitions holding response snapshots.
//!
//! This module provides the cache store used by the worker:
//! - One static partition per worker version, populated all-or-nothing at install
//! - One dynamic partition per worker version, filled lazily from live responses
//! - Eviction of every partition that does not belong to the current version

mod manager;
mod storage;
mod traits;

pub use manager::CacheManager;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::PartitionKind;
