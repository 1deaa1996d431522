//! Core types for the partitioned cache.

use chrono::{DateTime, Utc};

use crate::http::Response;

/// The two logical partitions a worker version owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
  /// Application shell, populated at install time
  Static,
  /// Runtime responses, populated on successful fetches
  Dynamic,
}

/// A stored response snapshot.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  /// Absolute URL the response was fetched from
  pub url: String,
  pub response: Response,
  /// When the snapshot was stored; informational only, entries never expire
  pub cached_at: DateTime<Utc>,
}
