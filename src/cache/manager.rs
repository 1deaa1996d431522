//! Cache manager that owns the partitions of one worker version.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::storage::CacheStorage;
use super::traits::{CachedEntry, PartitionKind};
use crate::config::CacheNames;
use crate::http::{Request, Response};
use crate::network::Network;

/// Manages population, lookup and eviction of the current partitions.
pub struct CacheManager<S: CacheStorage> {
  storage: Arc<S>,
  names: CacheNames,
}

impl<S: CacheStorage> CacheManager<S> {
  pub fn new(storage: S, names: CacheNames) -> Self {
    Self {
      storage: Arc::new(storage),
      names,
    }
  }

  fn partition_name(&self, kind: PartitionKind) -> &str {
    match kind {
      PartitionKind::Static => &self.names.static_name,
      PartitionKind::Dynamic => &self.names.dynamic_name,
    }
  }

  /// Fetch every manifest resource and store them in the static partition.
  ///
  /// All-or-nothing: if any resource fails to fetch or answers with a
  /// non-success status, nothing is stored and the partition is not created.
  pub async fn initialize_static_cache<N: Network>(
    &self,
    network: &N,
    manifest: &[Url],
  ) -> Result<usize> {
    let requests: Vec<Request> = manifest.iter().cloned().map(Request::get).collect();

    let responses = try_join_all(requests.iter().map(|request| async move {
      let response = network
        .fetch(request)
        .await
        .map_err(|e| e.wrap_err(format!("Failed to precache {}", request.url)))?;
      if !response.ok() {
        return Err(eyre!(
          "Failed to precache {}: status {}",
          request.url,
          response.status
        ));
      }
      Ok(response)
    }))
    .await?;

    let entries: Vec<(Request, Response)> = requests.into_iter().zip(responses).collect();
    self.storage.put_all(&self.names.static_name, &entries)?;

    info!(
      partition = %self.names.static_name,
      resources = entries.len(),
      "Static cache populated"
    );
    Ok(entries.len())
  }

  /// Delete every partition that does not belong to the current version.
  ///
  /// Returns the names of the deleted partitions.
  pub fn activate_and_evict(&self) -> Result<Vec<String>> {
    let mut evicted = Vec::new();

    for name in self.storage.partitions()? {
      if self.names.is_current(&name) {
        continue;
      }
      if self.storage.delete_partition(&name)? {
        info!(partition = %name, "Deleted stale cache partition");
        evicted.push(name);
      }
    }

    Ok(evicted)
  }

  /// Store a snapshot of `response` for `request`.
  ///
  /// Failures are logged and never reach the caller, whose response is
  /// returned regardless.
  pub fn put(&self, kind: PartitionKind, request: &Request, response: &Response) {
    let partition = self.partition_name(kind);
    match self.storage.put(partition, request, response) {
      Ok(()) => debug!(partition, url = %request.url, "Cached response"),
      Err(e) => warn!(partition, url = %request.url, error = %e, "Failed to cache response"),
    }
  }

  /// Look a request up in one partition.
  pub fn lookup(&self, kind: PartitionKind, request: &Request) -> Option<CachedEntry> {
    let partition = self.partition_name(kind);
    match self.storage.get(partition, request) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(partition, url = %request.url, error = %e, "Cache lookup failed");
        None
      }
    }
  }

  /// Look a request up across the current partitions, static first.
  ///
  /// A miss (or an unreadable store) is `None`, never an error.
  pub fn match_request(&self, request: &Request) -> Option<CachedEntry> {
    self
      .lookup(PartitionKind::Static, request)
      .or_else(|| self.lookup(PartitionKind::Dynamic, request))
  }

  /// Like `match_request`, but the dynamic partition is searched first so a
  /// copy refreshed at runtime wins over the install-time one.
  pub fn match_latest(&self, request: &Request) -> Option<CachedEntry> {
    self
      .lookup(PartitionKind::Dynamic, request)
      .or_else(|| self.lookup(PartitionKind::Static, request))
  }

  /// Names of every partition in the store, current or not.
  pub fn partitions(&self) -> Result<Vec<String>> {
    self.storage.partitions()
  }
}

impl<S: CacheStorage> Clone for CacheManager<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      names: self.names.clone(),
    }
  }
}
