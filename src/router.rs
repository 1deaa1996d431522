//! Classifies intercepted requests and applies the matching cache policy.

use color_eyre::Result;
use std::sync::Arc;
use tracing::debug;

use crate::cache::{CacheManager, CacheStorage, PartitionKind};
use crate::http::{Destination, Request, Response};
use crate::network::Network;

/// Resource class of a request, checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Non-retrieval methods; never touched by the cache
  Passthrough,
  /// Backend data endpoints
  Api,
  /// Scripts, stylesheets and images
  Asset,
  /// Page navigations
  Document,
  Other,
}

/// How a request class is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
  /// Straight to the network with no cache involvement
  Network,
  /// Network, falling back to the cache when unreachable; `store` refreshes
  /// the dynamic partition with successful responses
  NetworkFirst { store: bool },
  /// Cache, falling back to the network without storing
  CacheFirst,
}

impl RequestClass {
  pub fn classify(request: &Request, api_prefix: &str) -> Self {
    if !request.method.is_cacheable() {
      return Self::Passthrough;
    }
    if request.url.path().starts_with(api_prefix) {
      return Self::Api;
    }
    match request.destination {
      Destination::Script | Destination::Style | Destination::Image => Self::Asset,
      Destination::Document => Self::Document,
      Destination::Empty => Self::Other,
    }
  }

  pub fn policy(self) -> Policy {
    match self {
      Self::Passthrough => Policy::Network,
      Self::Api | Self::Document => Policy::NetworkFirst { store: true },
      Self::Asset => Policy::CacheFirst,
      Self::Other => Policy::NetworkFirst { store: false },
    }
  }
}

/// Serves requests from the cache, the network, or both.
pub struct Router<N: Network, S: CacheStorage> {
  network: Arc<N>,
  cache: CacheManager<S>,
  api_prefix: String,
}

impl<N: Network, S: CacheStorage> Router<N, S> {
  pub fn new(network: Arc<N>, cache: CacheManager<S>, api_prefix: impl Into<String>) -> Self {
    Self {
      network,
      cache,
      api_prefix: api_prefix.into(),
    }
  }

  pub fn classify(&self, request: &Request) -> RequestClass {
    RequestClass::classify(request, &self.api_prefix)
  }

  /// Answer `request` according to its class.
  ///
  /// Fails only when the network is unreachable and the cache has nothing
  /// for the request.
  pub async fn respond(&self, request: &Request) -> Result<Response> {
    let class = self.classify(request);
    let policy = class.policy();
    debug!(url = %request.url, ?class, ?policy, "Routing request");

    match policy {
      Policy::Network => self.network.fetch(request).await,
      Policy::NetworkFirst { store } => self.network_first(request, store).await,
      Policy::CacheFirst => self.cache_first(request).await,
    }
  }

  async fn network_first(&self, request: &Request, store: bool) -> Result<Response> {
    match self.network.fetch(request).await {
      Ok(response) => {
        if store && response.ok() {
          self.cache.put(PartitionKind::Dynamic, request, &response);
        }
        Ok(response)
      }
      Err(err) => match self.cache.match_latest(request) {
        Some(entry) => {
          debug!(
            url = %entry.url,
            cached_at = %entry.cached_at,
            "Network unavailable, serving cached response"
          );
          Ok(entry.response)
        }
        None => Err(err.wrap_err(format!(
          "Offline and no cached response for {}",
          request.url
        ))),
      },
    }
  }

  async fn cache_first(&self, request: &Request) -> Result<Response> {
    if let Some(entry) = self.cache.match_request(request) {
      debug!(url = %entry.url, "Serving from cache");
      return Ok(entry.response);
    }
    self.network.fetch(request).await
  }
}
