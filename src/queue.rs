//! Durable queue of mutations attempted while offline, replayed on sync.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use rusqlite::params;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::db::{parse_datetime, Database};
use crate::http::{Method, Request};
use crate::network::Network;

/// Sync tag under which quiz progress submissions are replayed.
pub const QUIZ_PROGRESS_TAG: &str = "quiz-progress";

/// One mutation waiting for connectivity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredAction {
  pub id: String,
  pub url: String,
  pub method: Method,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  pub queued_at: DateTime<Utc>,
}

impl DeferredAction {
  fn to_request(&self) -> Result<Request> {
    let url = Url::parse(&self.url)
      .map_err(|e| eyre!("Deferred action {} has invalid URL {}: {}", self.id, self.url, e))?;
    Ok(Request {
      method: self.method,
      url,
      destination: Default::default(),
      headers: self.headers.clone(),
      body: self.body.clone(),
    })
  }
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
  /// Actions accepted by the server and removed from the queue
  pub replayed: usize,
  /// Actions left in place for the next sync
  pub retained: usize,
}

/// SQLite-backed deferred mutation queue.
pub struct DeferredQueue {
  db: Arc<Database>,
}

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn generate_id(request: &Request) -> String {
  let mut hasher = Sha256::new();
  hasher.update(request.method.as_str().as_bytes());
  hasher.update(request.url.as_str().as_bytes());
  if let Some(body) = &request.body {
    hasher.update(body);
  }
  hasher.update(std::process::id().to_le_bytes());
  hasher.update(Utc::now().timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
  hasher.update(SEQUENCE.fetch_add(1, Ordering::Relaxed).to_le_bytes());
  hex::encode(&hasher.finalize()[..16])
}

impl DeferredQueue {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Persist a mutation and return its identifier.
  pub fn enqueue(&self, request: &Request) -> Result<String> {
    let id = generate_id(request);
    let headers = serde_json::to_string(&request.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    self
      .db
      .conn()?
      .execute(
        "INSERT INTO deferred_actions (id, url, method, headers, body) VALUES (?, ?, ?, ?, ?)",
        params![
          id,
          request.url.as_str(),
          request.method.as_str(),
          headers,
          request.body
        ],
      )
      .map_err(|e| eyre!("Failed to queue deferred action: {}", e))?;

    info!(%id, method = %request.method, url = %request.url, "Queued deferred action");
    Ok(id)
  }

  /// All queued actions, oldest first.
  pub fn pending(&self) -> Result<Vec<DeferredAction>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, url, method, headers, body, queued_at FROM deferred_actions ORDER BY rowid",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, Option<Vec<u8>>>(4)?,
          row.get::<_, String>(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query deferred actions: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read deferred action: {}", e))?;

    rows
      .into_iter()
      .map(|(id, url, method, headers, body, queued_at)| -> Result<DeferredAction> {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", id, e))?;
        Ok(DeferredAction {
          method: method.parse()?,
          queued_at: parse_datetime(&queued_at)?,
          id,
          url,
          headers,
          body,
        })
      })
      .collect()
  }

  pub fn len(&self) -> Result<usize> {
    let count: i64 = self
      .db
      .conn()?
      .query_row("SELECT COUNT(*) FROM deferred_actions", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count deferred actions: {}", e))?;
    Ok(count as usize)
  }

  /// Delete an action. Deleting one that is already gone is not an error.
  pub fn remove(&self, id: &str) -> Result<bool> {
    let removed = self
      .db
      .conn()?
      .execute("DELETE FROM deferred_actions WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete deferred action {}: {}", id, e))?;
    Ok(removed > 0)
  }

  /// Ask for a sync event under `tag` once connectivity returns.
  pub fn register_sync(&self, tag: &str) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO sync_registrations (tag) VALUES (?)",
        params![tag],
      )
      .map_err(|e| eyre!("Failed to register sync {}: {}", tag, e))?;
    debug!(tag, "Registered background sync");
    Ok(())
  }

  pub fn sync_tags(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT tag FROM sync_registrations ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let tags = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list sync registrations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read sync registration: {}", e))?;

    Ok(tags)
  }

  pub fn clear_sync(&self, tag: &str) -> Result<()> {
    self
      .db
      .conn()?
      .execute("DELETE FROM sync_registrations WHERE tag = ?", params![tag])
      .map_err(|e| eyre!("Failed to clear sync {}: {}", tag, e))?;
    Ok(())
  }

  /// Replay every queued action against the network.
  ///
  /// Actions are replayed concurrently and settle independently: a success
  /// status removes the record, anything else leaves it for the next pass.
  /// Individual failures are logged, never returned.
  pub async fn replay<N: Network>(&self, network: &N) -> Result<ReplayReport> {
    let actions = self.pending()?;
    if actions.is_empty() {
      return Ok(ReplayReport::default());
    }

    let outcomes = join_all(
      actions
        .iter()
        .map(|action| self.replay_one(network, action)),
    )
    .await;

    let replayed = outcomes.iter().filter(|done| **done).count();
    let report = ReplayReport {
      replayed,
      retained: outcomes.len() - replayed,
    };
    info!(
      replayed = report.replayed,
      retained = report.retained,
      "Deferred actions replayed"
    );
    Ok(report)
  }

  async fn replay_one<N: Network>(&self, network: &N, action: &DeferredAction) -> bool {
    let request = match action.to_request() {
      Ok(request) => request,
      Err(e) => {
        warn!(id = %action.id, error = %e, "Skipping unreplayable deferred action");
        return false;
      }
    };

    match network.fetch(&request).await {
      Ok(response) if response.ok() => match self.remove(&action.id) {
        Ok(_) => {
          debug!(id = %action.id, url = %action.url, "Deferred action replayed");
          true
        }
        Err(e) => {
          warn!(id = %action.id, error = %e, "Replayed action could not be removed");
          false
        }
      },
      Ok(response) => {
        warn!(
          id = %action.id,
          url = %action.url,
          status = response.status,
          "Deferred action rejected, keeping it for the next sync"
        );
        false
      }
      Err(e) => {
        warn!(
          id = %action.id,
          url = %action.url,
          error = %e,
          "Deferred action replay failed, keeping it for the next sync"
        );
        false
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Response;
  use crate::network::testing::{url, FakeNetwork};

  fn queue() -> DeferredQueue {
    DeferredQueue::new(Arc::new(Database::in_memory().unwrap()))
  }

  fn progress(n: u32) -> Request {
    Request::new(Method::Post, url(&format!("/api/progress/{}", n)))
      .with_header("Content-Type", "application/json")
      .with_body(format!(r#"{{"quiz":{},"score":80}}"#, n))
  }

  #[test]
  fn test_enqueue_persists_request() {
    let queue = queue();
    let id = queue.enqueue(&progress(1)).unwrap();

    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    let action = &pending[0];
    assert_eq!(action.id, id);
    assert_eq!(action.method, Method::Post);
    assert_eq!(action.url, "http://localhost:5000/api/progress/1");
    assert_eq!(
      action.headers,
      vec![("Content-Type".to_string(), "application/json".to_string())]
    );
    assert_eq!(action.body.as_deref(), Some(br#"{"quiz":1,"score":80}"#.as_slice()));
  }

  #[test]
  fn test_identical_requests_get_distinct_ids() {
    let queue = queue();
    let a = queue.enqueue(&progress(1)).unwrap();
    let b = queue.enqueue(&progress(1)).unwrap();
    assert_ne!(a, b);
    assert_eq!(queue.len().unwrap(), 2);
  }

  #[tokio::test]
  async fn test_successful_replay_removes_exactly_once() {
    let queue = queue();
    let network = FakeNetwork::new();
    network.respond("/api/progress/1", Response::new(200, "ok"));
    let id = queue.enqueue(&progress(1)).unwrap();

    let report = queue.replay(&network).await.unwrap();
    assert_eq!(report, ReplayReport { replayed: 1, retained: 0 });
    assert_eq!(queue.len().unwrap(), 0);

    // A second pass and a second delete are both no-ops
    let report = queue.replay(&network).await.unwrap();
    assert_eq!(report, ReplayReport::default());
    assert!(!queue.remove(&id).unwrap());
    assert_eq!(network.calls_to("/api/progress/1"), 1);
  }

  #[tokio::test]
  async fn test_failed_replay_keeps_only_that_action() {
    let queue = queue();
    let network = FakeNetwork::new();
    network.respond("/api/progress/1", Response::new(200, "ok"));
    network.fail("/api/progress/2");
    network.respond("/api/progress/3", Response::new(200, "ok"));

    queue.enqueue(&progress(1)).unwrap();
    let second = queue.enqueue(&progress(2)).unwrap();
    queue.enqueue(&progress(3)).unwrap();

    let report = queue.replay(&network).await.unwrap();

    assert_eq!(report, ReplayReport { replayed: 2, retained: 1 });
    let remaining: Vec<String> = queue.pending().unwrap().into_iter().map(|a| a.id).collect();
    assert_eq!(remaining, vec![second]);
  }

  #[tokio::test]
  async fn test_rejected_replay_is_retained() {
    let queue = queue();
    let network = FakeNetwork::new();
    network.respond("/api/progress/1", Response::new(503, "busy"));
    queue.enqueue(&progress(1)).unwrap();

    let report = queue.replay(&network).await.unwrap();

    assert_eq!(report, ReplayReport { replayed: 0, retained: 1 });
    assert_eq!(queue.len().unwrap(), 1);
  }

  #[test]
  fn test_sync_registration_lifecycle() {
    let queue = queue();
    queue.register_sync(QUIZ_PROGRESS_TAG).unwrap();
    queue.register_sync(QUIZ_PROGRESS_TAG).unwrap();
    assert_eq!(queue.sync_tags().unwrap(), vec![QUIZ_PROGRESS_TAG]);

    queue.clear_sync(QUIZ_PROGRESS_TAG).unwrap();
    assert!(queue.sync_tags().unwrap().is_empty());
  }
}
