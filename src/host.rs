//! Platform side of the worker: delivers events, awaits the intents they
//! produce and applies the resulting effects.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::SqliteStorage;
use crate::config::Config;
use crate::db::Database;
use crate::http::{Request, Response};
use crate::network::Network;
use crate::queue::{DeferredQueue, ReplayReport, QUIZ_PROGRESS_TAG};
use crate::signals::{Connectivity, InstallPrompt, Transition};
use crate::worker::{Effect, Intent, Worker, WorkerEvent, WorkerMessage};

const ACTIVE_VERSION: &str = "active_version";
const WAITING_VERSION: &str = "waiting_version";

/// Result of sending a mutation.
#[derive(Debug)]
pub enum Submission {
  /// The server answered; the response is returned whatever its status
  Sent(Response),
  /// The network was unreachable; the mutation waits in the queue
  Deferred { id: String },
}

/// Snapshot of everything the application can observe.
#[derive(Debug, Clone)]
pub struct Status {
  pub online: bool,
  pub version: String,
  pub active_version: Option<String>,
  pub waiting_version: Option<String>,
  pub installable: bool,
  pub partitions: Vec<String>,
  pub pending_actions: usize,
  pub sync_tags: Vec<String>,
}

pub struct Host<N: Network> {
  config: Config,
  network: Arc<N>,
  db: Arc<Database>,
  worker: Worker<N, SqliteStorage>,
  queue: DeferredQueue,
  connectivity: Connectivity,
  install_prompt: InstallPrompt,
}

impl<N: Network> Host<N> {
  pub fn new(config: Config, network: Arc<N>, db: Arc<Database>) -> Result<Self> {
    let worker = Worker::new(
      &config,
      Arc::clone(&network),
      SqliteStorage::new(Arc::clone(&db)),
      DeferredQueue::new(Arc::clone(&db)),
    )?;

    let host = Self {
      config,
      network,
      queue: DeferredQueue::new(Arc::clone(&db)),
      db,
      worker,
      connectivity: Connectivity::new(true),
      install_prompt: InstallPrompt::new(),
    };
    host.refresh_install_prompt()?;
    Ok(host)
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn install_prompt(&self) -> &InstallPrompt {
    &self.install_prompt
  }

  fn state(&self, key: &str) -> Result<Option<String>> {
    self
      .db
      .conn()?
      .query_row(
        "SELECT value FROM worker_state WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read worker state {}: {}", key, e))
  }

  fn set_state(&self, key: &str, value: Option<&str>) -> Result<()> {
    let conn = self.db.conn()?;
    let result = match value {
      Some(value) => conn.execute(
        "INSERT OR REPLACE INTO worker_state (key, value) VALUES (?, ?)",
        params![key, value],
      ),
      None => conn.execute("DELETE FROM worker_state WHERE key = ?", params![key]),
    };
    result.map_err(|e| eyre!("Failed to write worker state {}: {}", key, e))?;
    Ok(())
  }

  pub fn active_version(&self) -> Result<Option<String>> {
    self.state(ACTIVE_VERSION)
  }

  pub fn waiting_version(&self) -> Result<Option<String>> {
    self.state(WAITING_VERSION)
  }

  /// Whether the configured worker version controls requests.
  fn is_controlling(&self) -> Result<bool> {
    Ok(self.active_version()?.as_deref() == Some(self.config.worker.version.as_str()))
  }

  fn refresh_install_prompt(&self) -> Result<()> {
    if self.is_controlling()? {
      self.install_prompt.withdraw();
    } else {
      self.install_prompt.offer();
    }
    Ok(())
  }

  /// Deliver a non-fetch event and wait for its work to finish.
  async fn run(&self, event: WorkerEvent) -> Result<Vec<Effect>> {
    match self.worker.dispatch(event) {
      Intent::WaitUntil(work) => work.await,
      Intent::Ignore => Ok(Vec::new()),
      Intent::RespondWith(_) | Intent::Passthrough(_) => {
        Err(eyre!("Worker answered a lifecycle event with a response"))
      }
    }
  }

  /// Apply lifecycle effects; the user-facing ones are returned to the caller.
  async fn apply(&self, effects: Vec<Effect>) -> Result<Vec<Effect>> {
    let mut visible = Vec::new();
    for effect in effects {
      match effect {
        Effect::SkipWaiting => {
          if self.waiting_version()?.is_some() {
            self.activate().await?;
          } else {
            debug!("No waiting worker to activate");
          }
        }
        Effect::ClaimClients => {
          info!(version = %self.config.worker.version, "Worker controls all clients");
        }
        other => visible.push(other),
      }
    }
    Ok(visible)
  }

  /// Install the configured version. This is the install trigger behind the
  /// install prompt.
  ///
  /// A failed install leaves the previously active version in charge.
  pub async fn install(&self) -> Result<()> {
    let version = self.config.worker.version.clone();
    info!(%version, "Installing worker");

    let effects = self
      .run(WorkerEvent::Install)
      .await
      .map_err(|e| e.wrap_err(format!("Install of worker {} failed", version)))?;

    self.set_state(WAITING_VERSION, Some(&version))?;
    self.apply(effects).await?;
    Ok(())
  }

  /// Activate the waiting version: evict stale partitions, then take control.
  pub async fn activate(&self) -> Result<()> {
    let version = self.config.worker.version.clone();
    if self.waiting_version()?.as_deref() != Some(version.as_str()) {
      if self.is_controlling()? {
        debug!(%version, "Worker already active");
        return Ok(());
      }
      return Err(eyre!("Worker {} is not installed; run install first", version));
    }

    let effects = self.run(WorkerEvent::Activate).await?;
    self.set_state(ACTIVE_VERSION, Some(&version))?;
    self.set_state(WAITING_VERSION, None)?;
    self.refresh_install_prompt()?;
    if effects.contains(&Effect::ClaimClients) {
      info!(%version, "Worker activated and controls all clients");
    } else {
      info!(%version, "Worker activated");
    }
    Ok(())
  }

  /// Make a request the way the application would.
  pub async fn fetch(&self, request: Request) -> Result<Response> {
    if !self.is_controlling()? {
      debug!(url = %request.url, "No active worker, going to the network");
      return self.network.fetch(&request).await;
    }

    match self.worker.dispatch(WorkerEvent::Fetch(request)) {
      Intent::RespondWith(response) => response.await,
      Intent::Passthrough(request) => self.network.fetch(&request).await,
      Intent::WaitUntil(_) | Intent::Ignore => Err(eyre!("Worker did not answer the request")),
    }
  }

  /// Send a mutation, deferring it for background sync when the network is
  /// unreachable.
  pub async fn submit(&self, request: Request) -> Result<Submission> {
    if request.method.is_cacheable() {
      return Err(eyre!(
        "{} {} is not a mutation",
        request.method,
        request.url
      ));
    }

    match self.fetch(request.clone()).await {
      Ok(response) => Ok(Submission::Sent(response)),
      Err(e) => {
        warn!(url = %request.url, error = %e, "Mutation failed, deferring until back online");
        let id = self.queue.enqueue(&request)?;
        self.queue.register_sync(QUIZ_PROGRESS_TAG)?;
        Ok(Submission::Deferred { id })
      }
    }
  }

  /// Fire a sync event for every registered tag.
  ///
  /// A tag stays registered while its replay leaves actions behind.
  pub async fn sync(&self) -> Result<ReplayReport> {
    let mut total = ReplayReport::default();
    if !self.is_controlling()? {
      warn!("No active worker, background sync skipped");
      return Ok(total);
    }

    for tag in self.queue.sync_tags()? {
      let effects = self.run(WorkerEvent::Sync { tag: tag.clone() }).await?;

      let mut retained = 0;
      for effect in effects {
        if let Effect::SyncCompleted { report, .. } = effect {
          total.replayed += report.replayed;
          total.retained += report.retained;
          retained += report.retained;
        }
      }
      if retained == 0 {
        self.queue.clear_sync(&tag)?;
      }
    }

    Ok(total)
  }

  /// Record a platform connectivity event. Coming back online fires the
  /// pending background syncs.
  pub async fn set_online(&self, online: bool) -> Result<Option<Transition>> {
    let transition = self.connectivity.set_online(online);
    if transition == Some(Transition::WentOnline) {
      let report = self.sync().await?;
      debug!(?report, "Sync after reconnect finished");
    }
    Ok(transition)
  }

  pub async fn push(&self, payload: Option<String>) -> Result<Vec<Effect>> {
    let effects = self.run(WorkerEvent::Push { payload }).await?;
    self.apply(effects).await
  }

  pub async fn notification_click(&self, action: Option<String>) -> Result<Vec<Effect>> {
    let effects = self.run(WorkerEvent::NotificationClick { action }).await?;
    self.apply(effects).await
  }

  pub async fn post_message(&self, message: WorkerMessage) -> Result<Vec<Effect>> {
    let effects = self.run(WorkerEvent::Message(message)).await?;
    self.apply(effects).await
  }

  /// Whether the origin answers the connectivity probe.
  pub async fn probe(&self) -> Result<bool> {
    let probe = Request::get(self.config.resolve(&self.config.connectivity.probe_path)?);
    Ok(Connectivity::probe(self.network.as_ref(), &probe).await)
  }

  /// Poll the origin and feed reachability into the connectivity signal
  /// until `shutdown` resolves.
  pub async fn watch(&self, poll: Duration, shutdown: impl Future<Output = ()>) -> Result<()> {
    let mut interval = tokio::time::interval(poll);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    let mut first = true;
    loop {
      tokio::select! {
        _ = &mut shutdown => break,
        _ = interval.tick() => {
          let online = self.probe().await?;
          match self.set_online(online).await {
            Ok(Some(_)) => {}
            // Syncs registered before we started watching
            Ok(None) if first && online => {
              if let Err(e) = self.sync().await {
                warn!(error = %e, "Background sync failed");
              }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Background sync after reconnect failed"),
          }
          first = false;
        }
      }
    }

    Ok(())
  }

  pub fn status(&self) -> Result<Status> {
    Ok(Status {
      online: self.connectivity.is_online(),
      version: self.config.worker.version.clone(),
      active_version: self.active_version()?,
      waiting_version: self.waiting_version()?,
      installable: self.install_prompt.is_installable(),
      partitions: self.worker.cache().partitions()?,
      pending_actions: self.queue.len()?,
      sync_tags: self.queue.sync_tags()?,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::{Destination, Method};
  use crate::network::testing::{url, FakeNetwork, ORIGIN};

  fn config(version: &str) -> Config {
    let mut config = Config::default();
    config.origin = ORIGIN.to_string();
    config.worker.version = version.to_string();
    config.worker.static_prefix = "static".into();
    config.worker.dynamic_prefix = "dynamic".into();
    config.worker.precache = vec!["/".into(), "/index.html".into()];
    config
  }

  fn host_on(db: &Arc<Database>, network: &Arc<FakeNetwork>, version: &str) -> Host<FakeNetwork> {
    Host::new(config(version), Arc::clone(network), Arc::clone(db)).unwrap()
  }

  fn shell(network: &FakeNetwork) {
    network.respond("/", Response::new(200, "<html>root</html>"));
    network.respond("/index.html", Response::new(200, "<html>index</html>"));
  }

  fn progress(n: u32) -> Request {
    Request::new(Method::Post, url(&format!("/api/progress/{}", n))).with_body("{}")
  }

  #[tokio::test]
  async fn test_install_activates_immediately() {
    let db = Arc::new(Database::in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    shell(&network);
    let host = host_on(&db, &network, "v1");
    assert!(host.install_prompt().is_installable());

    host.install().await.unwrap();

    assert_eq!(host.active_version().unwrap().as_deref(), Some("v1"));
    assert_eq!(host.waiting_version().unwrap(), None);
    assert!(!host.install_prompt().is_installable());
    assert_eq!(host.status().unwrap().partitions, vec!["static-v1"]);
  }

  #[tokio::test]
  async fn test_failed_install_keeps_previous_version() {
    let db = Arc::new(Database::in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    shell(&network);
    host_on(&db, &network, "v1").install().await.unwrap();

    network.fail("/index.html");
    let host = host_on(&db, &network, "v2");
    assert!(host.install().await.is_err());

    assert_eq!(host.active_version().unwrap().as_deref(), Some("v1"));
    assert_eq!(host.waiting_version().unwrap(), None);
    assert!(host.install_prompt().is_installable());
    assert_eq!(host.status().unwrap().partitions, vec!["static-v1"]);
    assert!(host.activate().await.is_err());
  }

  #[tokio::test]
  async fn test_upgrade_evicts_previous_partitions() {
    let db = Arc::new(Database::in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    shell(&network);
    network.respond("/api/quizzes", Response::new(200, "[]"));

    let v1 = host_on(&db, &network, "v1");
    v1.install().await.unwrap();
    v1.fetch(Request::get(url("/api/quizzes"))).await.unwrap();
    assert_eq!(v1.status().unwrap().partitions, vec!["static-v1", "dynamic-v1"]);

    let v2 = host_on(&db, &network, "v2");
    v2.install().await.unwrap();

    assert_eq!(v2.status().unwrap().partitions, vec!["static-v2"]);
    assert_eq!(v2.active_version().unwrap().as_deref(), Some("v2"));
  }

  #[tokio::test]
  async fn test_uncontrolled_fetch_bypasses_cache() {
    let db = Arc::new(Database::in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    network.respond("/api/quizzes", Response::new(200, "[]"));
    let host = host_on(&db, &network, "v1");

    host.fetch(Request::get(url("/api/quizzes"))).await.unwrap();

    assert!(host.status().unwrap().partitions.is_empty());
  }

  #[tokio::test]
  async fn test_controlled_fetch_serves_shell_offline() {
    let db = Arc::new(Database::in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    shell(&network);
    let host = host_on(&db, &network, "v1");
    host.install().await.unwrap();

    network.set_offline(true);
    let response = host
      .fetch(Request::navigate(url("/index.html")))
      .await
      .unwrap();
    assert_eq!(response.body, b"<html>index</html>");

    let missing = host
      .fetch(Request::get(url("/img/owl.png")).with_destination(Destination::Image))
      .await;
    assert!(missing.is_err());
  }

  #[tokio::test]
  async fn test_offline_navigation_serves_refreshed_shell() {
    let db = Arc::new(Database::in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    network.respond("/", Response::new(200, "<html>install-time</html>"));
    network.respond("/index.html", Response::new(200, "<html>index</html>"));
    let host = host_on(&db, &network, "v1");
    host.install().await.unwrap();

    network.respond("/", Response::new(200, "<html>refreshed</html>"));
    let online = host.fetch(Request::navigate(url("/"))).await.unwrap();
    assert_eq!(online.body, b"<html>refreshed</html>");

    network.set_offline(true);
    let offline = host.fetch(Request::navigate(url("/"))).await.unwrap();
    assert_eq!(offline.body, b"<html>refreshed</html>");
  }

  #[tokio::test]
  async fn test_offline_submission_is_replayed_on_reconnect() {
    let db = Arc::new(Database::in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    shell(&network);
    network.respond("/api/progress/1", Response::new(200, "saved"));
    let host = host_on(&db, &network, "v1");
    host.install().await.unwrap();

    network.set_offline(true);
    host.set_online(false).await.unwrap();
    let Submission::Deferred { .. } = host.submit(progress(1)).await.unwrap() else {
      panic!("submission should be deferred while offline");
    };
    assert_eq!(host.status().unwrap().pending_actions, 1);
    assert_eq!(host.status().unwrap().sync_tags, vec![QUIZ_PROGRESS_TAG]);

    network.set_offline(false);
    assert_eq!(
      host.set_online(true).await.unwrap(),
      Some(Transition::WentOnline)
    );

    let status = host.status().unwrap();
    assert_eq!(status.pending_actions, 0);
    assert!(status.sync_tags.is_empty());
  }

  #[tokio::test]
  async fn test_partial_replay_keeps_sync_registered() {
    let db = Arc::new(Database::in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    shell(&network);
    let host = host_on(&db, &network, "v1");
    host.install().await.unwrap();

    network.set_offline(true);
    for n in 1..=3 {
      host.submit(progress(n)).await.unwrap();
    }
    network.set_offline(false);
    network.respond("/api/progress/1", Response::new(200, "saved"));
    network.fail("/api/progress/2");
    network.respond("/api/progress/3", Response::new(200, "saved"));

    let report = host.sync().await.unwrap();

    assert_eq!(report, ReplayReport { replayed: 2, retained: 1 });
    let status = host.status().unwrap();
    assert_eq!(status.pending_actions, 1);
    assert_eq!(status.sync_tags, vec![QUIZ_PROGRESS_TAG]);
  }

  #[tokio::test]
  async fn test_online_submission_is_sent() {
    let db = Arc::new(Database::in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    network.respond("/api/progress/1", Response::new(201, "created"));
    let host = host_on(&db, &network, "v1");

    let Submission::Sent(response) = host.submit(progress(1)).await.unwrap() else {
      panic!("submission should reach the server");
    };
    assert_eq!(response.status, 201);
    assert_eq!(host.status().unwrap().pending_actions, 0);
    assert!(host.submit(Request::get(url("/api/quizzes"))).await.is_err());
  }

  #[tokio::test]
  async fn test_skip_waiting_message_activates_waiting_version() {
    let db = Arc::new(Database::in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    let host = host_on(&db, &network, "v3");
    host.set_state(WAITING_VERSION, Some("v3")).unwrap();

    let visible = host
      .post_message(WorkerMessage::parse(r#"{"type":"SKIP_WAITING"}"#))
      .await
      .unwrap();

    assert!(visible.is_empty());
    assert_eq!(host.active_version().unwrap().as_deref(), Some("v3"));
  }

  #[tokio::test]
  async fn test_push_and_click_effects_reach_the_caller() {
    let db = Arc::new(Database::in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    let host = host_on(&db, &network, "v1");

    let effects = host.push(Some("New notes shared".into())).await.unwrap();
    assert!(matches!(
      effects.as_slice(),
      [Effect::ShowNotification(n)] if n.body == "New notes shared"
    ));

    let effects = host.notification_click(None).await.unwrap();
    assert_eq!(
      effects,
      vec![Effect::CloseNotification, Effect::OpenWindow(url("/"))]
    );
  }

  #[tokio::test]
  async fn test_watch_replays_once_origin_is_reachable() {
    let db = Arc::new(Database::in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    shell(&network);
    network.respond("/api/health", Response::new(200, "ok"));
    network.respond("/api/progress/1", Response::new(200, "saved"));
    let host = host_on(&db, &network, "v1");
    host.install().await.unwrap();

    network.set_offline(true);
    host.submit(progress(1)).await.unwrap();
    network.set_offline(false);

    host
      .watch(
        Duration::from_millis(10),
        tokio::time::sleep(Duration::from_millis(100)),
      )
      .await
      .unwrap();

    assert_eq!(host.status().unwrap().pending_actions, 0);
    assert!(host.connectivity().is_online());
  }
}
