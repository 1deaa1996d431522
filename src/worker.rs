//! The worker: one dispatch function over every event the platform delivers.
//!
//! Handlers never touch the platform. They return an [`Intent`] describing
//! what the host must do, and any asynchronous work comes back as a future
//! the host awaits before the event counts as complete.

use color_eyre::{Report, Result};
use futures::future::{self, BoxFuture, FutureExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::cache::{CacheManager, CacheStorage};
use crate::config::{Config, NotificationConfig};
use crate::http::{Request, Response};
use crate::network::Network;
use crate::queue::{DeferredQueue, ReplayReport, QUIZ_PROGRESS_TAG};
use crate::router::Router;

/// Events the platform delivers to the worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
  Install,
  Activate,
  Fetch(Request),
  Sync { tag: String },
  Push { payload: Option<String> },
  NotificationClick { action: Option<String> },
  Message(WorkerMessage),
}

/// One-way messages from the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
  /// Activate the waiting version now instead of when every tab closes
  SkipWaiting,
  Other(String),
}

impl WorkerMessage {
  /// Accepts `{"type":"SKIP_WAITING"}` or the bare `SKIP_WAITING` string.
  pub fn parse(raw: &str) -> Self {
    let kind = match serde_json::from_str::<serde_json::Value>(raw) {
      Ok(serde_json::Value::Object(map)) => map
        .get("type")
        .and_then(|t| t.as_str())
        .map(String::from),
      Ok(serde_json::Value::String(s)) => Some(s),
      _ => Some(raw.trim().to_string()),
    };

    match kind.as_deref() {
      Some("SKIP_WAITING") => Self::SkipWaiting,
      _ => Self::Other(raw.to_string()),
    }
  }
}

/// Action button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

/// A notification to show to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub actions: Vec<NotificationAction>,
}

const ACTION_EXPLORE: &str = "explore";
const ACTION_CLOSE: &str = "close";

/// Side effects the host applies once an event's work has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
  /// Promote this version without waiting for open clients to go away
  SkipWaiting,
  /// Take control of every open client
  ClaimClients,
  ShowNotification(Notification),
  CloseNotification,
  /// Open, or focus if already open, the given view
  OpenWindow(Url),
  SyncCompleted { tag: String, report: ReplayReport },
}

/// What the worker wants done with an event.
pub enum Intent<'a> {
  /// Answer the intercepted request with this response.
  RespondWith(BoxFuture<'a, Result<Response>>),
  /// Keep the event alive until this work finishes, then apply its effects.
  WaitUntil(BoxFuture<'a, Result<Vec<Effect>>>),
  /// Not intercepted; the request goes to the network as-is.
  Passthrough(Request),
  Ignore,
}

/// Work that has already finished.
fn done<'a>(effects: Vec<Effect>) -> BoxFuture<'a, Result<Vec<Effect>>> {
  future::ready(Ok(effects)).boxed()
}

/// Policy core of the offline layer for one worker version.
pub struct Worker<N: Network, S: CacheStorage> {
  network: Arc<N>,
  cache: CacheManager<S>,
  router: Router<N, S>,
  queue: DeferredQueue,
  manifest: Vec<Url>,
  root: Url,
  notifications: NotificationConfig,
}

impl<N: Network, S: CacheStorage> Worker<N, S> {
  pub fn new(config: &Config, network: Arc<N>, storage: S, queue: DeferredQueue) -> Result<Self> {
    let manifest = config
      .worker
      .precache
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;
    let cache = CacheManager::new(storage, config.worker.cache_names());
    let router = Router::new(
      Arc::clone(&network),
      cache.clone(),
      config.worker.api_prefix.clone(),
    );

    Ok(Self {
      network,
      cache,
      router,
      queue,
      manifest,
      root: config.resolve("/")?,
      notifications: config.notifications.clone(),
    })
  }

  pub fn cache(&self) -> &CacheManager<S> {
    &self.cache
  }

  pub fn dispatch(&self, event: WorkerEvent) -> Intent<'_> {
    match event {
      WorkerEvent::Install => Intent::WaitUntil(
        async move {
          self
            .cache
            .initialize_static_cache(self.network.as_ref(), &self.manifest)
            .await?;
          Ok::<_, Report>(vec![Effect::SkipWaiting])
        }
        .boxed(),
      ),
      WorkerEvent::Activate => Intent::WaitUntil(
        async move {
          self.cache.activate_and_evict()?;
          Ok::<_, Report>(vec![Effect::ClaimClients])
        }
        .boxed(),
      ),
      WorkerEvent::Fetch(request) => {
        if !request.method.is_cacheable() {
          return Intent::Passthrough(request);
        }
        Intent::RespondWith(async move { self.router.respond(&request).await }.boxed())
      }
      WorkerEvent::Sync { tag } if tag == QUIZ_PROGRESS_TAG => Intent::WaitUntil(
        async move {
          let report = self.queue.replay(self.network.as_ref()).await?;
          Ok::<_, Report>(vec![Effect::SyncCompleted { tag, report }])
        }
        .boxed(),
      ),
      WorkerEvent::Sync { tag } => {
        debug!(%tag, "Ignoring sync for unknown tag");
        Intent::Ignore
      }
      WorkerEvent::Push { payload } => {
        let notification = self.notification(payload);
        Intent::WaitUntil(done(vec![Effect::ShowNotification(notification)]))
      }
      WorkerEvent::NotificationClick { action } => {
        let mut effects = vec![Effect::CloseNotification];
        match action.as_deref() {
          None | Some(ACTION_EXPLORE) => effects.push(Effect::OpenWindow(self.root.clone())),
          Some(_) => {}
        }
        Intent::WaitUntil(done(effects))
      }
      WorkerEvent::Message(WorkerMessage::SkipWaiting) => {
        info!("Skip waiting requested by the application");
        Intent::WaitUntil(done(vec![Effect::SkipWaiting]))
      }
      WorkerEvent::Message(WorkerMessage::Other(raw)) => {
        debug!(message = %raw, "Ignoring unknown message");
        Intent::Ignore
      }
    }
  }

  fn notification(&self, payload: Option<String>) -> Notification {
    let body = payload
      .filter(|text| !text.trim().is_empty())
      .unwrap_or_else(|| self.notifications.default_body.clone());

    Notification {
      title: self.notifications.title.clone(),
      body,
      icon: self.notifications.icon.clone(),
      badge: self.notifications.badge.clone(),
      vibrate: vec![100, 50, 100],
      actions: vec![
        NotificationAction {
          action: ACTION_EXPLORE.to_string(),
          title: "Open App".to_string(),
        },
        NotificationAction {
          action: ACTION_CLOSE.to_string(),
          title: "Close".to_string(),
        },
      ],
    }
  }
}
