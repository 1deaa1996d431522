//! State the offline layer surfaces to the hosting application.

use tokio::sync::watch;
use tracing::info;

use crate::http::Request;
use crate::network::Network;

/// A change of connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  WentOnline,
  WentOffline,
}

/// Process-wide online/offline flag.
///
/// Every change is published immediately; there is no debouncing.
pub struct Connectivity {
  tx: watch::Sender<bool>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Receiver that observes every published state.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  /// Record the platform's current status. Returns the transition if the
  /// status actually changed.
  pub fn set_online(&self, online: bool) -> Option<Transition> {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        return false;
      }
      *current = online;
      true
    });

    if !changed {
      return None;
    }
    let transition = if online {
      Transition::WentOnline
    } else {
      Transition::WentOffline
    };
    info!(?transition, "Connectivity changed");
    Some(transition)
  }

  /// Whether `probe` can reach the origin at all. Any response counts,
  /// whatever its status.
  pub async fn probe<N: Network>(network: &N, probe: &Request) -> bool {
    network.fetch(probe).await.is_ok()
  }
}

/// Signal that an installable update is available, plus its outcome.
pub struct InstallPrompt {
  tx: watch::Sender<bool>,
}

impl InstallPrompt {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(false);
    Self { tx }
  }

  pub fn is_installable(&self) -> bool {
    *self.tx.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  /// Make the install trigger available.
  pub fn offer(&self) {
    self.tx.send_if_modified(|installable| !std::mem::replace(installable, true));
  }

  /// Consume the prompt once the install has been triggered and succeeded.
  pub fn withdraw(&self) {
    self.tx.send_if_modified(|installable| std::mem::replace(installable, false));
  }
}

impl Default for InstallPrompt {
  fn default() -> Self {
    Self::new()
  }
}
