mod cache;
mod config;
mod db;
mod host;
mod http;
mod network;
mod queue;
mod router;
mod signals;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::host::{Host, Submission};
use crate::http::{Destination, Method, Request};
use crate::network::{HttpNetwork, Network};
use crate::worker::{Effect, WorkerMessage};

#[derive(Parser, Debug)]
#[command(name = "eduquest-sw")]
#[command(about = "Offline caching and background sync for EduQuest")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/eduquest-sw/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-cache the application shell and activate the configured version
  Install,
  /// Activate an installed version that is still waiting
  Activate,
  /// Request a resource through the offline layer
  Fetch {
    /// Path or absolute URL
    url: String,
    /// Request destination: document, script, style, image or empty
    /// (guessed from the path when omitted)
    #[arg(short, long)]
    dest: Option<String>,
    /// Write the body to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Send a mutation, queueing it for background sync when offline
  Submit {
    /// Path or absolute URL
    url: String,
    #[arg(short = 'X', long, default_value = "POST")]
    method: String,
    /// Header as 'Name: value' (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Replay queued mutations now
  Sync,
  /// Deliver a push message
  Push {
    /// Notification text
    message: Option<String>,
  },
  /// Click a notification, optionally on one of its actions
  Click {
    #[arg(short, long)]
    action: Option<String>,
  },
  /// Ask a waiting version to take over immediately
  SkipWaiting,
  /// Post a raw message to the worker, e.g. '{"type":"SKIP_WAITING"}'
  Message {
    raw: String,
  },
  /// Track connectivity and replay queued mutations when the origin comes back
  Watch,
  /// Show versions, partitions and queued mutations
  Status,
}

fn init_tracing() -> WorkerGuard {
  let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
  let filter = EnvFilter::try_from_env("EDUQUEST_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .init();
  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_tracing();

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;

  let db = Arc::new(db::Database::open(config.database.as_deref())?);
  let network = Arc::new(HttpNetwork::new(&config.network)?);
  let poll = Duration::from_secs(config.connectivity.poll_secs.max(1));
  let host = Host::new(config, network, db)?;

  match args.command {
    Command::Install => {
      host.install().await?;
      println!("Installed and activated");
    }
    Command::Activate => {
      host.activate().await?;
      println!("Activated");
    }
    Command::Fetch { url, dest, output } => {
      let url = host.config().resolve(&url)?;
      let destination = match dest {
        Some(d) => d.parse()?,
        None => Destination::infer(&url),
      };
      let request = match destination {
        Destination::Document => Request::navigate(url),
        other => Request::get(url).with_destination(other),
      };
      let response = host.fetch(request).await?;

      eprintln!("{} {}", response.status, response.status_text);
      match output {
        Some(path) => std::fs::write(&path, &response.body)
          .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
        None => std::io::stdout().write_all(&response.body)?,
      }
    }
    Command::Submit {
      url,
      method,
      headers,
      data,
    } => {
      let method: Method = method.parse()?;
      let mut request = Request::new(method, host.config().resolve(&url)?);
      for raw in &headers {
        let (name, value) = http::parse_header(raw)?;
        request = request.with_header(name, value);
      }
      if let Some(data) = data {
        request = request.with_body(data);
      }

      match host.submit(request).await? {
        Submission::Sent(response) => {
          eprintln!("{} {}", response.status, response.status_text);
          std::io::stdout().write_all(&response.body)?;
        }
        Submission::Deferred { id } => println!("Offline: queued as {}", id),
      }
    }
    Command::Sync => {
      let report = host.sync().await?;
      println!(
        "Replayed {}, still queued {}",
        report.replayed, report.retained
      );
    }
    Command::Push { message } => print_effects(&host.push(message).await?)?,
    Command::Click { action } => print_effects(&host.notification_click(action).await?)?,
    Command::SkipWaiting => {
      print_effects(&host.post_message(WorkerMessage::SkipWaiting).await?)?;
      println!("Active version: {}", host.active_version()?.unwrap_or_else(|| "none".into()));
    }
    Command::Message { raw } => {
      print_effects(&host.post_message(WorkerMessage::parse(&raw)).await?)?;
      println!("Active version: {}", host.active_version()?.unwrap_or_else(|| "none".into()));
    }
    Command::Watch => {
      let mut online_rx = host.connectivity().subscribe();
      let mut installable_rx = host.install_prompt().subscribe();
      if *installable_rx.borrow_and_update() {
        println!("update available: run install");
      }
      let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
      };
      let printer = async {
        loop {
          tokio::select! {
            changed = online_rx.changed() => {
              if changed.is_err() {
                break;
              }
              let online = *online_rx.borrow_and_update();
              println!("{}", if online { "online" } else { "offline" });
            }
            changed = installable_rx.changed() => {
              if changed.is_err() {
                break;
              }
              if *installable_rx.borrow_and_update() {
                println!("update available: run install");
              }
            }
          }
        }
      };
      tokio::select! {
        result = host.watch(poll, shutdown) => result?,
        _ = printer => {}
      }
    }
    Command::Status => {
      let online = host.probe().await?;
      host.connectivity().set_online(online);
      print_status(&host)?;
    }
  }

  Ok(())
}

fn print_effects(effects: &[Effect]) -> Result<()> {
  for effect in effects {
    match effect {
      Effect::ShowNotification(notification) => {
        let json = serde_json::to_string_pretty(notification)
          .map_err(|e| eyre!("Failed to render notification: {}", e))?;
        println!("{}", json);
      }
      Effect::CloseNotification => println!("Notification closed"),
      Effect::OpenWindow(url) => println!("Open {}", url),
      Effect::SyncCompleted { tag, report } => println!(
        "Sync {}: replayed {}, still queued {}",
        tag, report.replayed, report.retained
      ),
      Effect::SkipWaiting | Effect::ClaimClients => {}
    }
  }
  Ok(())
}

fn print_status<N: Network>(host: &Host<N>) -> Result<()> {
  let status = host.status()?;
  let or_none = |v: &Option<String>| v.clone().unwrap_or_else(|| "none".to_string());

  println!("Online:          {}", status.online);
  println!("Version:         {}", status.version);
  println!("Active version:  {}", or_none(&status.active_version));
  println!("Waiting version: {}", or_none(&status.waiting_version));
  println!("Installable:     {}", status.installable);
  println!("Partitions:      {}", status.partitions.join(", "));
  println!("Queued actions:  {}", status.pending_actions);
  if !status.sync_tags.is_empty() {
    println!("Pending syncs:   {}", status.sync_tags.join(", "));
  }
  Ok(())
}
