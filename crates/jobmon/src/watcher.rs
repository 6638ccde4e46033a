//! Configuration file watcher for hot reload.

use crate::context::AppContext;
use camino::{Utf8Path, Utf8PathBuf};
use miette::{IntoDiagnostic, Result};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Events from the file watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    /// The configuration file was created or modified
    ConfigChanged,
    /// Watcher error
    Error(String),
}

/// Watches the directory of the configuration file; editors often replace
/// the file instead of writing it in place.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    receiver: UnboundedReceiver<WatcherEvent>,
    config_path: Utf8PathBuf,
}

impl ConfigWatcher {
    pub fn new(config_path: &Utf8Path) -> Result<Self> {
        let (tx, rx) = unbounded_channel();
        let watcher = create_watcher(tx, config_path)?;
        Ok(Self {
            _watcher: watcher,
            receiver: rx,
            config_path: config_path.to_owned(),
        })
    }

    pub async fn recv(&mut self) -> Option<WatcherEvent> {
        self.receiver.recv().await
    }

    /// Reload the context on every change until the watcher goes away.
    ///
    /// Bursts of events within `debounce` trigger a single reload.
    pub fn spawn_reloader(mut self, ctx: Arc<AppContext>, debounce: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(path = %self.config_path, "Watching configuration");
            while let Some(event) = self.recv().await {
                match event {
                    WatcherEvent::ConfigChanged => {
                        tokio::time::sleep(debounce).await;
                        while let Ok(WatcherEvent::ConfigChanged) = self.receiver.try_recv() {}
                        match ctx.reload_config().await {
                            Ok(created) => tracing::debug!(created, "Configuration reload applied"),
                            Err(e) => tracing::error!("Error reloading configuration: {}", e),
                        }
                    }
                    WatcherEvent::Error(e) => tracing::error!("Configuration watcher error: {}", e),
                }
            }
        })
    }
}

fn create_watcher(tx: UnboundedSender<WatcherEvent>, config_path: &Utf8Path) -> Result<RecommendedWatcher> {
    let target = config_path.to_owned();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => handle_event(event, &tx, &target),
            Err(e) => {
                let _ = tx.send(WatcherEvent::Error(e.to_string()));
            }
        },
        Config::default().with_poll_interval(Duration::from_millis(500)),
    )
    .into_diagnostic()?;

    let dir = match config_path.parent() {
        Some(p) if !p.as_str().is_empty() => p,
        _ => Utf8Path::new("."),
    };
    watcher
        .watch(dir.as_std_path(), RecursiveMode::NonRecursive)
        .into_diagnostic()?;
    Ok(watcher)
}

fn handle_event(event: Event, tx: &UnboundedSender<WatcherEvent>, target: &Utf8Path) {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => {
            let touched = event.paths.into_iter().any(|path| {
                Utf8PathBuf::try_from(path)
                    .map(|p| p.file_name() == target.file_name())
                    .unwrap_or(false)
            });
            if touched {
                let _ = tx.send(WatcherEvent::ConfigChanged);
            }
        }
        _ => {}
    }
}
