//! Config-file watcher.
//!
//! Watches the directory containing the config file (rename-on-save editors
//! replace the file, so watching the path itself misses events) and funnels
//! modification events into the manager's debounced reload.

use super::defaults::RELOAD_DEBOUNCE_MS;
use super::manager::ConfigManager;
use super::ConfigError;

use futures::future::join_all;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long `stop` waits for in-flight reloads before giving up.
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle keeping the filesystem watcher and its forwarding task alive.
pub struct ConfigWatch {
    _watcher: RecommendedWatcher,
    forward_task: JoinHandle<()>,
    reloads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ConfigWatch {
    /// Begin watching the manager's config file. The returned handle must be
    /// kept alive; dropping it stops the watcher.
    pub fn start(manager: Arc<ConfigManager>) -> Result<Self, ConfigError> {
        let config_path = manager.config_path().to_path_buf();
        let watch_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        // The notify callback runs on the watcher's own thread; it only
        // filters and forwards into the async world.
        let target = std::fs::canonicalize(&config_path).unwrap_or_else(|_| config_path.clone());
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        return;
                    }
                    let hit = event.paths.iter().any(|p| {
                        std::fs::canonicalize(p).map(|p| p == target).unwrap_or(false)
                            || p == &target
                    });
                    if hit {
                        let _ = tx.send(());
                    }
                }
                Err(e) => warn!("config watcher error: {e}"),
            }
        })?;
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
        info!("Watching config file {}", config_path.display());

        // Reload tasks are tracked so `stop` can drain the in-flight ones.
        let reloads = Arc::new(Mutex::new(Vec::new()));
        let reload_tracker = reloads.clone();
        let forward_task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                debug!("config file change event");
                let handle = tokio::spawn(
                    manager
                        .clone()
                        .debounced_reload(Duration::from_millis(RELOAD_DEBOUNCE_MS)),
                );
                let mut handles = reload_tracker.lock();
                handles.retain(|h: &JoinHandle<()>| !h.is_finished());
                handles.push(handle);
            }
        });

        Ok(Self {
            _watcher: watcher,
            forward_task,
            reloads,
        })
    }

    /// Stop watching and wait (bounded) for in-flight reloads to settle, so
    /// no reload is still swapping the snapshot after shutdown.
    pub async fn stop(self) {
        self.forward_task.abort();
        let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *self.reloads.lock());
        if !pending.is_empty()
            && tokio::time::timeout(STOP_DRAIN_TIMEOUT, join_all(pending))
                .await
                .is_err()
        {
            warn!("in-flight config reloads did not finish before the deadline");
        }
        info!("Config watcher stopped");
    }
}
