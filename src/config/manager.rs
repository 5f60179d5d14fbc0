use super::{Config, ConfigError};

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Callback invoked with `(old_value, new_value)` when a watched dotted path
/// changes across a reload. Values are JSON projections of the config.
pub type ChangeCallback =
    Arc<dyn Fn(Value, Value) -> BoxFuture<'static, ()> + Send + Sync + 'static>;

struct Registration {
    path: String,
    callback: ChangeCallback,
}

/// Owns the live `Config` snapshot and dispatches change callbacks.
///
/// Reads are a lock-guarded `Arc` clone; the reload path swaps the pointer
/// and diffs registered paths by structural equality.
pub struct ConfigManager {
    config_path: PathBuf,
    current: RwLock<Arc<Config>>,
    registrations: Mutex<Vec<Registration>>,
    reloading: AtomicBool,
    /// Monotonic counter distinguishing debounce triggers; the newest wins.
    trigger_seq: AtomicU64,
}

impl ConfigManager {
    /// Load the initial snapshot from `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = Config::load(path)?;
        info!("Config loaded from {}", path.display());
        Ok(Self {
            config_path: path.to_path_buf(),
            current: RwLock::new(Arc::new(config)),
            registrations: Mutex::new(Vec::new()),
            reloading: AtomicBool::new(false),
            trigger_seq: AtomicU64::new(0),
        })
    }

    /// Construct a manager around an in-memory config. Used by tests and by
    /// `config validate`; the watcher cannot be started without a real file.
    pub fn from_config(config: Config) -> Self {
        Self {
            config_path: PathBuf::new(),
            current: RwLock::new(Arc::new(config)),
            registrations: Mutex::new(Vec::new()),
            reloading: AtomicBool::new(false),
            trigger_seq: AtomicU64::new(0),
        }
    }

    /// The watched file path.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Current snapshot. Cheap: clones an `Arc` under a read lock.
    pub fn snapshot(&self) -> Arc<Config> {
        self.current.read().clone()
    }

    /// Register a callback for a dotted config path such as `gateway` or
    /// `chat.ban_user_id`. Unknown paths are rejected at registration time.
    pub fn on_change(&self, path: &str, callback: ChangeCallback) -> Result<(), ConfigError> {
        let snapshot = serde_json::to_value(&*self.snapshot()).expect("config serializes");
        if lookup_path(&snapshot, path).is_none() {
            return Err(ConfigError::UnknownPath(path.to_string()));
        }
        self.registrations.lock().push(Registration {
            path: path.to_string(),
            callback,
        });
        debug!(path, "registered config change callback");
        Ok(())
    }

    /// Reload the file, swap the snapshot, and notify changed paths.
    ///
    /// A parse or read failure keeps the old snapshot; no callbacks fire.
    pub async fn reload(&self) -> bool {
        let new_config = match Config::load(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                error!(
                    "Config reload failed: {e}. The previous config stays active; \
                     fix the file and save again to retry."
                );
                return false;
            }
        };

        let old = {
            let mut guard = self.current.write();
            let old = guard.clone();
            *guard = Arc::new(new_config);
            old
        };
        let new = self.snapshot();
        info!("Config reloaded from {}", self.config_path.display());

        self.notify_changes(&old, &new).await;
        true
    }

    async fn notify_changes(&self, old: &Config, new: &Config) {
        let old_json = serde_json::to_value(old).expect("config serializes");
        let new_json = serde_json::to_value(new).expect("config serializes");

        // Snapshot registrations so callbacks may themselves register more.
        let regs: Vec<(String, ChangeCallback)> = self
            .registrations
            .lock()
            .iter()
            .map(|r| (r.path.clone(), r.callback.clone()))
            .collect();

        for (path, callback) in regs {
            let old_value = lookup_path(&old_json, &path);
            let new_value = lookup_path(&new_json, &path);
            if old_value == new_value {
                continue;
            }
            info!(path = %path, "config change detected");
            let old_value = old_value.cloned().unwrap_or(Value::Null);
            let new_value = new_value.cloned().unwrap_or(Value::Null);
            // Each callback is isolated: a panic aborts only its own task.
            let fut = callback(old_value, new_value);
            if let Err(e) = tokio::spawn(fut).await {
                error!(path = %path, "config change callback failed: {e}");
            }
        }
    }

    /// Debounced reload entry point used by the file watcher. Coalesces
    /// trigger bursts within the debounce window and drops triggers that
    /// arrive while a reload is already running.
    pub(super) async fn debounced_reload(self: Arc<Self>, debounce: std::time::Duration) {
        let my_seq = self.trigger_seq.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(debounce).await;

        if self.trigger_seq.load(Ordering::SeqCst) != my_seq {
            debug!("discarding superseded reload trigger");
            return;
        }
        if self
            .reloading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("reload already in progress, skipping trigger");
            return;
        }

        if let Ok(meta) = std::fs::metadata(&self.config_path) {
            if let Ok(modified) = meta.modified() {
                let stamp = chrono::DateTime::<chrono::Local>::from(modified);
                info!(
                    "Config file updated (modified {}), reloading...",
                    stamp.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }

        self.reload().await;
        self.reloading.store(false, Ordering::SeqCst);
    }
}

/// Walk a dotted path through a JSON projection of the config.
pub(super) fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cursor = value;
    for part in path.split('.') {
        cursor = cursor.as_object()?.get(part)?;
    }
    Some(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn lookup_path_walks_nested_objects() {
        let value = serde_json::json!({"gateway": {"port": 8095}});
        assert_eq!(
            lookup_path(&value, "gateway.port"),
            Some(&serde_json::json!(8095))
        );
        assert!(lookup_path(&value, "gateway.missing").is_none());
        assert!(lookup_path(&value, "nope").is_none());
    }

    #[test]
    fn unknown_path_rejected_at_registration() {
        let manager = ConfigManager::from_config(Config::default());
        let cb: ChangeCallback = Arc::new(|_, _| Box::pin(async {}));
        assert!(manager.on_change("gateway", cb.clone()).is_ok());
        assert!(manager.on_change("gateway.port", cb.clone()).is_ok());
        assert!(matches!(
            manager.on_change("no.such.section", cb),
            Err(ConfigError::UnknownPath(_))
        ));
    }

    #[tokio::test]
    async fn changed_path_fires_callback_once() {
        let manager = ConfigManager::from_config(Config::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        let cb: ChangeCallback = Arc::new(move |old, new| {
            let seen = seen.clone();
            Box::pin(async move {
                assert_ne!(old, new);
                seen.fetch_add(1, Ordering::SeqCst);
            })
        });
        manager.on_change("gateway.port", cb).unwrap();

        let old = Config::default();
        let mut new = Config::default();
        new.gateway.port = 9000;
        manager.notify_changes(&old, &new).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Unchanged reload notifies nothing further.
        manager.notify_changes(&new, &new).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
