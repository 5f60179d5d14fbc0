//! Meta-event handling: connection lifecycle and heartbeat supervision.

use crate::config::ConfigManager;

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub struct MetaHandler {
    last_heartbeat: Mutex<Instant>,
    /// Expected heartbeat interval in seconds; the gateway's advertised
    /// value (milliseconds on the wire) overrides the configured default.
    interval: Mutex<f64>,
    watchdog_running: AtomicBool,
}

impl MetaHandler {
    pub fn new(config: &Arc<ConfigManager>) -> Self {
        Self {
            last_heartbeat: Mutex::new(Instant::now()),
            interval: Mutex::new(config.snapshot().gateway.heartbeat_interval as f64),
            watchdog_running: AtomicBool::new(false),
        }
    }

    pub async fn handle(self: &Arc<Self>, frame: &Value) {
        let event_type = frame.get("meta_event_type").and_then(|v| v.as_str());
        match event_type {
            Some("lifecycle") => {
                if frame.get("sub_type").and_then(|v| v.as_str()) == Some("connect") {
                    let self_id = frame.get("self_id").and_then(|v| v.as_i64()).unwrap_or(0);
                    *self.last_heartbeat.lock() = Instant::now();
                    info!("Bot {self_id} connected");
                    self.spawn_watchdog(self_id);
                }
            }
            Some("heartbeat") => self.handle_heartbeat(frame),
            other => debug!(?other, "unhandled meta event"),
        }
    }

    fn handle_heartbeat(self: &Arc<Self>, frame: &Value) {
        let self_id = frame.get("self_id").and_then(|v| v.as_i64()).unwrap_or(0);
        let status = frame.get("status").cloned().unwrap_or(Value::Null);
        let online = status.get("online").and_then(|v| v.as_bool()).unwrap_or(false);
        let good = status.get("good").and_then(|v| v.as_bool()).unwrap_or(false);

        if online && good {
            if !self.watchdog_running.load(Ordering::SeqCst) {
                self.spawn_watchdog(self_id);
            }
            *self.last_heartbeat.lock() = Instant::now();
            if let Some(interval_ms) = frame.get("interval").and_then(|v| v.as_f64()) {
                *self.interval.lock() = interval_ms / 1000.0;
            }
        } else if !online {
            error!("Bot {self_id} reports offline (online=false)");
            warn!("the bot may have been logged out or lost its network");
        } else {
            warn!("Bot {self_id} reports a degraded state (good=false)");
        }
    }

    /// Watchdog: once per interval, check that a heartbeat arrived within
    /// 2x the interval. On a miss, log and exit; the connection itself is
    /// supervised through session closure, not from here.
    fn spawn_watchdog(self: &Arc<Self>, self_id: i64) {
        if self
            .watchdog_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let meta = self.clone();
        tokio::spawn(async move {
            loop {
                let interval = *meta.interval.lock();
                tokio::time::sleep(Duration::from_secs_f64(interval.max(1.0))).await;
                let silent_for = meta.last_heartbeat.lock().elapsed().as_secs_f64();
                if silent_for > interval * 2.0 {
                    error!(
                        "Bot {self_id} heartbeat silent for {silent_for:.0}s; \
                         the gateway may be disconnected or stuck"
                    );
                    break;
                }
                debug!("heartbeat healthy");
            }
            meta.watchdog_running.store(false, Ordering::SeqCst);
        });
    }
}
