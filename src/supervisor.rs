//! Top-level wiring and lifecycle.
//!
//! Constructs every component explicitly and owns the restart loop for the
//! gateway listener plus the three-phase graceful shutdown. No component
//! reaches for process-wide state; everything travels by `Arc`.

use crate::config::{ChangeCallback, ConfigManager, ConfigWatch};
use crate::core::CoreSession;
use crate::gateway::{GatewayError, GatewayLink, GatewayServer};
use crate::inbound::{self, ChatGate, MessageTranslator, MetaHandler, NoticeEngine};
use crate::message::MessageBase;
use crate::outbound::SendHandler;
use crate::response_pool::ResponsePool;
use crate::store::BanStore;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Ban records live in the data directory next to the adapter, unless
/// `LOBSTERBRIDGE_DATA_DIR` points elsewhere.
fn ban_store_path() -> std::path::PathBuf {
    let dir = std::env::var("LOBSTERBRIDGE_DATA_DIR").unwrap_or_else(|_| "data".to_string());
    Path::new(&dir).join("ban_records.db")
}

/// Per-phase deadline during shutdown.
const SHUTDOWN_PHASE_TIMEOUT: Duration = Duration::from_secs(3);

/// Run the adapter until a shutdown signal arrives.
///
/// Startup failures (typically the gateway port being taken) are returned
/// to the caller, which exits with status 1.
pub async fn run(config: Arc<ConfigManager>) -> Result<()> {
    info!("Starting lobsterbridge adapter");

    let store = Arc::new(BanStore::open(&ban_store_path()).context("opening ban store")?);
    let pool = Arc::new(ResponsePool::new());
    let link = Arc::new(GatewayLink::new(pool.clone()));
    let http = reqwest::Client::new();

    let root = CancellationToken::new();
    spawn_signal_handler(root.clone());

    // Response-pool sweeper.
    let sweeper = tokio::spawn(pool.clone().run_sweeper(root.child_token()));

    // Core session and its sending handle.
    let (core_inbound_tx, core_inbound_rx) = mpsc::channel::<MessageBase>(256);
    let (core_session, core) = CoreSession::new(&config, core_inbound_tx);
    let core_cancel = root.child_token();
    let core_task = tokio::spawn(async move { core_session.run(core_cancel).await });

    // Inbound pipeline.
    let gate = Arc::new(ChatGate::new(config.clone(), link.clone()));
    let translator = Arc::new(MessageTranslator::new(
        config.clone(),
        link.clone(),
        core.clone(),
        gate.clone(),
        http.clone(),
    ));
    let meta = Arc::new(MetaHandler::new(&config));
    let notices = NoticeEngine::new(
        config.clone(),
        link.clone(),
        core.clone(),
        gate,
        store.clone(),
    );
    notices.load_persisted();
    notices.spawn_tasks(&root);

    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let router = tokio::spawn(inbound::run_router(
        frame_rx,
        translator,
        meta,
        notices,
        root.child_token(),
    ));

    // Outbound pipeline.
    let send_handler = SendHandler::new(config.clone(), link.clone(), core.clone());
    let send_cancel = root.child_token();
    let sender =
        tokio::spawn(async move { send_handler.run(core_inbound_rx, send_cancel).await });

    // Config watching and the gateway restart callback.
    let (restart_tx, restart_rx) = mpsc::channel::<()>(1);
    register_gateway_restart(&config, restart_tx)?;
    let watch = ConfigWatch::start(config.clone()).context("starting config watcher")?;

    // Serve the gateway listener, rebinding on config change, until the
    // root token is cancelled.
    let serve_result =
        gateway_restart_loop(&config, &link, frame_tx, &root, restart_rx).await;

    // Three-phase drain: the listener is already closed by the loop above.
    info!("Shutting down");
    root.cancel();
    watch.stop().await;

    if tokio::time::timeout(SHUTDOWN_PHASE_TIMEOUT, core_task)
        .await
        .is_err()
    {
        warn!("core session did not stop within the deadline");
    }

    for (name, task) in [("router", router), ("sender", sender), ("sweeper", sweeper)] {
        if tokio::time::timeout(SHUTDOWN_PHASE_TIMEOUT, task).await.is_err() {
            warn!("{name} task did not stop within the deadline");
        }
    }

    info!("Adapter shut down cleanly");
    serve_result
}

/// React to `gateway` config changes by bouncing the listener.
fn register_gateway_restart(
    config: &Arc<ConfigManager>,
    restart_tx: mpsc::Sender<()>,
) -> Result<()> {
    let callback: ChangeCallback = Arc::new(move |old, new| {
        let restart_tx = restart_tx.clone();
        Box::pin(async move {
            warn!(
                "gateway config changed:\n  old: {}:{}\n  new: {}:{}",
                old.get("host").and_then(|h| h.as_str()).unwrap_or("?"),
                old.get("port").and_then(|p| p.as_u64()).unwrap_or(0),
                new.get("host").and_then(|h| h.as_str()).unwrap_or("?"),
                new.get("port").and_then(|p| p.as_u64()).unwrap_or(0),
            );
            let _ = restart_tx.try_send(());
        })
    });
    config
        .on_change("gateway", callback)
        .context("registering gateway restart callback")
}

async fn gateway_restart_loop(
    config: &Arc<ConfigManager>,
    link: &Arc<GatewayLink>,
    frame_tx: mpsc::UnboundedSender<serde_json::Value>,
    root: &CancellationToken,
    mut restart_rx: mpsc::Receiver<()>,
) -> Result<()> {
    let mut first_bind = true;
    loop {
        if root.is_cancelled() {
            return Ok(());
        }

        let server = GatewayServer::new(config.clone(), link.clone(), frame_tx.clone());
        let session_cancel = root.child_token();
        let run_cancel = session_cancel.clone();
        let mut server_task: JoinHandle<Result<(), GatewayError>> =
            tokio::spawn(async move { server.run(run_cancel).await });

        tokio::select! {
            result = &mut server_task => {
                match result {
                    Ok(Err(e @ GatewayError::Bind { .. })) if first_bind => {
                        return Err(e.into());
                    }
                    Ok(Err(e)) => {
                        error!("gateway session failed: {e}; waiting before rebinding");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Ok(Ok(())) => {
                        if root.is_cancelled() {
                            return Ok(());
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Err(e) => error!("gateway session task panicked: {e}"),
                }
            }
            _ = restart_rx.recv() => {
                info!("closing gateway listener for restart");
                session_cancel.cancel();
                // Wait for the old listener to release its port before the
                // next bind.
                let _ = server_task.await;
                info!("restarting gateway listener");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            _ = root.cancelled() => {
                session_cancel.cancel();
                let _ = server_task.await;
                return Ok(());
            }
        }
        first_bind = false;
    }
}

/// Cancel the root token on Ctrl+C or SIGTERM.
fn spawn_signal_handler(root: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to install Ctrl+C handler: {e}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!("failed to install SIGTERM handler: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown"),
            _ = terminate => info!("Received SIGTERM, initiating shutdown"),
        }
        root.cancel();
    });
}
