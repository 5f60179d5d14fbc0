//! Inbound side: routing of gateway frames and their translation into
//! canonical envelopes for the core.

mod cards;
mod emoji_likes;
mod face_codes;
mod fetch;
mod forward;
mod gate;
mod message;
mod meta;
mod notice;

pub use forward::FORWARD_MAX_DEPTH;
pub use gate::ChatGate;
pub use message::MessageTranslator;
pub use meta::MetaHandler;
pub use notice::NoticeEngine;

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Pause between frame dequeues so long bursts cannot starve other tasks.
const ROUTER_PACING: Duration = Duration::from_millis(50);

/// Drain the frame queue, dispatching by `post_type`.
pub async fn run_router(
    mut frames: mpsc::UnboundedReceiver<Value>,
    translator: Arc<MessageTranslator>,
    meta: Arc<MetaHandler>,
    notices: Arc<NoticeEngine>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
            _ = cancel.cancelled() => return,
        };

        match frame.get("post_type").and_then(|p| p.as_str()) {
            Some("message") => translator.handle_raw_message(&frame).await,
            Some("meta_event") => meta.handle(&frame).await,
            Some("notice") => notices.handle_notice(&frame).await,
            other => warn!(?other, "unknown post_type"),
        }

        tokio::time::sleep(ROUTER_PACING).await;
    }
}
