//! Socket lifecycle for one accepted WebSocket.
//!
//! Split into a writer task that drains the connection's outbox onto the
//! socket, and the receive loop that runs on the caller's task. Either side
//! finishing cancels the shared close token so the other side stops too,
//! except at server shutdown, where the writer flushes the outbox first.
//! Cleanup (`unregister`) runs exactly once, after both sides are done.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::ConnectionChannel;
use super::protocol::{self, CloseReason};
use super::registry::Registry;

/// Per-connection tuning taken from the server config.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionSettings {
    pub send_queue_capacity: usize,
    pub write_timeout: Duration,
}

/// Serve one WebSocket until it closes, then remove it from the registry.
pub async fn serve_connection(
    socket: WebSocket,
    registry: Arc<Registry>,
    settings: ConnectionSettings,
) -> CloseReason {
    let (channel, outbox) = ConnectionChannel::bounded(settings.send_queue_capacity);
    let close = channel.close_token();
    let drain = channel.drain_token();
    let id = registry.register(channel.clone());
    info!(conn_id = %id, "websocket client connected");

    if channel.send_frame(&protocol::welcome(&id)).is_err() {
        let _ = registry.unregister(&id);
        return CloseReason::SendFailed;
    }

    let (ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(write_loop(
        ws_tx,
        outbox,
        close.clone(),
        drain.clone(),
        settings.write_timeout,
    ));

    let reason = loop {
        let msg = tokio::select! {
            biased;
            () = close.cancelled() => break CloseReason::Evicted,
            () = drain.cancelled() => break CloseReason::ServerShutdown,
            msg = ws_rx.next() => msg,
        };

        let text = match msg {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Binary(_))) => {
                let _ = registry.touch(&id);
                let reply = sonar_core::ServerFrame::error("binary frames are not supported");
                if channel.send_frame(&reply).is_err() {
                    break CloseReason::SendFailed;
                }
                continue;
            }
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                // axum answers pings itself; still counts as activity
                let _ = registry.touch(&id);
                continue;
            }
            Some(Ok(WsMessage::Close(_))) | None => break CloseReason::ClientClosed,
            Some(Err(e)) => {
                debug!(conn_id = %id, error = %e, "websocket read error");
                break CloseReason::TransportError;
            }
        };

        if !registry.touch(&id) {
            break CloseReason::Evicted;
        }
        let reply = protocol::handle_text(&registry, &id, text.as_str());
        if let Err(e) = channel.send_frame(&reply) {
            warn!(conn_id = %id, error = %e, "failed to queue reply");
            break CloseReason::SendFailed;
        }
    };

    // at shutdown the writer stops on its own once the outbox is flushed
    if reason != CloseReason::ServerShutdown {
        close.cancel();
    }
    let _ = registry.unregister(&id);
    if let Err(e) = writer.await {
        warn!(conn_id = %id, error = %e, "websocket writer task failed");
    }
    info!(conn_id = %id, reason = reason.as_str(), "websocket client disconnected");
    reason
}

/// Forward queued frames to the socket until the outbox closes, a write fails
/// or times out, or the close token fires. When `drain` fires instead, stop
/// accepting new frames and write out what is already queued before closing.
/// Always cancels `close` on exit.
#[instrument(skip_all)]
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut outbox: mpsc::Receiver<Arc<String>>,
    close: CancellationToken,
    drain: CancellationToken,
    write_timeout: Duration,
) {
    let draining = loop {
        let next = tokio::select! {
            biased;
            () = close.cancelled() => break false,
            () = drain.cancelled() => break true,
            next = outbox.recv() => next,
        };
        let Some(text) = next else { break false };
        if !write_frame(&mut ws_tx, &text, write_timeout).await {
            break false;
        }
    };

    if draining {
        outbox.close();
        let mut flushed = 0usize;
        while let Some(text) = outbox.recv().await {
            if !write_frame(&mut ws_tx, &text, write_timeout).await {
                break;
            }
            flushed += 1;
        }
        debug!(flushed, "outbox flushed before close");
    }

    close.cancel();
    let _ = tokio::time::timeout(write_timeout, ws_tx.send(WsMessage::Close(None))).await;
}

async fn write_frame(
    ws_tx: &mut SplitSink<WebSocket, WsMessage>,
    text: &str,
    write_timeout: Duration,
) -> bool {
    let frame = WsMessage::Text(text.to_owned().into());
    match tokio::time::timeout(write_timeout, ws_tx.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(error = %e, "websocket write failed");
            false
        }
        Err(_) => {
            warn!(timeout_ms = write_timeout.as_millis() as u64, "websocket write timed out");
            false
        }
    }
}
