use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use circle_db::Database;
use circle_types::events::GatewayEvent;

use crate::poller::NotificationPoller;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// At most `max_chars` characters of `text`, cut on a char boundary.
fn preview(text: &str, max_chars: usize) -> &str {
    text.char_indices().nth(max_chars).map_or(text, |(i, _)| &text[..i])
}

/// Drive one authenticated gateway connection.
///
/// The token was checked at the HTTP upgrade, so the socket gets `Ready`
/// straight away. A [`NotificationPoller`] bound to this connection feeds the
/// send loop; it is cancelled when the socket closes, the heartbeat times out
/// or `shutdown` fires.
pub async fn handle_connection(
    socket: WebSocket,
    db: Arc<Database>,
    user_id: Uuid,
    username: String,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    let (mut sender, mut receiver) = socket.split();

    info!("{} ({}) connected to gateway", username, user_id);

    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if sender.send(Message::Text(ready.to_json().into())).await.is_err() {
        return;
    }

    let cancel = shutdown.child_token();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<GatewayEvent>();
    let poller = NotificationPoller::new(db, user_id, poll_interval).spawn(event_tx, cancel.clone());

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    let send_cancel = cancel.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                _ = send_cancel.cancelled() => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    if sender.send(Message::Text(event.to_json().into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Clients have nothing to send; only liveness frames matter.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Pong(_) => pong_flag_recv.store(true, Ordering::Release),
                Message::Close(_) => break,
                Message::Text(text) => {
                    debug!("Ignoring client frame from {}: {}", user_id, preview(text.as_str(), 200));
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => {
            cancel.cancel();
            let _ = (&mut send_task).await;
        }
    }

    cancel.cancel();
    if let Err(e) = poller.await {
        warn!("Notification poller for {} panicked: {}", user_id, e);
    }
    info!("{} ({}) disconnected from gateway", username, user_id);
}
