//! WebSocket event stream
//!
//! Each connection gets its own bus subscription for its whole lifetime;
//! closing the socket drops the subscription. `http_result` events are
//! batched into 250 ms windows before hitting the wire, everything else
//! is forwarded as it arrives. The manager mutex is never touched here.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::api::server::AppState;
use crate::events::BusMessage;
use crate::models::{Event, HttpResult};

/// Flush window for batched `http_result` frames
const RESULT_BATCH_WINDOW: Duration = Duration::from_millis(250);

/// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut stream = state.manager.bus().subscribe();

    info!("websocket client connected");

    let mut batch: Vec<HttpResult> = Vec::new();
    let mut flush = interval(RESULT_BATCH_WINDOW);
    flush.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            message = stream.recv() => {
                match message {
                    BusMessage::Event(Event::HttpResult(result)) => {
                        batch.push(result);
                    }
                    BusMessage::Event(event) => {
                        // Flush buffered results first so ordering across
                        // event kinds survives the batching window.
                        if flush_batch(&mut sender, &mut batch).await.is_err() {
                            break;
                        }
                        if send_json(&mut sender, &event).await.is_err() {
                            break;
                        }
                    }
                    BusMessage::Overflow(n) => {
                        debug!("websocket subscriber lagged by {} events", n);
                        let overflow = Event::log("subscriber overflow");
                        if send_json(&mut sender, &overflow).await.is_err() {
                            break;
                        }
                    }
                    BusMessage::Closed => break,
                }
            }
            _ = flush.tick() => {
                if flush_batch(&mut sender, &mut batch).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(Message::Ping(_))) => {
                        // Pong is handled automatically by axum.
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    info!("websocket client disconnected");
}

async fn flush_batch<S>(sender: &mut S, batch: &mut Vec<HttpResult>) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }
    let frame = serde_json::json!({
        "type": "http_result",
        "data": std::mem::take(batch),
    });
    send_text(sender, frame.to_string()).await
}

async fn send_json<S>(sender: &mut S, event: &Event) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    match serde_json::to_string(event) {
        Ok(json) => send_text(sender, json).await,
        Err(e) => {
            debug!("failed to serialize event: {}", e);
            Ok(())
        }
    }
}

async fn send_text<S>(sender: &mut S, text: String) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    sender.send(Message::Text(text)).await.map_err(|_| ())
}
