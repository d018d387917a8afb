use crate::AppState;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use fm_core::types::event::EventBody;
use fm_events::types::EventRecord;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    prompt_id: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-subscriber loop. On connect the client receives a full queue snapshot
/// and a health frame before any live event, so state converges regardless of
/// connection time. A subscriber that falls behind the bus gets a fresh
/// snapshot instead of stalling the publisher.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut events = state.engine.bus().subscribe();
    send_snapshot(&state, &tx);
    send_health(&state, &tx);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(record) => {
                    if send_record(&tx, &record).is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    // Dropped the oldest events for this subscriber; catch it
                    // up with a fresh snapshot instead of blocking the bus.
                    tracing::debug!(missed, "subscriber lagged; replaying snapshot");
                    send_snapshot(&state, &tx);
                    send_health(&state, &tx);
                }
                Err(RecvError::Closed) => break,
            },
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => handle_client_message(&state, &tx, &text),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    writer.abort();
}

fn handle_client_message(state: &AppState, tx: &mpsc::UnboundedSender<Message>, text: &str) {
    let Ok(message) = serde_json::from_str::<ClientMessage>(text) else {
        let _ = tx.send(text_message(
            serde_json::json!({ "type": "error", "message": "invalid JSON payload" }).to_string(),
        ));
        return;
    };
    match message.kind.as_str() {
        "request_queue" => send_snapshot(state, tx),
        "fetch_prompt" => {
            let prompt = message
                .prompt_id
                .as_deref()
                .and_then(|raw| raw.parse().ok())
                .and_then(|id| state.engine.get(&id).ok().flatten());
            match prompt {
                Some(prompt) => send_body(tx, &EventBody::PromptUpdate { prompt }),
                None => {
                    let _ = tx.send(text_message(
                        serde_json::json!({ "type": "error", "message": "prompt not found" })
                            .to_string(),
                    ));
                }
            }
        }
        "ping" => {
            let _ = tx.send(text_message(
                serde_json::json!({ "type": "pong", "timestamp": Utc::now() }).to_string(),
            ));
        }
        other => {
            let _ = tx.send(text_message(
                serde_json::json!({
                    "type": "error",
                    "message": format!("unknown message type: {other}"),
                })
                .to_string(),
            ));
        }
    }
}

fn send_snapshot(state: &AppState, tx: &mpsc::UnboundedSender<Message>) {
    if let Ok(snapshot) = state.engine.snapshot() {
        send_body(tx, &EventBody::QueueSnapshot { snapshot });
    }
}

fn send_health(state: &AppState, tx: &mpsc::UnboundedSender<Message>) {
    if let Ok(health) = state.engine.health() {
        send_body(tx, &EventBody::Health { health });
    }
}

/// Replay frames carry seq 0: they are synthesized for one subscriber, not
/// part of the bus ordering.
fn send_body(tx: &mpsc::UnboundedSender<Message>, body: &EventBody) {
    if let Ok(value) = serde_json::to_value(body) {
        let record = EventRecord {
            seq: 0,
            at: Utc::now(),
            body: value,
        };
        let _ = send_record(tx, &record);
    }
}

fn send_record(
    tx: &mpsc::UnboundedSender<Message>,
    record: &EventRecord,
) -> Result<(), mpsc::error::SendError<Message>> {
    let json = serde_json::to_string(record).unwrap_or_else(|_| "{}".to_string());
    tx.send(text_message(json))
}

fn text_message(value: String) -> Message {
    Message::Text(Utf8Bytes::from(value))
}
