use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::state::AppState;

const BROADCAST_CAPACITY: usize = 256;
const MAX_QUEUE_PER_TASK: usize = 100;

/// How long a finished task's events stay replayable
pub const REPLAY_RETENTION: Duration = Duration::from_secs(300);

/// Event prefixes kept for replay, keyed by the payload's `taskId`
const REPLAYED_PREFIXES: [&str; 2] = ["snapshot:", "restore:"];

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub event_type: String,
    pub payload: Value,
    pub timestamp: i64,
}

#[derive(Clone)]
pub struct UiBroadcaster {
    tx: broadcast::Sender<String>,
    queue: Arc<DashMap<String, VecDeque<QueuedMessage>>>,
}

impl Default for UiBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl UiBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            queue: Arc::new(DashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn broadcast(&self, event_type: &str, payload: Value) {
        let msg = encode(event_type, &payload);

        if REPLAYED_PREFIXES.iter().any(|p| event_type.starts_with(p)) {
            if let Some(task_id) = payload.get("taskId").and_then(|v| v.as_str()) {
                let mut entry = self.queue.entry(task_id.to_string()).or_default();
                entry.push_back(QueuedMessage {
                    event_type: event_type.to_string(),
                    payload: payload.clone(),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                });
                if entry.len() > MAX_QUEUE_PER_TASK {
                    entry.pop_front();
                }
            }
        }

        // No subscribers is not an error
        let _ = self.tx.send(msg);
    }

    pub fn get_queued_messages(&self, task_id: &str, since: i64) -> Vec<QueuedMessage> {
        self.queue
            .get(task_id)
            .map(|q| q.iter().filter(|m| m.timestamp > since).cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the replay queue of a finished task
    pub fn forget(&self, task_id: &str) {
        self.queue.remove(task_id);
    }

    /// Keep a finished task's events replayable for a while, then drop them.
    pub fn forget_after(&self, task_id: &str, delay: Duration) {
        let ui = self.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            ui.forget(&task_id);
        });
    }
}

fn encode(event_type: &str, payload: &Value) -> String {
    serde_json::json!({
        "type": event_type,
        "payload": payload,
    })
    .to_string()
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ui_socket(socket, state))
}

async fn handle_ui_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.ui.subscribe();
    let (replay_tx, mut replay_rx) = mpsc::channel::<String>(MAX_QUEUE_PER_TASK);

    // Forward broadcasts, plus replays requested by this client only
    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                msg = rx.recv() => match msg {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "UI client lagged behind broadcasts");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(msg) = replay_rx.recv() => msg,
            };
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    let ui = state.ui.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let Message::Text(text) = msg else { continue };
            let Ok(parsed) = serde_json::from_str::<Value>(&text) else { continue };
            if parsed.get("type").and_then(|t| t.as_str()) != Some("replay:request") {
                continue;
            }
            let Some(payload) = parsed.get("payload") else { continue };
            let task_id = payload.get("taskId").and_then(|v| v.as_str()).unwrap_or("");
            let since = payload.get("since").and_then(|v| v.as_i64()).unwrap_or(0);
            for m in ui.get_queued_messages(task_id, since) {
                if replay_tx.send(encode(&m.event_type, &m.payload)).await.is_err() {
                    return;
                }
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_task_events_are_queued_for_replay() {
        let ui = UiBroadcaster::new();
        let mut rx = ui.subscribe();

        ui.broadcast("snapshot:progress", json!({ "taskId": "t1", "progress": 0.5 }));
        ui.broadcast("plan:created", json!({ "planId": "p1" }));

        let first: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "snapshot:progress");
        assert_eq!(first["payload"]["progress"], 0.5);

        assert_eq!(ui.get_queued_messages("t1", 0).len(), 1);
        assert!(ui.get_queued_messages("p1", 0).is_empty());

        ui.forget("t1");
        assert!(ui.get_queued_messages("t1", 0).is_empty());
    }

    #[test]
    fn test_queue_is_bounded() {
        let ui = UiBroadcaster::new();
        for i in 0..(MAX_QUEUE_PER_TASK + 10) {
            ui.broadcast("restore:progress", json!({ "taskId": "r1", "n": i }));
        }
        let queued = ui.get_queued_messages("r1", 0);
        assert_eq!(queued.len(), MAX_QUEUE_PER_TASK);
        assert_eq!(queued[0].payload["n"], 10);
    }
}
