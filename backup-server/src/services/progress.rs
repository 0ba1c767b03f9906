use backup_engine::tasks::{Progress, TaskHandle};
use serde_json::json;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::ws::ui::UiBroadcaster;

const MIN_BROADCAST_INTERVAL: Duration = Duration::from_millis(500);

/// Progress sink that records into the task table and throttles
/// `<kind>:progress` events to the UI.
pub struct BroadcastProgress {
    handle: TaskHandle,
    ui: UiBroadcaster,
    event: String,
    last_sent: Mutex<Option<Instant>>,
}

impl BroadcastProgress {
    pub fn new(handle: TaskHandle, ui: UiBroadcaster, kind: &str) -> Self {
        Self {
            handle,
            ui,
            event: format!("{kind}:progress"),
            last_sent: Mutex::new(None),
        }
    }

    fn should_send(&self, finished: bool) -> bool {
        let mut last = self.last_sent.lock().unwrap_or_else(|e| e.into_inner());
        let due = finished || last.map_or(true, |t| t.elapsed() >= MIN_BROADCAST_INTERVAL);
        if due {
            *last = Some(Instant::now());
        }
        due
    }
}

impl Progress for BroadcastProgress {
    fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    fn set_message(&self, message: &str) {
        self.handle.set_message(message);
        self.ui.broadcast(
            &self.event,
            json!({ "taskId": self.handle.id(), "message": message }),
        );
    }

    fn report(&self, processed: usize, total: usize, current: Option<&str>) {
        self.handle.report(processed, total, current);
        if !self.should_send(processed >= total) {
            return;
        }
        let progress = self.handle.snapshot().map(|t| t.progress).unwrap_or(0.0);
        self.ui.broadcast(
            &self.event,
            json!({
                "taskId": self.handle.id(),
                "progress": progress,
                "processed": processed,
                "total": total,
                "current": current,
            }),
        );
    }
}
