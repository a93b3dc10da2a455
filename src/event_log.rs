//! Structured event emission for node-level progress logging.
//!
//! Generalizes the teacher's event-bus sink abstraction down to what this
//! engine needs: an ordered, in-memory record of `{scan_id, component,
//! message}` lines per scan, mirrored into `tracing` at the same time.

use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, serde::Serialize)]
pub struct LogEvent {
    pub scan_id: String,
    pub component: &'static str,
    pub message: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Per-scan append-only event sink, mirrored into `tracing::info!`.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    inner: Arc<Mutex<Vec<LogEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn log(&self, scan_id: &str, component: &'static str, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(scan_id, component, "{message}");
        self.inner.lock().await.push(LogEvent {
            scan_id: scan_id.to_string(),
            component,
            message,
            at: chrono::Utc::now(),
        });
    }

    pub async fn snapshot(&self) -> Vec<LogEvent> {
        self.inner.lock().await.clone()
    }
}
