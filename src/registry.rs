//! Concurrency & Resource Model (§5): the scan registry.
//!
//! Multiple scans run in parallel as independent tasks; each scan owns
//! exclusive state, guarded collectively by one mutex covering the
//! registry/task/ephemeral-token maps, matching the spec's "single-writer
//! cooperative per scan" model.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::HitlDecision;
use crate::state::ScanState;

#[derive(Debug, Clone)]
pub struct ScanHandle {
    pub latest_state: ScanState,
}

#[derive(Default)]
struct Inner {
    handles: HashMap<String, ScanHandle>,
    tasks: HashMap<String, JoinHandle<()>>,
    /// Ephemeral credentials, popped at the moment of graph invocation and
    /// never persisted into `ScanState`.
    ephemeral_tokens: HashMap<String, String>,
    /// Decisions submitted through `POST /scan/{id}/hitl-decision`, polled
    /// by the HITL subgraph's wait-for-decision step.
    hitl_decisions: HashMap<String, HitlDecision>,
}

/// Guards the registry/task/ephemeral-token maps collectively; every read
/// returns an immutable snapshot.
#[derive(Clone, Default)]
pub struct ScanRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl ScanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_token(&self, scan_id: &str, token: String) {
        self.inner.lock().await.ephemeral_tokens.insert(scan_id.to_string(), token);
    }

    /// Pops the ephemeral token at graph-invocation time; it is never
    /// written back.
    pub async fn take_token(&self, scan_id: &str) -> Option<String> {
        self.inner.lock().await.ephemeral_tokens.remove(scan_id)
    }

    pub async fn record_state(&self, state: &ScanState) {
        self.inner.lock().await.handles.insert(
            state.scan_id.clone(),
            ScanHandle {
                latest_state: state.clone(),
            },
        );
    }

    pub async fn get(&self, scan_id: &str) -> Option<ScanHandle> {
        self.inner.lock().await.handles.get(scan_id).cloned()
    }

    pub async fn track_task(&self, scan_id: &str, handle: JoinHandle<()>) {
        self.inner.lock().await.tasks.insert(scan_id.to_string(), handle);
    }

    /// Cancels a running scan task at its current suspension point. The
    /// Error Handler still runs to attempt forced cleanup in that case; see
    /// `subgraphs::orchestrator`.
    pub async fn cancel(&self, scan_id: &str) -> bool {
        if let Some(handle) = self.inner.lock().await.tasks.remove(scan_id) {
            handle.abort();
            true
        } else {
            false
        }
    }

    /// Called by the `POST /scan/{id}/hitl-decision` handler.
    pub async fn submit_decision(&self, scan_id: &str, decision: HitlDecision) {
        self.inner.lock().await.hitl_decisions.insert(scan_id.to_string(), decision);
    }

    /// Polled by the HITL subgraph's wait-for-decision step; does not
    /// remove the entry so repeated polls see the same answer.
    pub async fn peek_decision(&self, scan_id: &str) -> Option<HitlDecision> {
        self.inner.lock().await.hitl_decisions.get(scan_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::build_initial_state;

    #[tokio::test]
    async fn ephemeral_tokens_are_popped_not_read_back() {
        let registry = ScanRegistry::new();
        registry.insert_token("scan-1", "ghp_secret".to_string()).await;
        assert_eq!(registry.take_token("scan-1").await, Some("ghp_secret".to_string()));
        assert_eq!(registry.take_token("scan-1").await, None);
    }

    #[tokio::test]
    async fn record_and_get_round_trips_latest_state() {
        let registry = ScanRegistry::new();
        let state = build_initial_state("https://github.com/o/r", "p", None);
        registry.record_state(&state).await;
        let handle = registry.get(&state.scan_id).await.unwrap();
        assert_eq!(handle.latest_state.scan_id, state.scan_id);
    }
}
