//! Cleanup Subgraph (4.10): **Result Persister → Volume Cleanup**.

use std::sync::Arc;

use serde_json::json;

use crate::error::NodeError;
use crate::persistence::{PersistedRow, ScanResultStore};
use crate::sandbox::{SandboxBackend, SandboxRequest};
use crate::state::ScanState;

/// Idempotent INSERT-if-absent persistence write. On failure, appends an
/// error but does not abort cleanup (4.10, §7).
pub async fn run_result_persister(state: &ScanState, store: &ScanResultStore) -> Result<ScanState, NodeError> {
    let status = if state.errors.is_empty() { "completed" } else { "failed" };
    let findings_json = serde_json::to_string(&state.intelligent_findings).map_err(NodeError::Serde)?;

    let row = PersistedRow {
        project_id: state.project_id.clone(),
        status: status.to_string(),
        phase: state.phase.to_string(),
        persisted_count: state.intelligent_findings.len() as u64,
        findings_json,
        created_at: state.created_at.to_rfc3339(),
        updated_at: state.updated_at.to_rfc3339(),
    };

    match store.persist_if_absent(&state.scan_id, row).await {
        Ok(count) => Ok(state.merge(|s| {
            s.cleanup_status.persistence_completed = true;
            s.cleanup_status.persisted_count = count;
        })?),
        Err(e) => Ok(state.merge(|s| {
            s.errors.push(
                json!({
                    "component": "result_persister",
                    "code": "persistence_failed",
                    "reason": e.to_string(),
                    "exit_code": 1,
                    "stderr": "",
                })
                .to_string(),
            );
        })?),
    }
}

/// Removes the named workspace volume; "not found" counts as success.
/// Non-fatal to the workflow otherwise — the Error Handler retries forced
/// removal if the volume was left behind.
pub async fn run_volume_cleanup(state: &ScanState, backend: &Arc<dyn SandboxBackend>) -> Result<ScanState, NodeError> {
    let Some(volume) = state.docker_volumes.get("code").cloned() else {
        return Ok(state.merge(|s| {
            s.cleanup_status.volume_removed = true;
            s.cleanup_status.completed = true;
        })?);
    };

    let request = SandboxRequest::new(
        "alpine",
        vec!["rm".to_string(), "-rf".to_string(), "/workspace".to_string()],
        &volume,
    )
    .read_write();

    let removed = match backend.run(request).await {
        Ok(output) if output.exit_code == 0 => true,
        Ok(output) => {
            output.stderr.to_lowercase().contains("not found") || output.stderr.to_lowercase().contains("no such volume")
        }
        Err(_) => false,
    };

    Ok(state.merge(|s| {
        if removed {
            s.cleanup_status.volume_removed = true;
        } else {
            s.errors.push(
                json!({
                    "component": "volume_cleanup",
                    "code": "volume_removal_failed",
                    "reason": "volume removal did not report success",
                    "exit_code": 1,
                    "stderr": "",
                })
                .to_string(),
            );
        }
        s.cleanup_status.completed = true;
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::build_initial_state;

    #[tokio::test]
    async fn persisting_twice_keeps_persisted_count_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.sqlite3");
        let store = ScanResultStore::connect(path.to_str().unwrap()).await.unwrap();

        let state = build_initial_state("https://github.com/o/r", "p", None);
        let once = run_result_persister(&state, &store).await.unwrap();
        let twice = run_result_persister(&once, &store).await.unwrap();

        assert_eq!(once.cleanup_status.persisted_count, twice.cleanup_status.persisted_count);
    }

    #[tokio::test]
    async fn volume_cleanup_with_no_volume_is_trivially_complete() {
        struct Unused;
        #[async_trait::async_trait]
        impl SandboxBackend for Unused {
            async fn run(&self, _req: SandboxRequest) -> Result<crate::sandbox::SandboxOutput, crate::error::SandboxError> {
                unreachable!("no volume means the backend is never invoked")
            }
        }

        let state = build_initial_state("https://github.com/o/r", "p", None);
        let backend: Arc<dyn SandboxBackend> = Arc::new(Unused);
        let next = run_volume_cleanup(&state, &backend).await.unwrap();
        assert!(next.cleanup_status.volume_removed);
    }
}
