//! HITL Gate (4.13): prompt → wait-for-decision (bounded, poll interval
//! ~2s, default `reject`) → apply decision.

use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use crate::config::HitlDecision;
use crate::error::NodeError;
use crate::state::ScanState;
use crate::types::{Phase, PhaseStatus};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// An external decision provider. The production surface is the
/// `POST /scan/{id}/hitl-decision` endpoint; tests and the CLI substitute a
/// fixed-answer or timing-out provider.
#[async_trait::async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn poll(&self, scan_id: &str) -> Option<HitlDecision>;
}

/// Marks Analysis/Correlation/Execution as `skipped` and records the
/// prompt envelope under `repo_metadata.hitl`.
pub async fn run_prompt(state: &ScanState) -> Result<ScanState, NodeError> {
    Ok(state.merge(|s| {
        s.phase = Phase::HitlWaiting;
        s.hitl_phase = PhaseStatus::Running;
        s.analysis_phase = PhaseStatus::Skipped;
        s.correlation_phase = PhaseStatus::Skipped;
        s.execution_phase = PhaseStatus::Skipped;
        s.repo_metadata.insert(
            "hitl".to_string(),
            json!({"prompted_at": s.updated_at, "reason": "repository exceeds size threshold"}),
        );
    })?)
}

/// Polls `provider` at `POLL_INTERVAL` until a decision arrives or
/// `timeout` elapses, in which case `default_decision` applies with
/// `decision_source="timeout_default"`.
pub async fn run_wait_for_decision(
    state: &ScanState,
    provider: &dyn DecisionProvider,
    timeout: Duration,
    default_decision: HitlDecision,
) -> Result<ScanState, NodeError> {
    let deadline = Instant::now() + timeout;
    let mut decision = None;
    let mut decision_source = "timeout_default";

    while Instant::now() < deadline {
        if let Some(d) = provider.poll(&state.scan_id).await {
            decision = Some(d);
            decision_source = "provider";
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    let resolved = decision.unwrap_or(default_decision);

    Ok(state.merge(|s| {
        s.phase = Phase::HitlResolved;
        s.hitl_phase = PhaseStatus::Completed;
        s.repo_metadata.insert(
            "hitl_decision".to_string(),
            json!({"decision": resolved.as_str(), "decision_source": decision_source}),
        );
    })?)
}

/// On `reject`, downstream analysis stays skipped and the scan proceeds
/// directly to Cleanup; on `approve`, control returns to the analysis path
/// (the orchestrator re-runs Analysis/Correlation/Execution).
pub fn decision_of(state: &ScanState) -> HitlDecision {
    state
        .repo_metadata
        .get("hitl_decision")
        .and_then(|v| v.get("decision"))
        .and_then(|v| v.as_str())
        .and_then(HitlDecision::parse)
        .unwrap_or(HitlDecision::Reject)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::build_initial_state;

    struct NeverAnswers;

    #[async_trait::async_trait]
    impl DecisionProvider for NeverAnswers {
        async fn poll(&self, _scan_id: &str) -> Option<HitlDecision> {
            None
        }
    }

    struct ImmediateApprove;

    #[async_trait::async_trait]
    impl DecisionProvider for ImmediateApprove {
        async fn poll(&self, _scan_id: &str) -> Option<HitlDecision> {
            Some(HitlDecision::Approve)
        }
    }

    #[tokio::test]
    async fn timeout_resolves_to_default_decision() {
        let state = build_initial_state("https://github.com/o/r", "p", None);
        let next = run_wait_for_decision(&state, &NeverAnswers, Duration::from_millis(10), HitlDecision::Reject)
            .await
            .unwrap();
        assert_eq!(decision_of(&next), HitlDecision::Reject);
        assert_eq!(
            next.repo_metadata["hitl_decision"]["decision_source"],
            json!("timeout_default")
        );
    }

    #[tokio::test]
    async fn provider_decision_wins_over_default() {
        let state = build_initial_state("https://github.com/o/r", "p", None);
        let next = run_wait_for_decision(&state, &ImmediateApprove, Duration::from_secs(5), HitlDecision::Reject)
            .await
            .unwrap();
        assert_eq!(decision_of(&next), HitlDecision::Approve);
    }

    #[tokio::test]
    async fn prompt_marks_downstream_phases_skipped() {
        let state = build_initial_state("https://github.com/o/r", "p", None);
        let next = run_prompt(&state).await.unwrap();
        assert_eq!(next.analysis_phase, PhaseStatus::Skipped);
        assert_eq!(next.correlation_phase, PhaseStatus::Skipped);
        assert_eq!(next.execution_phase, PhaseStatus::Skipped);
    }
}
