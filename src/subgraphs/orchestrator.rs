//! Master Orchestrator and Error Handler (4.12): composes the subgraphs,
//! in order, into one scan run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::config::{EngineConfig, HitlDecision};
use crate::error::{EngineError, NodeError};
use crate::node::Node;
use crate::persistence::ScanResultStore;
use crate::registry::ScanRegistry;
use crate::sandbox::{ProcessSandbox, SandboxBackend};
use crate::state::{build_initial_state, ScanState};
use crate::subgraphs::{analysis, cleanup, correlation, execution, hitl, observability, setup, validation};
use crate::types::Phase;

/// Resolves a pending HITL decision from the registry's shared map; the
/// `POST /scan/{id}/hitl-decision` handler writes into the same registry.
struct RegistryDecisionProvider {
    registry: ScanRegistry,
}

#[async_trait]
impl hitl::DecisionProvider for RegistryDecisionProvider {
    async fn poll(&self, scan_id: &str) -> Option<HitlDecision> {
        self.registry.peek_decision(scan_id).await
    }
}

/// Shared collaborators a scan run needs; constructed once per process and
/// passed to every `run_scan` invocation.
#[derive(Clone)]
pub struct EngineContext {
    pub config: EngineConfig,
    pub backend: Arc<dyn SandboxBackend>,
    pub http: reqwest::Client,
    pub store: ScanResultStore,
}

impl EngineContext {
    pub async fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let store = ScanResultStore::connect(&config.scan_db_path)
            .await
            .map_err(EngineError::Persistence)?;
        Ok(Self {
            backend: Arc::new(ProcessSandbox),
            http: reqwest::Client::new(),
            store,
            config,
        })
    }
}

/// Appends a canonical error if none exists, records an incomplete
/// persistence attempt, force-removes the volume if it is still present,
/// and leaves `phase = error` (4.12).
async fn run_error_handler(state: &ScanState, backend: &Arc<dyn SandboxBackend>) -> Result<ScanState, NodeError> {
    let mut current = state.clone();

    if current.errors.is_empty() {
        current = current.merge(|s| {
            s.errors.push(
                json!({
                    "component": "error_handler",
                    "code": "unspecified_failure",
                    "reason": "scan routed to the error handler without a recorded cause",
                    "exit_code": 1,
                    "stderr": "",
                })
                .to_string(),
            );
        })?;
    }

    if !current.cleanup_status.persistence_completed {
        current = current.merge(|s| {
            s.errors.push(
                json!({
                    "component": "error_handler",
                    "code": "persistence_incomplete",
                    "reason": "persistence never completed for this scan",
                    "exit_code": 1,
                    "stderr": "",
                })
                .to_string(),
            );
        })?;
    }

    if !current.cleanup_status.volume_removed {
        current = cleanup::run_volume_cleanup(&current, backend).await?;
    }

    Ok(current.merge(|s| {
        s.phase = Phase::Error;
    })?)
}

fn has_error(state: &ScanState) -> bool {
    matches!(state.phase, Phase::Error) || !state.errors.is_empty()
}

/// Runs one end-to-end scan: Validation/Init → Setup → { HITL branch |
/// Analysis → Correlation → Execution } → Cleanup → Observability.
pub async fn run_scan(
    ctx: &EngineContext,
    registry: &ScanRegistry,
    repo_url: &str,
    project_id: &str,
    github_token: Option<String>,
) -> Result<ScanState, EngineError> {
    let mut state = build_initial_state(repo_url, project_id, github_token);
    registry.record_state(&state).await;

    let validation_nodes: Vec<Box<dyn Node>> = vec![
        Box::new(validation::RequestValidatorNode),
        Box::new(validation::GithubAuthNode { client: ctx.http.clone() }),
        Box::new(validation::StateInitializerNode),
    ];

    state = match crate::node::run_pipeline(&validation_nodes, state).await {
        Ok(s) => s,
        Err(e) => return Err(EngineError::Node(e)),
    };
    registry.record_state(&state).await;

    if has_error(&state) {
        state = run_error_handler(&state, &ctx.backend).await.map_err(EngineError::Node)?;
        registry.record_state(&state).await;
        return Ok(state);
    }

    let setup_nodes: Vec<Box<dyn Node>> = vec![
        Box::new(setup::VolumeCreatorNode { backend: ctx.backend.clone() }),
        Box::new(setup::ClonerNode {
            backend: ctx.backend.clone(),
            http: ctx.http.clone(),
        }),
        Box::new(setup::CodebaseStatsNode { backend: ctx.backend.clone() }),
        Box::new(setup::MemoryLoaderNode),
        Box::new(setup::SizeCheckerNode),
    ];

    state = crate::node::run_pipeline(&setup_nodes, state).await.map_err(EngineError::Node)?;
    registry.record_state(&state).await;

    if has_error(&state) {
        state = run_error_handler(&state, &ctx.backend).await.map_err(EngineError::Node)?;
        registry.record_state(&state).await;
        return Ok(state);
    }

    if state.requires_hitl {
        state = hitl::run_prompt(&state).await.map_err(EngineError::Node)?;
        registry.record_state(&state).await;

        let provider = RegistryDecisionProvider { registry: registry.clone() };
        state = hitl::run_wait_for_decision(
            &state,
            &provider,
            Duration::from_secs(ctx.config.hitl_timeout_seconds),
            ctx.config.hitl_default_decision,
        )
        .await
        .map_err(EngineError::Node)?;
        registry.record_state(&state).await;

        if hitl::decision_of(&state) == HitlDecision::Approve {
            state = run_analysis_correlation_execution(&state, ctx).await?;
            registry.record_state(&state).await;
        }
    } else {
        state = run_analysis_correlation_execution(&state, ctx).await?;
        registry.record_state(&state).await;
    }

    if has_error(&state) {
        state = run_error_handler(&state, &ctx.backend).await.map_err(EngineError::Node)?;
        registry.record_state(&state).await;
        return Ok(state);
    }

    state = cleanup::run_result_persister(&state, &ctx.store).await.map_err(EngineError::Node)?;
    state = cleanup::run_volume_cleanup(&state, &ctx.backend).await.map_err(EngineError::Node)?;
    registry.record_state(&state).await;

    state = observability::run_observability(&state).await.map_err(EngineError::Node)?;

    if !state.cleanup_status.persistence_completed {
        state = run_error_handler(&state, &ctx.backend).await.map_err(EngineError::Node)?;
    } else {
        state = state
            .merge(|s| s.phase = Phase::Completed)
            .map_err(|e| EngineError::Node(NodeError::from(e)))?;
    }

    registry.record_state(&state).await;
    Ok(state)
}

async fn run_analysis_correlation_execution(state: &ScanState, ctx: &EngineContext) -> Result<ScanState, EngineError> {
    let mut current = analysis::run_analysis_subgraph(state, ctx.backend.clone(), &ctx.config.sandbox_image)
        .await
        .map_err(EngineError::Node)?;

    if has_error(&current) {
        return Ok(current);
    }

    let correlation_nodes: Vec<Box<dyn Node>> = vec![
        Box::new(correlation::BaseScorerNode),
        Box::new(correlation::CorrelationApplierNode),
        Box::new(correlation::SpawnDeciderNode),
        Box::new(correlation::TechStackFilterNode),
        Box::new(correlation::ExecutionPlannerNode),
    ];
    current = crate::node::run_pipeline(&correlation_nodes, current).await.map_err(EngineError::Node)?;

    if has_error(&current) {
        return Ok(current);
    }

    current = execution::run_execution_subgraph(&current, ctx.backend.clone(), &ctx.config.sandbox_image)
        .await
        .map_err(EngineError::Node)?;

    if has_error(&current) {
        return Ok(current);
    }

    crate::subgraphs::dedup::run_dedup_subgraph(&current).await.map_err(EngineError::Node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxError;
    use crate::sandbox::{SandboxOutput, SandboxRequest};

    struct EmptyFindingsBackend;

    #[async_trait::async_trait]
    impl SandboxBackend for EmptyFindingsBackend {
        async fn run(&self, _req: SandboxRequest) -> Result<SandboxOutput, SandboxError> {
            Ok(SandboxOutput {
                exit_code: 0,
                stdout: r#"{"findings":[]}"#.to_string(),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn invalid_url_routes_straight_to_error_handler() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("scan.sqlite3");
        let store = ScanResultStore::connect(db_path.to_str().unwrap()).await.unwrap();

        let ctx = EngineContext {
            config: EngineConfig::default(),
            backend: Arc::new(EmptyFindingsBackend),
            http: reqwest::Client::new(),
            store,
        };
        let registry = ScanRegistry::new();

        let final_state = run_scan(&ctx, &registry, "ftp://not-a-real-host", "proj-1", None).await.unwrap();
        assert_eq!(final_state.phase, Phase::Error);
        assert!(!final_state.errors.is_empty());
        assert!(final_state.cleanup_status.volume_removed);
    }
}
