//! Execution Subgraph (4.8): **Coordinator → per-category subgraph
//! (selector → prioritizer → sandbox executor → recorder → aggregator →
//! evaluator) → Merger**, then the Smart-Dedup Subgraph.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::NodeError;
use crate::owasp::{tool_weight, tools_for_category};
use crate::sandbox::SandboxBackend;
use crate::state::{CategoryResult, ScanState, ToolExecutionRecord};
use crate::tool_runtime::{run_tool, ToolStatus};
use crate::types::{Phase, PhaseStatus};

const TOOL_TIMEOUT: Duration = Duration::from_secs(120);
const COMPLETED_CONFIDENCE_THRESHOLD: f64 = 0.6;

/// Runs one category's tool battery: selector → prioritizer → executor →
/// recorder → aggregator → evaluator, all inlined since each step is a
/// cheap pure transform over the same intermediate values.
async fn run_category_subgraph(
    state: &ScanState,
    backend: &Arc<dyn SandboxBackend>,
    image: &str,
    category: &str,
    order: u32,
    score: f64,
) -> CategoryResult {
    let mut tools = tools_for_category(category);
    tools.sort_by(|a, b| tool_weight(b).cmp(&tool_weight(a)));

    let Some(workspace) = state.repo_path.clone() else {
        return CategoryResult {
            category: category.to_string(),
            order,
            score,
            category_status: "low_confidence".to_string(),
            category_confidence: 0.0,
            execution_record: Vec::new(),
            aggregated_findings: Vec::new(),
        };
    };

    let mut execution_record = Vec::new();
    let mut aggregated_findings = Vec::new();

    for tool in tools {
        let started = Instant::now();
        let envelope = run_tool(backend, image, tool, &workspace, TOOL_TIMEOUT).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let confidence = if envelope.status == ToolStatus::Completed {
            envelope.findings.iter().map(|f| f.confidence).sum::<f64>() / envelope.findings.len().max(1) as f64
        } else {
            0.0
        };

        execution_record.push(ToolExecutionRecord {
            tool_name: tool.to_string(),
            execution_time_ms: elapsed_ms,
            status: format!("{:?}", envelope.status).to_lowercase(),
            confidence,
            finding_count: envelope.findings.len(),
        });

        aggregated_findings.extend(envelope.findings);
    }

    let avg_confidence = if aggregated_findings.is_empty() {
        0.0
    } else {
        aggregated_findings.iter().map(|f| f.confidence).sum::<f64>() / aggregated_findings.len() as f64
    };

    let category_status = if avg_confidence >= COMPLETED_CONFIDENCE_THRESHOLD {
        "completed"
    } else {
        "low_confidence"
    };

    CategoryResult {
        category: category.to_string(),
        order,
        score,
        category_status: category_status.to_string(),
        category_confidence: avg_confidence,
        execution_record,
        aggregated_findings,
    }
}

/// Validates the plan is non-empty and aligned with `filtered_categories`;
/// routes directly to the merger with an empty result set otherwise.
pub async fn run_execution_subgraph(
    state: &ScanState,
    backend: Arc<dyn SandboxBackend>,
    image: &str,
) -> Result<ScanState, NodeError> {
    let mut current = state.merge(|s| {
        s.phase = Phase::ExecutionPhase;
        s.execution_phase = PhaseStatus::Running;
    })?;

    let aligned = !current.execution_plan.is_empty()
        && current
            .execution_plan
            .iter()
            .all(|entry| current.filtered_categories.contains(&entry.category));

    let layer6_results = if aligned {
        let mut results = Vec::with_capacity(current.execution_plan.len());
        for entry in current.execution_plan.clone() {
            let result = run_category_subgraph(&current, &backend, image, &entry.category, entry.order, entry.score).await;
            results.push(result);
        }
        results
    } else {
        Vec::new()
    };

    current = current.merge(|s| {
        s.layer6_results = layer6_results;
    })?;

    current = run_merger(&current).await?;

    current = current.merge(|s| {
        s.phase = Phase::ExecutionCompleted;
        s.execution_phase = PhaseStatus::Completed;
        s.execution_stage = "merged".to_string();
    })?;

    Ok(current)
}

/// Concatenates Layer-4 normalized findings with all category-aggregated
/// findings into `final_findings`.
pub async fn run_merger(state: &ScanState) -> Result<ScanState, NodeError> {
    let mut final_findings = state.normalized_findings.clone();
    for category_result in &state.layer6_results {
        final_findings.extend(category_result.aggregated_findings.clone());
    }

    Ok(state.merge(|s| {
        s.final_findings = final_findings;
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxError;
    use crate::sandbox::{SandboxOutput, SandboxRequest};
    use crate::state::{build_initial_state, ExecutionPlanEntry};
    use async_trait::async_trait;

    struct AlwaysEmpty;

    #[async_trait]
    impl SandboxBackend for AlwaysEmpty {
        async fn run(&self, _req: SandboxRequest) -> Result<SandboxOutput, SandboxError> {
            Ok(SandboxOutput {
                exit_code: 0,
                stdout: r#"{"findings":[]}"#.to_string(),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn misaligned_plan_short_circuits_to_empty_results() {
        let mut state = build_initial_state("https://github.com/o/r", "p", None);
        state = state
            .merge(|s| {
                s.execution_plan = vec![ExecutionPlanEntry {
                    order: 1,
                    category: "A03".to_string(),
                    score: 0.5,
                }];
                s.filtered_categories = vec!["A01".to_string()];
            })
            .unwrap();

        let backend: Arc<dyn SandboxBackend> = Arc::new(AlwaysEmpty);
        let next = run_execution_subgraph(&state, backend, "img").await.unwrap();
        assert!(next.layer6_results.is_empty());
    }

    #[tokio::test]
    async fn merger_concatenates_normalized_and_category_findings() {
        let state = build_initial_state("https://github.com/o/r", "p", None);
        let next = run_merger(&state).await.unwrap();
        assert!(next.final_findings.is_empty());
    }
}
