//! Analysis Subgraph (4.6): **Planner → AST/Regex/Dependency/Config
//! scanners → Aggregator → (Reflector → optional Targeted Rescan →
//! Aggregator) → Mapper**.
//!
//! The reflector/rescan/aggregator cycle is the spec's one bounded loop;
//! `rescans_triggered` is the one-way latch that bounds it to a single
//! iteration (§3, §8).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::error::NodeError;
use crate::owasp::map_category_hint;
use crate::sandbox::SandboxBackend;
use crate::state::{Finding, ScanState};
use crate::tool_runtime::run_tool;
use crate::types::{Phase, PhaseStatus};

const REQUIRED_SCANNERS: &[&str] = &["ast", "regex", "dependency", "config"];
const SCAN_TIMEOUT: Duration = Duration::from_secs(90);

/// Inspects the workspace for source extensions, dependency manifests, and
/// config files; advisory telemetry only — scanners always run regardless.
pub async fn run_planner(state: &ScanState, backend: &Arc<dyn SandboxBackend>, image: &str) -> Result<ScanState, NodeError> {
    let Some(workspace) = state.repo_path.clone() else {
        return Err(NodeError::MissingInput {
            node: "planner",
            what: "repo_path",
        });
    };

    let envelope = run_tool(backend, image, "analysis_plan_probe", &workspace, Duration::from_secs(30)).await;
    let plan = json!({
        "scanners_planned": REQUIRED_SCANNERS,
        "probe_status": format!("{:?}", envelope.status),
    });

    Ok(state.merge(|s| {
        s.phase = Phase::Analysis;
        s.analysis_phase = PhaseStatus::Running;
        s.repo_metadata.insert("analysis_plan".to_string(), plan);
    })?)
}

async fn run_scanner(
    state: &ScanState,
    backend: &Arc<dyn SandboxBackend>,
    image: &str,
    scanner: &str,
) -> Result<ScanState, NodeError> {
    let Some(workspace) = state.repo_path.clone() else {
        return Err(NodeError::MissingInput {
            node: scanner_node_name(scanner),
            what: "repo_path",
        });
    };

    let envelope = run_tool(backend, image, scanner, &workspace, SCAN_TIMEOUT).await;

    let raw = json!({
        "tool": envelope.tool,
        "findings": envelope.findings.iter().map(finding_to_value).collect::<Vec<_>>(),
        "source_tool": scanner,
    });

    Ok(state.merge(|s| {
        s.raw_tool_outputs.push(raw);
    })?)
}

fn scanner_node_name(scanner: &str) -> &'static str {
    match scanner {
        "ast" => "ast_scanner",
        "regex" => "regex_scanner",
        "dependency" => "dependency_scanner",
        "config" => "config_scanner",
        _ => "scanner",
    }
}

fn finding_to_value(f: &Finding) -> serde_json::Value {
    serde_json::to_value(f).unwrap_or(serde_json::Value::Null)
}

/// Flattens `raw_tool_outputs`, normalizes, and dedups by
/// `(scanner, type, file, line)` preserving first occurrence.
pub async fn run_aggregator(state: &ScanState) -> Result<ScanState, NodeError> {
    let mut seen = BTreeSet::new();
    let mut normalized = Vec::new();

    for (envelope_idx, envelope) in state.raw_tool_outputs.iter().enumerate() {
        let scanner = envelope.get("source_tool").and_then(|v| v.as_str()).unwrap_or("unknown");
        let findings = envelope.get("findings").and_then(|v| v.as_array()).cloned().unwrap_or_default();

        for (idx, raw) in findings.into_iter().enumerate() {
            let mut finding: Finding = serde_json::from_value(raw).map_err(NodeError::Serde)?;
            let signature = (
                scanner.to_string(),
                finding.category.clone(),
                finding.file_path.clone(),
                finding.line_number,
            );
            if !seen.insert(signature) {
                continue;
            }
            finding.id = format!("{}-{scanner}-{envelope_idx}-{idx}", state.scan_id);
            normalized.push(finding);
        }
    }

    Ok(state.merge(|s| {
        s.normalized_findings = normalized;
    })?)
}

/// Compares tools seen against the required set; if a rescan already
/// occurred, gaps are forced empty (the one-way latch).
pub async fn run_reflector(state: &ScanState) -> Result<ScanState, NodeError> {
    if state.rescans_triggered {
        return Ok(state.merge(|s| {
            s.coverage_gaps.clear();
        })?);
    }

    let seen: BTreeSet<&str> = state
        .raw_tool_outputs
        .iter()
        .filter_map(|e| e.get("source_tool").and_then(|v| v.as_str()))
        .collect();

    let gaps: Vec<String> = REQUIRED_SCANNERS
        .iter()
        .filter(|scanner| !seen.contains(*scanner))
        .map(|s| s.to_string())
        .collect();

    Ok(state.merge(|s| {
        s.coverage_gaps = gaps;
    })?)
}

/// Re-invokes only the scanners named in `coverage_gaps`; keeps findings
/// that carry a concrete evidence ref and a non-generic category hint.
/// Sets the one-way `rescans_triggered` latch.
pub async fn run_targeted_rescan(
    state: &ScanState,
    backend: &Arc<dyn SandboxBackend>,
    image: &str,
) -> Result<ScanState, NodeError> {
    if state.coverage_gaps.is_empty() {
        return Ok(state.clone());
    }

    let mut current = state.clone();
    for scanner in state.coverage_gaps.clone() {
        let Some(workspace) = current.repo_path.clone() else {
            return Err(NodeError::MissingInput {
                node: "targeted_rescan",
                what: "repo_path",
            });
        };

        let envelope = run_tool(backend, image, &scanner, &workspace, SCAN_TIMEOUT).await;
        let filtered: Vec<Finding> = envelope
            .findings
            .into_iter()
            .filter(|f| !f.file_path.is_empty() && f.line_number > 0 && map_category_hint(&f.category) != crate::owasp::DEFAULT_CATEGORY)
            .map(|mut f| {
                f.origin_parser = "source_tool".to_string();
                f
            })
            .collect();

        let raw = json!({
            "tool": scanner,
            "findings": filtered.iter().map(finding_to_value).collect::<Vec<_>>(),
            "source_tool": scanner,
        });

        current = current.merge(|s| {
            s.raw_tool_outputs.push(raw);
        })?;
    }

    Ok(current.merge(|s| {
        s.rescans_triggered = true;
        s.coverage_gaps.clear();
        s.analysis_stage = "signals_aggregated_after_rescan".to_string();
    })?)
}

/// Groups normalized findings by the category-hint table (OWASP Top 10
/// 2021); unknown hints default to `A04:2021-Insecure Design`.
pub async fn run_mapper(state: &ScanState) -> Result<ScanState, NodeError> {
    let mut owasp_mapped: std::collections::HashMap<String, Vec<Finding>> = std::collections::HashMap::new();
    for finding in &state.normalized_findings {
        let category = map_category_hint(&finding.category).to_string();
        owasp_mapped.entry(category).or_default().push(finding.clone());
    }

    Ok(state.merge(|s| {
        s.owasp_mapped = owasp_mapped;
        s.phase = Phase::AnalysisCompleted;
        s.analysis_phase = PhaseStatus::Completed;
        s.analysis_stage = "mapped".to_string();
    })?)
}

/// Runs the full subgraph including the bounded reflector/rescan cycle.
pub async fn run_analysis_subgraph(
    state: &ScanState,
    backend: Arc<dyn SandboxBackend>,
    image: &str,
) -> Result<ScanState, NodeError> {
    let mut current = run_planner(state, &backend, image).await?;

    for scanner in REQUIRED_SCANNERS {
        current = run_scanner(&current, &backend, image, scanner).await?;
    }

    current = run_aggregator(&current).await?;
    current = run_reflector(&current).await?;

    if !current.coverage_gaps.is_empty() {
        current = run_targeted_rescan(&current, &backend, image).await?;
        current = run_aggregator(&current).await?;
    }

    run_mapper(&current).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::build_initial_state;

    #[tokio::test]
    async fn aggregator_dedups_by_scanner_category_file_line() {
        let mut state = build_initial_state("https://github.com/o/r", "p", None);
        let finding = Finding {
            id: "x".to_string(),
            category: "A03:2021-Injection".to_string(),
            title: "t".to_string(),
            severity: "high".to_string(),
            evidence: "e".to_string(),
            tool_provenance: "regex".to_string(),
            confidence: 0.6,
            reasoning: "r".to_string(),
            origin_parser: "strict_json".to_string(),
            file_path: "a.py".to_string(),
            line_number: 10,
        };
        let raw = json!({"tool":"regex","source_tool":"regex","findings":[finding_to_value(&finding), finding_to_value(&finding)]});
        state = state.merge(|s| s.raw_tool_outputs.push(raw)).unwrap();

        let next = run_aggregator(&state).await.unwrap();
        assert_eq!(next.normalized_findings.len(), 1);
    }

    #[tokio::test]
    async fn reflector_forces_empty_gaps_once_rescanned() {
        let mut state = build_initial_state("https://github.com/o/r", "p", None);
        state = state.merge(|s| s.rescans_triggered = true).unwrap();
        let next = run_reflector(&state).await.unwrap();
        assert!(next.coverage_gaps.is_empty());
    }

    #[tokio::test]
    async fn mapper_defaults_unknown_category_hint() {
        let mut state = build_initial_state("https://github.com/o/r", "p", None);
        let finding = Finding {
            id: "x".to_string(),
            category: "mystery".to_string(),
            title: "t".to_string(),
            severity: "low".to_string(),
            evidence: "e".to_string(),
            tool_provenance: "regex".to_string(),
            confidence: 0.6,
            reasoning: "r".to_string(),
            origin_parser: "strict_json".to_string(),
            file_path: "a.py".to_string(),
            line_number: 1,
        };
        state = state.merge(|s| s.normalized_findings.push(finding)).unwrap();
        let next = run_mapper(&state).await.unwrap();
        assert!(next.owasp_mapped.contains_key(crate::owasp::DEFAULT_CATEGORY));
    }
}
