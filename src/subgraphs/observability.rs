//! Observability / Strategic Summary (4.11): non-blocking post-processing.
//! Any failure here is logged only and never flips the scan to error (§7).

use std::collections::HashMap;

use chrono::Duration as ChronoDuration;
use serde_json::json;

use crate::error::NodeError;
use crate::state::ScanState;

const PHASE_START_EVENTS: &[&str] = &["started", "running", "initialized"];
const PHASE_END_EVENTS: &[&str] = &["completed", "failed", "skipped"];

fn phase_durations(state: &ScanState) -> HashMap<String, i64> {
    let mut starts: HashMap<&str, chrono::DateTime<chrono::Utc>> = HashMap::new();
    let mut durations = HashMap::new();

    for entry in &state.phase_timeline {
        if PHASE_START_EVENTS.contains(&entry.event.as_str()) {
            starts.entry(entry.phase.as_str()).or_insert(entry.at);
        } else if PHASE_END_EVENTS.contains(&entry.event.as_str()) {
            if let Some(start) = starts.get(entry.phase.as_str()) {
                let delta: ChronoDuration = entry.at - *start;
                durations.insert(entry.phase.clone(), delta.num_milliseconds());
            }
        }
    }
    durations
}

fn risk_profile_score(state: &ScanState) -> f64 {
    if state.intelligent_findings.is_empty() {
        return 0.0;
    }
    let sum: f64 = state
        .intelligent_findings
        .iter()
        .map(|f| crate::types::Severity::parse(&f.severity).weight())
        .sum();
    sum / state.intelligent_findings.len() as f64
}

fn confidence_score(state: &ScanState) -> f64 {
    let weighted_sum: f64 = state
        .layer6_results
        .iter()
        .map(|r| r.category_confidence * r.aggregated_findings.len() as f64)
        .sum();
    let total_weight: f64 = state.layer6_results.iter().map(|r| r.aggregated_findings.len() as f64).sum();
    if total_weight == 0.0 {
        0.0
    } else {
        weighted_sum / total_weight
    }
}

fn noise_ratio(state: &ScanState) -> f64 {
    let regex_raw: usize = state
        .raw_tool_outputs
        .iter()
        .filter(|e| e.get("source_tool").and_then(|v| v.as_str()) == Some("regex"))
        .filter_map(|e| e.get("findings").and_then(|v| v.as_array()))
        .map(|a| a.len())
        .sum();

    if state.normalized_findings.is_empty() {
        0.0
    } else {
        regex_raw as f64 / state.normalized_findings.len() as f64
    }
}

fn executive_summary(state: &ScanState, risk_score: f64, confidence: f64) -> serde_json::Value {
    let critical_findings = state
        .intelligent_findings
        .iter()
        .filter(|f| f.severity == "critical")
        .count();

    let risk_level = if risk_score >= 0.75 {
        "high"
    } else if risk_score >= 0.4 {
        "medium"
    } else {
        "low"
    };

    let primary_risk_area = state
        .intelligent_findings
        .iter()
        .max_by(|a, b| {
            crate::types::Severity::parse(&a.severity)
                .rank()
                .cmp(&crate::types::Severity::parse(&b.severity).rank())
        })
        .map(|f| f.category.clone())
        .unwrap_or_else(|| "none".to_string());

    json!({
        "risk_level": risk_level,
        "total_findings": state.intelligent_findings.len(),
        "critical_findings": critical_findings,
        "owasp_categories": state.intelligent_findings.iter().map(|f| f.owasp_id.clone()).collect::<std::collections::BTreeSet<_>>(),
        "primary_risk_area": primary_risk_area,
        "confidence_level": confidence,
        "recommended_next_action": if critical_findings > 0 { "prioritize_remediation" } else { "monitor" },
    })
}

fn security_posture(state: &ScanState, confidence_map: &HashMap<String, f64>) -> serde_json::Value {
    let systemic_weakness_detected = state
        .intelligent_findings
        .iter()
        .filter(|f| f.cluster_size >= 2)
        .count()
        >= 2;

    json!({
        "attack_surface_vector": state.filtered_categories,
        "risk_distribution": state
            .intelligent_findings
            .iter()
            .fold(HashMap::<String, usize>::new(), |mut acc, f| {
                *acc.entry(f.severity.clone()).or_insert(0) += 1;
                acc
            }),
        "category_confidence_map": confidence_map,
        "systemic_weakness_detected": systemic_weakness_detected,
        "requires_manual_review": systemic_weakness_detected || state.requires_hitl,
    })
}

/// Computes phase durations, rollups, the audit record, and export blobs.
/// Failures here are non-blocking and logged only.
pub async fn run_observability(state: &ScanState) -> Result<ScanState, NodeError> {
    let durations = phase_durations(state);
    let risk_score = risk_profile_score(state);
    let confidence = confidence_score(state);
    let noise = noise_ratio(state);

    let category_confidence_map: HashMap<String, f64> = state
        .layer6_results
        .iter()
        .map(|r| (r.category.clone(), r.category_confidence))
        .collect();

    let telemetry = json!({
        "phase_durations_ms": durations,
        "risk_profile_score": risk_score,
        "confidence_score": confidence,
        "noise_ratio": noise,
    });

    let executive_summary = executive_summary(state, risk_score, confidence);
    let security_posture = security_posture(state, &category_confidence_map);

    let audit_record = json!({
        "scan_id": state.scan_id,
        "engine_version": crate::state::ENGINE_VERSION,
        "phase": state.phase.to_string(),
        "executive_summary": executive_summary,
        "security_posture": security_posture,
    });

    let external_report = json!({
        "markdown_summary": format!(
            "# Scan {}\n\nRisk level: {}\nTotal findings: {}\n",
            state.scan_id,
            executive_summary["risk_level"],
            state.intelligent_findings.len()
        ),
        "structured": audit_record,
    });

    Ok(state.merge(|s| {
        s.telemetry = Some(telemetry);
        s.audit_record = Some(audit_record.clone());
        s.external_report = Some(external_report);
        s.external_exports = Some(json!({"compact_blob": audit_record, "outbound_hook_enabled": false}));
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::build_initial_state;

    #[tokio::test]
    async fn empty_scan_has_zero_risk_and_low_severity() {
        let state = build_initial_state("https://github.com/o/r", "p", None);
        let next = run_observability(&state).await.unwrap();
        let telemetry = next.telemetry.unwrap();
        assert_eq!(telemetry["risk_profile_score"], 0.0);
    }
}
