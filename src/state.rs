//! State Kernel (4.1): the immutable `ScanState` snapshot, safe merge,
//! timeline append, and the secret-key write guard.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::LazyLock;
use uuid::Uuid;

use crate::error::StateError;
use crate::types::{Phase, PhaseStatus};

/// Keys allowed to carry the word `token` or `key` despite the write guard.
const SECRET_KEY_ALLOW_LIST: &[&str] = &["github_token"];

static SECRET_KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i).*(token|key).*").expect("static pattern is valid"));

/// Version embedded at build time, carried in the audit record for forensic
/// reproducibility.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub phase: String,
    pub event: String,
    pub at: DateTime<Utc>,
}

/// A single evidence-backed signal about the scanned code, normalized to the
/// canonical schema produced by Tool Runtime / the Analysis Aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub category: String,
    pub title: String,
    pub severity: String,
    pub evidence: String,
    pub tool_provenance: String,
    pub confidence: f64,
    pub reasoning: String,
    pub origin_parser: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub line_number: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlanEntry {
    pub order: u32,
    pub category: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    pub tool_name: String,
    pub execution_time_ms: u64,
    pub status: String,
    pub confidence: f64,
    pub finding_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryResult {
    pub category: String,
    pub order: u32,
    pub score: f64,
    pub category_status: String,
    pub category_confidence: f64,
    pub execution_record: Vec<ToolExecutionRecord>,
    pub aggregated_findings: Vec<Finding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedFinding {
    pub finding_id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub owasp_id: String,
    pub severity: String,
    pub evidence: String,
    pub file_path: String,
    pub line_number: i64,
    pub tool_sources: Vec<String>,
    pub confidence: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelligentFinding {
    pub finding_id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub owasp_id: String,
    pub severity: String,
    pub evidence: Vec<String>,
    pub file_path: String,
    pub line_number: i64,
    pub tool_sources: Vec<String>,
    pub confidence: f64,
    pub reasoning: String,
    pub root_cause: String,
    pub cluster_size: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupStatus {
    pub persistence_completed: bool,
    pub persisted_count: u64,
    pub volume_removed: bool,
    pub completed: bool,
}

/// The shared immutable snapshot threaded through every node. All updates
/// produce a new snapshot via [`ScanState::merge`]; in-place mutation from
/// outside this module is never valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanState {
    pub scan_id: String,
    pub project_id: String,
    pub repo_url: String,
    pub repo_path: Option<String>,
    pub github_token: Option<String>,

    pub phase: Phase,
    pub setup_phase: PhaseStatus,
    pub analysis_phase: PhaseStatus,
    pub correlation_phase: PhaseStatus,
    pub execution_phase: PhaseStatus,
    pub hitl_phase: PhaseStatus,
    pub dedup_phase: PhaseStatus,

    /// Free-form sub-stage label (`"planned"`, `"reflected"`, ...); kept
    /// distinct from the `PhaseStatus` enum fields per the Design Notes'
    /// resolution of the `analysis_phase` ambiguity.
    pub analysis_stage: String,
    pub correlation_stage: String,
    pub execution_stage: String,

    pub repo_metadata: Map<String, Value>,
    pub docker_volumes: HashMap<String, String>,

    pub errors: Vec<String>,
    pub requires_hitl: bool,

    pub raw_tool_outputs: Vec<Value>,
    pub findings: Vec<Finding>,
    pub normalized_findings: Vec<Finding>,
    pub owasp_mapped: HashMap<String, Vec<Finding>>,
    pub coverage_gaps: Vec<String>,
    pub rescans_triggered: bool,

    pub base_scores: HashMap<String, f64>,
    pub correlated_scores: HashMap<String, f64>,
    pub selected_owasp_categories: Vec<String>,
    pub filtered_categories: Vec<String>,
    pub execution_plan: Vec<ExecutionPlanEntry>,

    pub layer6_results: Vec<CategoryResult>,
    pub final_findings: Vec<Finding>,

    pub artifact_catalog: Vec<Value>,
    pub unified_findings: Vec<UnifiedFinding>,
    pub dedup_clusters: Vec<Value>,
    pub intelligent_findings: Vec<IntelligentFinding>,

    pub cleanup_status: CleanupStatus,

    pub telemetry: Option<Value>,
    pub audit_record: Option<Value>,
    pub external_report: Option<Value>,
    pub external_exports: Option<Value>,

    pub phase_timeline: Vec<TimelineEntry>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScanState {
    /// The ONLY allowed write operation. Clones `self`, applies `updates`,
    /// re-validates the write guard, and returns the new snapshot.
    ///
    /// # Errors
    /// Returns [`StateError::ForbiddenSecretKey`] if `updates` introduces a
    /// `repo_metadata` key matching `(?i).*(token|key).*` outside the
    /// allow-list.
    pub fn merge(&self, updates: impl FnOnce(&mut ScanState)) -> Result<ScanState, StateError> {
        let mut next = self.clone();
        updates(&mut next);
        check_secret_guard(&next.repo_metadata)?;
        next.updated_at = Utc::now();
        Ok(next)
    }

    /// Convenience wrapper producing a timeline append.
    pub fn append_timeline(&self, phase: &str, event: &str) -> Result<ScanState, StateError> {
        self.merge(|s| {
            s.phase_timeline.push(TimelineEntry {
                phase: phase.to_string(),
                event: event.to_string(),
                at: Utc::now(),
            });
        })
    }

    /// Strips `github_token` — used before any node that persists or
    /// serializes state runs, and by the `/scan/{id}/results` endpoint.
    pub fn with_token_stripped(&self) -> ScanState {
        let mut cloned = self.clone();
        cloned.github_token = None;
        cloned
    }
}

fn check_secret_guard(repo_metadata: &Map<String, Value>) -> Result<(), StateError> {
    fn walk(value: &Value) -> Option<String> {
        match value {
            Value::Object(map) => {
                for (k, v) in map {
                    if SECRET_KEY_PATTERN.is_match(k) && !SECRET_KEY_ALLOW_LIST.contains(&k.as_str()) {
                        return Some(k.clone());
                    }
                    if let Some(bad) = walk(v) {
                        return Some(bad);
                    }
                }
                None
            }
            Value::Array(items) => items.iter().find_map(walk),
            _ => None,
        }
    }

    if let Some(key) = walk(&Value::Object(repo_metadata.clone())) {
        return Err(StateError::ForbiddenSecretKey { key });
    }
    Ok(())
}

/// `build_initial_state(repo_url) -> ScanState`: a fresh snapshot with the
/// timeline seeded by a single `initialized` event.
pub fn build_initial_state(repo_url: &str, project_id: &str, github_token: Option<String>) -> ScanState {
    let now = Utc::now();
    ScanState {
        scan_id: Uuid::new_v4().to_string(),
        project_id: project_id.to_string(),
        repo_url: repo_url.to_string(),
        repo_path: None,
        github_token,

        phase: Phase::MasterOrchestrator,
        setup_phase: PhaseStatus::NotStarted,
        analysis_phase: PhaseStatus::NotStarted,
        correlation_phase: PhaseStatus::NotStarted,
        execution_phase: PhaseStatus::NotStarted,
        hitl_phase: PhaseStatus::NotStarted,
        dedup_phase: PhaseStatus::NotStarted,

        analysis_stage: "not_started".to_string(),
        correlation_stage: "not_started".to_string(),
        execution_stage: "not_started".to_string(),

        repo_metadata: Map::new(),
        docker_volumes: HashMap::new(),

        errors: Vec::new(),
        requires_hitl: false,

        raw_tool_outputs: Vec::new(),
        findings: Vec::new(),
        normalized_findings: Vec::new(),
        owasp_mapped: HashMap::new(),
        coverage_gaps: Vec::new(),
        rescans_triggered: false,

        base_scores: HashMap::new(),
        correlated_scores: HashMap::new(),
        selected_owasp_categories: Vec::new(),
        filtered_categories: Vec::new(),
        execution_plan: Vec::new(),

        layer6_results: Vec::new(),
        final_findings: Vec::new(),

        artifact_catalog: Vec::new(),
        unified_findings: Vec::new(),
        dedup_clusters: Vec::new(),
        intelligent_findings: Vec::new(),

        cleanup_status: CleanupStatus::default(),

        telemetry: None,
        audit_record: None,
        external_report: None,
        external_exports: None,

        phase_timeline: vec![TimelineEntry {
            phase: "master_orchestrator".to_string(),
            event: "initialized".to_string(),
            at: now,
        }],

        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_round_trip_preserves_all_fields() {
        let s = build_initial_state("https://github.com/o/r", "proj-1", None);
        let once = s.merge(|_| {}).unwrap();
        let twice = once.merge(|_| {}).unwrap();
        assert_eq!(s.scan_id, twice.scan_id);
        assert_eq!(s.phase_timeline.len(), twice.phase_timeline.len());
        assert_eq!(s.errors, twice.errors);
    }

    #[test]
    fn merge_rejects_secret_like_metadata_keys() {
        let s = build_initial_state("https://github.com/o/r", "proj-1", None);
        let err = s
            .merge(|state| {
                state
                    .repo_metadata
                    .insert("api_key".to_string(), Value::String("sk-123".to_string()));
            })
            .unwrap_err();
        assert!(matches!(err, StateError::ForbiddenSecretKey { key } if key == "api_key"));
    }

    #[test]
    fn merge_allows_the_github_token_key_inside_metadata() {
        let s = build_initial_state("https://github.com/o/r", "proj-1", None);
        let next = s
            .merge(|state| {
                state
                    .repo_metadata
                    .insert("github_token".to_string(), Value::Null);
            })
            .unwrap();
        assert!(next.repo_metadata.contains_key("github_token"));
    }

    #[test]
    fn append_timeline_is_append_only() {
        let s = build_initial_state("https://github.com/o/r", "proj-1", None);
        let next = s.append_timeline("setup", "running").unwrap();
        assert_eq!(next.phase_timeline.len(), s.phase_timeline.len() + 1);
    }

    #[test]
    fn with_token_stripped_clears_credential() {
        let s = build_initial_state("https://github.com/o/r", "proj-1", Some("ghp_x".into()));
        let stripped = s.with_token_stripped();
        assert!(stripped.github_token.is_none());
        assert!(s.github_token.is_some());
    }
}
