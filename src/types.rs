//! Discriminant types shared across the graph, state, and node layers.

use std::fmt;

/// Coarse lifecycle discriminant carried on [`crate::state::ScanState::phase`].
///
/// Mirrors the `phase` enumeration fixed by the data model: a scan moves
/// through these values strictly forward, except for the bounded HITL
/// detour, and never revisits `Error` once elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    MasterOrchestrator,
    Validation,
    GithubAuth,
    Initialized,
    SizeChecked,
    CodeAcquired,
    Analysis,
    AnalysisCompleted,
    CorrelationDecision,
    CorrelationDecisionCompleted,
    ExecutionPhase,
    ExecutionCompleted,
    HitlWaiting,
    HitlResolved,
    HitlRequired,
    Completed,
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "unknown".to_string());
        write!(f, "{s}")
    }
}

/// Status discriminant shared by every per-phase status field
/// (`setup_phase`, `analysis_phase` status axis, `execution_phase`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    NotStarted,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "unknown".to_string());
        write!(f, "{s}")
    }
}

/// Severity scale shared by raw tool findings and intelligent findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            "low" => Severity::Low,
            "info" | "informational" => Severity::Info,
            _ => Severity::Medium,
        }
    }

    /// Weight used by the Base Scorer (4.7).
    pub fn weight(self) -> f64 {
        match self {
            Severity::Critical => 1.0,
            Severity::High => 0.75,
            Severity::Medium => 0.5,
            Severity::Low => 0.25,
            Severity::Info => 0.1,
        }
    }

    /// Ordinal rank used by the Severity Adjuster (1..=5).
    pub fn rank(self) -> u8 {
        match self {
            Severity::Info => 1,
            Severity::Low => 2,
            Severity::Medium => 3,
            Severity::High => 4,
            Severity::Critical => 5,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank.clamp(1, 5) {
            1 => Severity::Info,
            2 => Severity::Low,
            3 => Severity::Medium,
            4 => Severity::High,
            _ => Severity::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
