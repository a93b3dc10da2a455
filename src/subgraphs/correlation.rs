//! Correlation Subgraph (4.7): **Base Scorer → Correlation Applier → Spawn
//! Decider → Tech Stack Filter → Execution Planner**.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::NodeError;
use crate::node::Node;
use crate::owasp::{correlation_weights, owasp_id};
use crate::state::{ExecutionPlanEntry, ScanState};
use crate::types::{Phase, PhaseStatus, Severity};

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// Sums per-finding severity weights per category.
pub struct BaseScorerNode;

#[async_trait]
impl Node for BaseScorerNode {
    fn name(&self) -> &'static str {
        "base_scorer"
    }

    async fn run(&self, state: &ScanState) -> Result<ScanState, NodeError> {
        let mut scores: HashMap<String, f64> = HashMap::new();
        for (category, findings) in &state.owasp_mapped {
            let sum: f64 = findings.iter().map(|f| Severity::parse(&f.severity).weight()).sum();
            *scores.entry(category.clone()).or_insert(0.0) += sum;
        }

        Ok(state.merge(|s| {
            s.base_scores = scores;
            s.phase = Phase::CorrelationDecision;
            s.correlation_phase = PhaseStatus::Running;
        })?)
    }
}

/// Adds a deterministic fraction of a source category's base score to a
/// target category per the fixed relationship table (4.7).
pub struct CorrelationApplierNode;

#[async_trait]
impl Node for CorrelationApplierNode {
    fn name(&self) -> &'static str {
        "correlation_applier"
    }

    async fn run(&self, state: &ScanState) -> Result<ScanState, NodeError> {
        let weights = correlation_weights();
        let mut correlated = state.base_scores.clone();

        for (category, base_score) in &state.base_scores {
            let prefix = owasp_id(category);
            if let Some(targets) = weights.get(prefix.as_str()) {
                for (target_prefix, fraction) in targets {
                    if let Some((full_target, _)) = state.base_scores.iter().find(|(c, _)| owasp_id(c) == *target_prefix) {
                        *correlated.entry(full_target.clone()).or_insert(0.0) += base_score * fraction;
                    }
                }
            }
        }

        for score in correlated.values_mut() {
            *score = round4(*score);
        }

        Ok(state.merge(|s| {
            s.correlated_scores = correlated;
        })?)
    }
}

/// Ranks categories by correlated score descending, selects `score > 0`.
pub struct SpawnDeciderNode;

#[async_trait]
impl Node for SpawnDeciderNode {
    fn name(&self) -> &'static str {
        "spawn_decider"
    }

    async fn run(&self, state: &ScanState) -> Result<ScanState, NodeError> {
        let mut ranked: Vec<(String, f64)> = state
            .correlated_scores
            .iter()
            .filter(|(_, score)| **score > 0.0)
            .map(|(c, s)| (c.clone(), *s))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));

        Ok(state.merge(|s| {
            s.selected_owasp_categories = ranked.into_iter().map(|(c, _)| c).collect();
        })?)
    }
}

/// Drops categories irrelevant to the detected stack (e.g. A06 with no
/// dependency manifests present).
pub struct TechStackFilterNode;

#[async_trait]
impl Node for TechStackFilterNode {
    fn name(&self) -> &'static str {
        "tech_stack_filter"
    }

    async fn run(&self, state: &ScanState) -> Result<ScanState, NodeError> {
        let has_dependency_manifests = state
            .repo_metadata
            .get("analysis_plan")
            .and_then(|v| v.get("scanners_planned"))
            .map(|v| v.to_string().contains("dependency"))
            .unwrap_or(true);

        let filtered: Vec<String> = state
            .selected_owasp_categories
            .iter()
            .filter(|c| {
                if owasp_id(c) == "A06" {
                    has_dependency_manifests
                } else {
                    true
                }
            })
            .cloned()
            .collect();

        Ok(state.merge(|s| {
            s.filtered_categories = filtered;
        })?)
    }
}

/// Emits the ranked execution plan, ordered 1.. by correlated score desc.
pub struct ExecutionPlannerNode;

#[async_trait]
impl Node for ExecutionPlannerNode {
    fn name(&self) -> &'static str {
        "execution_planner"
    }

    async fn run(&self, state: &ScanState) -> Result<ScanState, NodeError> {
        let plan: Vec<ExecutionPlanEntry> = state
            .filtered_categories
            .iter()
            .enumerate()
            .map(|(idx, category)| ExecutionPlanEntry {
                order: idx as u32 + 1,
                category: category.clone(),
                score: *state.correlated_scores.get(category).unwrap_or(&0.0),
            })
            .collect();

        Ok(state.merge(|s| {
            s.execution_plan = plan;
            s.phase = Phase::CorrelationDecisionCompleted;
            s.correlation_phase = PhaseStatus::Completed;
            s.correlation_stage = "planned".to_string();
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::build_initial_state;

    #[tokio::test]
    async fn correlation_applier_adds_weighted_fraction() {
        let mut state = build_initial_state("https://github.com/o/r", "p", None);
        state = state
            .merge(|s| {
                s.base_scores.insert("A03:2021-Injection".to_string(), 1.0);
                s.base_scores.insert("A05:2021-Security Misconfiguration".to_string(), 0.0);
            })
            .unwrap();
        let next = CorrelationApplierNode.run(&state).await.unwrap();
        assert_eq!(next.correlated_scores["A05:2021-Security Misconfiguration"], 0.2);
    }

    #[tokio::test]
    async fn spawn_decider_drops_zero_scores_and_sorts_descending() {
        let mut state = build_initial_state("https://github.com/o/r", "p", None);
        state = state
            .merge(|s| {
                s.correlated_scores.insert("A01".to_string(), 0.3);
                s.correlated_scores.insert("A03".to_string(), 0.9);
                s.correlated_scores.insert("A09".to_string(), 0.0);
            })
            .unwrap();
        let next = SpawnDeciderNode.run(&state).await.unwrap();
        assert_eq!(next.selected_owasp_categories, vec!["A03".to_string(), "A01".to_string()]);
    }

    #[tokio::test]
    async fn execution_planner_orders_from_one() {
        let mut state = build_initial_state("https://github.com/o/r", "p", None);
        state = state
            .merge(|s| {
                s.filtered_categories = vec!["A03".to_string(), "A01".to_string()];
                s.correlated_scores.insert("A03".to_string(), 0.9);
                s.correlated_scores.insert("A01".to_string(), 0.3);
            })
            .unwrap();
        let next = ExecutionPlannerNode.run(&state).await.unwrap();
        assert_eq!(next.execution_plan[0].order, 1);
        assert_eq!(next.execution_plan[0].category, "A03");
    }
}
