//! Smart-Dedup Subgraph (4.9): ten stages collapsing the union of
//! normalized and category-aggregated findings into `intelligent_findings`.

use std::collections::{BTreeSet, HashMap};

use md5::{Digest, Md5};
use serde_json::{json, Value};

use crate::error::NodeError;
use crate::owasp::owasp_id;
use crate::state::{Finding, IntelligentFinding, ScanState, UnifiedFinding};
use crate::types::{PhaseStatus, Severity};

const SEMANTIC_JACCARD_THRESHOLD: f64 = 0.7;

fn tokenize(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// 1. Artifact Collector — labels each source with an origin tag.
fn collect_artifacts(state: &ScanState) -> Vec<Value> {
    let mut artifacts = Vec::new();
    for (idx, finding) in state.final_findings.iter().enumerate() {
        artifacts.push(json!({
            "origin": "final_findings",
            "index": idx,
            "finding": finding,
        }));
    }
    artifacts
}

/// 2. Format Detector + 3. Known-format Parser: tags `internal_structured`
/// when the shape is an object, passes through only those.
fn detect_and_parse(artifacts: Vec<Value>) -> Vec<Finding> {
    artifacts
        .into_iter()
        .filter(|a| a.get("finding").is_some_and(Value::is_object))
        .filter_map(|a| serde_json::from_value(a["finding"].clone()).ok())
        .collect()
}

/// 4. Schema Mapper: produces a unified record; id derived deterministically.
fn map_schema(scan_id: &str, parsed: Vec<Finding>) -> Vec<UnifiedFinding> {
    parsed
        .into_iter()
        .enumerate()
        .map(|(idx, f)| {
            let key = format!("{}|{}|{}|{idx}", f.title, f.file_path, f.line_number);
            let mut hasher = Md5::new();
            hasher.update(key.as_bytes());
            let digest = hasher.finalize();
            let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
            let short = &hex[..12];

            UnifiedFinding {
                finding_id: format!("{scan_id}-uf-{short}"),
                title: f.title,
                description: f.evidence.clone(),
                category: f.category,
                owasp_id: String::new(),
                severity: f.severity,
                evidence: f.evidence,
                file_path: f.file_path,
                line_number: f.line_number,
                tool_sources: vec![f.tool_provenance],
                confidence: (f.confidence * 100.0).round() / 100.0,
                reasoning: f.reasoning,
            }
        })
        .collect()
}

/// 5. Taxonomy Tagger: normalizes category, sets `owasp_id`.
fn tag_taxonomy(mut unified: Vec<UnifiedFinding>) -> Vec<UnifiedFinding> {
    for u in &mut unified {
        u.owasp_id = owasp_id(&u.category);
    }
    unified
}

#[derive(Debug, Clone)]
struct Cluster {
    members: Vec<UnifiedFinding>,
}

/// 6. Signature Dedup: clusters by exact `(title.lower, file.lower, line)`.
fn signature_dedup(unified: Vec<UnifiedFinding>) -> Vec<Cluster> {
    let mut buckets: HashMap<(String, String, i64), Cluster> = HashMap::new();
    for u in unified {
        let key = (u.title.to_lowercase(), u.file_path.to_lowercase(), u.line_number);
        buckets.entry(key).or_insert_with(|| Cluster { members: Vec::new() }).members.push(u);
    }
    buckets.into_values().collect()
}

/// 7. Semantic Dedup: greedy first-match merge at Jaccard ≥ 0.7 over
/// description-token sets.
fn semantic_dedup(clusters: Vec<Cluster>) -> Vec<Cluster> {
    let mut merged: Vec<Cluster> = Vec::new();
    for cluster in clusters {
        let tokens: BTreeSet<String> = cluster
            .members
            .iter()
            .flat_map(|m| tokenize(&m.description))
            .collect();

        let target = merged.iter_mut().find(|existing| {
            let existing_tokens: BTreeSet<String> = existing.members.iter().flat_map(|m| tokenize(&m.description)).collect();
            jaccard(&tokens, &existing_tokens) >= SEMANTIC_JACCARD_THRESHOLD
        });

        match target {
            Some(existing) => existing.members.extend(cluster.members),
            None => merged.push(cluster),
        }
    }
    merged
}

fn root_cause_lexicon(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    if ["secret", "credential", "password", "token"].iter().any(|w| lower.contains(w)) {
        "secret_management"
    } else if ["inject", "sqli", "xss", "command"].iter().any(|w| lower.contains(w)) {
        "injection"
    } else if ["access", "permission", "authoriz", "role"].iter().any(|w| lower.contains(w)) {
        "access_control"
    } else {
        "general"
    }
}

/// 8. Context Dedup: groups clusters by the root-cause lexicon.
fn context_dedup(clusters: Vec<Cluster>) -> Vec<(&'static str, Cluster)> {
    let mut grouped: HashMap<&'static str, Cluster> = HashMap::new();
    for cluster in clusters {
        let combined: String = cluster
            .members
            .iter()
            .map(|m| format!("{} {} {}", m.title, m.description, m.reasoning))
            .collect::<Vec<_>>()
            .join(" ");
        let root_cause = root_cause_lexicon(&combined);
        grouped.entry(root_cause).or_insert_with(|| Cluster { members: Vec::new() }).members.extend(cluster.members);
    }
    grouped.into_iter().collect()
}

/// 9. Merge Executor: collapses each cluster to a canonical record.
fn merge_clusters(clusters: Vec<(&'static str, Cluster)>) -> Vec<IntelligentFinding> {
    clusters
        .into_iter()
        .filter(|(_, c)| !c.members.is_empty())
        .map(|(root_cause, cluster)| {
            let representative = cluster.members[0].clone();
            let mut tool_sources: BTreeSet<String> = BTreeSet::new();
            let mut reasonings: BTreeSet<String> = BTreeSet::new();
            let mut evidence = Vec::new();
            let mut confidence_sum = 0.0;

            for member in &cluster.members {
                tool_sources.extend(member.tool_sources.iter().cloned());
                reasonings.insert(member.reasoning.clone());
                evidence.push(member.evidence.clone());
                confidence_sum += member.confidence;
            }

            IntelligentFinding {
                finding_id: representative.finding_id,
                title: representative.title,
                description: representative.description,
                category: representative.category,
                owasp_id: representative.owasp_id,
                severity: representative.severity,
                evidence,
                file_path: representative.file_path,
                line_number: representative.line_number,
                tool_sources: tool_sources.into_iter().collect(),
                confidence: confidence_sum / cluster.members.len() as f64,
                reasoning: reasonings.into_iter().collect::<Vec<_>>().join("; "),
                root_cause: root_cause.to_string(),
                cluster_size: cluster.members.len(),
            }
        })
        .collect()
}

/// 10. Severity Adjuster: rank-based bonuses, clamped to [1,5].
fn adjust_severity(mut findings: Vec<IntelligentFinding>) -> Vec<IntelligentFinding> {
    const BOOSTED_CATEGORIES: &[&str] = &["A01", "A02", "A03", "A05"];
    for f in &mut findings {
        let mut rank = Severity::parse(&f.severity).rank() as i64;
        if f.tool_sources.len() >= 2 {
            rank += 1;
        }
        if f.confidence >= 0.75 {
            rank += 1;
        }
        if BOOSTED_CATEGORIES.contains(&f.owasp_id.as_str()) {
            rank += 1;
        }
        f.severity = Severity::from_rank(rank).as_str().to_string();
    }
    findings
}

/// Runs all ten stages in order.
pub async fn run_dedup_subgraph(state: &ScanState) -> Result<ScanState, NodeError> {
    let artifacts = collect_artifacts(state);
    let parsed = detect_and_parse(artifacts.clone());
    let unified = tag_taxonomy(map_schema(&state.scan_id, parsed));
    let signature_clusters = signature_dedup(unified.clone());
    let semantic_clusters = semantic_dedup(signature_clusters);
    let context_clusters = context_dedup(semantic_clusters);
    let merged = merge_clusters(context_clusters);
    let intelligent_findings = adjust_severity(merged);

    Ok(state.merge(|s| {
        s.artifact_catalog = artifacts;
        s.unified_findings = unified;
        s.dedup_clusters = Vec::new();
        s.intelligent_findings = intelligent_findings;
        s.dedup_phase = PhaseStatus::Completed;
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::build_initial_state;

    fn sample(title: &str, file: &str, line: i64, confidence: f64, tool: &str) -> Finding {
        Finding {
            id: "x".to_string(),
            category: "A03:2021-Injection".to_string(),
            title: title.to_string(),
            severity: "medium".to_string(),
            evidence: format!("evidence for {title}"),
            tool_provenance: tool.to_string(),
            confidence,
            reasoning: "because reasons".to_string(),
            origin_parser: "strict_json".to_string(),
            file_path: file.to_string(),
            line_number: line,
        }
    }

    #[tokio::test]
    async fn exact_duplicates_collapse_to_one_intelligent_finding() {
        let mut state = build_initial_state("https://github.com/o/r", "p", None);
        state = state
            .merge(|s| {
                s.final_findings = vec![
                    sample("SQL injection", "a.py", 10, 0.8, "taint_sim"),
                    sample("SQL injection", "a.py", 10, 0.9, "ast_deep_scan"),
                ];
            })
            .unwrap();

        let next = run_dedup_subgraph(&state).await.unwrap();
        assert_eq!(next.intelligent_findings.len(), 1);
        assert_eq!(next.intelligent_findings[0].tool_sources.len(), 2);
    }

    #[tokio::test]
    async fn severity_bumps_for_multi_tool_and_high_confidence() {
        let mut state = build_initial_state("https://github.com/o/r", "p", None);
        state = state
            .merge(|s| {
                s.final_findings = vec![
                    sample("Injection risk", "a.py", 10, 0.9, "taint_sim"),
                    sample("Injection risk", "a.py", 10, 0.95, "ast_deep_scan"),
                ];
            })
            .unwrap();

        let next = run_dedup_subgraph(&state).await.unwrap();
        assert_eq!(next.intelligent_findings[0].severity, "critical");
    }

    #[test]
    fn jaccard_identical_token_sets_is_one() {
        let a = tokenize("sql injection in login handler");
        let b = tokenize("sql injection in login handler");
        assert_eq!(jaccard(&a, &b), 1.0);
    }
}
