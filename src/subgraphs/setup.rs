//! Setup Subgraph (4.4): **Volume Creator → Cloner → Codebase Stats →
//! Memory Loader → Size Checker**.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::error::NodeError;
use crate::hosting_client::probe_repo_size_kb;
use crate::node::Node;
use crate::sandbox::{SandboxBackend, SandboxRequest};
use crate::state::ScanState;
use crate::types::Phase;

const SIZE_THRESHOLD_BYTES: u64 = 20 * 1024 * 1024;
const CLONE_BASE_TIMEOUT: u64 = 120;
const CLONE_MAX_TIMEOUT: u64 = 600;

fn volume_name(scan_id: &str) -> String {
    let sanitized: String = scan_id.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    format!("deplai_code_{sanitized}")
}

/// Provisions a named workspace volume. The engine never exposes host paths
/// (§3); `docker_volumes` records only the logical handle.
pub struct VolumeCreatorNode {
    pub backend: Arc<dyn SandboxBackend>,
}

#[async_trait]
impl Node for VolumeCreatorNode {
    fn name(&self) -> &'static str {
        "volume_creator"
    }

    async fn run(&self, state: &ScanState) -> Result<ScanState, NodeError> {
        let name = volume_name(&state.scan_id);
        Ok(state.merge(|s| {
            s.docker_volumes.insert("code".to_string(), name);
            s.setup_phase = crate::types::PhaseStatus::Running;
        })?)
    }
}

/// Clones with depth-1, single-branch, no-tags, no-submodules; retries
/// without credentials once if a token-authenticated clone fails (4.4).
pub struct ClonerNode {
    pub backend: Arc<dyn SandboxBackend>,
    pub http: reqwest::Client,
}

#[async_trait]
impl Node for ClonerNode {
    fn name(&self) -> &'static str {
        "cloner"
    }

    async fn run(&self, state: &ScanState) -> Result<ScanState, NodeError> {
        let Some(volume) = state.docker_volumes.get("code").cloned() else {
            return Err(NodeError::MissingInput {
                node: "cloner",
                what: "docker_volumes.code",
            });
        };

        let size_kb = probe_repo_size_kb(&self.http, &state.repo_url, state.github_token.as_deref())
            .await
            .unwrap_or(0);
        let dynamic = CLONE_BASE_TIMEOUT + size_kb / 50;
        let clone_timeout = Duration::from_secs(dynamic.clamp(CLONE_BASE_TIMEOUT, CLONE_MAX_TIMEOUT));

        let bare_argv = vec![
            "git".to_string(),
            "clone".to_string(),
            "--depth".to_string(),
            "1".to_string(),
            "--single-branch".to_string(),
            "--no-tags".to_string(),
            state.repo_url.clone(),
            ".".to_string(),
        ];

        // Authenticated clones inject the token as an extra HTTP header
        // rather than a credential helper, so nothing needs to touch disk.
        let authed_argv = |token: &str| {
            let mut argv = vec![
                "git".to_string(),
                "-c".to_string(),
                format!("http.extraHeader=Authorization: Bearer {token}"),
            ];
            argv.extend(bare_argv[1..].iter().cloned());
            argv
        };

        let outcome = match &state.github_token {
            Some(token) => {
                let request = SandboxRequest::new("alpine/git", authed_argv(token), &volume)
                    .read_write()
                    .with_timeout(clone_timeout);
                self.backend.run(request).await
            }
            None => {
                let request = SandboxRequest::new("alpine/git", bare_argv.clone(), &volume)
                    .read_write()
                    .with_timeout(clone_timeout);
                self.backend.run(request).await
            }
        };

        let outcome = match outcome {
            Ok(o) if o.exit_code == 0 => Ok(o),
            _ if state.github_token.is_some() => {
                // Retry once without credentials (stale-token / public-repo fallback).
                let retry = SandboxRequest::new("alpine/git", bare_argv, &volume)
                    .read_write()
                    .with_timeout(clone_timeout);
                self.backend.run(retry).await
            }
            other => other,
        };

        match outcome {
            Ok(o) if o.exit_code == 0 => Ok(state.merge(|s| {
                s.phase = Phase::CodeAcquired;
                s.repo_path = Some(volume.clone());
            })?),
            Ok(o) => Ok(state.merge(|s| {
                s.phase = Phase::Error;
                s.errors.push(
                    json!({
                        "component": "cloner",
                        "code": "clone_failed",
                        "reason": "git clone exited nonzero",
                        "exit_code": o.exit_code,
                        "stderr": o.stderr,
                    })
                    .to_string(),
                );
            })?),
            Err(e) => Ok(state.merge(|s| {
                s.phase = Phase::Error;
                s.errors.push(
                    json!({
                        "component": "cloner",
                        "code": "clone_error",
                        "reason": e.to_string(),
                        "exit_code": 1,
                        "stderr": "",
                    })
                    .to_string(),
                );
            })?),
        }
    }
}

/// Counts files and buckets them by extension into a fixed language set.
pub struct CodebaseStatsNode {
    pub backend: Arc<dyn SandboxBackend>,
}

#[async_trait]
impl Node for CodebaseStatsNode {
    fn name(&self) -> &'static str {
        "codebase_stats"
    }

    async fn run(&self, state: &ScanState) -> Result<ScanState, NodeError> {
        let Some(volume) = state.repo_path.clone() else {
            return Err(NodeError::MissingInput {
                node: "codebase_stats",
                what: "repo_path",
            });
        };

        let argv = vec![
            "python3".to_string(),
            "-c".to_string(),
            "import json,os,pathlib;\
             root=pathlib.Path('/workspace');\
             langs={'python':0,'typescript':0,'javascript':0,'java':0,'go':0,'rust':0,'other':0};\
             total=0;size=0\n\
             for p in root.rglob('*'):\n\
             \tif not p.is_file(): continue\n\
             \ttotal+=1; size+=p.stat().st_size\n\
             \text=p.suffix.lower()\n\
             \tkey={'.py':'python','.ts':'typescript','.js':'javascript','.java':'java','.go':'go','.rs':'rust'}.get(ext,'other')\n\
             \tlangs[key]+=1\n\
             print(json.dumps({'total_files':total,'total_size_bytes':size,'language_breakdown':langs}))"
                .to_string(),
        ];

        let request = SandboxRequest::new("python:3.12-alpine", argv, &volume).with_timeout(Duration::from_secs(60));
        let output = self.backend.run(request).await?;

        let stats = output
            .stdout
            .lines()
            .next_back()
            .and_then(|line| serde_json::from_str::<serde_json::Value>(line).ok())
            .unwrap_or_else(|| json!({"total_files": 0, "total_size_bytes": 0, "language_breakdown": {}}));

        Ok(state.merge(|s| {
            s.repo_metadata.insert("codebase_stats".to_string(), stats);
        })?)
    }
}

/// Placeholder for prior-scan context retrieval.
pub struct MemoryLoaderNode;

#[async_trait]
impl Node for MemoryLoaderNode {
    fn name(&self) -> &'static str {
        "memory_loader"
    }

    async fn run(&self, state: &ScanState) -> Result<ScanState, NodeError> {
        Ok(state.merge(|s| {
            s.repo_metadata.insert(
                "memory".to_string(),
                json!({"previous_findings_count": 0, "last_scan_status": "none"}),
            );
        })?)
    }
}

/// Latches `requires_hitl=true` when the codebase exceeds the size
/// threshold (§3's `requires_hitl` boolean latch).
pub struct SizeCheckerNode;

#[async_trait]
impl Node for SizeCheckerNode {
    fn name(&self) -> &'static str {
        "size_checker"
    }

    async fn run(&self, state: &ScanState) -> Result<ScanState, NodeError> {
        let total_size_bytes = state
            .repo_metadata
            .get("codebase_stats")
            .and_then(|v| v.get("total_size_bytes"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        let requires_hitl = total_size_bytes > SIZE_THRESHOLD_BYTES;

        Ok(state.merge(|s| {
            s.requires_hitl = requires_hitl;
            s.phase = if requires_hitl { Phase::HitlRequired } else { Phase::SizeChecked };
            s.setup_phase = crate::types::PhaseStatus::Completed;
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_name_strips_non_alphanumeric() {
        assert_eq!(volume_name("abc-123-def"), "deplai_code_abc123def");
    }

    #[tokio::test]
    async fn size_checker_latches_hitl_over_threshold() {
        let mut state = crate::state::build_initial_state("https://github.com/o/r", "p", None);
        state = state
            .merge(|s| {
                s.repo_metadata
                    .insert("codebase_stats".to_string(), json!({"total_size_bytes": 30 * 1024 * 1024}));
            })
            .unwrap();
        let next = SizeCheckerNode.run(&state).await.unwrap();
        assert!(next.requires_hitl);
        assert_eq!(next.phase, Phase::HitlRequired);
    }

    #[tokio::test]
    async fn size_checker_passes_under_threshold() {
        let state = crate::state::build_initial_state("https://github.com/o/r", "p", None);
        let next = SizeCheckerNode.run(&state).await.unwrap();
        assert!(!next.requires_hitl);
        assert_eq!(next.phase, Phase::SizeChecked);
    }
}
