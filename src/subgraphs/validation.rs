//! Validation/Init Subgraph (4.5): **Request Validator → GitHub Auth →
//! State Initializer**.

use async_trait::async_trait;
use serde_json::json;

use crate::error::NodeError;
use crate::hosting_client::{authenticate, TokenOutcome};
use crate::node::Node;
use crate::state::ScanState;
use crate::types::Phase;

/// Requires http(s) scheme, non-empty host, and a `github.com` origin (the
/// hosting source is hard-restricted; see Design Notes' open question).
pub struct RequestValidatorNode;

#[async_trait]
impl Node for RequestValidatorNode {
    fn name(&self) -> &'static str {
        "request_validator"
    }

    async fn run(&self, state: &ScanState) -> Result<ScanState, NodeError> {
        let parsed = url::Url::parse(&state.repo_url).ok();
        let valid = parsed
            .as_ref()
            .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some_and(|h| h.contains("github.com")))
            .unwrap_or(false);

        if valid {
            Ok(state.merge(|s| {
                s.phase = Phase::Validation;
            })?)
        } else {
            Ok(state.merge(|s| {
                s.phase = Phase::Error;
                s.errors.push(
                    json!({
                        "component": "request_validator",
                        "code": "invalid_url",
                        "reason": "Repository URL is invalid",
                        "exit_code": 1,
                        "stderr": "",
                    })
                    .to_string(),
                );
            })?)
        }
    }
}

/// Calls the hosting `/user` and `/repos/{owner}/{repo}` probes; clears the
/// credential from state regardless of outcome (the write-guard invariant).
pub struct GithubAuthNode {
    pub client: reqwest::Client,
}

#[async_trait]
impl Node for GithubAuthNode {
    fn name(&self) -> &'static str {
        "github_auth"
    }

    async fn run(&self, state: &ScanState) -> Result<ScanState, NodeError> {
        let result = authenticate(&self.client, &state.repo_url, state.github_token.as_deref()).await;
        let failed = matches!(
            result.outcome,
            TokenOutcome::InsufficientScope | TokenOutcome::RepoNotFound | TokenOutcome::NetworkError(_)
        ) && !result.repo_access;

        let auth_summary = json!({
            "token_valid": result.token_valid,
            "repo_access": result.repo_access,
            "outcome": format!("{:?}", result.outcome),
        });

        Ok(state.merge(|s| {
            s.github_token = None;
            s.phase = Phase::GithubAuth;
            s.repo_metadata.insert("github_auth".to_string(), auth_summary);
            if failed {
                s.phase = Phase::Error;
                s.errors.push(
                    json!({
                        "component": "github_auth",
                        "code": "auth_failed",
                        "reason": "Credential validation failed and repository is not publicly accessible",
                        "exit_code": 1,
                        "stderr": "",
                    })
                    .to_string(),
                );
            }
        })?)
    }
}

pub struct StateInitializerNode;

#[async_trait]
impl Node for StateInitializerNode {
    fn name(&self) -> &'static str {
        "state_initializer"
    }

    async fn run(&self, state: &ScanState) -> Result<ScanState, NodeError> {
        Ok(state.merge(|s| {
            s.phase = Phase::Initialized;
            s.repo_metadata.insert(
                "scan_record".to_string(),
                json!({"scan_id": s.scan_id, "status": "initialized"}),
            );
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::build_initial_state;

    #[tokio::test]
    async fn rejects_non_github_urls() {
        let state = build_initial_state("ftp://example.com/o/r", "proj", None);
        let next = RequestValidatorNode.run(&state).await.unwrap();
        assert_eq!(next.phase, Phase::Error);
        assert!(next.errors[0].contains("Repository URL is invalid"));
    }

    #[tokio::test]
    async fn accepts_github_https_urls() {
        let state = build_initial_state("https://github.com/octo/hello-world", "proj", None);
        let next = RequestValidatorNode.run(&state).await.unwrap();
        assert_eq!(next.phase, Phase::Validation);
        assert!(next.errors.is_empty());
    }

    #[tokio::test]
    async fn state_initializer_records_scan_record() {
        let state = build_initial_state("https://github.com/octo/hello-world", "proj", None);
        let next = StateInitializerNode.run(&state).await.unwrap();
        assert!(next.repo_metadata.contains_key("scan_record"));
    }
}
