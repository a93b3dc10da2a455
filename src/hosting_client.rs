//! Hosting API collaborator (4.5): the abstract "verify token + repo"
//! contract against GitHub. Credential-provider integration detail beyond
//! this contract is out of scope (§1).

use std::time::Duration;

use serde::Deserialize;

const HOSTING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOutcome {
    Absent,
    ValidWithRepoAccess,
    InsufficientScope,
    RepoNotFound,
    NetworkError(String),
}

#[derive(Debug, Clone)]
pub struct AuthResult {
    pub outcome: TokenOutcome,
    pub token_valid: bool,
    pub repo_access: bool,
}

impl AuthResult {
    pub fn success(&self) -> bool {
        matches!(self.outcome, TokenOutcome::ValidWithRepoAccess)
            || (matches!(self.outcome, TokenOutcome::Absent) && self.repo_access)
    }
}

#[derive(Debug, Deserialize)]
struct RepoProbeBody {
    #[serde(default)]
    private: bool,
}

/// Splits a `github.com` URL into `(owner, repo)`, stripping `.git` and any
/// trailing slash.
pub fn parse_owner_repo(repo_url: &str) -> Option<(String, String)> {
    let trimmed = repo_url.trim_end_matches('/').trim_end_matches(".git");
    let after_host = trimmed.split("github.com/").nth(1)?;
    let mut parts = after_host.splitn(2, '/');
    let owner = parts.next()?.to_string();
    let repo = parts.next()?.split('/').next()?.to_string();
    if owner.is_empty() || repo.is_empty() {
        None
    } else {
        Some((owner, repo))
    }
}

/// Probes `/user` and `/repos/{owner}/{repo}`; success requires either a
/// valid user probe or a successful repo probe (4.5).
pub async fn authenticate(client: &reqwest::Client, repo_url: &str, token: Option<&str>) -> AuthResult {
    let Some((owner, repo)) = parse_owner_repo(repo_url) else {
        return AuthResult {
            outcome: TokenOutcome::RepoNotFound,
            token_valid: false,
            repo_access: false,
        };
    };

    let repo_probe = client
        .get(format!("https://api.github.com/repos/{owner}/{repo}"))
        .header("User-Agent", "scan-orchestrator")
        .header("Accept", "application/vnd.github+json")
        .timeout(HOSTING_TIMEOUT);
    let repo_probe = match token {
        Some(t) => repo_probe.bearer_auth(t),
        None => repo_probe,
    };

    let repo_access = match repo_probe.send().await {
        Ok(resp) if resp.status().is_success() => true,
        Ok(resp) if resp.status().as_u16() == 404 => false,
        Ok(_) => false,
        Err(e) => {
            return AuthResult {
                outcome: TokenOutcome::NetworkError(e.to_string()),
                token_valid: false,
                repo_access: false,
            };
        }
    };

    let Some(token) = token else {
        return AuthResult {
            outcome: TokenOutcome::Absent,
            token_valid: false,
            repo_access,
        };
    };

    let user_probe = client
        .get("https://api.github.com/user")
        .header("User-Agent", "scan-orchestrator")
        .bearer_auth(token)
        .timeout(HOSTING_TIMEOUT);

    let token_valid = match user_probe.send().await {
        Ok(resp) => resp.status().is_success(),
        Err(e) => {
            return AuthResult {
                outcome: TokenOutcome::NetworkError(e.to_string()),
                token_valid: false,
                repo_access,
            };
        }
    };

    let outcome = if token_valid && repo_access {
        TokenOutcome::ValidWithRepoAccess
    } else if repo_access {
        TokenOutcome::ValidWithRepoAccess
    } else {
        TokenOutcome::InsufficientScope
    };

    AuthResult {
        outcome,
        token_valid,
        repo_access,
    }
}

/// Best-effort repo size lookup in kB, used by the Cloner's dynamic timeout
/// (4.4). Returns `None` on any failure — the caller falls back to the base
/// timeout.
pub async fn probe_repo_size_kb(client: &reqwest::Client, repo_url: &str, token: Option<&str>) -> Option<u64> {
    let (owner, repo) = parse_owner_repo(repo_url)?;
    let request = client
        .get(format!("https://api.github.com/repos/{owner}/{repo}"))
        .header("User-Agent", "scan-orchestrator")
        .timeout(HOSTING_TIMEOUT);
    let request = match token {
        Some(t) => request.bearer_auth(t),
        None => request,
    };

    #[derive(Deserialize)]
    struct SizeBody {
        size: u64,
    }

    let body: SizeBody = request.send().await.ok()?.json().await.ok()?;
    Some(body.size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_owner_repo_stripping_git_suffix() {
        assert_eq!(
            parse_owner_repo("https://github.com/octo/hello-world.git"),
            Some(("octo".to_string(), "hello-world".to_string()))
        );
    }

    #[test]
    fn parses_owner_repo_with_trailing_slash() {
        assert_eq!(
            parse_owner_repo("https://github.com/octo/hello-world/"),
            Some(("octo".to_string(), "hello-world".to_string()))
        );
    }

    #[test]
    fn rejects_non_github_urls() {
        assert_eq!(parse_owner_repo("https://gitlab.com/octo/hello-world"), None);
    }

    #[test]
    fn success_true_for_absent_token_with_repo_access() {
        let result = AuthResult {
            outcome: TokenOutcome::Absent,
            token_valid: false,
            repo_access: true,
        };
        assert!(result.success());
    }
}
