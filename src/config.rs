//! Typed configuration, resolved compiled-defaults → `.env` → environment.
//!
//! Mirrors the hierarchy used throughout the pack's config layers: secure,
//! working defaults baked in, optionally overridden by a loaded `.env` file,
//! then by real process environment variables (which always win).

use crate::error::ConfigError;

/// Default wall-clock timeout for the HITL wait-for-decision poll loop.
const DEFAULT_HITL_TIMEOUT_SECONDS: u64 = 60;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `DEPLAI_SCAN_DB_PATH` — sqlite persistence location.
    pub scan_db_path: String,
    /// `DEPLAI_HITL_TIMEOUT_SECONDS`.
    pub hitl_timeout_seconds: u64,
    /// `DEPLAI_HITL_DEFAULT_DECISION` — `approve` or `reject`.
    pub hitl_default_decision: HitlDecision,
    /// `SCAN_LOG_LEVEL` — passed to the tracing env-filter.
    pub log_level: String,
    /// `SCAN_SANDBOX_IMAGE` — descriptive default sandbox image tag.
    pub sandbox_image: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitlDecision {
    Approve,
    Reject,
}

impl HitlDecision {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "approve" | "approved" | "continue" | "proceed" => Some(HitlDecision::Approve),
            "reject" | "denied" | "cancel" | "stop" => Some(HitlDecision::Reject),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HitlDecision::Approve => "approve",
            HitlDecision::Reject => "reject",
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan_db_path: "scan_results.sqlite3".to_string(),
            hitl_timeout_seconds: DEFAULT_HITL_TIMEOUT_SECONDS,
            hitl_default_decision: HitlDecision::Reject,
            log_level: "info".to_string(),
            sandbox_image: "python:3.12-alpine".to_string(),
        }
    }
}

impl EngineConfig {
    /// Loads `.env` (best-effort) then layers process environment variables
    /// over the compiled defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut cfg = Self::default();

        if let Ok(path) = std::env::var("DEPLAI_SCAN_DB_PATH") {
            cfg.scan_db_path = path;
        }

        if let Ok(raw) = std::env::var("DEPLAI_HITL_TIMEOUT_SECONDS") {
            cfg.hitl_timeout_seconds = raw.parse().map_err(|_| ConfigError::EnvParse {
                key: "DEPLAI_HITL_TIMEOUT_SECONDS".to_string(),
                message: "must be a positive integer".to_string(),
            })?;
        }

        if let Ok(raw) = std::env::var("DEPLAI_HITL_DEFAULT_DECISION") {
            cfg.hitl_default_decision = HitlDecision::parse(&raw).ok_or_else(|| ConfigError::EnvParse {
                key: "DEPLAI_HITL_DEFAULT_DECISION".to_string(),
                message: "must be 'approve' or 'reject'".to_string(),
            })?;
        }

        if let Ok(level) = std::env::var("SCAN_LOG_LEVEL") {
            cfg.log_level = level;
        }

        if let Ok(image) = std::env::var("SCAN_SANDBOX_IMAGE") {
            cfg.sandbox_image = image;
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_secure_and_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.hitl_default_decision, HitlDecision::Reject);
        assert_eq!(cfg.hitl_timeout_seconds, DEFAULT_HITL_TIMEOUT_SECONDS);
    }

    #[test]
    fn hitl_decision_parses_synonyms() {
        assert_eq!(HitlDecision::parse("approved"), Some(HitlDecision::Approve));
        assert_eq!(HitlDecision::parse("DENIED"), Some(HitlDecision::Reject));
        assert_eq!(HitlDecision::parse("maybe"), None);
    }
}
