//! Error taxonomy for every fallible boundary in the engine.
//!
//! Each variant carries a `miette` diagnostic code of the form
//! `scan_engine::<component>::<kind>` when the `diagnostics` feature is on.

use thiserror::Error;

#[cfg(feature = "diagnostics")]
use miette::Diagnostic;

/// Errors raised by the state kernel's `merge`.
#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum StateError {
    /// A caller attempted to write a key whose name matches `(?i).*(token|key).*`
    /// outside the `github_token` allow-list.
    #[error("forbidden secret-like key in state update: {key}")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(code(scan_engine::state::forbidden_secret_key))
    )]
    ForbiddenSecretKey { key: String },
}

/// Errors raised by the sandbox runtime (4.2).
#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum SandboxError {
    #[error("sandbox backend executable not found")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(scan_engine::sandbox::executor_missing)))]
    ExecutorMissing,

    #[error("sandbox command exceeded {0}s wall-clock timeout")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(scan_engine::sandbox::timeout)))]
    Timeout(u64),

    #[error("sandbox command exited nonzero: {0}")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(scan_engine::sandbox::nonzero_exit)))]
    NonZeroExit(i32),

    #[error("failed to spawn sandbox process: {0}")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(scan_engine::sandbox::spawn_failed)))]
    SpawnFailed(String),
}

/// Errors raised by node execution inside a subgraph.
#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum NodeError {
    #[error("node {node} is missing required input: {what}")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(scan_engine::node::missing_input)))]
    MissingInput { node: &'static str, what: &'static str },

    #[error("state update rejected: {0}")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(scan_engine::node::state)))]
    State(#[from] StateError),

    #[error("sandbox invocation failed: {0}")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(scan_engine::node::sandbox)))]
    Sandbox(#[from] SandboxError),

    #[error("hosting API call failed: {0}")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(scan_engine::node::hosting)))]
    Hosting(String),

    #[error("persistence operation failed: {0}")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(scan_engine::node::persistence)))]
    Persistence(#[from] PersistenceError),

    #[error("serialization error: {0}")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(scan_engine::node::serde)))]
    Serde(#[from] serde_json::Error),
}

/// Errors raised by the persistence layer (Cleanup / Result Persister).
#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum PersistenceError {
    #[error("database error: {0}")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(scan_engine::persistence::db)))]
    Db(#[from] sqlx::Error),
}

/// Errors raised while resolving `EngineConfig`.
#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum ConfigError {
    #[error("failed to parse environment variable {key}: {message}")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(scan_engine::config::env_parse)))]
    EnvParse { key: String, message: String },
}

/// Top-level error returned by public engine entry points.
#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum EngineError {
    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("scan {0} not found")]
    ScanNotFound(String),
}
