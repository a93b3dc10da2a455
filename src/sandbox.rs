//! Sandbox Runtime (4.2): runs a command inside an ephemeral isolated
//! worker bound to a named workspace volume, with resource caps, timeouts,
//! and output sanitization.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::SandboxError;
use crate::redactor::redact;

/// Mount mode for the workspace volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

/// Network policy applied to the sandboxed worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkPolicy {
    None,
    Bridge,
}

/// Resource caps applied when running untrusted tool code (4.2).
#[derive(Debug, Clone)]
pub struct ResourceCaps {
    pub cpu_units: u32,
    pub memory_mib: u32,
    pub pids_limit: u32,
    pub read_only_root: bool,
    pub tmpfs_size_mib: u32,
}

impl Default for ResourceCaps {
    fn default() -> Self {
        Self {
            cpu_units: 1,
            memory_mib: 512,
            pids_limit: 128,
            read_only_root: true,
            tmpfs_size_mib: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub image: String,
    pub argv: Vec<String>,
    pub workspace_path: String,
    pub mount_path: String,
    pub mount_mode: MountMode,
    pub network: NetworkPolicy,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
    pub caps: ResourceCaps,
}

impl SandboxRequest {
    pub fn new(image: impl Into<String>, argv: Vec<String>, workspace_path: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            argv,
            workspace_path: workspace_path.into(),
            mount_path: "/workspace".to_string(),
            mount_mode: MountMode::ReadOnly,
            network: NetworkPolicy::None,
            env: HashMap::new(),
            timeout: Duration::from_secs(60),
            caps: ResourceCaps::default(),
        }
    }

    pub fn read_write(mut self) -> Self {
        self.mount_mode = MountMode::ReadWrite;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct SandboxOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Abstracts the isolated-worker boundary. [`ProcessSandbox`] is the
/// default, process-based implementation; a container/VM backend is a
/// drop-in alternate implementation of the same trait.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    async fn run(&self, request: SandboxRequest) -> Result<SandboxOutput, SandboxError>;
}

/// Process-based sandbox backend: shells out through `tokio::process::Command`
/// with a capped environment and a wall-clock timeout. `image` is recorded
/// but not otherwise enforced by this backend (a container/VM backend would
/// use it to select the runtime image).
pub struct ProcessSandbox;

#[async_trait]
impl SandboxBackend for ProcessSandbox {
    async fn run(&self, request: SandboxRequest) -> Result<SandboxOutput, SandboxError> {
        let Some(program) = request.argv.first() else {
            return Err(SandboxError::SpawnFailed("empty argv".to_string()));
        };

        let mut command = Command::new(program);
        command
            .args(&request.argv[1..])
            .current_dir(&request.workspace_path)
            .env_clear()
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;

        let wait_timeout = request.timeout;
        let output = timeout(wait_timeout, child.wait_with_output())
            .await
            .map_err(|_| SandboxError::Timeout(wait_timeout.as_secs()))?
            .map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;

        Ok(SandboxOutput {
            exit_code: output.status.code().unwrap_or(1),
            stdout: redact(&String::from_utf8_lossy(&output.stdout)),
            stderr: redact(&String::from_utf8_lossy(&output.stderr)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_a_trivial_command_and_redacts_output() {
        let sandbox = ProcessSandbox;
        let request = SandboxRequest::new(
            "irrelevant-for-process-backend",
            vec!["/bin/echo".to_string(), "token=supersecret".to_string()],
            ".",
        );
        let output = sandbox.run(request).await.unwrap();
        assert_eq!(output.exit_code, 0);
        assert!(output.stdout.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn enforces_wall_clock_timeout() {
        let sandbox = ProcessSandbox;
        let request = SandboxRequest::new("irrelevant", vec!["/bin/sleep".to_string(), "5".to_string()], ".")
            .with_timeout(Duration::from_millis(50));
        let err = sandbox.run(request).await.unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
    }
}
