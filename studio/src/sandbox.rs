use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// A live sandbox. `code_root` and `scratch_root` are absolute paths inside the sandbox filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxHandle {
    pub sandbox_id: String,
    pub code_root: String,
    pub scratch_root: String,
}

impl SandboxHandle {
    pub fn new(
        sandbox_id: impl Into<String>,
        code_root: impl Into<String>,
        scratch_root: impl Into<String>,
    ) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            code_root: code_root.into(),
            scratch_root: scratch_root.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub String);

impl Display for ProcessId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Text handed to the agent: labelled stdout/stderr sections, or a no-output note.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.stdout.trim().is_empty() {
            out.push_str("STDOUT:\n");
            out.push_str(&self.stdout);
        }
        if !self.stderr.trim().is_empty() {
            out.push_str("\nSTDERR:\n");
            out.push_str(&self.stderr);
        }
        if out.is_empty() {
            out.push_str("Command completed with no output");
        }
        if !self.success() {
            out.push_str(&format!("\nExit code: {}", self.exit_code));
        }
        out
    }
}

#[async_trait]
pub trait SandboxService: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn create(&self, project_id: &str) -> Result<SandboxHandle>;

    /// Reattaches to an existing sandbox; fails when it is gone.
    async fn connect(&self, sandbox_id: &str) -> Result<SandboxHandle>;

    /// Keys are absolute sandbox paths.
    async fn upload_files(
        &self,
        handle: &SandboxHandle,
        files: &BTreeMap<String, String>,
    ) -> Result<usize>;

    async fn run_command(
        &self,
        handle: &SandboxHandle,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput>;

    async fn spawn_process(&self, handle: &SandboxHandle, command: &str) -> Result<ProcessId>;

    async fn stop_process(&self, _handle: &SandboxHandle, _process: &ProcessId) -> Result<()> {
        Ok(())
    }

    /// Every text file under `root`, keyed by absolute sandbox path.
    async fn download_files(
        &self,
        handle: &SandboxHandle,
        root: &str,
    ) -> Result<BTreeMap<String, String>>;

    async fn get_logs(
        &self,
        handle: &SandboxHandle,
        process: &ProcessId,
        lines: usize,
    ) -> Result<String>;

    async fn expose_port(&self, handle: &SandboxHandle, port: u16) -> Result<String>;
}
