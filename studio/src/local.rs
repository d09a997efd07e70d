use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::errors::{Result, StudioError};
use crate::path;
use crate::sandbox::{CommandOutput, ProcessId, SandboxHandle, SandboxService};

const CODE_DIR: &str = "app";
const SCRATCH_DIR: &str = "tmp";
const SKIPPED_DIRS: [&str; 2] = ["node_modules", ".next"];

#[derive(Clone, Debug)]
pub struct LocalSandboxConfig {
    root: PathBuf,
    path_env: String,
    max_output_bytes: usize,
    max_log_lines: usize,
    preview_host: String,
}

impl LocalSandboxConfig {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = path::ensure_absolute_base(root.as_ref())?;
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            path_env: "/usr/local/bin:/usr/bin:/bin".to_string(),
            max_output_bytes: 1024 * 1024,
            max_log_lines: 2000,
            preview_host: "http://localhost".to_string(),
        })
    }

    pub fn with_path_env(mut self, path_env: impl Into<String>) -> Self {
        self.path_env = path_env.into();
        self
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Result<Self> {
        if max_output_bytes == 0 {
            return Err(StudioError::InvalidOperation(
                "max_output_bytes must be greater than zero".to_string(),
            ));
        }
        self.max_output_bytes = max_output_bytes;
        Ok(self)
    }

    pub fn with_max_log_lines(mut self, max_log_lines: usize) -> Self {
        self.max_log_lines = max_log_lines.max(1);
        self
    }

    pub fn with_preview_host(mut self, preview_host: impl Into<String>) -> Self {
        self.preview_host = preview_host.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

type LogRing = Arc<Mutex<VecDeque<String>>>;

#[derive(Debug)]
struct LocalProcess {
    child: Child,
    logs: LogRing,
}

/// Runs each sandbox as a directory under the configured root, with commands executed through `sh -c`.
#[derive(Debug)]
pub struct LocalSandbox {
    config: LocalSandboxConfig,
    processes: Mutex<HashMap<String, LocalProcess>>,
}

impl LocalSandbox {
    pub fn new(config: LocalSandboxConfig) -> Self {
        Self {
            config,
            processes: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LocalSandboxConfig {
        &self.config
    }

    fn sandbox_dir(&self, sandbox_id: &str) -> Result<PathBuf> {
        let dir = path::resolve(self.config.root(), sandbox_id)?;
        if !dir.is_dir() {
            return Err(StudioError::SandboxUnavailable(sandbox_id.to_string()));
        }
        Ok(dir)
    }

    fn handle_for(&self, sandbox_id: &str, dir: &Path) -> SandboxHandle {
        SandboxHandle::new(
            sandbox_id,
            dir.join(CODE_DIR).to_string_lossy(),
            dir.join(SCRATCH_DIR).to_string_lossy(),
        )
    }

    /// Resolves an absolute sandbox path, refusing anything outside the sandbox directory.
    fn resolve_in(&self, dir: &Path, sandbox_path: &str) -> Result<PathBuf> {
        let relative = Path::new(sandbox_path)
            .strip_prefix(dir)
            .map_err(|_| StudioError::OutsideRoot)?;
        path::resolve(dir, relative)
    }

    fn command(&self, dir: &Path, script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command.current_dir(dir);
        command.kill_on_drop(true);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.env_clear();
        command.env("PATH", &self.config.path_env);
        command.env("HOME", dir);
        command
    }
}

#[async_trait]
impl SandboxService for LocalSandbox {
    fn backend(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self))]
    async fn create(&self, project_id: &str) -> Result<SandboxHandle> {
        let sandbox_id = format!("local-{}", Uuid::new_v4());
        let dir = self.config.root().join(&sandbox_id);
        tokio::fs::create_dir_all(dir.join(CODE_DIR)).await?;
        tokio::fs::create_dir_all(dir.join(SCRATCH_DIR)).await?;
        debug!(sandbox_id = %sandbox_id, "local sandbox directory created");
        Ok(self.handle_for(&sandbox_id, &dir))
    }

    async fn connect(&self, sandbox_id: &str) -> Result<SandboxHandle> {
        let dir = self.sandbox_dir(sandbox_id)?;
        Ok(self.handle_for(sandbox_id, &dir))
    }

    #[instrument(skip(self, handle, files), fields(sandbox_id = %handle.sandbox_id, files = files.len()))]
    async fn upload_files(
        &self,
        handle: &SandboxHandle,
        files: &BTreeMap<String, String>,
    ) -> Result<usize> {
        let dir = self.sandbox_dir(&handle.sandbox_id)?;
        for (sandbox_path, content) in files {
            let target = self.resolve_in(&dir, sandbox_path)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, content).await?;
        }
        Ok(files.len())
    }

    #[instrument(skip(self, handle), fields(sandbox_id = %handle.sandbox_id))]
    async fn run_command(
        &self,
        handle: &SandboxHandle,
        command: &str,
        limit: Duration,
    ) -> Result<CommandOutput> {
        if limit.is_zero() {
            return Err(StudioError::InvalidOperation(
                "timeout must be greater than zero".to_string(),
            ));
        }
        let dir = self.sandbox_dir(&handle.sandbox_id)?;
        let child = self.command(&dir, command).spawn()?;

        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => return Err(StudioError::Timeout(limit)),
        };

        let max = self.config.max_output_bytes;
        if output.stdout.len() > max {
            return Err(StudioError::OutputTooLarge {
                stream: "stdout",
                limit: max,
            });
        }
        if output.stderr.len() > max {
            return Err(StudioError::OutputTooLarge {
                stream: "stderr",
                limit: max,
            });
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            // killed by signal
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    #[instrument(skip(self, handle), fields(sandbox_id = %handle.sandbox_id))]
    async fn spawn_process(&self, handle: &SandboxHandle, command: &str) -> Result<ProcessId> {
        let dir = self.sandbox_dir(&handle.sandbox_id)?;
        let mut child = self.command(&dir, command).spawn()?;

        let logs: LogRing = Arc::new(Mutex::new(VecDeque::new()));
        let cap = self.config.max_log_lines;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, logs.clone(), cap));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, logs.clone(), cap));
        }

        let process = ProcessId(Uuid::new_v4().to_string());
        self.processes
            .lock()
            .insert(process.0.clone(), LocalProcess { child, logs });
        Ok(process)
    }

    async fn stop_process(&self, _handle: &SandboxHandle, process: &ProcessId) -> Result<()> {
        let removed = self.processes.lock().remove(&process.0);
        match removed {
            Some(mut local) => {
                if let Err(err) = local.child.start_kill() {
                    warn!(%err, process = %process, "failed to signal process");
                }
                Ok(())
            }
            None => Err(StudioError::InvalidOperation(format!(
                "unknown process {process}"
            ))),
        }
    }

    #[instrument(skip(self, handle), fields(sandbox_id = %handle.sandbox_id))]
    async fn download_files(
        &self,
        handle: &SandboxHandle,
        root: &str,
    ) -> Result<BTreeMap<String, String>> {
        let dir = self.sandbox_dir(&handle.sandbox_id)?;
        let start = self.resolve_in(&dir, root)?;

        let mut files = BTreeMap::new();
        let mut pending = vec![start];
        while let Some(current) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(StudioError::Io(err)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let entry_path = entry.path();
                if file_type.is_dir() {
                    let skipped = entry
                        .file_name()
                        .to_str()
                        .map(|name| SKIPPED_DIRS.contains(&name))
                        .unwrap_or(false);
                    if !skipped {
                        pending.push(entry_path);
                    }
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }
                let bytes = tokio::fs::read(&entry_path).await?;
                match String::from_utf8(bytes) {
                    Ok(content) => {
                        files.insert(entry_path.to_string_lossy().into_owned(), content);
                    }
                    Err(_) => warn!(path = %entry_path.display(), "skipping non-UTF-8 file"),
                }
            }
        }
        Ok(files)
    }

    async fn get_logs(
        &self,
        _handle: &SandboxHandle,
        process: &ProcessId,
        lines: usize,
    ) -> Result<String> {
        let logs = self
            .processes
            .lock()
            .get(&process.0)
            .map(|local| local.logs.clone())
            .ok_or_else(|| StudioError::InvalidOperation(format!("unknown process {process}")))?;
        let guard = logs.lock();
        let skip = guard.len().saturating_sub(lines);
        Ok(guard
            .iter()
            .skip(skip)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn expose_port(&self, _handle: &SandboxHandle, port: u16) -> Result<String> {
        Ok(format!("{}:{port}", self.config.preview_host))
    }
}

async fn pump_lines(stream: impl AsyncRead + Unpin, logs: LogRing, cap: usize) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let mut guard = logs.lock();
                if guard.len() >= cap {
                    guard.pop_front();
                }
                guard.push_back(line);
            }
            Ok(None) => break,
            Err(err) => {
                debug!(%err, "process output stream closed");
                break;
            }
        }
    }
}
