use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::timeout;
use tracing::{info, instrument, warn};

use crate::errors::{Result, StudioError};
use crate::path::DAPP_ROOT;
use crate::registry::SandboxRegistry;
use crate::sandbox::{CommandOutput, SandboxHandle, SandboxService};

pub const NO_ACTIVE_PROCESS: &str = "No active process found. Start the dev server first.";

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub command_timeout: Duration,
    pub bootstrap_timeout: Duration,
    pub dev_port: u16,
    pub app_name: String,
    pub idle_ttl: Duration,
    pub install_command: String,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            bootstrap_timeout: Duration::from_secs(300),
            dev_port: 3000,
            app_name: "dapp".to_string(),
            idle_ttl: Duration::from_secs(3600),
            install_command: "pnpm install".to_string(),
        }
    }
}

impl SandboxSettings {
    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    pub fn with_bootstrap_timeout(mut self, bootstrap_timeout: Duration) -> Self {
        self.bootstrap_timeout = bootstrap_timeout;
        self
    }

    pub fn with_dev_port(mut self, dev_port: u16) -> Self {
        self.dev_port = dev_port;
        self
    }

    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl = idle_ttl;
        self
    }

    pub fn with_install_command(mut self, install_command: impl Into<String>) -> Self {
        self.install_command = install_command.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    pub project_id: String,
    pub sandbox_id: String,
    pub url: Option<String>,
    pub dev_server_running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    pub uploaded: usize,
    pub url: Option<String>,
    pub dev_server_started: bool,
}

#[derive(Debug, Clone)]
pub struct BootstrapOutcome {
    pub files: BTreeMap<String, String>,
    pub output: CommandOutput,
}

/// Maps project-level sandbox operations onto a [`SandboxService`] and the shared registry.
#[derive(Clone)]
pub struct SandboxAdapter {
    service: Arc<dyn SandboxService>,
    registry: Arc<SandboxRegistry>,
    settings: SandboxSettings,
}

impl SandboxAdapter {
    pub fn new(
        service: Arc<dyn SandboxService>,
        registry: Arc<SandboxRegistry>,
        settings: SandboxSettings,
    ) -> Self {
        Self {
            service,
            registry,
            settings,
        }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    pub fn backend(&self) -> &'static str {
        self.service.backend()
    }

    async fn bounded<T>(
        &self,
        limit: Duration,
        operation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match timeout(limit, operation).await {
            Ok(result) => result,
            Err(_) => Err(StudioError::Timeout(limit)),
        }
    }

    /// Reuses the registered sandbox when it still answers, otherwise creates a new one.
    #[instrument(skip(self), fields(backend = self.service.backend()))]
    pub async fn ensure_sandbox(&self, project_id: &str) -> Result<SandboxHandle> {
        let gate = self.registry.creation_lock(project_id);
        let _creating = gate.lock().await;
        if let Some(entry) = self.registry.get(project_id) {
            let connected = self
                .bounded(
                    self.settings.command_timeout,
                    self.service.connect(&entry.handle.sandbox_id),
                )
                .await;
            match connected {
                Ok(handle) => return Ok(handle),
                Err(err) => {
                    warn!(%err, sandbox_id = %entry.handle.sandbox_id, "reconnect failed, creating new sandbox");
                    self.registry.remove(project_id);
                }
            }
        }
        self.create_sandbox(project_id).await
    }

    async fn create_sandbox(&self, project_id: &str) -> Result<SandboxHandle> {
        let handle = self
            .bounded(
                self.settings.bootstrap_timeout,
                self.service.create(project_id),
            )
            .await?;
        self.registry.insert(project_id, handle.clone());

        let exposed = self
            .bounded(
                self.settings.command_timeout,
                self.service.expose_port(&handle, self.settings.dev_port),
            )
            .await;
        match exposed {
            Ok(url) => self.registry.set_url(project_id, url),
            Err(err) => warn!(%err, "could not expose dev port"),
        }
        info!(sandbox_id = %handle.sandbox_id, "sandbox created");
        Ok(handle)
    }

    pub fn sandbox_info(&self, project_id: &str) -> Option<SandboxInfo> {
        self.registry.peek(project_id).map(|entry| SandboxInfo {
            project_id: project_id.to_string(),
            sandbox_id: entry.handle.sandbox_id,
            url: entry.url,
            dev_server_running: entry.dev_server.is_some(),
        })
    }

    pub fn sandbox_url(&self, project_id: &str) -> Option<String> {
        self.registry.peek(project_id).and_then(|entry| entry.url)
    }

    #[instrument(skip(self, files), fields(files = files.len()))]
    pub async fn upload_files(
        &self,
        project_id: &str,
        files: &BTreeMap<String, String>,
        auto_start: bool,
    ) -> Result<UploadSummary> {
        let handle = self.ensure_sandbox(project_id).await?;
        let remapped: BTreeMap<String, String> = files
            .iter()
            .map(|(virtual_path, content)| (to_sandbox_path(&handle, virtual_path), content.clone()))
            .collect();
        let uploaded = self
            .bounded(
                self.settings.command_timeout,
                self.service.upload_files(&handle, &remapped),
            )
            .await?;

        let mut dev_server_started = false;
        let running = self
            .registry
            .peek(project_id)
            .and_then(|entry| entry.dev_server)
            .is_some();
        if auto_start && !running {
            match self.start_dev_server(project_id).await {
                Ok(_) => dev_server_started = true,
                Err(err) => warn!(%err, "auto start of dev server failed"),
            }
        }

        Ok(UploadSummary {
            uploaded,
            url: self.sandbox_url(project_id),
            dev_server_started,
        })
    }

    #[instrument(skip(self))]
    pub async fn start_dev_server(&self, project_id: &str) -> Result<Option<String>> {
        let handle = self.ensure_sandbox(project_id).await?;
        let root = shell_quote(&handle.code_root);

        let has_manifest = self
            .bounded(
                self.settings.command_timeout,
                self.service.run_command(
                    &handle,
                    &format!("test -f {root}/package.json"),
                    self.settings.command_timeout,
                ),
            )
            .await?
            .success();
        if has_manifest {
            let install = self
                .bounded(
                    self.settings.bootstrap_timeout,
                    self.service.run_command(
                        &handle,
                        &format!("cd {root} && {}", self.settings.install_command),
                        self.settings.bootstrap_timeout,
                    ),
                )
                .await?;
            if !install.success() {
                warn!(exit_code = install.exit_code, "dependency install failed");
            }
        }

        let process = self
            .bounded(
                self.settings.command_timeout,
                self.service.spawn_process(
                    &handle,
                    &format!(
                        "cd {root} && npx next dev --port {}",
                        self.settings.dev_port
                    ),
                ),
            )
            .await?;
        info!(process = %process, "dev server started");
        self.registry.set_dev_server(project_id, Some(process));
        Ok(self.sandbox_url(project_id))
    }

    #[instrument(skip(self))]
    pub async fn restart_dev_server(&self, project_id: &str) -> Result<String> {
        self.stop_dev_server(project_id).await;
        let url = self.start_dev_server(project_id).await?;
        Ok(match url {
            Some(url) => format!("Dev server restarted. Preview: {url}"),
            None => "Dev server restarted.".to_string(),
        })
    }

    async fn stop_dev_server(&self, project_id: &str) {
        let Some(entry) = self.registry.peek(project_id) else {
            return;
        };
        if let Some(process) = entry.dev_server {
            let stopped = self
                .bounded(
                    self.settings.command_timeout,
                    self.service.stop_process(&entry.handle, &process),
                )
                .await;
            if let Err(err) = stopped {
                warn!(%err, process = %process, "failed to stop dev server");
            }
            self.registry.set_dev_server(project_id, None);
        }
    }

    #[instrument(skip(self), fields(backend = self.service.backend()))]
    pub async fn run_command(&self, project_id: &str, command: &str) -> Result<CommandOutput> {
        let handle = self.ensure_sandbox(project_id).await?;
        let scoped = format!("cd {} && {command}", shell_quote(&handle.code_root));
        self.bounded(
            self.settings.command_timeout,
            self.service
                .run_command(&handle, &scoped, self.settings.command_timeout),
        )
        .await
    }

    pub async fn recent_logs(&self, project_id: &str, lines: usize) -> Result<String> {
        let Some(entry) = self.registry.get(project_id) else {
            return Ok(NO_ACTIVE_PROCESS.to_string());
        };
        let Some(process) = entry.dev_server else {
            return Ok(NO_ACTIVE_PROCESS.to_string());
        };
        self.bounded(
            self.settings.command_timeout,
            self.service.get_logs(&entry.handle, &process, lines),
        )
        .await
    }

    /// Sandbox code root as virtual `/dapp/` paths, minus dependency and build directories.
    #[instrument(skip(self), fields(backend = self.service.backend()))]
    pub async fn download_files(&self, project_id: &str) -> Result<BTreeMap<String, String>> {
        let handle = self.ensure_sandbox(project_id).await?;
        self.download_from(&handle).await
    }

    async fn download_from(&self, handle: &SandboxHandle) -> Result<BTreeMap<String, String>> {
        let raw = self
            .bounded(
                self.settings.command_timeout,
                self.service.download_files(handle, &handle.code_root),
            )
            .await?;
        let files: BTreeMap<String, String> = raw
            .into_iter()
            .filter(|(real, _)| !is_excluded_download(real))
            .filter_map(|(real, content)| {
                to_virtual_path(handle, &real).map(|virtual_path| (virtual_path, content))
            })
            .collect();
        info!(files = files.len(), "downloaded sandbox files");
        Ok(files)
    }

    #[instrument(skip(self))]
    pub async fn bootstrap_next(
        &self,
        project_id: &str,
        use_typescript: bool,
        use_tailwind: bool,
    ) -> Result<BootstrapOutcome> {
        let handle = self.ensure_sandbox(project_id).await?;
        let command = create_next_app_command(
            &handle,
            &self.settings.app_name,
            use_typescript,
            use_tailwind,
        );
        let output = self
            .bounded(
                self.settings.bootstrap_timeout,
                self.service
                    .run_command(&handle, &command, self.settings.bootstrap_timeout),
            )
            .await?;
        if !output.success() {
            return Err(StudioError::Sandbox(format!(
                "create-next-app failed\n{}",
                output.render()
            )));
        }
        let files = self.download_from(&handle).await?;
        Ok(BootstrapOutcome { files, output })
    }

    /// Tears down sandboxes idle past the configured TTL.
    pub async fn evict_idle(&self) -> usize {
        let evicted = self.registry.evict_idle(self.settings.idle_ttl);
        for (project_id, entry) in &evicted {
            if let Some(process) = &entry.dev_server {
                let stopped = self
                    .bounded(
                        self.settings.command_timeout,
                        self.service.stop_process(&entry.handle, process),
                    )
                    .await;
                if let Err(err) = stopped {
                    warn!(%err, project_id = %project_id, "failed to stop evicted dev server");
                }
            }
        }
        evicted.len()
    }

    pub async fn release(&self, project_id: &str) -> bool {
        self.stop_dev_server(project_id).await;
        self.registry.release(project_id).is_some()
    }
}

/// `/dapp/x` maps to `<code root>/x`; other absolute paths land under the code root verbatim.
pub fn to_sandbox_path(handle: &SandboxHandle, virtual_path: &str) -> String {
    let root = handle.code_root.trim_end_matches('/');
    if let Some(rest) = virtual_path.strip_prefix(DAPP_ROOT) {
        format!("{root}/{rest}")
    } else if virtual_path.starts_with('/') {
        format!("{root}{virtual_path}")
    } else {
        format!("{root}/{virtual_path}")
    }
}

pub fn to_virtual_path(handle: &SandboxHandle, sandbox_path: &str) -> Option<String> {
    let root = handle.code_root.trim_end_matches('/');
    let rest = sandbox_path.strip_prefix(root)?;
    let rest = rest.strip_prefix('/')?;
    if rest.is_empty() {
        return None;
    }
    Some(format!("{DAPP_ROOT}{rest}"))
}

pub fn is_excluded_download(path: &str) -> bool {
    path.contains("node_modules") || path.contains("/.next/")
}

pub fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Scaffolds into the scratch dir, then moves the generated tree over the code root.
pub fn create_next_app_command(
    handle: &SandboxHandle,
    app_name: &str,
    use_typescript: bool,
    use_tailwind: bool,
) -> String {
    let scratch = shell_quote(&handle.scratch_root);
    let root = shell_quote(&handle.code_root);
    let generated = shell_quote(&format!(
        "{}/{app_name}",
        handle.scratch_root.trim_end_matches('/')
    ));
    let language = if use_typescript { "--typescript" } else { "--js" };
    let tailwind = if use_tailwind {
        "--tailwind"
    } else {
        "--no-tailwind"
    };
    format!(
        "mkdir -p {scratch} && cd {scratch} && rm -rf {generated} && \
         npx --yes create-next-app@latest {app_name} --no-git --eslint --no-turbopack {language} {tailwind} \
         --app --no-src-dir --import-alias '@/*' && \
         mkdir -p {root} && rm -rf {root}/* && mv {generated}/* {root}/ && \
         (mv {generated}/.[!.]* {root}/ 2>/dev/null || true)"
    )
}
