use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::errors::{Result, StudioError};
use crate::sandbox::{CommandOutput, ProcessId, SandboxHandle, SandboxService};

pub const DEFAULT_CODE_ROOT: &str = "/app";
pub const DEFAULT_SCRATCH_ROOT: &str = "/tmp";

#[derive(Clone, Debug)]
pub struct RemoteSandboxConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

impl RemoteSandboxConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

/// Client for a hosted sandbox service speaking JSON over HTTP. File bodies travel base64-encoded.
#[derive(Debug)]
pub struct RemoteSandbox {
    http: reqwest::Client,
    config: RemoteSandboxConfig,
}

impl RemoteSandbox {
    pub fn new(config: RemoteSandboxConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| StudioError::InvalidOperation(err.to_string()))?;
        Ok(Self { http, config })
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/v1/sandboxes{suffix}",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn execute(&self, request: RequestBuilder, sandbox_id: &str) -> Result<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|err| StudioError::Network(err.to_string()))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StudioError::SandboxUnavailable(sandbox_id.to_string()));
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unavailable>".to_string());
            return Err(StudioError::Sandbox(format!(
                "sandbox request failed with status {status}: {body}"
            )));
        }
        Ok(response)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, sandbox_id: &str) -> Result<T> {
        self.execute(request, sandbox_id)
            .await?
            .json::<T>()
            .await
            .map_err(|err| StudioError::Sandbox(format!("invalid sandbox response payload: {err}")))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequest<'a> {
    project_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SandboxResponse {
    sandbox_id: String,
    #[serde(default)]
    code_root: Option<String>,
    #[serde(default)]
    scratch_root: Option<String>,
}

impl From<SandboxResponse> for SandboxHandle {
    fn from(response: SandboxResponse) -> Self {
        SandboxHandle::new(
            response.sandbox_id,
            response
                .code_root
                .unwrap_or_else(|| DEFAULT_CODE_ROOT.to_string()),
            response
                .scratch_root
                .unwrap_or_else(|| DEFAULT_SCRATCH_ROOT.to_string()),
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncodedFile {
    path: String,
    content_base64: String,
}

#[derive(Debug, Serialize)]
struct UploadRequest {
    files: Vec<EncodedFile>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    written: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecRequest<'a> {
    command: &'a str,
    timeout_secs: u64,
}

#[derive(Debug, Serialize)]
struct SpawnRequest<'a> {
    command: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpawnResponse {
    process_id: String,
}

#[derive(Debug, Serialize)]
struct DownloadRequest<'a> {
    root: &'a str,
}

#[derive(Debug, Deserialize)]
struct DownloadResponse {
    files: Vec<EncodedFile>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LogsRequest<'a> {
    process_id: &'a str,
    lines: usize,
}

#[derive(Debug, Deserialize)]
struct LogsResponse {
    lines: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ExposeRequest {
    port: u16,
}

#[derive(Debug, Deserialize)]
struct ExposeResponse {
    url: String,
}

#[async_trait]
impl SandboxService for RemoteSandbox {
    fn backend(&self) -> &'static str {
        "remote"
    }

    #[instrument(skip(self))]
    async fn create(&self, project_id: &str) -> Result<SandboxHandle> {
        let request = self
            .http
            .post(self.url(""))
            .json(&CreateRequest { project_id });
        let response: SandboxResponse = self.send(request, project_id).await?;
        Ok(response.into())
    }

    async fn connect(&self, sandbox_id: &str) -> Result<SandboxHandle> {
        let request = self.http.get(self.url(&format!("/{sandbox_id}")));
        let response: SandboxResponse = self.send(request, sandbox_id).await?;
        Ok(response.into())
    }

    #[instrument(skip(self, handle, files), fields(sandbox_id = %handle.sandbox_id, files = files.len()))]
    async fn upload_files(
        &self,
        handle: &SandboxHandle,
        files: &BTreeMap<String, String>,
    ) -> Result<usize> {
        let payload = UploadRequest {
            files: files
                .iter()
                .map(|(path, content)| EncodedFile {
                    path: path.clone(),
                    content_base64: STANDARD.encode(content.as_bytes()),
                })
                .collect(),
        };
        let request = self
            .http
            .post(self.url(&format!("/{}/files", handle.sandbox_id)))
            .json(&payload);
        let response: UploadResponse = self.send(request, &handle.sandbox_id).await?;
        Ok(response.written)
    }

    #[instrument(skip(self, handle), fields(sandbox_id = %handle.sandbox_id))]
    async fn run_command(
        &self,
        handle: &SandboxHandle,
        command: &str,
        limit: Duration,
    ) -> Result<CommandOutput> {
        let request = self
            .http
            .post(self.url(&format!("/{}/exec", handle.sandbox_id)))
            .timeout(limit + self.config.request_timeout)
            .json(&ExecRequest {
                command,
                timeout_secs: limit.as_secs().max(1),
            });
        self.send(request, &handle.sandbox_id).await
    }

    async fn spawn_process(&self, handle: &SandboxHandle, command: &str) -> Result<ProcessId> {
        let request = self
            .http
            .post(self.url(&format!("/{}/processes", handle.sandbox_id)))
            .json(&SpawnRequest { command });
        let response: SpawnResponse = self.send(request, &handle.sandbox_id).await?;
        Ok(ProcessId(response.process_id))
    }

    async fn stop_process(&self, handle: &SandboxHandle, process: &ProcessId) -> Result<()> {
        let request = self.http.delete(self.url(&format!(
            "/{}/processes/{}",
            handle.sandbox_id, process.0
        )));
        self.execute(request, &handle.sandbox_id).await?;
        Ok(())
    }

    #[instrument(skip(self, handle), fields(sandbox_id = %handle.sandbox_id))]
    async fn download_files(
        &self,
        handle: &SandboxHandle,
        root: &str,
    ) -> Result<BTreeMap<String, String>> {
        let request = self
            .http
            .post(self.url(&format!("/{}/download", handle.sandbox_id)))
            .json(&DownloadRequest { root });
        let response: DownloadResponse = self.send(request, &handle.sandbox_id).await?;

        let mut files = BTreeMap::new();
        for file in response.files {
            let decoded = STANDARD
                .decode(file.content_base64.as_bytes())
                .map_err(|err| StudioError::Sandbox(format!("invalid file encoding for {}: {err}", file.path)))?;
            match String::from_utf8(decoded) {
                Ok(content) => {
                    files.insert(file.path, content);
                }
                Err(_) => warn!(path = %file.path, "skipping non-UTF-8 file"),
            }
        }
        Ok(files)
    }

    async fn get_logs(
        &self,
        handle: &SandboxHandle,
        process: &ProcessId,
        lines: usize,
    ) -> Result<String> {
        let request = self
            .http
            .post(self.url(&format!("/{}/logs", handle.sandbox_id)))
            .json(&LogsRequest {
                process_id: &process.0,
                lines,
            });
        let response: LogsResponse = self.send(request, &handle.sandbox_id).await?;
        Ok(response.lines.join("\n"))
    }

    async fn expose_port(&self, handle: &SandboxHandle, port: u16) -> Result<String> {
        let request = self
            .http
            .post(self.url(&format!("/{}/ports", handle.sandbox_id)))
            .json(&ExposeRequest { port });
        let response: ExposeResponse = self.send(request, &handle.sandbox_id).await?;
        Ok(response.url)
    }
}
