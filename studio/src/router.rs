use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use crate::adapter::SandboxAdapter;
use crate::blueprint;
use crate::errors::{Result, StudioError};
use crate::path::{self, ToolGates};
use crate::store::{StoreLimits, VirtualFileStore, WriteOutcome};
use crate::tools::{
    build_tool_manifest, BlueprintArgs, BootstrapArgs, CommandArgs, GrepArgs, InvocationStatus,
    LogArgs, PathArgs, ToolCall, ToolDescriptor, ToolInvocationRecord, ToolName, ToolOutput,
    WriteArgs,
};

/// Generated paths listed back to the agent after a bootstrap.
const BOOTSTRAP_LISTED_FILES: usize = 20;

/// Per-turn tool context. Owns the turn's files and the audit trail of every call.
pub struct ToolRouter {
    store: VirtualFileStore,
    original: BTreeMap<String, String>,
    gates: ToolGates,
    project_id: Option<String>,
    sandbox: Option<SandboxAdapter>,
    manifest: Vec<ToolDescriptor>,
    records: Vec<ToolInvocationRecord>,
}

impl ToolRouter {
    pub fn new(files: BTreeMap<String, String>, limits: StoreLimits, gates: ToolGates) -> Self {
        Self::from_store(VirtualFileStore::from_files(files, limits), gates)
    }

    pub fn from_store(store: VirtualFileStore, gates: ToolGates) -> Self {
        let original = store.files().clone();
        Self {
            store,
            original,
            gates,
            project_id: None,
            sandbox: None,
            manifest: build_tool_manifest(gates),
            records: Vec::new(),
        }
    }

    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        let project_id = project_id.into();
        if !project_id.trim().is_empty() {
            self.project_id = Some(project_id);
        }
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxAdapter) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn gates(&self) -> ToolGates {
        self.gates
    }

    pub fn manifest(&self) -> &[ToolDescriptor] {
        &self.manifest
    }

    pub fn store(&self) -> &VirtualFileStore {
        &self.store
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    pub fn records(&self) -> &[ToolInvocationRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<ToolInvocationRecord> {
        self.records
    }

    /// Files that are new or changed relative to the turn's input.
    pub fn updated_files(&self) -> BTreeMap<String, String> {
        self.store.updated_files(&self.original)
    }

    pub fn sandbox_url(&self) -> Option<String> {
        let project_id = self.project_id.as_deref()?;
        self.sandbox.as_ref()?.sandbox_url(project_id)
    }

    /// Never fails: errors come back as text the agent can act on.
    #[instrument(skip(self, call), fields(tool = %call.name))]
    pub async fn dispatch(&mut self, call: &ToolCall) -> ToolOutput {
        let result = match ToolName::parse(&call.name) {
            None => Err(StudioError::InvalidOperation(format!(
                "Unknown tool: {}",
                call.name
            ))),
            Some(name) if !name.is_enabled(self.gates) => Err(StudioError::PolicyViolation(
                format!("Tool {name} is not enabled for this project"),
            )),
            Some(name) => self.execute(name, &call.arguments).await,
        };

        let (output, status) = match result {
            Ok(output) => (output, InvocationStatus::Ok),
            Err(err) => (
                ToolOutput::Text(format!("Error: {err}")),
                InvocationStatus::Error,
            ),
        };
        debug!(?status, "tool call finished");
        self.records.push(ToolInvocationRecord::new(
            call.name.clone(),
            recorded_arguments(&call.arguments),
            &output.as_summary(),
            status,
        ));
        output
    }

    async fn execute(&mut self, name: ToolName, arguments: &Value) -> Result<ToolOutput> {
        match name {
            ToolName::ListFiles => {
                let args: PathArgs = parse_args(arguments)?;
                let entries = self.store.list_files(&args.path);
                Ok(ToolOutput::Json(to_json(&entries)?))
            }
            ToolName::ReadFile => {
                let args: PathArgs = parse_args(arguments)?;
                Ok(ToolOutput::Text(self.store.read_file(&args.path)?))
            }
            ToolName::WriteFile => {
                let args: WriteArgs = parse_args(arguments)?;
                match self.store.write_file(&args.path, &args.content, self.gates) {
                    WriteOutcome::Rejected(rejection) => {
                        Err(StudioError::PolicyViolation(rejection.to_string()))
                    }
                    applied => Ok(ToolOutput::Text(applied.to_string())),
                }
            }
            ToolName::DeleteFile => {
                let args: PathArgs = parse_args(arguments)?;
                let target = path::normalize(&args.path);
                path::check_write(&target, self.gates)
                    .map_err(|rejection| StudioError::PolicyViolation(rejection.to_string()))?;
                Ok(ToolOutput::Text(self.store.delete_file(&target)?))
            }
            ToolName::GetProjectStructure => {
                Ok(ToolOutput::Text(self.store.project_structure()))
            }
            ToolName::ValidateBlueprint => {
                let args: BlueprintArgs = parse_args(arguments)?;
                let report = blueprint::validate(&self.store, &args.file_path);
                Ok(ToolOutput::Text(report.to_string()))
            }
            ToolName::CompileBlueprint => {
                let args: BlueprintArgs = parse_args(arguments)?;
                Ok(ToolOutput::Text(blueprint::compile(&self.store, &args.file_path)))
            }
            ToolName::RunBlueprintTests => {
                let args: BlueprintArgs = parse_args(arguments)?;
                Ok(ToolOutput::Text(blueprint::test_readiness(
                    &self.store,
                    &args.file_path,
                )?))
            }
            ToolName::ListBlueprintMethods => {
                let args: BlueprintArgs = parse_args(arguments)?;
                Ok(ToolOutput::Text(blueprint::list_methods(
                    &self.store,
                    &args.file_path,
                )?))
            }
            ToolName::Grep => {
                let args: GrepArgs = parse_args(arguments)?;
                let matches = self.store.grep(&args.pattern, &args.path);
                if matches.is_empty() {
                    return Ok(ToolOutput::Text(format!(
                        "No matches found for '{}' in {}",
                        args.pattern, args.path
                    )));
                }
                Ok(ToolOutput::Json(to_json(&matches)?))
            }
            ToolName::RunCommand => {
                let args: CommandArgs = parse_args(arguments)?;
                let (adapter, project_id) = self.sandbox_context()?;
                info!(project_id = %project_id, "running sandbox command");
                let output = adapter.run_command(&project_id, &args.command).await?;
                Ok(ToolOutput::Text(output.render()))
            }
            ToolName::GetSandboxLogs => {
                let args: LogArgs = parse_args(arguments)?;
                let (adapter, project_id) = self.sandbox_context()?;
                let logs = adapter.recent_logs(&project_id, args.lines).await?;
                if logs.trim().is_empty() {
                    return Ok(ToolOutput::Text("No log output yet".to_string()));
                }
                Ok(ToolOutput::Text(logs))
            }
            ToolName::RestartDevServer => {
                let (adapter, project_id) = self.sandbox_context()?;
                Ok(ToolOutput::Text(
                    adapter.restart_dev_server(&project_id).await?,
                ))
            }
            ToolName::BootstrapNextProject => {
                let args: BootstrapArgs = parse_args(arguments)?;
                let (adapter, project_id) = self.sandbox_context()?;
                let outcome = adapter
                    .bootstrap_next(&project_id, args.use_typescript, args.use_tailwind)
                    .await?;
                let paths: Vec<String> = outcome.files.keys().cloned().collect();
                let merged = self.store.merge(outcome.files);
                Ok(ToolOutput::Text(describe_bootstrap(merged, &paths)))
            }
            ToolName::DownloadSandboxFiles => {
                let (adapter, project_id) = self.sandbox_context()?;
                let files = adapter.download_files(&project_id).await?;
                let merged = self.store.merge(files);
                Ok(ToolOutput::Text(format!(
                    "Downloaded {merged} files from sandbox into /dapp/"
                )))
            }
        }
    }

    fn sandbox_context(&self) -> Result<(SandboxAdapter, String)> {
        let project_id = self.project_id.clone().ok_or_else(|| {
            StudioError::InvalidOperation(
                "No project_id available, sandbox tools need an active project".to_string(),
            )
        })?;
        let adapter = self.sandbox.clone().ok_or_else(|| {
            StudioError::SandboxUnavailable(format!(
                "{project_id} (no sandbox backend configured)"
            ))
        })?;
        Ok((adapter, project_id))
    }
}

fn parse_args<T: DeserializeOwned>(arguments: &Value) -> Result<T> {
    let arguments = match arguments {
        Value::Null => json!({}),
        other => other.clone(),
    };
    serde_json::from_value(arguments)
        .map_err(|err| StudioError::InvalidOperation(format!("invalid tool arguments: {err}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|err| StudioError::InvalidOperation(format!("could not encode tool result: {err}")))
}

/// File bodies are replaced by their length so records stay small.
fn recorded_arguments(arguments: &Value) -> Value {
    let mut recorded = arguments.clone();
    if let Some(object) = recorded.as_object_mut() {
        let length = object
            .get("content")
            .and_then(Value::as_str)
            .map(|content| content.chars().count());
        if let Some(length) = length {
            object.remove("content");
            object.insert("content_length".to_string(), json!(length));
        }
    }
    recorded
}

fn describe_bootstrap(merged: usize, paths: &[String]) -> String {
    let mut out = format!("Created Next.js project with {merged} files in /dapp/:\n");
    for listed in paths.iter().take(BOOTSTRAP_LISTED_FILES) {
        out.push_str(&format!("  {listed}\n"));
    }
    if paths.len() > BOOTSTRAP_LISTED_FILES {
        out.push_str(&format!(
            "  ... and {} more files\n",
            paths.len() - BOOTSTRAP_LISTED_FILES
        ));
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(files: &[(&str, &str)], gates: ToolGates) -> ToolRouter {
        let files = files
            .iter()
            .map(|(path, content)| (path.to_string(), content.to_string()))
            .collect();
        ToolRouter::new(files, StoreLimits::default(), gates)
    }

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall::new("call-1", name, arguments)
    }

    #[tokio::test]
    async fn write_records_length_not_content() {
        let mut router = router(&[], ToolGates::all());
        let output = router
            .dispatch(&call(
                "write_file",
                json!({ "path": "/dapp/app/page.tsx", "content": "hello" }),
            ))
            .await;
        assert_eq!(output.into_text(), "Created /dapp/app/page.tsx (5 chars)");
        let record = &router.records()[0];
        assert_eq!(record.status, InvocationStatus::Ok);
        assert_eq!(record.arguments["content_length"], json!(5));
        assert!(record.arguments.get("content").is_none());
    }

    #[tokio::test]
    async fn disabled_tool_is_refused_and_recorded() {
        let mut router = router(&[], ToolGates::new(true, false));
        let output = router
            .dispatch(&call("run_command", json!({ "command": "ls" })))
            .await;
        assert!(output.into_text().contains("not enabled"));
        assert_eq!(router.records()[0].status, InvocationStatus::Error);
    }

    #[tokio::test]
    async fn sandbox_tools_need_a_project_id() {
        let mut router = router(&[], ToolGates::all());
        let output = router
            .dispatch(&call("get_sandbox_logs", Value::Null))
            .await;
        assert!(output.into_text().contains("No project_id available"));
    }

    #[tokio::test]
    async fn unknown_tool_is_reported() {
        let mut router = router(&[], ToolGates::all());
        let output = router.dispatch(&call("format_disk", json!({}))).await;
        assert_eq!(output.into_text(), "Error: invalid operation: Unknown tool: format_disk");
    }

    #[tokio::test]
    async fn delete_follows_write_policy() {
        let mut router = router(&[("/blueprints/a.py", "x")], ToolGates::new(false, true));
        let output = router
            .dispatch(&call("delete_file", json!({ "path": "/blueprints/a.py" })))
            .await;
        assert!(output.into_text().starts_with("Error: Blueprint tools are not enabled"));
        assert!(router.store().contains("/blueprints/a.py"));
    }

    #[test]
    fn bootstrap_summary_is_bounded() {
        let paths: Vec<String> = (0..25).map(|idx| format!("/dapp/f{idx}.ts")).collect();
        let text = describe_bootstrap(25, &paths);
        assert!(text.starts_with("Created Next.js project with 25 files"));
        assert!(text.ends_with("... and 5 more files"));
    }
}
