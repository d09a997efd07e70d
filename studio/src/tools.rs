use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::path::ToolGates;

pub const SUMMARY_LIMIT: usize = 200;
pub const LOG_SUMMARY_LIMIT: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Shared,
    Blueprint,
    Dapp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    ListFiles,
    ReadFile,
    WriteFile,
    DeleteFile,
    GetProjectStructure,
    ValidateBlueprint,
    CompileBlueprint,
    RunBlueprintTests,
    ListBlueprintMethods,
    Grep,
    RunCommand,
    GetSandboxLogs,
    RestartDevServer,
    #[serde(rename = "bootstrap_nextjs_project")]
    BootstrapNextProject,
    DownloadSandboxFiles,
}

impl ToolName {
    pub const ALL: [ToolName; 15] = [
        ToolName::ListFiles,
        ToolName::ReadFile,
        ToolName::WriteFile,
        ToolName::DeleteFile,
        ToolName::GetProjectStructure,
        ToolName::ValidateBlueprint,
        ToolName::CompileBlueprint,
        ToolName::RunBlueprintTests,
        ToolName::ListBlueprintMethods,
        ToolName::Grep,
        ToolName::RunCommand,
        ToolName::GetSandboxLogs,
        ToolName::RestartDevServer,
        ToolName::BootstrapNextProject,
        ToolName::DownloadSandboxFiles,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::ListFiles => "list_files",
            ToolName::ReadFile => "read_file",
            ToolName::WriteFile => "write_file",
            ToolName::DeleteFile => "delete_file",
            ToolName::GetProjectStructure => "get_project_structure",
            ToolName::ValidateBlueprint => "validate_blueprint",
            ToolName::CompileBlueprint => "compile_blueprint",
            ToolName::RunBlueprintTests => "run_blueprint_tests",
            ToolName::ListBlueprintMethods => "list_blueprint_methods",
            ToolName::Grep => "grep",
            ToolName::RunCommand => "run_command",
            ToolName::GetSandboxLogs => "get_sandbox_logs",
            ToolName::RestartDevServer => "restart_dev_server",
            ToolName::BootstrapNextProject => "bootstrap_nextjs_project",
            ToolName::DownloadSandboxFiles => "download_sandbox_files",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        ToolName::ALL.into_iter().find(|name| name.as_str() == raw)
    }

    pub fn capability(self) -> Capability {
        match self {
            ToolName::ListFiles
            | ToolName::ReadFile
            | ToolName::WriteFile
            | ToolName::DeleteFile
            | ToolName::GetProjectStructure => Capability::Shared,
            ToolName::ValidateBlueprint
            | ToolName::CompileBlueprint
            | ToolName::RunBlueprintTests
            | ToolName::ListBlueprintMethods => Capability::Blueprint,
            ToolName::Grep
            | ToolName::RunCommand
            | ToolName::GetSandboxLogs
            | ToolName::RestartDevServer
            | ToolName::BootstrapNextProject
            | ToolName::DownloadSandboxFiles => Capability::Dapp,
        }
    }

    pub fn is_enabled(self, gates: ToolGates) -> bool {
        match self.capability() {
            Capability::Shared => true,
            Capability::Blueprint => gates.blueprint,
            Capability::Dapp => gates.dapp,
        }
    }

    pub fn needs_sandbox(self) -> bool {
        matches!(
            self,
            ToolName::RunCommand
                | ToolName::GetSandboxLogs
                | ToolName::RestartDevServer
                | ToolName::BootstrapNextProject
                | ToolName::DownloadSandboxFiles
        )
    }

    fn summary_limit(self) -> usize {
        match self {
            ToolName::GetSandboxLogs => LOG_SUMMARY_LIMIT,
            _ => SUMMARY_LIMIT,
        }
    }

    fn description(self) -> &'static str {
        match self {
            ToolName::ListFiles => "List files and directories under a path. Directories come first.",
            ToolName::ReadFile => "Read a file's content. Falls back to a case-insensitive filename match and reports the real path.",
            ToolName::WriteFile => "Create or overwrite a file. Paths must be under an enabled project root.",
            ToolName::DeleteFile => "Delete a file by exact path.",
            ToolName::GetProjectStructure => "Render the project as a directory tree.",
            ToolName::ValidateBlueprint => "Statically check a Hathor blueprint for syntax and common mistakes.",
            ToolName::CompileBlueprint => "Validate a blueprint and report whether it is ready to compile in the IDE.",
            ToolName::RunBlueprintTests => "Check that a pytest file is ready to run in the IDE.",
            ToolName::ListBlueprintMethods => "List @public and @view methods declared in a blueprint.",
            ToolName::Grep => "Search file contents with a case-insensitive regex (literal fallback).",
            ToolName::RunCommand => "Run a shell command in the sandbox code directory.",
            ToolName::GetSandboxLogs => "Tail the dev server log.",
            ToolName::RestartDevServer => "Restart the Next.js dev server in the sandbox.",
            ToolName::BootstrapNextProject => "Scaffold a new Next.js project in the sandbox and sync it into /dapp/.",
            ToolName::DownloadSandboxFiles => "Sync every file from the sandbox back into /dapp/.",
        }
    }

    fn parameters(self) -> Value {
        match self {
            ToolName::ListFiles => object(json!({ "path": string("Directory to list, default /") }), &[]),
            ToolName::ReadFile | ToolName::DeleteFile => {
                object(json!({ "path": string("Absolute file path") }), &["path"])
            }
            ToolName::WriteFile => object(
                json!({
                    "path": string("Absolute file path"),
                    "content": string("Full file content"),
                }),
                &["path", "content"],
            ),
            ToolName::GetProjectStructure
            | ToolName::RestartDevServer
            | ToolName::DownloadSandboxFiles => object(json!({}), &[]),
            ToolName::ValidateBlueprint
            | ToolName::CompileBlueprint
            | ToolName::ListBlueprintMethods => object(
                json!({ "file_path": string("Blueprint path, e.g. /blueprints/Counter.py") }),
                &["file_path"],
            ),
            ToolName::RunBlueprintTests => object(
                json!({ "test_file_path": string("Test file path, e.g. /tests/test_counter.py") }),
                &["test_file_path"],
            ),
            ToolName::Grep => object(
                json!({
                    "pattern": string("Regex or literal text"),
                    "path": string("File or directory prefix to search, default /"),
                }),
                &["pattern"],
            ),
            ToolName::RunCommand => object(
                json!({ "command": string("Shell command, run from the code root") }),
                &["command"],
            ),
            ToolName::GetSandboxLogs => object(
                json!({ "lines": { "type": "integer", "description": "Number of trailing lines, default 30" } }),
                &[],
            ),
            ToolName::BootstrapNextProject => object(
                json!({
                    "use_typescript": { "type": "boolean", "description": "Default true" },
                    "use_tailwind": { "type": "boolean", "description": "Default true" },
                }),
                &[],
            ),
        }
    }

    pub fn descriptor(self) -> ToolDescriptor {
        ToolDescriptor {
            name: self,
            description: self.description(),
            parameters: self.parameters(),
        }
    }
}

impl Display for ToolName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn string(description: &str) -> Value {
    json!({ "type": "string", "description": description })
}

fn object(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: ToolName,
    pub description: &'static str,
    pub parameters: Value,
}

impl ToolDescriptor {
    /// OpenAI-compatible `tools[]` entry.
    pub fn to_function_schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name.as_str(),
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Shared tools always, then each family the gates enable.
pub fn build_tool_manifest(gates: ToolGates) -> Vec<ToolDescriptor> {
    ToolName::ALL
        .into_iter()
        .filter(|name| name.is_enabled(gates))
        .map(ToolName::descriptor)
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Ok,
    Error,
}

impl InvocationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InvocationStatus::Ok => "ok",
            InvocationStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationRecord {
    pub tool_name: String,
    pub arguments: Value,
    pub result_summary: String,
    pub status: InvocationStatus,
    pub recorded_at: DateTime<Utc>,
}

impl ToolInvocationRecord {
    pub fn new(
        tool_name: impl Into<String>,
        arguments: Value,
        result: &str,
        status: InvocationStatus,
    ) -> Self {
        let tool_name = tool_name.into();
        let limit = ToolName::parse(&tool_name)
            .map(ToolName::summary_limit)
            .unwrap_or(SUMMARY_LIMIT);
        Self {
            tool_name,
            arguments,
            result_summary: truncate(result, limit),
            status,
            recorded_at: Utc::now(),
        }
    }
}

pub fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// What a tool hands back to the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Json(Value),
}

impl ToolOutput {
    pub fn into_text(self) -> String {
        match self {
            ToolOutput::Text(text) => text,
            ToolOutput::Json(value) => value.to_string(),
        }
    }

    pub fn as_summary(&self) -> String {
        match self {
            ToolOutput::Text(text) => text.clone(),
            ToolOutput::Json(value) => value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathArgs {
    #[serde(default = "root_path", alias = "file_path", alias = "directory")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriteArgs {
    #[serde(alias = "file_path")]
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlueprintArgs {
    #[serde(alias = "path", alias = "test_file_path")]
    pub file_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GrepArgs {
    pub pattern: String,
    #[serde(default = "root_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandArgs {
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogArgs {
    #[serde(default = "default_log_lines")]
    pub lines: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapArgs {
    #[serde(default = "enabled")]
    pub use_typescript: bool,
    #[serde(default = "enabled")]
    pub use_tailwind: bool,
}

fn root_path() -> String {
    "/".to_string()
}

fn default_log_lines() -> usize {
    30
}

fn enabled() -> bool {
    true
}
