use std::collections::BTreeMap;

use crate::environment::{EnvironmentKind, EnvironmentVerdict};
use crate::path::ToolGates;
use crate::tools::truncate;

pub const PREVIEW_CHARS: usize = 200;
const SECTION_SEPARATOR: &str = "\n\n---\n\n";

const CORE_SECTION: &str = "You are an AI assistant for Hathor blockchain development.

You help developers build:
- Blueprints: Hathor nano contracts written in Python
- dApps: Next.js web applications

Core principles:
1. Explore first. Use list_files and read_file before changing anything.
2. Explain what you are doing and which tools you use.
3. Write complete files. write_file replaces the whole file.
4. Tool errors are returned as text. Read them and correct the call.";

const BLUEPRINT_SECTION: &str = "Blueprint tools are enabled.
- Blueprint sources live in /blueprints/ or /contracts/, tests in /tests/.
- Run validate_blueprint after every edit, then compile_blueprint.
- Never assign containers directly (self.balances = {}). Container fields are auto-initialized.
- Use initialize() instead of __init__, and ctx.vertex.hash instead of ctx.address.
- Export the class with __blueprint__ = ClassName.
- Compilation and tests run in the IDE; the tools only check readiness.";

const DAPP_SECTION: &str = "dApp tools are enabled.
- dApp files live in /dapp/, which maps to the sandbox code root.
- For a new project call bootstrap_nextjs_project, then edit the generated files.
- Use run_command for package installs and builds, get_sandbox_logs to inspect the dev server.
- After changing files out of band in the sandbox, call download_sandbox_files.";

const SHARED_SECTION: &str = "Shared tools: list_files, read_file, write_file, delete_file, get_project_structure.
Paths are absolute. Writes outside the enabled project roots are rejected.";

pub fn build_system_prompt(kind: EnvironmentKind, gates: ToolGates) -> String {
    let mut sections = vec![
        CORE_SECTION.to_string(),
        format!("Current environment: {kind}"),
    ];
    if gates.blueprint {
        sections.push(BLUEPRINT_SECTION.to_string());
    }
    if gates.dapp {
        sections.push(DAPP_SECTION.to_string());
    }
    sections.push(SHARED_SECTION.to_string());
    sections.join("\n\n")
}

pub fn environment_info(verdict: &EnvironmentVerdict) -> String {
    format!(
        "Detected: {} (confidence: {:.0}%)\nReason: {}",
        verdict.kind,
        verdict.confidence * 100.0,
        verdict.reason
    )
}

/// Environment, file previews in path order, then the current message.
pub fn build_user_context(
    files: &BTreeMap<String, String>,
    message: &str,
    environment: Option<&str>,
) -> String {
    let mut parts = Vec::new();
    if let Some(environment) = environment {
        parts.push(format!("## Environment Detection\n\n{environment}"));
    }
    if !files.is_empty() {
        let mut listing = String::from("## Current Project Files\n");
        for (path, content) in files {
            listing.push_str(&format!(
                "\n### {path}\n```\n{}\n```\n",
                truncate(content, PREVIEW_CHARS)
            ));
        }
        parts.push(listing);
    }
    parts.push(format!("## User's Current Message\n\n{message}"));
    parts.join(SECTION_SEPARATOR)
}
