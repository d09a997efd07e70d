use integration_tests::support::files;
use serde_json::json;
use studio::path::ToolGates;
use studio::router::ToolRouter;
use studio::store::StoreLimits;
use studio::tools::{InvocationStatus, ToolCall, ToolOutput};

const COUNTER: &str = r#"from hathor.nanocontracts import Blueprint
from hathor.nanocontracts.context import Context
from hathor.nanocontracts.types import public, view


class Counter(Blueprint):
    count: int

    @public
    def initialize(self, ctx: Context) -> None:
        self.count = 0

    @public
    def increment(self, ctx: Context, amount: int) -> None:
        self.count += amount

    @view
    def get_count(self) -> int:
        return self.count


__blueprint__ = Counter
"#;

fn blueprint_router(entries: &[(&str, &str)]) -> ToolRouter {
    ToolRouter::new(files(entries), StoreLimits::default(), ToolGates::new(true, false))
        .with_project_id("project-1")
}

fn call(name: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall::new("call", name, arguments)
}

#[tokio::test]
async fn blueprint_workflow_validates_and_compiles() {
    let mut router = blueprint_router(&[("/blueprints/counter.py", COUNTER)]);

    let validation = router
        .dispatch(&call("validate_blueprint", json!({ "file_path": "/blueprints/counter.py" })))
        .await
        .into_text();
    assert_eq!(
        validation,
        "/blueprints/counter.py passed validation. Ready for compilation."
    );

    let compiled = router
        .dispatch(&call("compile_blueprint", json!({ "path": "/blueprints/counter.py" })))
        .await
        .into_text();
    assert!(compiled.starts_with("Blueprint ready for compilation: /blueprints/counter.py"));

    let methods = router
        .dispatch(&call("list_blueprint_methods", json!({ "file_path": "/blueprints/counter.py" })))
        .await
        .into_text();
    assert!(methods.contains("@public methods (state-changing):"));
    assert!(methods.contains("def increment(self, ctx: Context, amount: int) -> None:"));
    assert!(methods.contains("def get_count(self) -> int:"));

    assert_eq!(router.records().len(), 3);
    assert!(router.updated_files().is_empty());
}

#[tokio::test]
async fn container_assignment_blocks_compilation() {
    let broken = COUNTER.replace("count: int", "balances: dict[str, int]").replace(
        "self.count = 0",
        "self.balances = {}",
    );
    let mut router = blueprint_router(&[("/blueprints/counter.py", broken.as_str())]);

    let compiled = router
        .dispatch(&call("compile_blueprint", json!({ "file_path": "/blueprints/counter.py" })))
        .await
        .into_text();
    assert!(compiled.starts_with("Cannot compile due to validation errors:"));
    assert!(compiled.contains("[CRITICAL] Container field assignment detected: self.balances = {}"));
}

#[tokio::test]
async fn syntax_errors_report_a_line() {
    let mut router = blueprint_router(&[("/contracts/bad.py", "class Bad(Blueprint:\n    pass\n")]);
    let validation = router
        .dispatch(&call("validate_blueprint", json!({ "file_path": "/contracts/bad.py" })))
        .await
        .into_text();
    assert!(validation.starts_with("Syntax error in /contracts/bad.py on line"));
}

#[tokio::test]
async fn dapp_tools_are_hidden_and_refused_for_blueprints() {
    let mut router = blueprint_router(&[("/blueprints/counter.py", COUNTER)]);
    assert!(router
        .manifest()
        .iter()
        .all(|descriptor| descriptor.name.as_str() != "run_command"));

    let refused = router
        .dispatch(&call("run_command", json!({ "command": "ls" })))
        .await
        .into_text();
    assert_eq!(
        refused,
        "Error: Tool run_command is not enabled for this project"
    );
    assert_eq!(router.records()[0].status, InvocationStatus::Error);
}

#[tokio::test]
async fn sandbox_tools_without_backend_report_errors() {
    let mut router = ToolRouter::new(files(&[]), StoreLimits::default(), ToolGates::new(false, true))
        .with_project_id("project-1");
    let output = router
        .dispatch(&call("run_command", json!({ "command": "ls" })))
        .await
        .into_text();
    assert!(output.starts_with("Error: no sandbox found for project project-1"));

    let mut orphan = ToolRouter::new(files(&[]), StoreLimits::default(), ToolGates::new(false, true));
    let output = orphan
        .dispatch(&call("download_sandbox_files", json!({})))
        .await
        .into_text();
    assert!(output.contains("No project_id available"));
}

#[tokio::test]
async fn shared_tools_work_in_any_environment() {
    let mut router = ToolRouter::new(
        files(&[("/dapp/app/page.tsx", "export default function Page() {}")]),
        StoreLimits::default(),
        ToolGates::new(false, true),
    );

    let listing = router.dispatch(&call("list_files", json!({ "path": "/dapp/app" }))).await;
    match listing {
        ToolOutput::Json(value) => assert_eq!(value[0]["name"], json!("page.tsx")),
        other => panic!("unexpected output {other:?}"),
    }

    let found = router
        .dispatch(&call("grep", json!({ "pattern": "PAGE" })))
        .await;
    assert!(matches!(found, ToolOutput::Json(_)));

    let deleted = router
        .dispatch(&call("delete_file", json!({ "path": "/dapp/app/page.tsx" })))
        .await
        .into_text();
    assert_eq!(deleted, "Deleted /dapp/app/page.tsx");

    let missing = router
        .dispatch(&call("read_file", json!({ "path": "/dapp/app/page.tsx" })))
        .await
        .into_text();
    assert!(missing.starts_with("Error: File not found: /dapp/app/page.tsx"));
}
