use std::sync::Arc;
use std::time::Duration;

use integration_tests::support::{files, Ending, ScriptedAgent};
use serde_json::json;
use studio::tools::InvocationStatus;
use studio::turn::{TurnRequest, TurnRunner};

#[tokio::test]
async fn turn_returns_only_changed_files() {
    let agent = ScriptedAgent::replying("Updated the page and added a button.")
        .call("read_file", json!({ "path": "/dapp/app/page.tsx" }))
        .call(
            "write_file",
            json!({ "path": "/dapp/app/page.tsx", "content": "export default function Page() { return <Button /> }" }),
        )
        .call(
            "write_file",
            json!({ "path": "/dapp/components/Button.tsx", "content": "export function Button() {}" }),
        )
        .call(
            "write_file",
            json!({ "path": "/blueprints/sneaky.py", "content": "class Sneaky: pass" }),
        )
        .call("write_file", json!({ "path": "/dapp/lib/utils.ts", "content": "export const x = 1" }));
    let runner = TurnRunner::new(Arc::new(agent));

    let request = TurnRequest::new("add a button to the page", "project-1").with_files(files(&[
        ("/dapp/app/page.tsx", "export default function Page() {}"),
        ("/dapp/lib/utils.ts", "export const x = 1"),
    ]));
    let response = runner.run(request).await;

    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.environment, "dapp");
    assert_eq!(response.confidence, 0.95);
    assert_eq!(response.message, "Updated the page and added a button.");
    assert_eq!(
        response.updated_files.keys().collect::<Vec<_>>(),
        vec!["/dapp/app/page.tsx", "/dapp/components/Button.tsx"]
    );

    assert_eq!(response.tool_calls.len(), 5);
    assert_eq!(response.tool_calls[3].status, InvocationStatus::Error);
    assert!(response.tool_calls[3]
        .result_summary
        .contains("Blueprint tools are not enabled"));
    assert_eq!(response.tool_calls[1].arguments["content_length"], json!(52));
}

#[tokio::test]
async fn empty_project_enables_both_families() {
    let agent = ScriptedAgent::replying("Scaffolded both sides.")
        .call(
            "write_file",
            json!({ "path": "/blueprints/counter.py", "content": "class Counter: pass" }),
        )
        .call("write_file", json!({ "path": "/dapp/app/page.tsx", "content": "page" }));
    let runner = TurnRunner::new(Arc::new(agent));

    let response = runner
        .run(TurnRequest::new("write a nano contract blueprint", "project-2"))
        .await;

    assert!(response.success);
    assert_eq!(response.environment, "empty");
    assert_eq!(response.confidence, 0.95);
    assert_eq!(response.updated_files.len(), 2);
    assert!(response
        .tool_calls
        .iter()
        .all(|record| record.status == InvocationStatus::Ok));
}

#[tokio::test]
async fn forced_environment_overrides_detection() {
    let agent = ScriptedAgent::replying("done")
        .call("write_file", json!({ "path": "/dapp/app/page.tsx", "content": "page" }));
    let runner = TurnRunner::new(Arc::new(agent));

    let request = TurnRequest::new("tweak", "project-3")
        .with_files(files(&[("/dapp/app/page.tsx", "old")]))
        .with_forced_environment("blueprint");
    let response = runner.run(request).await;

    assert!(response.success);
    assert_eq!(response.environment, "blueprint");
    assert_eq!(response.confidence, 1.0);
    assert!(response.updated_files.is_empty());
    assert_eq!(response.tool_calls[0].status, InvocationStatus::Error);
}

#[tokio::test]
async fn failed_turn_keeps_records_but_drops_delta() {
    let agent = ScriptedAgent::new(Ending::Fail("provider exploded".to_string()))
        .call("write_file", json!({ "path": "/dapp/app/page.tsx", "content": "new" }));
    let runner = TurnRunner::new(Arc::new(agent));

    let response = runner
        .run(TurnRequest::new("change it", "project-4").with_files(files(&[("/dapp/app/page.tsx", "old")])))
        .await;

    assert!(!response.success);
    assert!(response.updated_files.is_empty());
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(
        response.error.as_deref(),
        Some("agent execution failed: provider exploded")
    );
}

#[tokio::test]
async fn empty_model_response_gets_guidance() {
    let runner = TurnRunner::new(Arc::new(ScriptedAgent::new(Ending::Empty)));
    let response = runner
        .run(TurnRequest::new("hello", "project-5").with_files(files(&[("/dapp/a.ts", "a")])))
        .await;

    assert!(!response.success);
    assert!(response.message.starts_with("I'm having trouble processing this request"));
    assert!(response
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("Clear chat history"));
}

#[tokio::test]
async fn stalled_agent_hits_turn_timeout() {
    let agent = ScriptedAgent::new(Ending::Stall(Duration::from_secs(5)));
    let runner = TurnRunner::new(Arc::new(agent)).with_turn_timeout(Duration::from_millis(50));
    let response = runner.run(TurnRequest::new("hello", "project-6")).await;

    assert!(!response.success);
    assert!(response
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("timed out"));
}
