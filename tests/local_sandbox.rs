use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use integration_tests::support::{files, system_path, temp_workspace, ScriptedAgent};
use serde_json::json;
use studio::adapter::{SandboxAdapter, SandboxSettings, NO_ACTIVE_PROCESS};
use studio::errors::StudioError;
use studio::local::{LocalSandbox, LocalSandboxConfig};
use studio::registry::SandboxRegistry;
use studio::sandbox::SandboxService;
use studio::turn::{TurnRequest, TurnRunner};

fn adapter(root: &std::path::Path) -> Result<SandboxAdapter> {
    let config = LocalSandboxConfig::new(root)?.with_path_env(system_path());
    Ok(SandboxAdapter::new(
        Arc::new(LocalSandbox::new(config)),
        Arc::new(SandboxRegistry::new()),
        SandboxSettings::default().with_command_timeout(Duration::from_secs(5)),
    ))
}

#[tokio::test]
async fn upload_run_and_download_round_trip() -> Result<()> {
    let workspace = temp_workspace()?;
    let sandbox = adapter(workspace.path())?;

    let summary = sandbox
        .upload_files(
            "project-1",
            &files(&[("/dapp/app/page.tsx", "export default 1"), ("/dapp/README.md", "hi")]),
            false,
        )
        .await?;
    assert_eq!(summary.uploaded, 2);
    assert_eq!(summary.url.as_deref(), Some("http://localhost:3000"));
    assert!(!summary.dev_server_started);

    let output = sandbox.run_command("project-1", "cat app/page.tsx").await?;
    assert!(output.success());
    assert_eq!(output.stdout, "export default 1");

    sandbox
        .run_command(
            "project-1",
            "mkdir -p node_modules/pkg .next/cache && echo x > node_modules/pkg/index.js && echo y > .next/cache/a && echo z > app/extra.ts",
        )
        .await?;

    let downloaded = sandbox.download_files("project-1").await?;
    assert_eq!(
        downloaded.keys().collect::<Vec<_>>(),
        vec!["/dapp/README.md", "/dapp/app/extra.ts", "/dapp/app/page.tsx"]
    );
    assert_eq!(downloaded["/dapp/app/extra.ts"], "z\n");
    Ok(())
}

#[tokio::test]
async fn sandbox_is_reused_per_project() -> Result<()> {
    let workspace = temp_workspace()?;
    let sandbox = adapter(workspace.path())?;

    let first = sandbox.ensure_sandbox("project-1").await?;
    let second = sandbox.ensure_sandbox("project-1").await?;
    let other = sandbox.ensure_sandbox("project-2").await?;
    assert_eq!(first.sandbox_id, second.sandbox_id);
    assert_ne!(first.sandbox_id, other.sandbox_id);

    let info = sandbox.sandbox_info("project-1").expect("registered");
    assert!(!info.dev_server_running);

    assert!(sandbox.release("project-1").await);
    assert!(sandbox.sandbox_info("project-1").is_none());
    Ok(())
}

#[tokio::test]
async fn concurrent_ensure_creates_one_sandbox() -> Result<()> {
    let workspace = temp_workspace()?;
    let sandbox = adapter(workspace.path())?;

    let (first, second) = tokio::join!(
        sandbox.ensure_sandbox("project-1"),
        sandbox.ensure_sandbox("project-1")
    );
    assert_eq!(first?.sandbox_id, second?.sandbox_id);
    assert_eq!(sandbox.registry().len(), 1);

    let dirs = std::fs::read_dir(workspace.path())?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("local-"))
        .count();
    assert_eq!(dirs, 1);
    Ok(())
}

#[tokio::test]
async fn logs_without_dev_server_say_so() -> Result<()> {
    let workspace = temp_workspace()?;
    let sandbox = adapter(workspace.path())?;
    sandbox.ensure_sandbox("project-1").await?;
    assert_eq!(sandbox.recent_logs("project-1", 10).await?, NO_ACTIVE_PROCESS);
    Ok(())
}

#[tokio::test]
async fn spawned_process_logs_are_tailed() -> Result<()> {
    let workspace = temp_workspace()?;
    let config = LocalSandboxConfig::new(workspace.path())?.with_path_env(system_path());
    let service = LocalSandbox::new(config);
    let handle = service.create("project-1").await?;

    let process = service
        .spawn_process(&handle, "echo one; echo two; echo three")
        .await?;

    let mut tail = String::new();
    for _ in 0..50 {
        tail = service.get_logs(&handle, &process, 2).await?;
        if tail.contains("three") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(tail, "two\nthree");

    service.stop_process(&handle, &process).await?;
    assert!(service.get_logs(&handle, &process, 2).await.is_err());
    Ok(())
}

#[tokio::test]
async fn slow_command_times_out() -> Result<()> {
    let workspace = temp_workspace()?;
    let config = LocalSandboxConfig::new(workspace.path())?.with_path_env(system_path());
    let service = LocalSandbox::new(config);
    let handle = service.create("project-1").await?;

    let err = service
        .run_command(&handle, "sleep 5", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, StudioError::Timeout(_)));
    Ok(())
}

#[tokio::test]
async fn upload_outside_sandbox_is_refused() -> Result<()> {
    let workspace = temp_workspace()?;
    let config = LocalSandboxConfig::new(workspace.path())?.with_path_env(system_path());
    let service = LocalSandbox::new(config);
    let handle = service.create("project-1").await?;

    let err = service
        .upload_files(&handle, &files(&[("/etc/evil", "x")]))
        .await
        .unwrap_err();
    assert!(matches!(err, StudioError::OutsideRoot));
    Ok(())
}

#[tokio::test]
async fn turn_runs_commands_in_project_sandbox() -> Result<()> {
    let workspace = temp_workspace()?;
    let sandbox = adapter(workspace.path())?;
    sandbox
        .upload_files("project-9", &files(&[("/dapp/hello.txt", "from sandbox")]), false)
        .await?;

    let agent = ScriptedAgent::replying("ran it")
        .call("run_command", json!({ "command": "cat hello.txt" }))
        .call("get_sandbox_logs", json!({}));
    let runner = TurnRunner::new(Arc::new(agent)).with_sandbox(sandbox);

    let response = runner
        .run(TurnRequest::new("show the file", "project-9").with_files(files(&[("/dapp/hello.txt", "from sandbox")])))
        .await;

    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.sandbox_url.as_deref(), Some("http://localhost:3000"));
    assert!(response.tool_calls[0].result_summary.contains("STDOUT:\nfrom sandbox"));
    assert!(response.tool_calls[1].result_summary.contains("No active process"));
    Ok(())
}
