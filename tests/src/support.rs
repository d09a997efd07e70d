use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use studio::agent::{Agent, AgentOutcome, AgentRequest};
use studio::errors::StudioError;
use studio::router::ToolRouter;
use studio::tools::ToolCall;
use tempfile::{tempdir, TempDir};

pub fn temp_workspace() -> Result<TempDir> {
    Ok(tempdir()?)
}

pub fn system_path() -> String {
    env::var("PATH").unwrap_or_else(|_| {
        "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string()
    })
}

pub fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(path, content)| (path.to_string(), content.to_string()))
        .collect()
}

/// How a scripted run ends once every call has been dispatched.
#[derive(Debug, Clone)]
pub enum Ending {
    Reply(String),
    Empty,
    Fail(String),
    Stall(Duration),
}

/// Agent that replays a fixed list of tool calls, then ends as told.
#[derive(Debug, Clone)]
pub struct ScriptedAgent {
    calls: Vec<ToolCall>,
    ending: Ending,
}

impl ScriptedAgent {
    pub fn new(ending: Ending) -> Self {
        Self {
            calls: Vec::new(),
            ending,
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::new(Ending::Reply(text.to_string()))
    }

    pub fn call(mut self, name: &str, arguments: Value) -> Self {
        let id = format!("call-{}", self.calls.len() + 1);
        self.calls.push(ToolCall::new(id, name, arguments));
        self
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn run(
        &self,
        _request: AgentRequest,
        router: &mut ToolRouter,
    ) -> studio::errors::Result<AgentOutcome> {
        for call in &self.calls {
            router.dispatch(call).await;
        }
        match &self.ending {
            Ending::Reply(text) => Ok(AgentOutcome {
                output: text.clone(),
                tool_calls: self.calls.clone(),
                steps: self.calls.len() + 1,
            }),
            Ending::Empty => Err(StudioError::EmptyModelResponse),
            Ending::Fail(reason) => Err(StudioError::AgentFailed(reason.clone())),
            Ending::Stall(pause) => {
                tokio::time::sleep(*pause).await;
                Err(StudioError::AgentFailed("stalled".to_string()))
            }
        }
    }
}
