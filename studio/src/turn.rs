use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{info, instrument, warn};

use crate::adapter::SandboxAdapter;
use crate::agent::{Agent, AgentRequest, ConversationMessage};
use crate::environment::{classify, EnvironmentKind, EnvironmentVerdict};
use crate::errors::StudioError;
use crate::prompt::{build_system_prompt, build_user_context, environment_info};
use crate::router::ToolRouter;
use crate::store::{StoreLimits, VirtualFileStore};
use crate::tools::{build_tool_manifest, ToolInvocationRecord};

pub const UNKNOWN_ENVIRONMENT: &str = "unknown";

const EMPTY_RESPONSE_GUIDANCE: &str = "The AI model couldn't generate a response. This may be due to:
- Conversation history is too long
- Input contains problematic content
- API rate limits

Try:
- Clear chat history
- Simplify your request
- Wait a moment and try again";

const EMPTY_RESPONSE_MESSAGE: &str =
    "I'm having trouble processing this request. Please try clearing the chat or simplifying your message.";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub message: String,
    #[serde(default, alias = "project_id")]
    pub project_id: String,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default, alias = "conversation_history")]
    pub conversation_history: Vec<ConversationMessage>,
    #[serde(default, alias = "force_environment")]
    pub force_environment: Option<String>,
}

impl TurnRequest {
    pub fn new(message: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            project_id: project_id.into(),
            ..Self::default()
        }
    }

    pub fn with_files(mut self, files: BTreeMap<String, String>) -> Self {
        self.files = files;
        self
    }

    pub fn with_history(mut self, history: Vec<ConversationMessage>) -> Self {
        self.conversation_history = history;
        self
    }

    pub fn with_forced_environment(mut self, kind: impl Into<String>) -> Self {
        self.force_environment = Some(kind.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResponse {
    pub success: bool,
    pub message: String,
    pub environment: String,
    pub confidence: f64,
    pub tool_calls: Vec<ToolInvocationRecord>,
    pub updated_files: BTreeMap<String, String>,
    pub sandbox_url: Option<String>,
    pub error: Option<String>,
}

impl TurnResponse {
    fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: String::new(),
            environment: UNKNOWN_ENVIRONMENT.to_string(),
            confidence: 0.0,
            tool_calls: Vec::new(),
            updated_files: BTreeMap::new(),
            sandbox_url: None,
            error: Some(error.into()),
        }
    }

    fn failed(verdict: &EnvironmentVerdict, message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            environment: verdict.kind.to_string(),
            confidence: verdict.confidence,
            tool_calls: Vec::new(),
            updated_files: BTreeMap::new(),
            sandbox_url: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TurnLimits {
    pub max_files: usize,
    pub max_file_bytes: usize,
    pub max_message_chars: usize,
}

impl Default for TurnLimits {
    fn default() -> Self {
        Self {
            max_files: 100,
            max_file_bytes: 1_000_000,
            max_message_chars: 10_000,
        }
    }
}

impl TurnLimits {
    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    pub fn with_max_file_bytes(mut self, max_file_bytes: usize) -> Self {
        self.max_file_bytes = max_file_bytes;
        self
    }

    pub fn with_max_message_chars(mut self, max_message_chars: usize) -> Self {
        self.max_message_chars = max_message_chars;
        self
    }

    fn store_limits(self) -> StoreLimits {
        StoreLimits::default().with_max_file_bytes(self.max_file_bytes)
    }

    /// Returns the forced environment, if one was requested and is valid.
    pub fn validate(&self, request: &TurnRequest) -> Result<Option<EnvironmentKind>, String> {
        if request.message.trim().is_empty() {
            return Err("Message cannot be empty".to_string());
        }
        if request.files.len() > self.max_files {
            return Err(format!("Too many files (max {})", self.max_files));
        }
        if request.message.chars().count() > self.max_message_chars {
            return Err(format!(
                "Message too long (max {} chars)",
                self.max_message_chars
            ));
        }
        if let Some((path, _)) = request
            .files
            .iter()
            .find(|(_, content)| content.len() > self.max_file_bytes)
        {
            return Err(format!(
                "File {path} too large (max {} bytes)",
                self.max_file_bytes
            ));
        }
        match request.force_environment.as_deref() {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => EnvironmentKind::parse(raw).map(Some).ok_or_else(|| {
                format!("Invalid forceEnvironment value: {raw} (expected blueprint, dapp, mixed or empty)")
            }),
        }
    }
}

/// One conversation turn: classify, gate tools, run the agent, report the file delta.
#[derive(Clone)]
pub struct TurnRunner {
    agent: Option<Arc<dyn Agent>>,
    agent_unavailable: String,
    sandbox: Option<SandboxAdapter>,
    limits: TurnLimits,
    turn_timeout: Duration,
}

impl TurnRunner {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self {
            agent: Some(agent),
            agent_unavailable: String::new(),
            sandbox: None,
            limits: TurnLimits::default(),
            turn_timeout: Duration::from_secs(300),
        }
    }

    /// A runner that answers every turn with the static fallback.
    pub fn unconfigured(reason: impl Into<String>) -> Self {
        Self {
            agent: None,
            agent_unavailable: reason.into(),
            sandbox: None,
            limits: TurnLimits::default(),
            turn_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_sandbox(mut self, sandbox: SandboxAdapter) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_limits(mut self, limits: TurnLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_turn_timeout(mut self, turn_timeout: Duration) -> Self {
        self.turn_timeout = turn_timeout;
        self
    }

    pub fn limits(&self) -> TurnLimits {
        self.limits
    }

    pub fn is_configured(&self) -> bool {
        self.agent.is_some()
    }

    pub fn sandbox(&self) -> Option<&SandboxAdapter> {
        self.sandbox.as_ref()
    }

    #[instrument(skip(self, request), fields(project_id = %request.project_id, files = request.files.len()))]
    pub async fn run(&self, request: TurnRequest) -> TurnResponse {
        let forced = match self.limits.validate(&request) {
            Ok(forced) => forced,
            Err(error) => {
                warn!(%error, "turn rejected");
                return TurnResponse::rejected(error);
            }
        };

        let store = VirtualFileStore::from_files(request.files, self.limits.store_limits());
        let verdict = match forced {
            Some(kind) => EnvironmentVerdict::forced(kind),
            None => classify(&store, Some(&request.message)),
        };
        info!(
            kind = %verdict.kind,
            confidence = verdict.confidence,
            reason = %verdict.reason,
            "environment detected"
        );

        let gates = verdict.gates();
        let Some(agent) = self.agent.clone() else {
            return TurnResponse::failed(
                &verdict,
                self.fallback_message(&verdict),
                format!("AI provider not configured: {}", self.agent_unavailable),
            );
        };

        let mut router = ToolRouter::from_store(store, gates).with_project_id(&request.project_id);
        if gates.dapp {
            if let Some(sandbox) = &self.sandbox {
                router = router.with_sandbox(sandbox.clone());
            }
        }

        let agent_request = AgentRequest {
            system_prompt: build_system_prompt(verdict.kind, gates),
            user_prompt: build_user_context(
                router.store().files(),
                &request.message,
                Some(&environment_info(&verdict)),
            ),
            history: request.conversation_history,
        };

        let outcome = match timeout(self.turn_timeout, agent.run(agent_request, &mut router)).await {
            Ok(result) => result,
            Err(_) => Err(StudioError::Timeout(self.turn_timeout)),
        };

        match outcome {
            Ok(outcome) => {
                let updated_files = router.updated_files();
                info!(
                    steps = outcome.steps,
                    tool_calls = router.records().len(),
                    updated_files = updated_files.len(),
                    "turn completed"
                );
                TurnResponse {
                    success: true,
                    message: outcome.output,
                    environment: verdict.kind.to_string(),
                    confidence: verdict.confidence,
                    sandbox_url: router.sandbox_url(),
                    tool_calls: router.into_records(),
                    updated_files,
                    error: None,
                }
            }
            Err(StudioError::EmptyModelResponse) => {
                warn!("model returned an empty response");
                TurnResponse {
                    tool_calls: router.into_records(),
                    ..TurnResponse::failed(&verdict, EMPTY_RESPONSE_MESSAGE, EMPTY_RESPONSE_GUIDANCE)
                }
            }
            Err(err) => {
                warn!(%err, "agent run failed");
                TurnResponse {
                    tool_calls: router.into_records(),
                    ..TurnResponse::failed(&verdict, String::new(), err.to_string())
                }
            }
        }
    }

    fn fallback_message(&self, verdict: &EnvironmentVerdict) -> String {
        let tools: Vec<&str> = build_tool_manifest(verdict.gates())
            .into_iter()
            .map(|descriptor| descriptor.name.as_str())
            .collect();
        format!(
            "AI provider not configured. Detected a {} project ({}). Set OPENAI_API_KEY or GOOGLE_API_KEY and choose AI_PROVIDER to enable the assistant. Tools available for this project: {}.",
            verdict.kind,
            verdict.reason,
            tools.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(path, content)| (path.to_string(), content.to_string()))
            .collect()
    }

    #[test]
    fn limits_reject_oversized_input() {
        let limits = TurnLimits::default()
            .with_max_files(1)
            .with_max_message_chars(5)
            .with_max_file_bytes(3);

        let too_long = TurnRequest::new("123456", "p");
        assert_eq!(
            limits.validate(&too_long).unwrap_err(),
            "Message too long (max 5 chars)"
        );

        let too_many = TurnRequest::new("hi", "p").with_files(files(&[("/a", "1"), ("/b", "2")]));
        assert_eq!(limits.validate(&too_many).unwrap_err(), "Too many files (max 1)");

        let too_big = TurnRequest::new("hi", "p").with_files(files(&[("/dapp/a.ts", "1234")]));
        assert_eq!(
            limits.validate(&too_big).unwrap_err(),
            "File /dapp/a.ts too large (max 3 bytes)"
        );
    }

    #[test]
    fn forced_environment_must_be_known() {
        let limits = TurnLimits::default();
        let forced = TurnRequest::new("hi", "p").with_forced_environment("DAPP");
        assert_eq!(limits.validate(&forced), Ok(Some(EnvironmentKind::Dapp)));
        let invalid = TurnRequest::new("hi", "p").with_forced_environment("backend");
        assert!(limits.validate(&invalid).unwrap_err().contains("backend"));
    }

    #[tokio::test]
    async fn unconfigured_runner_returns_fallback() {
        let runner = TurnRunner::unconfigured("OPENAI_API_KEY is not set");
        let request = TurnRequest::new("add a button", "p1")
            .with_files(files(&[("/dapp/app/page.tsx", "export default function Page() {}")]));
        let response = runner.run(request).await;
        assert!(!response.success);
        assert_eq!(response.environment, "dapp");
        assert_eq!(response.confidence, 0.95);
        assert!(response.message.contains("run_command"));
        assert!(!response.message.contains("validate_blueprint"));
        assert_eq!(
            response.error.as_deref(),
            Some("AI provider not configured: OPENAI_API_KEY is not set")
        );
    }

    #[tokio::test]
    async fn invalid_input_reports_unknown_environment() {
        let runner = TurnRunner::unconfigured("none");
        let response = runner.run(TurnRequest::new("   ", "p1")).await;
        assert!(!response.success);
        assert_eq!(response.environment, UNKNOWN_ENVIRONMENT);
        assert_eq!(response.confidence, 0.0);
    }

    #[test]
    fn request_accepts_snake_case_aliases() {
        let request: TurnRequest = serde_json::from_value(serde_json::json!({
            "message": "hi",
            "project_id": "p9",
            "force_environment": "blueprint",
            "conversation_history": [{ "role": "user", "content": "earlier" }]
        }))
        .expect("request");
        assert_eq!(request.project_id, "p9");
        assert_eq!(request.force_environment.as_deref(), Some("blueprint"));
        assert_eq!(request.conversation_history.len(), 1);
    }
}
