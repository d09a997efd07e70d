use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::errors::{Result, StudioError};
use crate::router::ToolRouter;
use crate::tools::ToolCall;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
}

impl ConversationMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    /// Only user and assistant turns are replayed to the model.
    pub fn is_dialogue(&self) -> bool {
        matches!(self.role.as_str(), "user" | "assistant")
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub history: Vec<ConversationMessage>,
}

#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub output: String,
    pub tool_calls: Vec<ToolCall>,
    pub steps: usize,
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn model(&self) -> &str;

    /// Runs to completion, resolving every tool call through `router` in the order requested.
    async fn run(&self, request: AgentRequest, router: &mut ToolRouter) -> Result<AgentOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiProvider {
    OpenAi,
    Gemini,
}

impl AiProvider {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(AiProvider::OpenAi),
            "gemini" | "google" => Some(AiProvider::Gemini),
            _ => None,
        }
    }

    pub fn default_endpoint(self) -> &'static str {
        match self {
            AiProvider::OpenAi => "https://api.openai.com/v1",
            AiProvider::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            AiProvider::OpenAi => "gpt-4o",
            AiProvider::Gemini => "gemini-2.5-flash",
        }
    }

    pub fn api_key_var(self) -> &'static str {
        match self {
            AiProvider::OpenAi => "OPENAI_API_KEY",
            AiProvider::Gemini => "GOOGLE_API_KEY",
        }
    }
}

#[derive(Clone, Debug)]
pub struct LlmAgentConfig {
    pub provider: AiProvider,
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub request_timeout: Duration,
    pub max_steps: usize,
    pub temperature: f32,
}

impl LlmAgentConfig {
    pub fn new(provider: AiProvider, api_key: impl Into<String>) -> Self {
        Self {
            provider,
            endpoint: provider.default_endpoint().to_string(),
            api_key: api_key.into(),
            model: provider.default_model().to_string(),
            request_timeout: Duration::from_millis(60_000),
            max_steps: 24,
            temperature: 0.2,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl LlmClient {
    fn new(base_url: String, timeout: Duration, api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| StudioError::InvalidOperation(err.to_string()))?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    async fn chat(&self, request: &ChatCompletionRequest) -> Result<ChatCompletionResponse> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|err| StudioError::Network(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unavailable>".to_string());
            return Err(StudioError::AgentFailed(format!(
                "llm request failed with status {status}: {body}"
            )));
        }
        response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|err| StudioError::AgentFailed(format!("invalid llm response payload: {err}")))
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    fn tool_result(tool_call_id: &str, content: String) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: WireFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatMessage,
}

impl WireToolCall {
    fn to_tool_call(&self) -> ToolCall {
        let arguments = if self.function.arguments.trim().is_empty() {
            Value::Null
        } else {
            // Malformed JSON is passed through so the router reports it back to the model.
            serde_json::from_str(&self.function.arguments)
                .unwrap_or_else(|_| Value::String(self.function.arguments.clone()))
        };
        ToolCall::new(self.id.clone(), self.function.name.clone(), arguments)
    }
}

fn initial_messages(request: &AgentRequest) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::text("system", request.system_prompt.clone())];
    messages.extend(
        request
            .history
            .iter()
            .filter(|message| message.is_dialogue())
            .map(|message| ChatMessage::text(&message.role, message.content.clone())),
    );
    messages.push(ChatMessage::text("user", request.user_prompt.clone()));
    messages
}

/// Chat-completions agent with function calling against any OpenAI-compatible endpoint.
pub struct LlmAgent {
    config: LlmAgentConfig,
    client: LlmClient,
}

impl LlmAgent {
    pub fn new(config: LlmAgentConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(StudioError::AgentNotConfigured(format!(
                "{} is not set",
                config.provider.api_key_var()
            )));
        }
        let client = LlmClient::new(
            config.endpoint.clone(),
            config.request_timeout,
            config.api_key.clone(),
        )?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &LlmAgentConfig {
        &self.config
    }
}

#[async_trait]
impl Agent for LlmAgent {
    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, request, router), fields(model = %self.config.model))]
    async fn run(&self, request: AgentRequest, router: &mut ToolRouter) -> Result<AgentOutcome> {
        let tools: Vec<Value> = router
            .manifest()
            .iter()
            .map(|descriptor| descriptor.to_function_schema())
            .collect();
        let mut chat = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: initial_messages(&request),
            tool_choice: (!tools.is_empty()).then_some("auto"),
            tools,
            temperature: self.config.temperature,
        };
        let mut calls = Vec::new();

        for step in 1..=self.config.max_steps {
            let response = self.client.chat(&chat).await?;
            let Some(choice) = response.choices.into_iter().next() else {
                warn!(step, "model returned no choices");
                return Err(StudioError::EmptyModelResponse);
            };
            let message = choice.message;

            if message.tool_calls.is_empty() {
                let output = message.content.unwrap_or_default();
                if output.trim().is_empty() {
                    return Err(StudioError::EmptyModelResponse);
                }
                info!(step, tool_calls = calls.len(), "agent finished");
                return Ok(AgentOutcome {
                    output,
                    tool_calls: calls,
                    steps: step,
                });
            }

            let requested: Vec<ToolCall> = message
                .tool_calls
                .iter()
                .map(WireToolCall::to_tool_call)
                .collect();
            chat.messages.push(ChatMessage {
                role: "assistant".to_string(),
                ..message
            });
            for call in requested {
                debug!(step, tool = %call.name, "dispatching tool call");
                let output = router.dispatch(&call).await;
                chat.messages
                    .push(ChatMessage::tool_result(&call.id, output.into_text()));
                calls.push(call);
            }
        }

        Err(StudioError::AgentFailed(format!(
            "agent did not finish within {} steps",
            self.config.max_steps
        )))
    }
}
