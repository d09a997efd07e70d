//! Core of the unified blueprint and dApp assistant.
//!
//! A turn classifies the project's virtual files, gates the tool families,
//! runs the agent against an in-memory store and returns the file delta.
//! dApp tools reach a sandbox through [`SandboxService`].

pub mod adapter;
pub mod agent;
pub mod blueprint;
pub mod environment;
pub mod errors;
pub mod local;
pub mod path;
pub mod prompt;
pub mod registry;
pub mod remote;
pub mod router;
pub mod sandbox;
pub mod store;
pub mod tools;
pub mod turn;

pub use adapter::{SandboxAdapter, SandboxInfo, SandboxSettings, UploadSummary};
pub use agent::{Agent, AgentOutcome, AgentRequest, AiProvider, ConversationMessage, LlmAgent, LlmAgentConfig};
pub use environment::{classify, EnvironmentKind, EnvironmentVerdict};
pub use errors::{Result, StudioError};
pub use local::{LocalSandbox, LocalSandboxConfig};
pub use path::ToolGates;
pub use registry::SandboxRegistry;
pub use remote::{RemoteSandbox, RemoteSandboxConfig};
pub use router::ToolRouter;
pub use sandbox::{CommandOutput, ProcessId, SandboxHandle, SandboxService};
pub use store::{StoreLimits, VirtualFileStore, WriteOutcome};
pub use tools::{ToolCall, ToolInvocationRecord, ToolName, ToolOutput};
pub use turn::{TurnLimits, TurnRequest, TurnResponse, TurnRunner};
