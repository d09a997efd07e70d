use std::io;
use std::time::Duration;
use thiserror::Error;

/// Upper bound on how many candidate paths a not-found error lists back to the agent.
pub const MAX_LISTED_PATHS: usize = 50;

#[derive(Debug, Error)]
pub enum StudioError {
    #[error("path traversal detected")]
    PathTraversal,
    #[error("operation outside sandbox root")]
    OutsideRoot,
    #[error("File not found: {path}. Available files: {}", list_paths(.available))]
    NotFound { path: String, available: Vec<String> },
    #[error("{0}")]
    PolicyViolation(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("process produced {stream} output exceeding limit of {limit} bytes")]
    OutputTooLarge { stream: &'static str, limit: usize },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("no sandbox found for project {0}")]
    SandboxUnavailable(String),
    #[error("sandbox operation failed: {0}")]
    Sandbox(String),
    #[error("network request failed: {0}")]
    Network(String),
    #[error("agent execution failed: {0}")]
    AgentFailed(String),
    #[error("model returned an empty response")]
    EmptyModelResponse,
    #[error("AI provider not configured: {0}")]
    AgentNotConfigured(String),
}

impl StudioError {
    pub fn not_found<'a>(
        path: impl Into<String>,
        available: impl IntoIterator<Item = &'a String>,
    ) -> Self {
        StudioError::NotFound {
            path: path.into(),
            available: available.into_iter().cloned().collect(),
        }
    }
}

fn list_paths(paths: &[String]) -> String {
    if paths.is_empty() {
        return "none".to_string();
    }
    let mut listed = paths
        .iter()
        .take(MAX_LISTED_PATHS)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    if paths.len() > MAX_LISTED_PATHS {
        listed.push_str(&format!(" ... and {} more", paths.len() - MAX_LISTED_PATHS));
    }
    listed
}

pub type Result<T> = std::result::Result<T, StudioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_lists_bounded_paths() {
        let available: Vec<String> = (0..60).map(|idx| format!("/dapp/f{idx}.ts")).collect();
        let err = StudioError::not_found("/missing.ts", &available);
        let message = err.to_string();
        assert!(message.starts_with("File not found: /missing.ts"));
        assert!(message.contains("/dapp/f0.ts"));
        assert!(message.contains("... and 10 more"));
        assert!(!message.contains("/dapp/f55.ts"));
    }

    #[test]
    fn not_found_without_files_says_none() {
        let err = StudioError::not_found("/a.py", &Vec::<String>::new());
        assert_eq!(err.to_string(), "File not found: /a.py. Available files: none");
    }
}
