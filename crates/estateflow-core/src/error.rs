use thiserror::Error;

/// Lifecycle errors raised by [`AgentRuntime`](crate::runtime::AgentRuntime).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("Agent '{0}' is already running")]
    AlreadyRunning(String),
    #[error("Agent '{0}' is not running")]
    NotRunning(String),
}
