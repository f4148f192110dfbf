use std::time::Duration;
use thiserror::Error;

use crate::task::model::TaskStatus;

/// Errors raised by the research engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResearchError {
    /// The submitted task spec is malformed; rejected before admission
    #[error("Validation error: {0}")]
    Validation(String),

    /// No task (or event log) exists for the given id
    #[error("Task not found: {0}")]
    NotFound(String),

    /// The allow/deny lists reject the target domain
    #[error("Domain blocked by allow/deny lists: {0}")]
    DomainDenied(String),

    /// The domain is throttling us; absorbed as a wait inside the rate limiter
    #[error("Rate limit exceeded for {0}")]
    RateLimitExceeded(String),

    /// Page load did not finish in time
    #[error("Navigation timeout after {timeout:?} for {url}")]
    NavigationTimeout { url: String, timeout: Duration },

    /// Network level failure that is worth retrying
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// The browser could not open an isolated context
    #[error("Failed to create browser context: {0}")]
    ContextCreation(String),

    /// The decision oracle failed to produce a usable instruction
    #[error("Decision oracle error: {0}")]
    Oracle(String),

    /// Cooperative cancellation; not a failure
    #[error("Task cancelled: {0}")]
    Cancelled(String),

    /// The task-level wall-clock timeout expired
    #[error("Task exceeded timeout of {}s", .0.as_secs())]
    Timeout(Duration),

    /// Page or step budget spent
    #[error("Budget exhausted: {0}")]
    BudgetExhausted(String),

    /// A page-level tool ran before any page was loaded
    #[error("No page loaded yet; navigate first")]
    NoPage,

    /// Status transition outside the state machine
    #[error("Invalid task transition {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    /// The event log was closed by a terminal event
    #[error("Event stream closed for task {0}")]
    StreamClosed(String),

    /// Non-transient browser failure
    #[error("Browser error: {0}")]
    Browser(String),

    /// Artifact persistence failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),
}

impl ResearchError {
    /// Errors that fail only the current tool call; the agent may pick another path
    pub fn is_tool_scoped(&self) -> bool {
        matches!(
            self,
            ResearchError::DomainDenied(_)
                | ResearchError::BudgetExhausted(_)
                | ResearchError::NoPage
        )
    }

    /// Errors retried locally at the tool-invocation layer
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ResearchError::NavigationTimeout { .. }
                | ResearchError::TransientNetwork(_)
                | ResearchError::RateLimitExceeded(_)
                | ResearchError::ContextCreation(_)
        )
    }

    /// Short machine-friendly code used in tool outputs and logs
    pub fn code(&self) -> &'static str {
        match self {
            ResearchError::Validation(_) => "validation",
            ResearchError::NotFound(_) => "not_found",
            ResearchError::DomainDenied(_) => "domain_denied",
            ResearchError::RateLimitExceeded(_) => "rate_limited",
            ResearchError::NavigationTimeout { .. } => "navigation_timeout",
            ResearchError::TransientNetwork(_) => "network",
            ResearchError::ContextCreation(_) => "context_creation",
            ResearchError::Oracle(_) => "oracle",
            ResearchError::Cancelled(_) => "cancelled",
            ResearchError::Timeout(_) => "timeout",
            ResearchError::BudgetExhausted(_) => "budget_exhausted",
            ResearchError::NoPage => "no_page",
            ResearchError::InvalidTransition { .. } => "invalid_transition",
            ResearchError::StreamClosed(_) => "stream_closed",
            ResearchError::Browser(_) => "browser",
            ResearchError::Storage(_) => "storage",
            ResearchError::Config(_) => "config",
        }
    }
}

impl From<std::io::Error> for ResearchError {
    fn from(err: std::io::Error) -> Self {
        ResearchError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ResearchError {
    fn from(err: serde_json::Error) -> Self {
        ResearchError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ResearchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ResearchError::DomainDenied("a.com".into()).is_tool_scoped());
        assert!(!ResearchError::DomainDenied("a.com".into()).is_transient());

        let timeout = ResearchError::NavigationTimeout {
            url: "https://a.com".into(),
            timeout: Duration::from_secs(30),
        };
        assert!(timeout.is_transient());
        assert!(!timeout.is_tool_scoped());

        assert!(!ResearchError::Oracle("boom".into()).is_transient());
        assert!(!ResearchError::Cancelled("user".into()).is_tool_scoped());
    }

    #[test]
    fn test_timeout_message() {
        let err = ResearchError::Timeout(Duration::from_secs(300));
        assert_eq!(err.to_string(), "Task exceeded timeout of 300s");
    }
}
