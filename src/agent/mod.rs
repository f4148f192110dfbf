pub mod executor;
pub mod oracle;
pub mod runner;
pub mod search;
pub mod tools;

// Re-export common types
pub use executor::{AgentServices, ToolExecutor};
pub use oracle::{Action, Decision, DecisionOracle, DecisionRequest, HttpOracle, TranscriptEntry};
pub use runner::ResearchAgent;
pub use search::search_url;
pub use tools::{ToolCall, ToolSchema};
