use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::agent::tools::ToolSchema;
use crate::cli::config::OracleSettings;
use crate::error::{ResearchError, Result};

/// One completed step, as shown to the oracle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub step: usize,
    pub tool: String,
    pub args: Value,
    pub output: Value,
}

/// Everything the oracle sees when choosing the next action
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRequest {
    pub question: String,
    pub seed_url: Option<String>,
    pub tools: Vec<ToolSchema>,
    pub transcript: Vec<TranscriptEntry>,
    pub step: usize,
    /// Set once the page or time budget is spent; the oracle should answer now
    pub budget_exhausted: bool,
}

/// What to do next
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Invoke a tool; arguments are validated by the agent, not the oracle
    Tool { name: String, args: Value },
    Final { answer: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub thought: Option<String>,
    pub action: Action,
}

impl Decision {
    pub fn tool(name: &str, args: Value) -> Self {
        Self {
            thought: None,
            action: Action::Tool {
                name: name.to_string(),
                args,
            },
        }
    }

    pub fn answer(answer: &str) -> Self {
        Self {
            thought: None,
            action: Action::Final {
                answer: answer.to_string(),
            },
        }
    }

    pub fn with_thought(mut self, thought: &str) -> Self {
        self.thought = Some(thought.to_string());
        self
    }
}

/// The opaque planner that picks the next tool call or the final answer
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn decide(&self, request: DecisionRequest) -> Result<Decision>;
}

/// Wire shape: `{"thought"?, "tool", "args"}` or `{"thought"?, "final_answer"}`
#[derive(Debug, Deserialize)]
struct OracleReply {
    thought: Option<String>,
    tool: Option<String>,
    #[serde(default)]
    args: Value,
    final_answer: Option<String>,
}

impl OracleReply {
    fn into_decision(self) -> Result<Decision> {
        let thought = self.thought.filter(|t| !t.trim().is_empty());

        let action = match (self.final_answer, self.tool) {
            (Some(answer), _) => Action::Final { answer },
            (None, Some(name)) => Action::Tool { name, args: self.args },
            (None, None) => {
                return Err(ResearchError::Oracle(
                    "reply has neither 'tool' nor 'final_answer'".to_string(),
                ))
            }
        };

        Ok(Decision { thought, action })
    }
}

/// Oracle reached over HTTP: the request is POSTed as JSON
pub struct HttpOracle {
    client: Client,
    url: String,
}

impl HttpOracle {
    pub fn new(settings: &OracleSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.effective_timeout())
            .build()
            .map_err(|e| ResearchError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: settings.url.clone(),
        })
    }
}

#[async_trait]
impl DecisionOracle for HttpOracle {
    async fn decide(&self, request: DecisionRequest) -> Result<Decision> {
        debug!(step = request.step, "Requesting decision from {}", self.url);

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ResearchError::Oracle(format!("Failed to reach oracle: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResearchError::Oracle(format!("Oracle responded with {}", status)));
        }

        let reply = response
            .json::<OracleReply>()
            .await
            .map_err(|e| ResearchError::Oracle(format!("Failed to parse oracle reply: {}", e)))?;

        reply.into_decision()
    }
}
