use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::agent::executor::{AgentServices, ToolExecutor};
use crate::agent::oracle::{Action, Decision, DecisionOracle, DecisionRequest, TranscriptEntry};
use crate::agent::tools::ToolCall;
use crate::cli::config::OracleSettings;
use crate::error::{ResearchError, Result};
use crate::task::model::ResearchOutcome;
use crate::task::scheduler::{TaskExecutor, TaskRun};

/// Drives the decide → act loop for one task at a time
pub struct ResearchAgent {
    oracle: Arc<dyn DecisionOracle>,
    services: Arc<AgentServices>,
    oracle_settings: OracleSettings,
}

impl ResearchAgent {
    pub fn new(oracle: Arc<dyn DecisionOracle>, services: Arc<AgentServices>, oracle_settings: OracleSettings) -> Self {
        Self {
            oracle,
            services,
            oracle_settings,
        }
    }

    /// Ask the oracle, retrying failures and giving up on cancellation
    async fn decide(&self, request: &DecisionRequest, run: &TaskRun, executor: &mut ToolExecutor) -> Result<Decision> {
        let attempts = self.oracle_settings.retries + 1;
        let timeout = self.oracle_settings.effective_timeout();
        let mut last_error = ResearchError::Oracle("no attempt made".to_string());

        for attempt in 1..=attempts {
            let call = tokio::time::timeout(timeout, self.oracle.decide(request.clone()));
            let result = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => {
                    return Err(ResearchError::Cancelled("cancelled while waiting for the oracle".to_string()))
                }
                result = call => result,
            };

            last_error = match result {
                Ok(Ok(decision)) => return Ok(decision),
                Ok(Err(ResearchError::Oracle(message))) => ResearchError::Oracle(message),
                Ok(Err(e)) => ResearchError::Oracle(e.to_string()),
                Err(_) => ResearchError::Oracle(format!("no decision within {}s", timeout.as_secs())),
            };

            if attempt < attempts {
                warn!(task_id = %run.task_id, attempt, "Oracle call failed, retrying: {}", last_error);
                executor.metrics_mut().oracle_retries += 1;
                run.events
                    .recoverable_error(format!("{} (attempt {}/{})", last_error, attempt, attempts))?;
            }
        }

        Err(last_error)
    }

    async fn research(&self, run: TaskRun) -> Result<ResearchOutcome> {
        let mut executor = ToolExecutor::new(self.services.clone(), &run);
        let mut transcript: Vec<TranscriptEntry> = Vec::new();
        let max_steps = self.services.settings.max_steps;

        run.events.thinking(format!("Researching: {}", run.config.question))?;

        for step in 1..=max_steps {
            if run.cancel.is_cancelled() {
                return Err(ResearchError::Cancelled("cancelled before next step".to_string()));
            }

            let request = DecisionRequest {
                question: run.config.question.clone(),
                seed_url: run.config.seed_url.clone(),
                tools: ToolCall::schemas(),
                transcript: transcript.clone(),
                step,
                budget_exhausted: executor.budget_exhausted(),
            };

            let decision = self.decide(&request, &run, &mut executor).await?;
            executor.metrics_mut().steps += 1;

            if let Some(thought) = &decision.thought {
                run.events.thinking(thought.clone())?;
            }

            let (name, args) = match decision.action {
                Action::Final { answer } => {
                    info!(task_id = %run.task_id, steps = step, "Research finished");
                    return Ok(executor.finish(answer));
                }
                Action::Tool { name, args } => (name, args),
            };

            let output = match ToolCall::parse(&name, &args) {
                Err(e) => {
                    run.events.tool_call(&name, args.clone())?;
                    json!({ "error": e.to_string(), "code": e.code() })
                }
                Ok(call) => {
                    run.events.tool_call(call.name(), call.args())?;
                    match executor.execute(step, call).await {
                        Ok(output) => output,
                        // The agent may still try another path
                        Err(e) if e.is_tool_scoped() || matches!(e, ResearchError::Validation(_)) => {
                            json!({ "error": e.to_string(), "code": e.code() })
                        }
                        Err(e) => return Err(e),
                    }
                }
            };

            run.events.tool_result(&name, output.clone())?;
            transcript.push(TranscriptEntry {
                step,
                tool: name,
                args,
                output,
            });
            run.progress.set(executor.progress());
        }

        Err(ResearchError::BudgetExhausted(format!(
            "no final answer after {} steps",
            max_steps
        )))
    }
}

#[async_trait]
impl TaskExecutor for ResearchAgent {
    async fn execute(&self, run: TaskRun) -> Result<ResearchOutcome> {
        self.research(run).await
    }
}
