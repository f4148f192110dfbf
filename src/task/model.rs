use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use url::Url;

use crate::error::{ResearchError, Result};

/// Lifecycle state of a research task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states accept no further mutation
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Created, Queued)
                | (Created, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Created => "created",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Supported search engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchEngine {
    #[default]
    Duckduckgo,
    Bing,
    Google,
    Custom,
}

impl std::str::FromStr for SearchEngine {
    type Err = ResearchError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "duckduckgo" => Ok(SearchEngine::Duckduckgo),
            "bing" => Ok(SearchEngine::Bing),
            "google" => Ok(SearchEngine::Google),
            "custom" => Ok(SearchEngine::Custom),
            other => Err(ResearchError::Validation(format!(
                "search_engine must be one of duckduckgo, bing, google, custom (got '{}')",
                other
            ))),
        }
    }
}

/// A research request as submitted by a caller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    pub question: String,
    #[serde(alias = "seedUrl")]
    pub seed_url: Option<String>,
    #[serde(alias = "maxDepth")]
    pub max_depth: u32,
    #[serde(alias = "maxPages")]
    pub max_pages: u32,
    /// Seconds
    #[serde(alias = "timeBudget")]
    pub time_budget: u64,
    #[serde(alias = "searchEngine")]
    pub search_engine: SearchEngine,
    #[serde(alias = "maxResults")]
    pub max_results: u32,
    #[serde(alias = "safeMode")]
    pub safe_mode: bool,
    #[serde(alias = "sameDomainOnly")]
    pub same_domain_only: bool,
    /// `None` means "no explicit override"
    #[serde(alias = "allowExternalLinks")]
    pub allow_external_links: Option<bool>,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            question: String::new(),
            seed_url: None,
            max_depth: 3,
            max_pages: 20,
            time_budget: 120,
            search_engine: SearchEngine::Duckduckgo,
            max_results: 10,
            safe_mode: true,
            same_domain_only: false,
            allow_external_links: None,
        }
    }
}

impl TaskSpec {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }

    /// Check bounds and freeze into the immutable task config
    pub fn validate(self) -> Result<TaskConfig> {
        let question = self.question.trim().to_string();
        if question.is_empty() {
            return Err(ResearchError::Validation("question must not be empty".into()));
        }
        if question.chars().count() > 1000 {
            return Err(ResearchError::Validation("question must be at most 1000 characters".into()));
        }

        check_range("max_depth", self.max_depth as u64, 1, 5)?;
        check_range("max_pages", self.max_pages as u64, 1, 50)?;
        check_range("time_budget", self.time_budget, 30, 600)?;
        check_range("max_results", self.max_results as u64, 1, 50)?;

        let seed_url = match self.seed_url.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(normalize_seed(raw)?),
        };

        Ok(TaskConfig {
            question,
            seed_url,
            max_depth: self.max_depth,
            max_pages: self.max_pages,
            time_budget: Duration::from_secs(self.time_budget),
            search_engine: self.search_engine,
            max_results: self.max_results,
            safe_mode: self.safe_mode,
            same_domain_only: self.same_domain_only,
            allow_external_links: self.allow_external_links,
        })
    }
}

fn check_range(field: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if value < min || value > max {
        return Err(ResearchError::Validation(format!(
            "{} must be between {} and {} (got {})",
            field, min, max, value
        )));
    }
    Ok(())
}

/// Add a scheme when missing and require http(s) with a host
pub fn normalize_seed(raw: &str) -> Result<String> {
    let candidate = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };

    let parsed = Url::parse(&candidate)
        .map_err(|e| ResearchError::Validation(format!("invalid URL '{}': {}", raw, e)))?;

    if parsed.host_str().is_none() {
        return Err(ResearchError::Validation(format!("URL has no host: {}", raw)));
    }

    Ok(parsed.to_string())
}

/// Validated, bounded task configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub question: String,
    pub seed_url: Option<String>,
    pub max_depth: u32,
    pub max_pages: u32,
    pub time_budget: Duration,
    pub search_engine: SearchEngine,
    pub max_results: u32,
    pub safe_mode: bool,
    pub same_domain_only: bool,
    pub allow_external_links: Option<bool>,
}

/// Source citation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub url: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

/// One research request and its full execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub config: TaskConfig,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub answer: Option<String>,
    pub citations: Vec<Citation>,
    pub screenshots: Vec<String>,
    pub error: Option<String>,
    pub metadata: BTreeMap<String, Value>,
}

impl Task {
    pub fn new(id: String, config: TaskConfig) -> Self {
        Self {
            id,
            status: TaskStatus::Created,
            config,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            answer: None,
            citations: Vec::new(),
            screenshots: Vec::new(),
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Move through the state machine, stamping timestamps on the way
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ResearchError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        match next {
            TaskStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        self.status = next;

        Ok(())
    }

    /// Seconds between start and completion
    pub fn duration(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id.clone(),
            status: self.status,
            question: self.config.question.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
        }
    }
}

/// Lightweight listing entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub status: TaskStatus,
    pub question: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Sort newest first and cut one page; returns the page and the total count
pub fn paginate(mut summaries: Vec<TaskSummary>, offset: usize, limit: usize) -> (Vec<TaskSummary>, usize) {
    // Stable, so equal timestamps keep the caller's order
    summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let total = summaries.len();
    let page = summaries.into_iter().skip(offset).take(limit).collect();
    (page, total)
}

/// What a finished agent run hands back to the scheduler
#[derive(Debug, Clone, Default)]
pub struct ResearchOutcome {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub screenshots: Vec<String>,
    pub metadata: BTreeMap<String, Value>,
}
