use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::ResearchError;

/// Upper bound on per-tool retries; backoff doubles per attempt
const MAX_TOOL_RETRIES: u32 = 10;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerSettings,
    pub events: EventSettings,
    pub rate_limit: RateLimitSettings,
    pub domains: DomainSettings,
    pub frontier: FrontierSettings,
    pub browser: BrowserSettings,
    pub agent: AgentSettings,
    pub oracle: OracleSettings,
    pub artifacts: ArtifactSettings,
}

/// Admission control and task lifetime settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerSettings {
    pub max_concurrent_tasks: usize,
    pub task_timeout_secs: u64,
    pub cancel_grace_secs: u64, // Time an in-flight tool call gets after a cancel request
}

/// Event log retention
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EventSettings {
    pub retain: usize,
}

/// Per-domain request limits
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub requests_per_window: usize,
    pub window_secs: u64,
    pub jitter_ms: u64,
    pub politeness_delay_ms: (u64, u64), // Min and max delay between hits on a busy domain
    pub max_backoff: f64,
    pub decay_after: u32, // Consecutive successes before the backoff multiplier halves
}

/// Domain allow/deny lists
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DomainSettings {
    pub allowed: Vec<String>,
    pub denied: Vec<String>,
    pub allowed_file: Option<PathBuf>,
    pub denied_file: Option<PathBuf>,
}

/// Crawl frontier filtering
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FrontierSettings {
    pub exclude_patterns: Vec<String>,
}

/// Browser backend settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrowserSettings {
    pub webdriver_url: String,
    pub headless: bool,
    pub max_contexts: usize,
    pub navigation_timeout_secs: u64,
    pub accept_language: String,
    pub user_agents: Vec<String>,
    pub viewport: ViewportRange,
}

/// Bounds for randomized viewports
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ViewportRange {
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

/// Agent loop settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AgentSettings {
    pub max_steps: usize,
    pub tool_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_text_chars: usize,
    pub max_links: usize,
    pub custom_search_url: Option<String>, // Template with a `{query}` placeholder
}

/// Decision oracle endpoint
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OracleSettings {
    pub url: String,
    pub timeout_secs: u64,
    pub timeout_floor_secs: u64,
    pub retries: u32,
}

/// Artifact persistence
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ArtifactSettings {
    pub dir: PathBuf,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            task_timeout_secs: 300,
            cancel_grace_secs: 5,
        }
    }
}

impl Default for EventSettings {
    fn default() -> Self {
        Self { retain: 1000 }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_window: 5,
            window_secs: 90,
            jitter_ms: 500,
            politeness_delay_ms: (1000, 3000),
            max_backoff: 16.0,
            decay_after: 3,
        }
    }
}

impl Default for FrontierSettings {
    fn default() -> Self {
        Self {
            exclude_patterns: vec![
                r"(?i)/(login|log-in|signin|sign-in|signup|sign-up|register|logout|auth|oauth)(/|$)".to_string(),
                r"(?i)/(ads?|adserver|advert\w*|tracking|track|pixel|beacon)(/|$)".to_string(),
                r"(?i)[?&](utm_[a-z]+|gclid|fbclid)=".to_string(),
                r"(?i)\.(pdf|zip|gz|tar|exe|dmg|msi|docx?|xlsx?|pptx?|jpe?g|png|gif|svg|webp|mp3|mp4|avi|css|js)$".to_string(),
            ],
        }
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:4444".to_string(),
            headless: true,
            max_contexts: 5,
            navigation_timeout_secs: 30,
            accept_language: "en-US,en;q=0.9".to_string(),
            user_agents: vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            ],
            viewport: ViewportRange {
                min_width: 1280,
                max_width: 1920,
                min_height: 720,
                max_height: 1080,
            },
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: 25,
            tool_retries: 2,
            retry_backoff_ms: 500,
            max_text_chars: 10_000,
            max_links: 50,
            custom_search_url: None,
        }
    }
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8001/decide".to_string(),
            timeout_secs: 120,
            timeout_floor_secs: 30,
            retries: 1,
        }
    }
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("artifacts"),
        }
    }
}

impl SchedulerSettings {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl BrowserSettings {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }
}

impl OracleSettings {
    /// Per-call timeout, never shorter than the configured floor
    pub fn effective_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(self.timeout_floor_secs))
    }
}

impl AppConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "web-reader", "web-reader") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path
    }

    /// Path of the default configuration file
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("default.yaml")
    }

    /// Load the configuration from an explicit path, or the default location
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_default()?,
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_path();

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            // Create and save the default configuration
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_to_file(&config_path)?;
            Ok(config)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// Apply environment variable overrides on top of the file configuration
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> std::result::Result<(), ResearchError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("MAX_CONCURRENT_TASKS") {
            self.scheduler.max_concurrent_tasks = parse_env("MAX_CONCURRENT_TASKS", &value)?;
        }
        if let Some(value) = lookup("TASK_TIMEOUT") {
            self.scheduler.task_timeout_secs = parse_env("TASK_TIMEOUT", &value)?;
        }
        if let Some(value) = lookup("ENABLE_RATE_LIMITING") {
            self.rate_limit.enabled = value.trim().eq_ignore_ascii_case("true");
        }
        if let Some(value) = lookup("RATE_LIMIT_REQUESTS") {
            self.rate_limit.requests_per_window = parse_env("RATE_LIMIT_REQUESTS", &value)?;
        }
        if let Some(value) = lookup("RATE_LIMIT_WINDOW") {
            self.rate_limit.window_secs = parse_env("RATE_LIMIT_WINDOW", &value)?;
        }
        if let Some(value) = lookup("MAX_BROWSER_CONTEXTS") {
            self.browser.max_contexts = parse_env("MAX_BROWSER_CONTEXTS", &value)?;
        }
        if let Some(value) = lookup("WEBDRIVER_URL") {
            self.browser.webdriver_url = value;
        }
        if let Some(value) = lookup("ORACLE_URL") {
            self.oracle.url = value;
        }
        if let Some(value) = lookup("ARTIFACT_DIR") {
            self.artifacts.dir = PathBuf::from(value);
        }

        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> std::result::Result<(), ResearchError> {
        if self.scheduler.max_concurrent_tasks == 0 {
            return Err(ResearchError::Config("scheduler.max_concurrent_tasks must be at least 1".into()));
        }
        if self.scheduler.task_timeout_secs == 0 {
            return Err(ResearchError::Config("scheduler.task_timeout_secs must be positive".into()));
        }
        if self.events.retain == 0 {
            return Err(ResearchError::Config("events.retain must be at least 1".into()));
        }
        if self.rate_limit.enabled {
            if self.rate_limit.requests_per_window == 0 || self.rate_limit.window_secs == 0 {
                return Err(ResearchError::Config("rate_limit window and request count must be positive".into()));
            }
            if self.rate_limit.max_backoff < 1.0 {
                return Err(ResearchError::Config("rate_limit.max_backoff must be >= 1.0".into()));
            }
            let (min, max) = self.rate_limit.politeness_delay_ms;
            if min > max {
                return Err(ResearchError::Config("rate_limit.politeness_delay_ms min exceeds max".into()));
            }
        }
        if self.browser.max_contexts == 0 {
            return Err(ResearchError::Config("browser.max_contexts must be at least 1".into()));
        }
        if self.browser.user_agents.is_empty() {
            return Err(ResearchError::Config("browser.user_agents must not be empty".into()));
        }
        let viewport = &self.browser.viewport;
        if viewport.min_width > viewport.max_width || viewport.min_height > viewport.max_height {
            return Err(ResearchError::Config("browser.viewport bounds are inverted".into()));
        }
        if self.agent.max_steps == 0 {
            return Err(ResearchError::Config("agent.max_steps must be at least 1".into()));
        }
        if self.agent.tool_retries > MAX_TOOL_RETRIES {
            return Err(ResearchError::Config(format!(
                "agent.tool_retries must be at most {}",
                MAX_TOOL_RETRIES
            )));
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> std::result::Result<T, ResearchError> {
    value
        .trim()
        .parse()
        .map_err(|_| ResearchError::Config(format!("{} has an invalid value: {}", key, value)))
}
