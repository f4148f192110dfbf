use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::agent::search::search_url;
use crate::agent::tools::ToolCall;
use crate::browser::{BrowserContextManager, ContextLease, NavigationResponse, PageSnapshot};
use crate::cli::config::AgentSettings;
use crate::crawler::{
    extract_content, extract_links, normalize_url, search_results, CrawlFrontier, DomainPolicy, RateLimiter,
};
use crate::error::{ResearchError, Result};
use crate::events::EventEmitter;
use crate::storage::ArtifactStore;
use crate::task::model::{normalize_seed, Citation, ResearchOutcome, TaskConfig};
use crate::task::scheduler::TaskRun;
use crate::utils::RunMetrics;

/// Longest excerpt attached to a citation
const EXCERPT_CHARS: usize = 280;

/// Process-wide services shared by every research run
pub struct AgentServices {
    pub policy: Arc<DomainPolicy>,
    pub limiter: Arc<RateLimiter>,
    pub contexts: BrowserContextManager,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub settings: AgentSettings,
    pub navigation_timeout: Duration,
    pub exclude_patterns: Vec<String>,
}

/// The page the task is currently looking at
#[derive(Debug, Clone)]
struct CurrentPage {
    url: String,
    title: String,
    depth: u32,
    /// Context generation the page was loaded in
    generation: u64,
}

/// Executes tool calls for one task, owning its frontier and findings
pub struct ToolExecutor {
    services: Arc<AgentServices>,
    task_id: String,
    config: TaskConfig,
    events: EventEmitter,
    cancel: CancellationToken,
    frontier: CrawlFrontier,
    current: Option<CurrentPage>,
    citations: Vec<Citation>,
    screenshots: Vec<String>,
    metrics: RunMetrics,
}

impl ToolExecutor {
    pub fn new(services: Arc<AgentServices>, run: &TaskRun) -> Self {
        let mut frontier = CrawlFrontier::new(&run.config, &services.exclude_patterns);
        if let Some(seed) = &run.config.seed_url {
            frontier.seed(seed, "seed");
        }

        Self {
            services,
            task_id: run.task_id.clone(),
            config: run.config.clone(),
            events: run.events.clone(),
            cancel: run.cancel.clone(),
            frontier,
            current: None,
            citations: Vec::new(),
            screenshots: Vec::new(),
            metrics: RunMetrics::new(),
        }
    }

    /// Run one tool call; `step` numbers screenshots
    pub async fn execute(&mut self, step: usize, call: ToolCall) -> Result<Value> {
        let name = call.name();
        let timer = self.metrics.start_timer();

        let result = match call {
            ToolCall::Search { query } => self.search(&query).await,
            ToolCall::Navigate { url } => self.navigate(&url).await,
            ToolCall::FollowLink { url } => self.follow_link(url.as_deref()).await,
            ToolCall::ExtractLinks => self.extract_links().await,
            ToolCall::ExtractContent => self.extract_content().await,
            ToolCall::Screenshot { full_page } => self.screenshot(step, full_page).await,
        };

        self.metrics.record_tool(name, result.is_ok(), timer.end());
        if let Err(e) = &result {
            debug!(task_id = %self.task_id, tool = name, "Tool failed: {}", e);
        }
        result
    }

    /// Whether the page or time budget is spent
    pub fn budget_exhausted(&self) -> bool {
        self.frontier.budget_exhausted().is_some()
    }

    pub fn metrics_mut(&mut self) -> &mut RunMetrics {
        &mut self.metrics
    }

    /// Findings so far, without an answer
    pub fn progress(&self) -> ResearchOutcome {
        ResearchOutcome {
            answer: String::new(),
            citations: self.citations.clone(),
            screenshots: self.screenshots.clone(),
            metadata: self.metadata(),
        }
    }

    pub fn finish(self, answer: String) -> ResearchOutcome {
        ResearchOutcome {
            answer,
            metadata: self.metadata(),
            citations: self.citations,
            screenshots: self.screenshots,
        }
    }

    fn metadata(&self) -> std::collections::BTreeMap<String, Value> {
        let mut metadata = self.metrics.to_metadata();
        metadata.insert(
            "frontier".to_string(),
            json!({
                "visited": self.frontier.visited_count(),
                "pending": self.frontier.pending(),
            }),
        );
        metadata
    }

    /// Race a blocking wait against cancellation
    async fn guarded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ResearchError::Cancelled("cancelled while waiting".to_string())),
            result = fut => result,
        }
    }

    async fn acquire(&self) -> Result<ContextLease> {
        self.guarded(self.services.contexts.acquire(&self.task_id)).await
    }

    /// Policy check, rate limiting and retried navigation in the task's own context
    async fn load(&mut self, tool: &str, url: &str) -> Result<(NavigationResponse, u64)> {
        let parsed = Url::parse(url)
            .map_err(|e| ResearchError::Validation(format!("invalid URL '{}': {}", url, e)))?;
        let host = self.services.policy.check(&parsed)?;
        let services = self.services.clone();
        let retries = services.settings.tool_retries;

        let mut attempt = 0;
        loop {
            let waited = self
                .guarded(async { Ok(services.limiter.await_slot(&host).await) })
                .await?;
            self.metrics.rate_limit_wait_ms += waited.as_millis() as u64;

            match self.navigate_once(&services, url, &host).await {
                Ok(loaded) => return Ok(loaded),
                Err(e) if e.is_transient() && attempt < retries => {
                    attempt += 1;
                    let backoff = retry_backoff(services.settings.retry_backoff_ms, attempt);
                    warn!(task_id = %self.task_id, tool, attempt, "Transient failure, retrying: {}", e);
                    self.metrics.record_retry(tool);
                    self.events.recoverable_error(format!(
                        "{} failed (attempt {}/{}): {}",
                        tool,
                        attempt,
                        retries + 1,
                        e
                    ))?;
                    self.guarded(async {
                        sleep(backoff).await;
                        Ok(())
                    })
                    .await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn navigate_once(
        &mut self,
        services: &AgentServices,
        url: &str,
        host: &str,
    ) -> Result<(NavigationResponse, u64)> {
        let lease = self.acquire().await?;
        let response = {
            let mut page = lease.page().await;
            page.navigate(url, services.navigation_timeout).await?
        };

        // Backends that cannot see the status count as a plain success
        services.limiter.report_response(host, response.status.unwrap_or(200)).await;

        if let Some(status) = response.status {
            self.metrics.record_status(status);
            if matches!(status, 429 | 502 | 503 | 504) {
                return Err(ResearchError::TransientNetwork(format!("{} returned HTTP {}", url, status)));
            }
        }

        Ok((response, lease.generation()))
    }

    /// Snapshot of the current page, reloading it if the context was recycled
    async fn current_snapshot(&mut self, tool: &str) -> Result<(PageSnapshot, CurrentPage)> {
        let mut current = self.current.clone().ok_or(ResearchError::NoPage)?;

        let mut lease = self.acquire().await?;
        if lease.generation() != current.generation {
            drop(lease);
            info!(task_id = %self.task_id, "Browser context was recycled, reloading {}", current.url);
            let (_, generation) = self.load(tool, &current.url).await?;
            current.generation = generation;
            self.current = Some(current.clone());
            lease = self.acquire().await?;
        }

        let snapshot = {
            let mut page = lease.page().await;
            page.content().await?
        };
        Ok((snapshot, current))
    }

    async fn search(&mut self, query: &str) -> Result<Value> {
        let url = search_url(
            self.config.search_engine,
            query,
            self.config.safe_mode,
            self.config.max_results,
            self.services.settings.custom_search_url.as_deref(),
        )?;

        let (response, generation) = self.load("search", &url).await?;
        self.current = Some(CurrentPage {
            url: response.final_url.clone(),
            title: response.title.clone(),
            depth: 0,
            generation,
        });

        let (snapshot, _) = self.current_snapshot("search").await?;
        let base = Url::parse(&snapshot.url)
            .or_else(|_| Url::parse(&url))
            .map_err(|e| ResearchError::Browser(format!("Unusable results page URL: {}", e)))?;

        let results = search_results(&snapshot.html, &base, self.config.max_results as usize);
        let report = self.frontier.offer_results(results.clone());
        self.metrics.links_queued += report.accepted;

        info!(task_id = %self.task_id, "Search for '{}': {} results", query, results.len());

        Ok(json!({
            "query": query,
            "engine": self.config.search_engine,
            "results": results,
            "queued": report.accepted,
        }))
    }

    async fn navigate(&mut self, url: &str) -> Result<Value> {
        let url = normalize_seed(url.trim())?;
        self.visit("navigate", &url, 0).await
    }

    async fn follow_link(&mut self, url: Option<&str>) -> Result<Value> {
        let link = match url {
            Some(url) => self
                .frontier
                .take(url)
                .ok_or_else(|| ResearchError::Validation(format!("{} is not in the link queue", url)))?,
            None => self
                .frontier
                .next()
                .map_err(|reason| ResearchError::BudgetExhausted(reason.to_string()))?,
        };

        let mut output = self.visit("follow_link", &link.url, link.depth).await?;
        output["link_text"] = json!(link.text);
        Ok(output)
    }

    /// Fetch a page that counts against the page budget
    async fn visit(&mut self, tool: &str, url: &str, depth: u32) -> Result<Value> {
        if let Some(reason) = self.frontier.budget_exhausted() {
            return Err(ResearchError::BudgetExhausted(reason.to_string()));
        }

        let revisit = self.frontier.is_visited(url);
        let (response, generation) = self.load(tool, url).await?;
        self.frontier.mark_visited(url);
        self.metrics.pages_visited = self.frontier.visited_count();

        self.current = Some(CurrentPage {
            url: response.final_url.clone(),
            title: response.title.clone(),
            depth,
            generation,
        });

        let mut output = json!({
            "url": response.final_url,
            "title": response.title,
            "depth": depth,
            "redirected": normalize_url(&response.final_url) != normalize_url(url),
        });
        if revisit {
            output["revisit"] = json!(true);
        }

        match response.status {
            Some(status) if status >= 400 => {
                output["http_status"] = json!(status);
                output["error"] = json!(format!("HTTP {}", status));
            }
            status => {
                if let Some(status) = status {
                    output["http_status"] = json!(status);
                }
                self.cite(&response.final_url, &response.title);
            }
        }

        Ok(output)
    }

    fn cite(&mut self, url: &str, title: &str) {
        let key = normalize_url(url);
        if self.citations.iter().any(|c| normalize_url(&c.url) == key) {
            return;
        }
        self.citations.push(Citation {
            url: url.to_string(),
            title: title.to_string(),
            excerpt: None,
        });
    }

    async fn extract_links(&mut self) -> Result<Value> {
        let (snapshot, current) = self.current_snapshot("extract_links").await?;
        let base = Url::parse(&snapshot.url)
            .or_else(|_| Url::parse(&current.url))
            .map_err(|e| ResearchError::Browser(format!("Unusable page URL: {}", e)))?;

        let links = extract_links(&snapshot.html, &base, self.services.settings.max_links);
        let report = self.frontier.offer(links.clone(), current.depth);
        self.metrics.links_queued += report.accepted;

        Ok(json!({
            "url": snapshot.url,
            "links": links,
            "report": report,
            "pending": self.frontier.pending(),
        }))
    }

    async fn extract_content(&mut self) -> Result<Value> {
        let (snapshot, current) = self.current_snapshot("extract_content").await?;
        let content = extract_content(&snapshot.html, self.services.settings.max_text_chars);

        // Fill in the citation excerpt for this page
        let key = normalize_url(&current.url);
        if let Some(citation) = self
            .citations
            .iter_mut()
            .find(|c| c.excerpt.is_none() && normalize_url(&c.url) == key)
        {
            let source = content.description.as_deref().unwrap_or(&content.text);
            let excerpt: String = source.chars().take(EXCERPT_CHARS).collect();
            if !excerpt.is_empty() {
                citation.excerpt = Some(excerpt);
            }
        }

        let title = if content.title.is_empty() {
            current.title
        } else {
            content.title.clone()
        };

        Ok(json!({
            "url": snapshot.url,
            "title": title,
            "description": content.description,
            "text": content.text,
            "word_count": content.word_count,
            "truncated": content.truncated,
        }))
    }

    async fn screenshot(&mut self, step: usize, full_page: bool) -> Result<Value> {
        let mut current = self.current.clone().ok_or(ResearchError::NoPage)?;
        let mut lease = self.acquire().await?;
        if lease.generation() != current.generation {
            // The recycled context shows a blank page; reload through the snapshot path
            drop(lease);
            let (_, reloaded) = self.current_snapshot("screenshot").await?;
            current = reloaded;
            lease = self.acquire().await?;
        }

        let png = {
            let mut page = lease.page().await;
            page.screenshot(full_page).await?
        };
        drop(lease);

        let reference = self
            .services
            .artifacts
            .save_screenshot(&self.task_id, step, &png)
            .await?;
        self.screenshots.push(reference.clone());
        self.events.screenshot(reference.clone())?;

        Ok(json!({
            "ref": reference,
            "bytes": png.len(),
            "full_page": full_page,
            "url": current.url,
        }))
    }
}

/// Exponential backoff before retry `attempt` (1-based), saturating instead of overflowing
fn retry_backoff(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_doubles_and_saturates() {
        assert_eq!(retry_backoff(500, 1), Duration::from_millis(500));
        assert_eq!(retry_backoff(500, 3), Duration::from_millis(2000));
        assert_eq!(retry_backoff(500, 64), Duration::from_millis(u64::MAX));
        assert_eq!(retry_backoff(500, 200), Duration::from_millis(u64::MAX));
    }
}
