use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

/// Per-tool counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolStats {
    pub calls: usize,
    pub failures: usize,
    pub retries: usize,
    pub total_ms: u64,
}

/// Statistics for one research run, written into the task's metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Oracle decisions taken
    pub steps: usize,

    /// Oracle calls that had to be retried
    pub oracle_retries: usize,

    /// Tool name -> counters
    pub tools: BTreeMap<String, ToolStats>,

    /// HTTP status code counts
    pub status_codes: HashMap<u16, usize>,

    /// Time spent waiting on the rate limiter
    pub rate_limit_wait_ms: u64,

    pub pages_visited: usize,
    pub links_queued: usize,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished tool invocation
    pub fn record_tool(&mut self, tool: &str, success: bool, duration_ms: u64) {
        let stats = self.tools.entry(tool.to_string()).or_default();
        stats.calls += 1;
        stats.total_ms += duration_ms;
        if !success {
            stats.failures += 1;
        }
    }

    pub fn record_retry(&mut self, tool: &str) {
        self.tools.entry(tool.to_string()).or_default().retries += 1;
    }

    pub fn record_status(&mut self, status: u16) {
        *self.status_codes.entry(status).or_default() += 1;
    }

    /// Start timing a request
    pub fn start_timer(&self) -> RequestTimer {
        RequestTimer { start: Instant::now() }
    }

    /// Flatten into metadata entries
    pub fn to_metadata(&self) -> BTreeMap<String, Value> {
        let mut metadata = BTreeMap::new();
        metadata.insert("steps".to_string(), Value::from(self.steps));
        metadata.insert("oracle_retries".to_string(), Value::from(self.oracle_retries));
        metadata.insert("pages_visited".to_string(), Value::from(self.pages_visited));
        metadata.insert("links_queued".to_string(), Value::from(self.links_queued));
        metadata.insert("rate_limit_wait_ms".to_string(), Value::from(self.rate_limit_wait_ms));
        if let Ok(tools) = serde_json::to_value(&self.tools) {
            metadata.insert("tools".to_string(), tools);
        }
        if !self.status_codes.is_empty() {
            let codes: BTreeMap<String, usize> = self
                .status_codes
                .iter()
                .map(|(code, count)| (code.to_string(), *count))
                .collect();
            if let Ok(codes) = serde_json::to_value(codes) {
                metadata.insert("status_codes".to_string(), codes);
            }
        }
        metadata
    }
}

/// Request timer for measuring request durations
pub struct RequestTimer {
    /// Start time of the request
    start: Instant,
}

impl RequestTimer {
    /// End timing and get the duration in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_counters() {
        let mut metrics = RunMetrics::new();
        metrics.record_tool("navigate", true, 120);
        metrics.record_tool("navigate", false, 30);
        metrics.record_retry("navigate");
        metrics.record_status(200);
        metrics.steps = 2;

        let stats = &metrics.tools["navigate"];
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.total_ms, 150);

        let metadata = metrics.to_metadata();
        assert_eq!(metadata["steps"], 2);
        assert_eq!(metadata["tools"]["navigate"]["calls"], 2);
        assert_eq!(metadata["status_codes"]["200"], 1);
    }
}
