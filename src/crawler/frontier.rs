use regex::Regex;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::crawler::links::PageLink;
use crate::task::model::TaskConfig;

/// A queued URL together with where it was found
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Link {
    pub url: String,
    pub text: String,
    pub depth: u32,
    /// Deduplication key, see [`normalize_url`]
    pub normalized: String,
}

/// Why the frontier has nothing more to hand out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhausted {
    PageBudget,
    TimeBudget,
    Empty,
}

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exhausted::PageBudget => f.write_str("page budget exhausted"),
            Exhausted::TimeBudget => f.write_str("time budget exhausted"),
            Exhausted::Empty => f.write_str("frontier is empty"),
        }
    }
}

/// Outcome of offering a batch of links
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OfferReport {
    pub accepted: usize,
    pub duplicate: usize,
    pub too_deep: usize,
    pub off_domain: usize,
    pub excluded: usize,
    pub invalid: usize,
}

/// Bounded FIFO queue of links for a single task
pub struct CrawlFrontier {
    max_depth: u32,
    max_pages: u32,
    time_budget: Duration,
    same_domain_only: bool,
    allow_external_links: Option<bool>,

    /// Compiled regex patterns for URL exclusion
    exclude_patterns: Vec<Regex>,

    queue: VecDeque<Link>,
    /// Every normalized URL ever queued, visited or rejected
    seen: HashSet<String>,
    visited: HashSet<String>,
    reference_host: Option<String>,
    started: Instant,
}

impl CrawlFrontier {
    pub fn new(config: &TaskConfig, exclude_patterns: &[String]) -> Self {
        let exclude_patterns = exclude_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!("Invalid exclude pattern '{}': {}", pattern, e);
                    None
                }
            })
            .collect();

        let reference_host = config
            .seed_url
            .as_deref()
            .and_then(|seed| Url::parse(seed).ok())
            .and_then(|url| url.host_str().map(str::to_lowercase));

        Self {
            max_depth: config.max_depth,
            max_pages: config.max_pages,
            time_budget: config.time_budget,
            same_domain_only: config.same_domain_only,
            allow_external_links: config.allow_external_links,
            exclude_patterns,
            queue: VecDeque::new(),
            seen: HashSet::new(),
            visited: HashSet::new(),
            reference_host,
            started: Instant::now(),
        }
    }

    /// Queue a starting point at depth 0; returns false if it was already known
    pub fn seed(&mut self, url: &str, text: &str) -> bool {
        let normalized = match normalize_url(url) {
            Some(normalized) => normalized,
            None => return false,
        };
        if !self.seen.insert(normalized.clone()) {
            return false;
        }

        self.queue.push_back(Link {
            url: url.to_string(),
            text: text.to_string(),
            depth: 0,
            normalized,
        });
        true
    }

    /// Offer links found on a page at `current_depth`; each lands at `current_depth + 1`
    pub fn offer(&mut self, links: Vec<PageLink>, current_depth: u32) -> OfferReport {
        self.offer_at(links, current_depth + 1)
    }

    /// Offer search results as starting points at depth 0, through the usual filters
    pub fn offer_results(&mut self, links: Vec<PageLink>) -> OfferReport {
        self.offer_at(links, 0)
    }

    fn offer_at(&mut self, links: Vec<PageLink>, depth: u32) -> OfferReport {
        let mut report = OfferReport::default();

        for link in links {
            let normalized = match normalize_url(&link.url) {
                Some(normalized) => normalized,
                None => {
                    report.invalid += 1;
                    continue;
                }
            };

            // Check if we've already seen this URL
            if self.seen.contains(&normalized) {
                report.duplicate += 1;
                continue;
            }
            self.seen.insert(normalized.clone());

            if depth > self.max_depth {
                debug!("Skipping URL beyond max depth {}: {}", self.max_depth, normalized);
                report.too_deep += 1;
                continue;
            }

            if !self.domain_permitted(&normalized) {
                debug!("Skipping external URL: {}", normalized);
                report.off_domain += 1;
                continue;
            }

            if self.exclude_patterns.iter().any(|p| p.is_match(&normalized)) {
                debug!("Skipping URL matching exclusion pattern: {}", normalized);
                report.excluded += 1;
                continue;
            }

            self.queue.push_back(Link {
                url: link.url,
                text: link.text,
                depth,
                normalized,
            });
            report.accepted += 1;
        }

        report
    }

    /// Next link in discovery order, unless a budget or the queue has run out
    pub fn next(&mut self) -> Result<Link, Exhausted> {
        if let Some(reason) = self.budget_exhausted() {
            return Err(reason);
        }

        while let Some(link) = self.queue.pop_front() {
            // Navigated to directly after being queued
            if self.visited.contains(&link.normalized) {
                continue;
            }
            return Ok(link);
        }

        Err(Exhausted::Empty)
    }

    /// Record a page as fetched; returns false if it was already counted
    pub fn mark_visited(&mut self, url: &str) -> bool {
        let normalized = match normalize_url(url) {
            Some(normalized) => normalized,
            None => return false,
        };

        if self.reference_host.is_none() {
            self.reference_host = host_of(&normalized);
        }
        self.seen.insert(normalized.clone());
        self.visited.insert(normalized)
    }

    pub fn is_visited(&self, url: &str) -> bool {
        normalize_url(url).map_or(false, |n| self.visited.contains(&n))
    }

    pub fn visited_count(&self) -> usize {
        self.visited.len()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Whether another page may still be fetched under the page budget
    pub fn has_page_budget(&self) -> bool {
        (self.visited.len() as u32) < self.max_pages
    }

    /// The page or time budget that has run out, if any
    pub fn budget_exhausted(&self) -> Option<Exhausted> {
        if !self.has_page_budget() {
            Some(Exhausted::PageBudget)
        } else if self.started.elapsed() >= self.time_budget {
            Some(Exhausted::TimeBudget)
        } else {
            None
        }
    }

    /// Pull a specific queued link out of the queue
    pub fn take(&mut self, url: &str) -> Option<Link> {
        let normalized = normalize_url(url)?;
        let index = self.queue.iter().position(|link| link.normalized == normalized)?;
        self.queue.remove(index)
    }

    fn domain_permitted(&self, normalized: &str) -> bool {
        let reference = match &self.reference_host {
            Some(reference) => reference,
            None => return true,
        };
        let host = match host_of(normalized) {
            Some(host) => host,
            None => return false,
        };
        if &host == reference {
            return true;
        }

        match self.allow_external_links {
            Some(allowed) => allowed,
            None => !self.same_domain_only,
        }
    }
}

fn host_of(normalized: &str) -> Option<String> {
    Url::parse(normalized)
        .ok()
        .and_then(|url| url.host_str().map(str::to_lowercase))
}

/// Normalize a URL to avoid duplicates due to minor differences
///
/// Lower-cases scheme and host, drops the default port, the fragment and
/// trailing slashes, and sorts query pairs. Returns `None` for anything that is
/// not an absolute http(s) URL.
pub fn normalize_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?;

    let mut normalized = format!("{}://{}", parsed.scheme(), host.to_lowercase());

    // `port()` is already `None` for the scheme's default port
    if let Some(port) = parsed.port() {
        normalized.push_str(&format!(":{}", port));
    }

    normalized.push_str(parsed.path().trim_end_matches('/'));

    if let Some(query) = parsed.query() {
        let mut params: Vec<&str> = query.split('&').filter(|pair| !pair.is_empty()).collect();
        if !params.is_empty() {
            params.sort();
            normalized.push('?');
            normalized.push_str(&params.join("&"));
        }
    }

    Some(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::TaskSpec;

    fn config(seed: Option<&str>) -> TaskConfig {
        TaskSpec {
            seed_url: seed.map(str::to_string),
            max_depth: 2,
            max_pages: 3,
            ..TaskSpec::new("q")
        }
        .validate()
        .unwrap()
    }

    fn page_links(urls: &[&str]) -> Vec<PageLink> {
        urls.iter()
            .map(|url| PageLink {
                url: url.to_string(),
                text: String::new(),
            })
            .collect()
    }

    fn excludes() -> Vec<String> {
        vec![r"(?i)\.(jpg|jpeg|png|gif|css|js)$".to_string()]
    }

    #[test]
    fn test_normalize_url() {
        // Test case insensitivity in host
        assert_eq!(
            normalize_url("HTTPS://EXAMPLE.com/path").as_deref(),
            Some("https://example.com/path")
        );

        // Test removal of default ports
        assert_eq!(
            normalize_url("https://example.com:443/path").as_deref(),
            Some("https://example.com/path")
        );
        assert_eq!(
            normalize_url("http://example.com:8080/").as_deref(),
            Some("http://example.com:8080")
        );

        // Test removal of trailing slash
        assert_eq!(normalize_url("https://example.com/").as_deref(), Some("https://example.com"));
        assert_eq!(
            normalize_url("https://example.com/docs//").as_deref(),
            Some("https://example.com/docs")
        );

        // Test query parameter sorting
        assert_eq!(
            normalize_url("https://example.com/search?b=2&a=1").as_deref(),
            Some("https://example.com/search?a=1&b=2")
        );
        assert_eq!(normalize_url("https://example.com/x?").as_deref(), Some("https://example.com/x"));

        // Test fragment removal
        assert_eq!(
            normalize_url("https://example.com/page#section").as_deref(),
            Some("https://example.com/page")
        );

        assert_eq!(normalize_url("ftp://example.com/file"), None);
        assert_eq!(normalize_url("not a url"), None);
    }

    #[test]
    fn test_fifo_and_dedup() {
        let mut frontier = CrawlFrontier::new(&config(Some("https://example.com")), &excludes());
        assert!(frontier.seed("https://example.com/", "seed"));
        assert!(!frontier.seed("https://EXAMPLE.com", "again"));

        let report = frontier.offer(
            page_links(&[
                "https://example.com/a",
                "https://example.com/b#frag",
                "https://example.com/b",
                "https://example.com/",
            ]),
            0,
        );
        assert_eq!(report.accepted, 2);
        assert_eq!(report.duplicate, 2);

        let seed = frontier.next().unwrap();
        assert_eq!(seed.depth, 0);
        frontier.mark_visited(&seed.url);

        assert_eq!(frontier.next().unwrap().normalized, "https://example.com/a");
        let b = frontier.next().unwrap();
        assert_eq!(b.normalized, "https://example.com/b");
        assert_eq!(b.depth, 1);
        assert_eq!(frontier.next(), Err(Exhausted::Empty));
    }

    #[test]
    fn test_depth_and_exclusions() {
        let mut frontier = CrawlFrontier::new(&config(None), &excludes());

        let report = frontier.offer(page_links(&["https://a.com/deep"]), 2);
        assert_eq!(report.too_deep, 1);

        let report = frontier.offer(page_links(&["https://a.com/logo.png", "https://a.com/ok"]), 1);
        assert_eq!(report.excluded, 1);
        assert_eq!(report.accepted, 1);

        // Rejected URLs are never reconsidered, even at an acceptable depth
        let report = frontier.offer(page_links(&["https://a.com/deep"]), 0);
        assert_eq!(report.duplicate, 1);
        assert_eq!(frontier.pending(), 1);
    }

    #[test]
    fn test_same_domain_rules() {
        let mut strict = config(Some("https://example.com"));
        strict.same_domain_only = true;

        let mut frontier = CrawlFrontier::new(&strict, &[]);
        let report = frontier.offer(page_links(&["https://other.org/x", "https://example.com/y"]), 0);
        assert_eq!(report.off_domain, 1);
        assert_eq!(report.accepted, 1);

        // An explicit allow overrides same_domain_only
        strict.allow_external_links = Some(true);
        let mut frontier = CrawlFrontier::new(&strict, &[]);
        assert_eq!(frontier.offer(page_links(&["https://other.org/x"]), 0).accepted, 1);

        // An explicit deny applies even without same_domain_only
        let mut open = config(Some("https://example.com"));
        open.allow_external_links = Some(false);
        let mut frontier = CrawlFrontier::new(&open, &[]);
        assert_eq!(frontier.offer(page_links(&["https://other.org/x"]), 0).off_domain, 1);
    }

    #[test]
    fn test_reference_domain_from_first_visit() {
        let mut strict = config(None);
        strict.same_domain_only = true;
        let mut frontier = CrawlFrontier::new(&strict, &[]);

        frontier.mark_visited("https://news.site/home");
        let report = frontier.offer(page_links(&["https://news.site/a", "https://elsewhere.net/"]), 0);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.off_domain, 1);
    }

    #[test]
    fn test_page_budget() {
        let mut frontier = CrawlFrontier::new(&config(None), &[]);
        frontier.offer(page_links(&["https://a.com/1", "https://a.com/2", "https://a.com/3", "https://a.com/4"]), 0);

        for _ in 0..3 {
            let link = frontier.next().unwrap();
            frontier.mark_visited(&link.url);
        }
        assert_eq!(frontier.visited_count(), 3);
        assert!(!frontier.has_page_budget());
        assert_eq!(frontier.next(), Err(Exhausted::PageBudget));
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_budget() {
        let mut frontier = CrawlFrontier::new(&config(None), &[]);
        frontier.seed("https://a.com", "");

        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(frontier.next(), Err(Exhausted::TimeBudget));
    }

    #[test]
    fn test_visited_urls_are_skipped_in_queue() {
        let mut frontier = CrawlFrontier::new(&config(None), &[]);
        frontier.offer(page_links(&["https://a.com/1", "https://a.com/2"]), 0);
        frontier.mark_visited("https://a.com/1/");

        assert!(frontier.is_visited("https://A.com/1"));
        assert_eq!(frontier.next().unwrap().normalized, "https://a.com/2");
    }

    #[test]
    fn test_results_enter_at_depth_zero() {
        let mut frontier = CrawlFrontier::new(&config(None), &excludes());
        let report = frontier.offer_results(page_links(&["https://a.com/x", "https://a.com/x.css"]));
        assert_eq!(report.accepted, 1);
        assert_eq!(report.excluded, 1);
        assert_eq!(frontier.next().unwrap().depth, 0);
    }

    #[test]
    fn test_take_specific_link() {
        let mut frontier = CrawlFrontier::new(&config(None), &[]);
        frontier.offer(page_links(&["https://a.com/1", "https://a.com/2"]), 0);

        assert_eq!(frontier.take("https://a.com/2/").unwrap().url, "https://a.com/2");
        assert!(frontier.take("https://a.com/2").is_none());
        assert_eq!(frontier.pending(), 1);
    }
}
