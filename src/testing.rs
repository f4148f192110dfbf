//! In-memory doubles for the browser, the artifact store and the oracle.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::agent::oracle::{Decision, DecisionOracle, DecisionRequest};
use crate::browser::{BrowserBackend, Fingerprint, NavigationResponse, PageSession, PageSnapshot};
use crate::error::{ResearchError, Result};
use crate::events::TaskEvent;
use crate::storage::{ArtifactStats, ArtifactStore};
use crate::task::model::{Citation, Task, TaskSummary};

/// Minimal PNG signature; enough for anything that only stores the bytes
pub const FAKE_PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

#[derive(Debug, Clone)]
struct FakeDocument {
    status: u16,
    title: String,
    html: String,
}

/// Pages served by every context of a [`FakeBackend`]
#[derive(Default)]
pub struct FakeSite {
    pages: Mutex<HashMap<String, FakeDocument>>,
    /// Remaining injected transient failures per URL
    failures: Mutex<HashMap<String, usize>>,
    delays: Mutex<HashMap<String, Duration>>,
    navigations: Mutex<Vec<String>>,
}

impl FakeSite {
    /// Serve `html` at `url`; a URL without a query also matches every query string
    pub fn page(&self, url: &str, title: &str, html: &str) {
        self.page_with_status(url, 200, title, html);
    }

    pub fn page_with_status(&self, url: &str, status: u16, title: &str, html: &str) {
        self.pages.lock().unwrap().insert(
            url.to_string(),
            FakeDocument {
                status,
                title: title.to_string(),
                html: html.to_string(),
            },
        );
    }

    /// Fail the next `times` navigations to `url` with a transient error
    pub fn fail(&self, url: &str, times: usize) {
        self.failures.lock().unwrap().insert(url.to_string(), times);
    }

    pub fn delay(&self, url: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(url.to_string(), delay);
    }

    /// Every URL navigated to, in order
    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().unwrap().clone()
    }

    fn lookup<T: Clone>(map: &Mutex<HashMap<String, T>>, url: &str) -> Option<T> {
        let map = map.lock().unwrap();
        if let Some(found) = map.get(url) {
            return Some(found.clone());
        }
        let mut bare = Url::parse(url).ok()?;
        bare.set_query(None);
        map.get(bare.as_str()).cloned()
    }

    fn take_failure(&self, url: &str) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(url) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Browser backend whose contexts serve a [`FakeSite`]
#[derive(Default)]
pub struct FakeBackend {
    pub created: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
    /// Number of upcoming context creations that fail
    pub fail_creations: AtomicUsize,
    pub shut_down: AtomicBool,
    pub site: Arc<FakeSite>,
}

#[async_trait]
impl BrowserBackend for FakeBackend {
    async fn create_context(&self, _fingerprint: &Fingerprint) -> Result<Box<dyn PageSession>> {
        let should_fail = self
            .fail_creations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(ResearchError::ContextCreation("injected failure".into()));
        }

        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePage {
            site: self.site.clone(),
            closed: self.closed.clone(),
            current: None,
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakePage {
    site: Arc<FakeSite>,
    closed: Arc<AtomicUsize>,
    current: Option<(String, FakeDocument)>,
}

#[async_trait]
impl PageSession for FakePage {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<NavigationResponse> {
        self.site.navigations.lock().unwrap().push(url.to_string());

        if let Some(delay) = FakeSite::lookup(&self.site.delays, url) {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(ResearchError::NavigationTimeout {
                    url: url.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(delay).await;
        }

        if self.site.take_failure(url) {
            return Err(ResearchError::TransientNetwork(format!("connection reset by {}", url)));
        }

        let document = FakeSite::lookup(&self.site.pages, url).unwrap_or_else(|| FakeDocument {
            status: 404,
            title: "Not Found".to_string(),
            html: "<html><head><title>Not Found</title></head><body>Not Found</body></html>".to_string(),
        });

        let response = NavigationResponse {
            status: Some(document.status),
            final_url: url.to_string(),
            title: document.title.clone(),
        };
        self.current = Some((url.to_string(), document));
        Ok(response)
    }

    async fn content(&mut self) -> Result<PageSnapshot> {
        Ok(match &self.current {
            Some((url, document)) => PageSnapshot {
                url: url.clone(),
                title: document.title.clone(),
                html: document.html.clone(),
            },
            None => PageSnapshot {
                url: "about:blank".to_string(),
                title: String::new(),
                html: "<html><body></body></html>".to_string(),
            },
        })
    }

    async fn screenshot(&mut self, _full_page: bool) -> Result<Vec<u8>> {
        Ok(FAKE_PNG.to_vec())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct StoredTask {
    task: Option<Task>,
    sources: Vec<Citation>,
    events: Vec<TaskEvent>,
    screenshots: Vec<usize>,
}

/// Artifact store kept in memory
#[derive(Default)]
pub struct MemoryArtifactStore {
    tasks: Mutex<HashMap<String, StoredTask>>,
}

impl MemoryArtifactStore {
    pub fn sources(&self, task_id: &str) -> Vec<Citation> {
        self.tasks
            .lock()
            .unwrap()
            .get(task_id)
            .map(|stored| stored.sources.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn save_task(&self, task: &Task) -> Result<()> {
        self.tasks.lock().unwrap().entry(task.id.clone()).or_default().task = Some(task.clone());
        Ok(())
    }

    async fn load_task(&self, task_id: &str) -> Result<Task> {
        self.tasks
            .lock()
            .unwrap()
            .get(task_id)
            .and_then(|stored| stored.task.clone())
            .ok_or_else(|| ResearchError::NotFound(task_id.to_string()))
    }

    async fn save_screenshot(&self, task_id: &str, step: usize, _png: &[u8]) -> Result<String> {
        self.tasks
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_default()
            .screenshots
            .push(step);
        Ok(format!("memory://{}/screenshots/step_{}.png", task_id, step))
    }

    async fn save_sources(&self, task_id: &str, citations: &[Citation]) -> Result<()> {
        self.tasks.lock().unwrap().entry(task_id.to_string()).or_default().sources = citations.to_vec();
        Ok(())
    }

    async fn save_events(&self, task_id: &str, events: &[TaskEvent]) -> Result<()> {
        self.tasks.lock().unwrap().entry(task_id.to_string()).or_default().events = events.to_vec();
        Ok(())
    }

    async fn load_events(&self, task_id: &str) -> Result<Vec<TaskEvent>> {
        self.tasks
            .lock()
            .unwrap()
            .get(task_id)
            .map(|stored| stored.events.clone())
            .ok_or_else(|| ResearchError::NotFound(task_id.to_string()))
    }

    async fn list(&self) -> Result<Vec<TaskSummary>> {
        let mut summaries: Vec<TaskSummary> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter_map(|stored| stored.task.as_ref().map(Task::summary))
            .collect();
        summaries.sort_by_key(|summary| summary.created_at);
        Ok(summaries)
    }

    async fn delete(&self, task_id: &str) -> Result<()> {
        self.tasks.lock().unwrap().remove(task_id);
        Ok(())
    }

    async fn stats(&self, task_id: &str) -> Result<ArtifactStats> {
        let tasks = self.tasks.lock().unwrap();
        Ok(match tasks.get(task_id) {
            Some(stored) => ArtifactStats {
                exists: true,
                total_size_bytes: (stored.screenshots.len() * FAKE_PNG.len()) as u64,
                screenshot_count: stored.screenshots.len(),
                has_events: !stored.events.is_empty(),
                has_sources: !stored.sources.is_empty(),
                has_result: stored.task.is_some(),
            },
            None => ArtifactStats::default(),
        })
    }
}

/// Oracle that replays a fixed list of decisions, then answers
#[derive(Default)]
pub struct ScriptedOracle {
    decisions: Mutex<VecDeque<Decision>>,
    requests: Mutex<Vec<DecisionRequest>>,
}

impl ScriptedOracle {
    pub fn new(decisions: Vec<Decision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<DecisionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl DecisionOracle for ScriptedOracle {
    async fn decide(&self, request: DecisionRequest) -> Result<Decision> {
        self.requests.lock().unwrap().push(request);
        Ok(self
            .decisions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Decision::answer("out of script")))
    }
}
