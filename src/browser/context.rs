//! Per-task browser context isolation.
//!
//! Every active task owns at most one context, created lazily with a fresh
//! fingerprint. The number of live contexts is capped; at the cap the least
//! recently used idle context is evicted, and when every context is busy the
//! caller waits for a lease to be dropped. The table lock is synchronous and is
//! never held while a context is being created or closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, Notify};
use tracing::{debug, info, warn};

use crate::browser::backend::{BrowserBackend, PageSession};
use crate::browser::fingerprint::{Fingerprint, FingerprintGenerator};
use crate::error::{ResearchError, Result};

type SharedPage = Arc<AsyncMutex<Box<dyn PageSession>>>;

/// Hands out isolated browser contexts keyed by task id
#[derive(Clone)]
pub struct BrowserContextManager {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn BrowserBackend>,
    fingerprints: FingerprintGenerator,
    max_contexts: usize,
    table: Mutex<ContextTable>,
    /// Signalled whenever a context becomes idle or a slot frees up
    changed: Notify,
}

#[derive(Default)]
struct ContextTable {
    slots: HashMap<String, Slot>,
    tick: u64,
    next_generation: u64,
    closed: bool,
}

enum Slot {
    /// Placeholder while the backend builds the context outside the lock
    Creating(u64),
    Ready(ContextEntry),
}

struct ContextEntry {
    page: SharedPage,
    fingerprint: Fingerprint,
    busy: usize,
    last_used: u64,
    generation: u64,
}

enum Step {
    Reuse(ContextLease),
    Create(u64),
    Evict(String, ContextEntry, u64),
    Wait,
}

impl Inner {
    fn table(&self) -> MutexGuard<'_, ContextTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ContextTable {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Least recently used context with no outstanding lease
    fn lru_idle(&self) -> Option<String> {
        self.slots
            .iter()
            .filter_map(|(task_id, slot)| match slot {
                Slot::Ready(entry) if entry.busy == 0 => Some((task_id, entry.last_used)),
                _ => None,
            })
            .min_by_key(|(_, last_used)| *last_used)
            .map(|(task_id, _)| task_id.clone())
    }
}

/// Exclusive use of a task's context; the context stays busy until dropped
pub struct ContextLease {
    inner: Arc<Inner>,
    task_id: String,
    generation: u64,
    page: SharedPage,
    fingerprint: Fingerprint,
}

impl ContextLease {
    /// Lock the page for a sequence of browser operations
    pub async fn page(&self) -> AsyncMutexGuard<'_, Box<dyn PageSession>> {
        self.page.lock().await
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Changes whenever the task's context is recreated, e.g. after eviction
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for ContextLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextLease")
            .field("task_id", &self.task_id)
            .field("generation", &self.generation)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        {
            let mut table = self.inner.table();
            let tick = table.touch();
            if let Some(Slot::Ready(entry)) = table.slots.get_mut(&self.task_id) {
                if entry.generation == self.generation {
                    entry.busy = entry.busy.saturating_sub(1);
                    entry.last_used = tick;
                }
            }
        }
        self.inner.changed.notify_waiters();
    }
}

/// Removes a `Creating` placeholder if creation is abandoned
struct CreationGuard<'a> {
    inner: &'a Arc<Inner>,
    task_id: &'a str,
    generation: u64,
    armed: bool,
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut table = self.inner.table();
            if matches!(table.slots.get(self.task_id), Some(Slot::Creating(g)) if *g == self.generation) {
                table.slots.remove(self.task_id);
            }
        }
        self.inner.changed.notify_waiters();
    }
}

impl BrowserContextManager {
    pub fn new(backend: Arc<dyn BrowserBackend>, fingerprints: FingerprintGenerator, max_contexts: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                fingerprints,
                max_contexts: max_contexts.max(1),
                table: Mutex::new(ContextTable::default()),
                changed: Notify::new(),
            }),
        }
    }

    /// Get the task's context, creating one (and evicting if at capacity) when needed
    pub async fn acquire(&self, task_id: &str) -> Result<ContextLease> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = self.plan(task_id)?;

            return match step {
                Step::Reuse(lease) => Ok(lease),
                Step::Wait => {
                    debug!(task_id, "All browser contexts busy, waiting");
                    notified.await;
                    continue;
                }
                Step::Evict(victim, entry, generation) => {
                    self.create(task_id, generation, Some((victim, entry))).await
                }
                Step::Create(generation) => self.create(task_id, generation, None).await,
            };
        }
    }

    /// Decide what to do under the table lock
    fn plan(&self, task_id: &str) -> Result<Step> {
        let mut table = self.inner.table();
        if table.closed {
            return Err(ResearchError::Browser("Browser context manager is shut down".to_string()));
        }

        let tick = table.touch();
        match table.slots.get_mut(task_id) {
            Some(Slot::Ready(entry)) => {
                entry.busy += 1;
                entry.last_used = tick;
                return Ok(Step::Reuse(ContextLease {
                    inner: self.inner.clone(),
                    task_id: task_id.to_string(),
                    generation: entry.generation,
                    page: entry.page.clone(),
                    fingerprint: entry.fingerprint.clone(),
                }));
            }
            Some(Slot::Creating(_)) => return Ok(Step::Wait),
            None => {}
        }

        if table.slots.len() < self.inner.max_contexts {
            let generation = table.generation();
            table.slots.insert(task_id.to_string(), Slot::Creating(generation));
            return Ok(Step::Create(generation));
        }

        if let Some(victim) = table.lru_idle() {
            if let Some(Slot::Ready(entry)) = table.slots.remove(&victim) {
                let generation = table.generation();
                table.slots.insert(task_id.to_string(), Slot::Creating(generation));
                return Ok(Step::Evict(victim, entry, generation));
            }
        }

        Ok(Step::Wait)
    }

    /// Build a context for a slot reserved by `plan`, closing the evicted one first
    async fn create(
        &self,
        task_id: &str,
        generation: u64,
        evicted: Option<(String, ContextEntry)>,
    ) -> Result<ContextLease> {
        let mut guard = CreationGuard {
            inner: &self.inner,
            task_id,
            generation,
            armed: true,
        };

        if let Some((victim, entry)) = evicted {
            info!(task_id, evicted = %victim, "Evicting idle browser context");
            close_page(&victim, entry.page).await;
        }

        let fingerprint = self.inner.fingerprints.generate();
        let page = match self.inner.backend.create_context(&fingerprint).await {
            Ok(page) => page,
            Err(e) => {
                warn!(task_id, "Failed to create browser context: {}", e);
                return Err(match e {
                    ResearchError::ContextCreation(_) => e,
                    other => ResearchError::ContextCreation(other.to_string()),
                });
            }
        };

        let outcome = {
            let mut table = self.inner.table();
            let tick = table.touch();
            let still_wanted = !table.closed
                && matches!(table.slots.get(task_id), Some(Slot::Creating(g)) if *g == generation);

            if still_wanted {
                let shared: SharedPage = Arc::new(AsyncMutex::new(page));
                table.slots.insert(
                    task_id.to_string(),
                    Slot::Ready(ContextEntry {
                        page: shared.clone(),
                        fingerprint: fingerprint.clone(),
                        busy: 1,
                        last_used: tick,
                        generation,
                    }),
                );
                guard.armed = false;
                Ok(ContextLease {
                    inner: self.inner.clone(),
                    task_id: task_id.to_string(),
                    generation,
                    page: shared,
                    fingerprint,
                })
            } else {
                Err(page)
            }
        };

        match outcome {
            Ok(lease) => {
                debug!(task_id, "Browser context ready");
                Ok(lease)
            }
            Err(mut page) => {
                // Released or shut down while the backend was working
                if let Err(e) = page.close().await {
                    warn!(task_id, "Error closing abandoned browser context: {}", e);
                }
                Err(ResearchError::ContextCreation(format!(
                    "Context for task {} was released during creation",
                    task_id
                )))
            }
        }
    }

    /// Destroy the task's context; a no-op when it has none
    pub async fn release(&self, task_id: &str) {
        let removed = {
            let mut table = self.inner.table();
            table.slots.remove(task_id)
        };

        if let Some(Slot::Ready(entry)) = removed {
            close_page(task_id, entry.page).await;
        }
        self.inner.changed.notify_waiters();
    }

    /// Close every context, then the backend
    pub async fn shutdown(&self) -> Result<()> {
        let drained: Vec<(String, ContextEntry)> = {
            let mut table = self.inner.table();
            table.closed = true;
            table
                .slots
                .drain()
                .filter_map(|(task_id, slot)| match slot {
                    Slot::Ready(entry) => Some((task_id, entry)),
                    Slot::Creating(_) => None,
                })
                .collect()
        };
        self.inner.changed.notify_waiters();

        info!("Closing {} browser contexts", drained.len());
        for (task_id, entry) in drained {
            close_page(&task_id, entry.page).await;
        }

        self.inner.backend.shutdown().await
    }

    pub fn has_context(&self, task_id: &str) -> bool {
        matches!(self.inner.table().slots.get(task_id), Some(Slot::Ready(_)))
    }

    /// Number of live or in-creation contexts
    pub fn active_count(&self) -> usize {
        self.inner.table().slots.len()
    }
}

async fn close_page(task_id: &str, page: SharedPage) {
    let mut page = page.lock().await;
    if let Err(e) = page.close().await {
        warn!(task_id, "Error closing browser context: {}", e);
    }
    debug!(task_id, "Browser context closed");
}
