//! Task admission and lifecycle.
//!
//! Tasks are admitted FIFO into a bounded number of running slots. Each running
//! task is one tokio task racing the executor against the task timeout and its
//! cancellation token. Every terminal path tears down in the same order:
//! drop the run future, release the browser context, write the terminal
//! snapshot, append exactly one terminal event, persist artifacts, free the
//! slot, admit the next queued task.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::browser::BrowserContextManager;
use crate::cli::config::SchedulerSettings;
use crate::error::{ResearchError, Result};
use crate::events::{EventEmitter, EventKind, EventStream, Subscription};
use crate::storage::ArtifactStore;
use crate::task::model::{paginate, ResearchOutcome, Task, TaskConfig, TaskSpec, TaskStatus, TaskSummary};

/// Runs a single task to its outcome
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, run: TaskRun) -> Result<ResearchOutcome>;
}

/// Everything an executor gets for one run
pub struct TaskRun {
    pub task_id: String,
    pub config: TaskConfig,
    pub events: EventEmitter,
    /// Checked at every step and raced against every blocking wait
    pub cancel: CancellationToken,
    pub progress: RunProgress,
}

/// Partial findings, kept for tasks that end without an answer
#[derive(Clone, Default)]
pub struct RunProgress {
    inner: Arc<Mutex<ResearchOutcome>>,
}

impl RunProgress {
    pub fn set(&self, outcome: ResearchOutcome) {
        *self.lock() = outcome;
    }

    pub fn take(&self) -> ResearchOutcome {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, ResearchOutcome> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Bounded, FIFO task scheduler
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    settings: SchedulerSettings,
    executor: Arc<dyn TaskExecutor>,
    events: Arc<EventStream>,
    contexts: BrowserContextManager,
    artifacts: Arc<dyn ArtifactStore>,
    state: Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<String, TaskEntry>,
    /// Submission order
    order: Vec<String>,
    queue: VecDeque<String>,
    running: usize,
    shutting_down: bool,
}

struct TaskEntry {
    task: Task,
    cancel: CancellationToken,
    cancel_reason: Option<String>,
    /// Published once teardown has fully finished
    done: watch::Sender<Option<Task>>,
    /// Holds a running slot until teardown frees it
    active: bool,
    delete_requested: bool,
}

/// How a run ended, before it is written to the task
enum RunEnd {
    Completed(ResearchOutcome),
    Cancelled(String),
    Failed(String),
}

impl SchedulerInner {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit queued tasks while slots are free
    fn dispatch(self: &Arc<Self>) {
        let mut state = self.state();

        while state.running < self.settings.max_concurrent_tasks && !state.shutting_down {
            let task_id = match state.queue.pop_front() {
                Some(task_id) => task_id,
                None => break,
            };

            let entry = match state.tasks.get_mut(&task_id) {
                Some(entry) if entry.task.status == TaskStatus::Queued => entry,
                _ => continue,
            };

            if let Err(e) = entry.task.transition(TaskStatus::Running) {
                warn!(task_id = %task_id, "Cannot start task: {}", e);
                continue;
            }
            entry.active = true;
            let config = entry.task.config.clone();
            let cancel = entry.cancel.clone();
            state.running += 1;

            info!(task_id = %task_id, running = state.running, "Task admitted");
            let inner = self.clone();
            tokio::spawn(async move {
                inner.run_task(task_id, config, cancel).await;
            });
        }
    }

    async fn run_task(self: Arc<Self>, task_id: String, config: TaskConfig, cancel: CancellationToken) {
        let progress = RunProgress::default();
        let run = TaskRun {
            task_id: task_id.clone(),
            config,
            events: EventEmitter::new(self.events.clone(), task_id.clone()),
            cancel: cancel.clone(),
            progress: progress.clone(),
        };

        let timeout = self.settings.task_timeout();
        let deadline = Instant::now() + timeout;
        let executor = self.executor.clone();
        let run_future = AssertUnwindSafe(executor.execute(run)).catch_unwind();
        tokio::pin!(run_future);

        let result = tokio::select! {
            result = &mut run_future => result.map_err(panic_message),
            _ = sleep_until(deadline) => Ok(Err(ResearchError::Timeout(timeout))),
            _ = cancel.cancelled() => {
                // Let an in-flight call settle, bounded by the grace period and the task deadline
                let grace_end = deadline.min(Instant::now() + self.settings.cancel_grace());
                let _ = timeout_at(grace_end, &mut run_future).await;
                Ok(Err(ResearchError::Cancelled("cancelled while running".to_string())))
            }
        };
        drop(run_future);

        // A cancel request always wins over a late answer
        let end = if cancel.is_cancelled() {
            RunEnd::Cancelled(self.cancel_reason(&task_id))
        } else {
            match result {
                Ok(Ok(outcome)) => RunEnd::Completed(outcome),
                Ok(Err(ResearchError::Cancelled(_))) => RunEnd::Cancelled(self.cancel_reason(&task_id)),
                Ok(Err(e)) => RunEnd::Failed(e.to_string()),
                Err(message) => {
                    warn!(task_id = %task_id, "Executor panicked: {}", message);
                    RunEnd::Failed(format!("executor panicked: {}", message))
                }
            }
        };

        self.contexts.release(&task_id).await;
        self.finish(&task_id, end, progress.take()).await;
        self.free_slot(&task_id).await;
        self.dispatch();
    }

    fn cancel_reason(&self, task_id: &str) -> String {
        self.state()
            .tasks
            .get(task_id)
            .and_then(|entry| entry.cancel_reason.clone())
            .unwrap_or_else(|| "cancelled".to_string())
    }

    /// Write the terminal snapshot, append the terminal event and persist artifacts
    async fn finish(&self, task_id: &str, end: RunEnd, partial: ResearchOutcome) {
        let (snapshot, event) = {
            let mut state = self.state();
            let entry = match state.tasks.get_mut(task_id) {
                Some(entry) => entry,
                None => return,
            };
            let task = &mut entry.task;

            let (status, event) = match end {
                RunEnd::Completed(outcome) => {
                    let event = EventKind::Complete {
                        answer: outcome.answer.clone(),
                        citations: outcome.citations.clone(),
                        screenshots: outcome.screenshots.clone(),
                    };
                    task.answer = Some(outcome.answer);
                    task.citations = outcome.citations;
                    task.screenshots = outcome.screenshots;
                    task.metadata.extend(outcome.metadata);
                    (TaskStatus::Completed, event)
                }
                RunEnd::Cancelled(reason) => {
                    apply_partial(task, partial);
                    let message = ResearchError::Cancelled(reason.clone()).to_string();
                    task.error = Some(reason);
                    (TaskStatus::Cancelled, EventKind::Error { message, recoverable: false })
                }
                RunEnd::Failed(message) => {
                    apply_partial(task, partial);
                    task.error = Some(message.clone());
                    (TaskStatus::Failed, EventKind::Error { message, recoverable: false })
                }
            };

            if let Err(e) = task.transition(status) {
                warn!(task_id, "Dropping terminal transition: {}", e);
                return;
            }
            info!(task_id, status = %status, "Task finished");
            (task.clone(), event)
        };

        self.close_events(task_id, event);
        self.persist(&snapshot).await;
    }

    fn close_events(&self, task_id: &str, event: EventKind) {
        if let Err(e) = self.events.append(task_id, event) {
            warn!(task_id, "Could not append terminal event: {}", e);
        }
    }

    async fn persist(&self, task: &Task) {
        if let Err(e) = self.artifacts.save_task(task).await {
            warn!(task_id = %task.id, "Failed to persist task snapshot: {}", e);
        }
        if let Err(e) = self.artifacts.save_sources(&task.id, &task.citations).await {
            warn!(task_id = %task.id, "Failed to persist sources: {}", e);
        }
        match self.events.history(&task.id) {
            Ok(events) => {
                if let Err(e) = self.artifacts.save_events(&task.id, &events).await {
                    warn!(task_id = %task.id, "Failed to persist event log: {}", e);
                }
            }
            Err(e) => debug!(task_id = %task.id, "No event log to persist: {}", e),
        }
    }

    /// Release the running slot, publish the final snapshot and reap if deletion was requested
    async fn free_slot(&self, task_id: &str) {
        let reap = {
            let mut state = self.state();
            state.running = state.running.saturating_sub(1);
            match state.tasks.get_mut(task_id) {
                Some(entry) => {
                    entry.active = false;
                    entry.done.send_replace(Some(entry.task.clone()));
                    entry.delete_requested
                }
                None => false,
            }
        };

        if reap {
            self.reap(task_id).await;
        }
    }

    async fn reap(&self, task_id: &str) {
        {
            let mut state = self.state();
            state.tasks.remove(task_id);
            state.order.retain(|id| id != task_id);
            state.queue.retain(|id| id != task_id);
        }
        self.events.remove(task_id);
        if let Err(e) = self.artifacts.delete(task_id).await {
            warn!(task_id, "Failed to delete artifacts: {}", e);
        }
        info!(task_id, "Task deleted");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn apply_partial(task: &mut Task, partial: ResearchOutcome) {
    task.citations = partial.citations;
    task.screenshots = partial.screenshots;
    task.metadata.extend(partial.metadata);
}

impl TaskScheduler {
    pub fn new(
        settings: SchedulerSettings,
        executor: Arc<dyn TaskExecutor>,
        events: Arc<EventStream>,
        contexts: BrowserContextManager,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                settings,
                executor,
                events,
                contexts,
                artifacts,
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    /// Validate and enqueue a task; returns its id
    pub fn submit(&self, spec: TaskSpec) -> Result<String> {
        let config = spec.validate()?;
        let task_id = Uuid::new_v4().to_string();
        let mut task = Task::new(task_id.clone(), config);

        {
            let mut state = self.inner.state();
            if state.shutting_down {
                return Err(ResearchError::Cancelled("scheduler is shutting down".to_string()));
            }

            self.inner.events.open(&task_id);
            task.transition(TaskStatus::Queued)?;

            let (done, _) = watch::channel(None);
            state.tasks.insert(
                task_id.clone(),
                TaskEntry {
                    task,
                    cancel: CancellationToken::new(),
                    cancel_reason: None,
                    done,
                    active: false,
                    delete_requested: false,
                },
            );
            state.order.push(task_id.clone());
            state.queue.push_back(task_id.clone());
            info!(task_id = %task_id, queued = state.queue.len(), "Task submitted");
        }

        self.inner.dispatch();
        Ok(task_id)
    }

    /// Current snapshot of a task
    pub fn status(&self, task_id: &str) -> Result<Task> {
        self.inner
            .state()
            .tasks
            .get(task_id)
            .map(|entry| entry.task.clone())
            .ok_or_else(|| ResearchError::NotFound(task_id.to_string()))
    }

    /// One page of summaries, newest first, and the total number of tasks
    pub fn list(&self, offset: usize, limit: usize) -> (Vec<TaskSummary>, usize) {
        let summaries = {
            let state = self.inner.state();
            state
                .order
                .iter()
                .rev()
                .filter_map(|id| state.tasks.get(id))
                .map(|entry| entry.task.summary())
                .collect()
        };
        paginate(summaries, offset, limit)
    }

    /// Request cancellation; a no-op for tasks that already finished
    pub async fn cancel(&self, task_id: &str, reason: &str) -> Result<()> {
        let snapshot = {
            let mut state = self.inner.state();
            let entry = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| ResearchError::NotFound(task_id.to_string()))?;

            let status = entry.task.status;
            match status {
                status if status.is_terminal() => return Ok(()),
                TaskStatus::Running => {
                    entry.cancel_reason.get_or_insert_with(|| reason.to_string());
                    entry.cancel.cancel();
                    info!(task_id, "Cancellation requested for running task");
                    return Ok(());
                }
                _ => {
                    // Never admitted: goes straight to cancelled
                    entry.cancel_reason = Some(reason.to_string());
                    entry.cancel.cancel();
                    entry.task.error = Some(reason.to_string());
                    entry.task.transition(TaskStatus::Cancelled)?;
                    let snapshot = entry.task.clone();
                    state.queue.retain(|id| id != task_id);
                    snapshot
                }
            }
        };

        info!(task_id, "Queued task cancelled");
        self.inner.close_events(
            task_id,
            EventKind::Error {
                message: ResearchError::Cancelled(reason.to_string()).to_string(),
                recoverable: false,
            },
        );
        self.inner.persist(&snapshot).await;

        if let Some(entry) = self.inner.state().tasks.get(task_id) {
            entry.done.send_replace(Some(entry.task.clone()));
        }
        Ok(())
    }

    /// Resolve with the final snapshot once the task has fully finished
    pub async fn wait(&self, task_id: &str) -> Result<Task> {
        let mut done = {
            let state = self.inner.state();
            let entry = state
                .tasks
                .get(task_id)
                .ok_or_else(|| ResearchError::NotFound(task_id.to_string()))?;
            entry.done.subscribe()
        };

        let result = done.wait_for(|task| task.is_some()).await;
        match result {
            Ok(task) => task.clone().ok_or_else(|| ResearchError::NotFound(task_id.to_string())),
            // Deleted before it finished
            Err(_) => Err(ResearchError::NotFound(task_id.to_string())),
        }
    }

    /// Remove a task with its event log and artifacts, cancelling it first if needed
    pub async fn delete(&self, task_id: &str) -> Result<()> {
        {
            let mut state = self.inner.state();
            let entry = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| ResearchError::NotFound(task_id.to_string()))?;
            entry.delete_requested = true;
        }

        match self.cancel(task_id, "deleted").await {
            // Already reaped by a teardown that raced us
            Ok(()) | Err(ResearchError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        // A task still holding a slot is reaped by its own teardown
        let reap_now = self
            .inner
            .state()
            .tasks
            .get(task_id)
            .map_or(false, |entry| !entry.active);
        if reap_now {
            self.inner.reap(task_id).await;
        }
        Ok(())
    }

    /// Follow a task's events from `since` on
    pub fn subscribe(&self, task_id: &str, since: u64) -> Result<Subscription> {
        self.inner.events.subscribe(task_id, since)
    }

    pub fn events(&self) -> &Arc<EventStream> {
        &self.inner.events
    }

    /// Number of tasks currently holding a running slot
    pub fn running(&self) -> usize {
        self.inner.state().running
    }

    /// Cancel everything, wait for teardown, then close the browser
    pub async fn shutdown(&self) -> Result<()> {
        let task_ids: Vec<String> = {
            let mut state = self.inner.state();
            state.shutting_down = true;
            state
                .tasks
                .iter()
                .filter(|(_, entry)| !entry.task.status.is_terminal())
                .map(|(id, _)| id.clone())
                .collect()
        };

        info!("Shutting down scheduler, cancelling {} tasks", task_ids.len());
        for task_id in &task_ids {
            match self.cancel(task_id, "scheduler shutting down").await {
                // Reaped by a delete that raced us
                Ok(()) | Err(ResearchError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        for task_id in &task_ids {
            let _ = self.wait(task_id).await;
        }

        self.inner.contexts.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::BrowserSettings;
    use crate::browser::FingerprintGenerator;
    use crate::testing::{FakeBackend, MemoryArtifactStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Behaviour is picked from the question text
    struct ScriptedExecutor {
        contexts: BrowserContextManager,
        running: AtomicUsize,
        max_running: AtomicUsize,
        /// (question, live contexts at start)
        started: Mutex<Vec<(String, usize)>>,
    }

    impl ScriptedExecutor {
        fn new(contexts: BrowserContextManager) -> Self {
            Self {
                contexts,
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                started: Mutex::new(Vec::new()),
            }
        }

        fn started(&self) -> Vec<(String, usize)> {
            self.started.lock().unwrap().clone()
        }
    }

    struct RunningGuard<'a>(&'a AtomicUsize);

    impl Drop for RunningGuard<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl TaskExecutor for ScriptedExecutor {
        async fn execute(&self, run: TaskRun) -> Result<ResearchOutcome> {
            let question = run.config.question.clone();
            self.started
                .lock()
                .unwrap()
                .push((question.clone(), self.contexts.active_count()));

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            let _guard = RunningGuard(&self.running);

            let _lease = self.contexts.acquire(&run.task_id).await?;
            run.events.thinking("working")?;

            match question.as_str() {
                "fail" => Err(ResearchError::Browser("boom".into())),
                "panic" => panic!("boom"),
                "hang" => std::future::pending().await,
                "answer on cancel" => {
                    run.cancel.cancelled().await;
                    Ok(ResearchOutcome {
                        answer: "late".into(),
                        ..ResearchOutcome::default()
                    })
                }
                "observe cancel" => {
                    run.cancel.cancelled().await;
                    Err(ResearchError::Cancelled("observed".into()))
                }
                other => {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(ResearchOutcome {
                        answer: format!("answer to {}", other),
                        ..ResearchOutcome::default()
                    })
                }
            }
        }
    }

    struct Harness {
        scheduler: TaskScheduler,
        executor: Arc<ScriptedExecutor>,
        contexts: BrowserContextManager,
        artifacts: Arc<MemoryArtifactStore>,
    }

    fn harness(max_concurrent_tasks: usize, task_timeout_secs: u64) -> Harness {
        let backend = Arc::new(FakeBackend::default());
        let contexts = BrowserContextManager::new(
            backend,
            FingerprintGenerator::new(&BrowserSettings::default()),
            5,
        );
        let executor = Arc::new(ScriptedExecutor::new(contexts.clone()));
        let artifacts = Arc::new(MemoryArtifactStore::default());
        let settings = SchedulerSettings {
            max_concurrent_tasks,
            task_timeout_secs,
            cancel_grace_secs: 5,
        };

        let scheduler = TaskScheduler::new(
            settings,
            executor.clone(),
            Arc::new(EventStream::new(100)),
            contexts.clone(),
            artifacts.clone(),
        );

        Harness {
            scheduler,
            executor,
            contexts,
            artifacts,
        }
    }

    fn spec(question: &str) -> TaskSpec {
        TaskSpec::new(question)
    }

    fn terminal_events(scheduler: &TaskScheduler, task_id: &str) -> usize {
        scheduler
            .events()
            .history(task_id)
            .unwrap()
            .iter()
            .filter(|e| e.kind.is_terminal())
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_and_fifo() {
        let h = harness(2, 300);

        let ids: Vec<String> = (0..5)
            .map(|i| h.scheduler.submit(spec(&format!("q{}", i))).unwrap())
            .collect();

        for id in &ids {
            let task = h.scheduler.wait(id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
            assert_eq!(terminal_events(&h.scheduler, id), 1);
        }

        assert_eq!(h.executor.max_running.load(Ordering::SeqCst), 2);
        let order: Vec<String> = h.executor.started().into_iter().map(|(q, _)| q).collect();
        assert_eq!(order, vec!["q0", "q1", "q2", "q3", "q4"]);

        let (listed, total) = h.scheduler.list(0, 10);
        let listed: Vec<String> = listed.into_iter().map(|s| s.id).collect();
        let newest_first: Vec<String> = ids.iter().rev().cloned().collect();
        assert_eq!(listed, newest_first);
        assert_eq!(total, 5);

        let (page, total) = h.scheduler.list(1, 2);
        let page: Vec<String> = page.into_iter().map(|s| s.id).collect();
        assert_eq!(page, vec![ids[3].clone(), ids[2].clone()]);
        assert_eq!(total, 5);
        assert_eq!(h.scheduler.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_until_a_slot_frees() {
        let h = harness(1, 300);
        let first = h.scheduler.submit(spec("q1")).unwrap();
        let second = h.scheduler.submit(spec("q2")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.scheduler.status(&first).unwrap().status, TaskStatus::Running);
        let waiting = h.scheduler.status(&second).unwrap();
        assert_eq!(waiting.status, TaskStatus::Queued);
        assert!(waiting.started_at.is_none());

        h.scheduler.wait(&first).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let admitted = h.scheduler.status(&second).unwrap();
        assert_eq!(admitted.status, TaskStatus::Running);
        assert!(admitted.started_at.is_some());
        assert_eq!(h.scheduler.running(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_panic_fails_task_and_frees_slot() {
        let h = harness(1, 300);
        let bad = h.scheduler.submit(spec("panic")).unwrap();
        let good = h.scheduler.submit(spec("fine")).unwrap();

        let task = h.scheduler.wait(&bad).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("executor panicked: boom"));
        assert_eq!(terminal_events(&h.scheduler, &bad), 1);
        assert!(!h.contexts.has_context(&bad));

        assert_eq!(h.scheduler.wait(&good).await.unwrap().status, TaskStatus::Completed);
        assert_eq!(h.scheduler.running(), 0);
        assert_eq!(h.executor.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_queued_task_never_runs() {
        let h = harness(1, 300);
        let first = h.scheduler.submit(spec("q1")).unwrap();
        let second = h.scheduler.submit(spec("q2")).unwrap();

        h.scheduler.cancel(&second, "user request").await.unwrap();
        let cancelled = h.scheduler.status(&second).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.started_at.is_none());
        assert_eq!(cancelled.error.as_deref(), Some("user request"));

        let history = h.scheduler.events().history(&second).unwrap();
        assert_eq!(history.len(), 1);
        assert!(matches!(history[0].kind, EventKind::Error { recoverable: false, .. }));

        // Idempotent on terminal tasks
        h.scheduler.cancel(&second, "again").await.unwrap();
        assert_eq!(h.scheduler.events().history(&second).unwrap().len(), 1);

        assert_eq!(h.scheduler.wait(&first).await.unwrap().status, TaskStatus::Completed);
        assert_eq!(h.executor.started().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wins_over_late_answer() {
        let h = harness(1, 300);
        let id = h.scheduler.submit(spec("answer on cancel")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.scheduler.cancel(&id, "stop").await.unwrap();
        let task = h.scheduler.wait(&id).await.unwrap();

        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.answer.is_none());
        assert_eq!(terminal_events(&h.scheduler, &id), 1);
        assert!(!h.contexts.has_context(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_observed_by_executor() {
        let h = harness(1, 300);
        let id = h.scheduler.submit(spec("observe cancel")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.scheduler.cancel(&id, "stop").await.unwrap();
        let task = h.scheduler.wait(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.error.as_deref(), Some("stop"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_and_releases_context_first() {
        let h = harness(1, 30);
        let hung = h.scheduler.submit(spec("hang")).unwrap();
        let next = h.scheduler.submit(spec("q-next")).unwrap();

        let task = h.scheduler.wait(&hung).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("Task exceeded timeout of 30s"));
        assert!(!h.contexts.has_context(&hung));

        assert_eq!(h.scheduler.wait(&next).await.unwrap().status, TaskStatus::Completed);
        let started = h.executor.started();
        assert_eq!(started[1], ("q-next".to_string(), 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_terminal_and_persisted() {
        let h = harness(2, 300);
        let id = h.scheduler.submit(spec("fail")).unwrap();

        let task = h.scheduler.wait(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("Browser error: boom"));
        assert_eq!(terminal_events(&h.scheduler, &id), 1);

        let stored = h.artifacts.load_task(&id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(h.artifacts.load_events(&id).await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_snapshot() {
        let h = harness(1, 300);
        let id = h.scheduler.submit(spec("What is Rust?")).unwrap();

        let task = h.scheduler.wait(&id).await.unwrap();
        assert_eq!(task.answer.as_deref(), Some("answer to What is Rust?"));
        assert!(task.started_at.is_some() && task.completed_at.is_some());

        let history = h.scheduler.events().history(&id).unwrap();
        let seqs: Vec<u64> = history.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert!(matches!(history[1].kind, EventKind::Complete { .. }));
    }

    #[tokio::test]
    async fn test_validation_and_not_found() {
        let h = harness(1, 300);
        assert!(matches!(h.scheduler.submit(spec("  ")), Err(ResearchError::Validation(_))));
        assert_eq!(h.scheduler.list(0, 10).1, 0);

        assert!(matches!(h.scheduler.status("nope"), Err(ResearchError::NotFound(_))));
        assert!(matches!(h.scheduler.cancel("nope", "x").await, Err(ResearchError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_running_task_reaps_after_teardown() {
        let h = harness(1, 300);
        let id = h.scheduler.submit(spec("observe cancel")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut done = {
            let state = h.scheduler.inner.state();
            state.tasks[&id].done.subscribe()
        };
        h.scheduler.delete(&id).await.unwrap();
        let _ = done.changed().await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(h.scheduler.status(&id), Err(ResearchError::NotFound(_))));
        assert!(h.scheduler.events().history(&id).is_err());
        assert!(h.artifacts.load_task(&id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_finished_task() {
        let h = harness(1, 300);
        let id = h.scheduler.submit(spec("q")).unwrap();
        h.scheduler.wait(&id).await.unwrap();

        h.scheduler.delete(&id).await.unwrap();
        assert!(h.scheduler.status(&id).is_err());
        assert!(h.scheduler.list(0, 10).0.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_replays_from_cursor() {
        let h = harness(1, 300);
        let id = h.scheduler.submit(spec("q")).unwrap();
        h.scheduler.wait(&id).await.unwrap();

        let mut subscription = h.scheduler.subscribe(&id, 1).unwrap();
        let event = subscription.next().await.unwrap().unwrap();
        assert_eq!(event.seq, 2);
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_everything() {
        let h = harness(1, 300);
        let running = h.scheduler.submit(spec("hang")).unwrap();
        let queued = h.scheduler.submit(spec("q")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.scheduler.shutdown().await.unwrap();

        assert_eq!(h.scheduler.status(&running).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(h.scheduler.status(&queued).unwrap().status, TaskStatus::Cancelled);
        assert!(h.scheduler.submit(spec("late")).is_err());
        assert_eq!(h.contexts.active_count(), 0);
    }
}
