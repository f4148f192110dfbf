use chrono::Utc;
use futures::Stream;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{ResearchError, Result};
use crate::events::{EventKind, TaskEvent};

/// Per-task, ordered, replayable event logs with live fan-out
///
/// Appends never wait on subscribers. Each log keeps at most `retain` events
/// that every attached subscriber has already received; undelivered events
/// are kept past `retain` up to a hard ceiling of `4 * retain`. A subscriber
/// left behind by the ceiling gets a single [`Lagged`] item and resumes at the
/// oldest retained event.
pub struct EventStream {
    logs: Mutex<HashMap<String, Arc<EventLog>>>,
    retain: usize,
}

/// Marker yielded to a subscriber whose next events were dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lagged {
    pub skipped: u64,
}

struct EventLog {
    task_id: String,
    state: Mutex<LogState>,
    wake: watch::Sender<u64>,
}

struct LogState {
    events: VecDeque<TaskEvent>,
    next_seq: u64,
    closed: bool,
    /// Subscriber id -> last delivered sequence number
    cursors: HashMap<u64, u64>,
    next_subscriber: u64,
}

impl EventStream {
    pub fn new(retain: usize) -> Self {
        Self {
            logs: Mutex::new(HashMap::new()),
            retain: retain.max(1),
        }
    }

    /// Create the log for a task; a no-op if it already exists
    pub fn open(&self, task_id: &str) {
        let mut logs = lock(&self.logs);
        logs.entry(task_id.to_string()).or_insert_with(|| {
            let (wake, _) = watch::channel(0);
            Arc::new(EventLog {
                task_id: task_id.to_string(),
                state: Mutex::new(LogState {
                    events: VecDeque::new(),
                    next_seq: 1,
                    closed: false,
                    cursors: HashMap::new(),
                    next_subscriber: 0,
                }),
                wake,
            })
        });
    }

    /// Append with the next sequence number for the task
    pub fn append(&self, task_id: &str, kind: EventKind) -> Result<TaskEvent> {
        self.log(task_id)?.append(kind, self.retain)
    }

    /// Replay events with `seq > since`, then follow the live tail
    pub fn subscribe(&self, task_id: &str, since: u64) -> Result<Subscription> {
        let log = self.log(task_id)?;
        let id = {
            let mut state = lock(&log.state);
            let id = state.next_subscriber;
            state.next_subscriber += 1;
            state.cursors.insert(id, since);
            id
        };
        let wake = log.wake.subscribe();

        debug!(task_id, since, subscriber = id, "Subscriber attached");

        Ok(Subscription {
            log,
            id,
            cursor: since,
            wake,
        })
    }

    /// Currently retained events
    pub fn history(&self, task_id: &str) -> Result<Vec<TaskEvent>> {
        let log = self.log(task_id)?;
        let state = lock(&log.state);
        Ok(state.events.iter().cloned().collect())
    }

    /// Sequence number of the most recent event (0 when empty)
    pub fn last_seq(&self, task_id: &str) -> Result<u64> {
        let log = self.log(task_id)?;
        let state = lock(&log.state);
        Ok(state.next_seq - 1)
    }

    pub fn is_closed(&self, task_id: &str) -> Result<bool> {
        let log = self.log(task_id)?;
        let closed = lock(&log.state).closed;
        Ok(closed)
    }

    /// Stop accepting live events without a terminal event
    pub fn close(&self, task_id: &str) -> Result<()> {
        self.log(task_id)?.close();
        Ok(())
    }

    /// Reap a task's log; attached subscribers drain what they can and end
    pub fn remove(&self, task_id: &str) -> bool {
        let removed = lock(&self.logs).remove(task_id);
        match removed {
            Some(log) => {
                log.close();
                true
            }
            None => false,
        }
    }

    fn log(&self, task_id: &str) -> Result<Arc<EventLog>> {
        lock(&self.logs)
            .get(task_id)
            .cloned()
            .ok_or_else(|| ResearchError::NotFound(task_id.to_string()))
    }
}

impl EventLog {
    fn append(&self, kind: EventKind, retain: usize) -> Result<TaskEvent> {
        let event = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(ResearchError::StreamClosed(self.task_id.clone()));
            }

            let event = TaskEvent {
                seq: state.next_seq,
                ts: Utc::now(),
                kind,
            };
            state.next_seq += 1;
            if event.kind.is_terminal() {
                state.closed = true;
            }
            state.events.push_back(event.clone());
            state.trim(retain);
            event
        };

        debug!(task_id = %self.task_id, seq = event.seq, kind = event.kind.name(), "Event appended");
        self.wake.send_replace(event.seq);

        Ok(event)
    }

    fn close(&self) {
        lock(&self.state).closed = true;
        self.wake.send_modify(|_| {});
    }
}

impl LogState {
    fn trim(&mut self, retain: usize) {
        if self.events.len() <= retain {
            return;
        }

        let hard_cap = retain.saturating_mul(4);
        let delivered = self.cursors.values().copied().min().unwrap_or(u64::MAX);

        while self.events.len() > retain {
            let front = match self.events.front() {
                Some(event) => event.seq,
                None => break,
            };
            if front <= delivered || self.events.len() > hard_cap {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn event_after(&self, cursor: u64) -> Option<TaskEvent> {
        let front = self.events.front()?.seq;
        let index = (cursor + 1).checked_sub(front)?;
        self.events.get(index as usize).cloned()
    }

    /// First sequence number still available to a reader
    fn first_available(&self) -> u64 {
        self.events.front().map(|e| e.seq).unwrap_or(self.next_seq)
    }
}

/// A reader attached to one task's log
pub struct Subscription {
    log: Arc<EventLog>,
    id: u64,
    cursor: u64,
    wake: watch::Receiver<u64>,
}

impl Subscription {
    /// Next event in sequence order; `None` once the log is closed and drained
    pub async fn next(&mut self) -> Option<std::result::Result<TaskEvent, Lagged>> {
        loop {
            // Mark the current version seen before inspecting the log so no append is missed
            self.wake.borrow_and_update();

            {
                let mut state = lock(&self.log.state);

                let first = state.first_available();
                if first > self.cursor + 1 {
                    let skipped = first - self.cursor - 1;
                    self.cursor = first - 1;
                    state.cursors.insert(self.id, self.cursor);
                    return Some(Err(Lagged { skipped }));
                }

                if let Some(event) = state.event_after(self.cursor) {
                    self.cursor = event.seq;
                    state.cursors.insert(self.id, self.cursor);
                    return Some(Ok(event));
                }

                if state.closed {
                    return None;
                }
            }

            if self.wake.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Sequence number of the last delivered event
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn into_stream(self) -> impl Stream<Item = std::result::Result<TaskEvent, Lagged>> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|item| (item, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        lock(&self.log.state).cursors.remove(&self.id);
    }
}

/// Task-scoped append handle used by the agent loop
#[derive(Clone)]
pub struct EventEmitter {
    stream: Arc<EventStream>,
    task_id: String,
}

impl EventEmitter {
    pub fn new(stream: Arc<EventStream>, task_id: impl Into<String>) -> Self {
        Self {
            stream,
            task_id: task_id.into(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn emit(&self, kind: EventKind) -> Result<TaskEvent> {
        self.stream.append(&self.task_id, kind)
    }

    pub fn thinking(&self, message: impl Into<String>) -> Result<TaskEvent> {
        self.emit(EventKind::Thinking { message: message.into() })
    }

    pub fn tool_call(&self, tool: &str, args: Value) -> Result<TaskEvent> {
        self.emit(EventKind::ToolCall {
            tool: tool.to_string(),
            args,
        })
    }

    pub fn tool_result(&self, tool: &str, output: Value) -> Result<TaskEvent> {
        self.emit(EventKind::ToolResult {
            tool: tool.to_string(),
            output,
        })
    }

    pub fn screenshot(&self, reference: impl Into<String>) -> Result<TaskEvent> {
        self.emit(EventKind::Screenshot { reference: reference.into() })
    }

    pub fn recoverable_error(&self, message: impl Into<String>) -> Result<TaskEvent> {
        self.emit(EventKind::Error {
            message: message.into(),
            recoverable: true,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
