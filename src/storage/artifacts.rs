use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

use crate::cli::config::ArtifactSettings;
use crate::error::{ResearchError, Result};
use crate::events::TaskEvent;
use crate::task::model::{Citation, Task, TaskSummary};

const TASK_FILE: &str = "task.json";
const SOURCES_FILE: &str = "sources.json";
const EVENTS_FILE: &str = "events.jsonl";
const SCREENSHOT_DIR: &str = "screenshots";

/// Interface for task artifact persistence
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write the task snapshot
    async fn save_task(&self, task: &Task) -> Result<()>;

    /// Read a task snapshot back (`NotFound` when absent)
    async fn load_task(&self, task_id: &str) -> Result<Task>;

    /// Store a PNG for a step and return its reference
    async fn save_screenshot(&self, task_id: &str, step: usize, png: &[u8]) -> Result<String>;

    async fn save_sources(&self, task_id: &str, citations: &[Citation]) -> Result<()>;

    /// Write the full event log, one JSON object per line
    async fn save_events(&self, task_id: &str, events: &[TaskEvent]) -> Result<()>;

    async fn load_events(&self, task_id: &str) -> Result<Vec<TaskEvent>>;

    /// Summaries of every stored task, oldest first
    async fn list(&self) -> Result<Vec<TaskSummary>>;

    /// Remove everything stored for a task; a no-op when nothing is stored
    async fn delete(&self, task_id: &str) -> Result<()>;

    /// What is stored for a task; `exists` is false when nothing is
    async fn stats(&self, task_id: &str) -> Result<ArtifactStats>;
}

/// Footprint of one task's stored artifacts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArtifactStats {
    pub exists: bool,
    pub total_size_bytes: u64,
    pub screenshot_count: usize,
    pub has_events: bool,
    pub has_sources: bool,
    /// The task snapshot is written
    pub has_result: bool,
}

/// Factory for artifact stores
pub struct Artifacts;

impl Artifacts {
    pub fn create(settings: &ArtifactSettings) -> Arc<dyn ArtifactStore> {
        Arc::new(FsArtifactStore::new(settings.dir.clone()))
    }
}

/// Filesystem layout: `<root>/<task_id>/{task.json,sources.json,events.jsonl,screenshots/step_N.png}`
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_dir(&self, task_id: &str) -> Result<PathBuf> {
        let valid = !task_id.is_empty()
            && task_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ResearchError::Validation(format!("Invalid task id: {}", task_id)));
        }
        Ok(self.root.join(task_id))
    }

    async fn is_file(path: &Path) -> bool {
        fs::metadata(path).await.map(|meta| meta.is_file()).unwrap_or(false)
    }

    async fn write_json<T: serde::Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(value)?;
        fs::write(path, json).await?;
        debug!("Wrote {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn save_task(&self, task: &Task) -> Result<()> {
        let path = self.task_dir(&task.id)?.join(TASK_FILE);
        self.write_json(&path, task).await
    }

    async fn load_task(&self, task_id: &str) -> Result<Task> {
        let path = self.task_dir(task_id)?.join(TASK_FILE);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ResearchError::NotFound(task_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn save_screenshot(&self, task_id: &str, step: usize, png: &[u8]) -> Result<String> {
        let dir = self.task_dir(task_id)?.join(SCREENSHOT_DIR);
        fs::create_dir_all(&dir).await?;

        let path = dir.join(format!("step_{}.png", step));
        fs::write(&path, png).await?;
        debug!("Screenshot saved to: {}", path.display());

        Ok(path.to_string_lossy().into_owned())
    }

    async fn save_sources(&self, task_id: &str, citations: &[Citation]) -> Result<()> {
        let path = self.task_dir(task_id)?.join(SOURCES_FILE);
        self.write_json(&path, citations).await
    }

    async fn save_events(&self, task_id: &str, events: &[TaskEvent]) -> Result<()> {
        let dir = self.task_dir(task_id)?;
        fs::create_dir_all(&dir).await?;

        let mut lines = String::new();
        for event in events {
            lines.push_str(&serde_json::to_string(event)?);
            lines.push('\n');
        }
        fs::write(dir.join(EVENTS_FILE), lines).await?;
        Ok(())
    }

    async fn load_events(&self, task_id: &str) -> Result<Vec<TaskEvent>> {
        let path = self.task_dir(task_id)?.join(EVENTS_FILE);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ResearchError::NotFound(task_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(ResearchError::from))
            .collect()
    }

    async fn list(&self) -> Result<Vec<TaskSummary>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let task_id = entry.file_name().to_string_lossy().into_owned();
            match self.load_task(&task_id).await {
                Ok(task) => summaries.push(task.summary()),
                Err(e) => warn!("Skipping unreadable artifact directory {}: {}", task_id, e),
            }
        }

        summaries.sort_by_key(|summary| summary.created_at);
        Ok(summaries)
    }

    async fn delete(&self, task_id: &str) -> Result<()> {
        let dir = self.task_dir(task_id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!("Deleted artifacts for task {}", task_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn stats(&self, task_id: &str) -> Result<ArtifactStats> {
        let dir = self.task_dir(task_id)?;
        match fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(ArtifactStats::default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ArtifactStats::default()),
            Err(e) => return Err(e.into()),
        }

        let screenshot_dir = dir.join(SCREENSHOT_DIR);
        let mut stats = ArtifactStats {
            exists: true,
            has_events: Self::is_file(&dir.join(EVENTS_FILE)).await,
            has_sources: Self::is_file(&dir.join(SOURCES_FILE)).await,
            has_result: Self::is_file(&dir.join(TASK_FILE)).await,
            ..ArtifactStats::default()
        };

        let mut pending = vec![dir];
        while let Some(current) = pending.pop() {
            let mut entries = fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                let path = entry.path();
                if meta.is_dir() {
                    pending.push(path);
                } else if meta.is_file() {
                    stats.total_size_bytes += meta.len();
                    let is_png = path.extension().map_or(false, |ext| ext == "png");
                    if is_png && current == screenshot_dir {
                        stats.screenshot_count += 1;
                    }
                }
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::task::model::{TaskSpec, TaskStatus};
    use chrono::Utc;

    fn temp_store() -> FsArtifactStore {
        FsArtifactStore::new(std::env::temp_dir().join(format!("web-reader-test-{}", uuid::Uuid::new_v4())))
    }

    fn task(id: &str) -> Task {
        Task::new(id.to_string(), TaskSpec::new("What is Rust?").validate().unwrap())
    }

    #[tokio::test]
    async fn test_task_snapshot_roundtrip() {
        let store = temp_store();
        let mut task = task("t-1");
        task.transition(TaskStatus::Queued).unwrap();
        store.save_task(&task).await.unwrap();

        let loaded = store.load_task("t-1").await.unwrap();
        assert_eq!(loaded.id, "t-1");
        assert_eq!(loaded.status, TaskStatus::Queued);
        assert_eq!(loaded.config.question, "What is Rust?");

        let err = store.load_task("missing").await.unwrap_err();
        assert_eq!(err, ResearchError::NotFound("missing".to_string()));

        store.delete("t-1").await.unwrap();
        store.delete("t-1").await.unwrap();
        assert!(store.load_task("t-1").await.is_err());
    }

    #[tokio::test]
    async fn test_screenshot_layout() {
        let store = temp_store();
        let reference = store.save_screenshot("t-2", 3, b"png").await.unwrap();

        assert!(reference.ends_with("t-2/screenshots/step_3.png"));
        assert_eq!(std::fs::read(&reference).unwrap(), b"png");

        let _ = std::fs::remove_dir_all(store.root());
    }

    #[tokio::test]
    async fn test_events_jsonl() {
        let store = temp_store();
        let events = vec![
            TaskEvent {
                seq: 1,
                ts: Utc::now(),
                kind: EventKind::Thinking { message: "start".into() },
            },
            TaskEvent {
                seq: 2,
                ts: Utc::now(),
                kind: EventKind::Error { message: "boom".into(), recoverable: false },
            },
        ];
        store.save_events("t-3", &events).await.unwrap();

        assert_eq!(store.load_events("t-3").await.unwrap(), events);
        let _ = std::fs::remove_dir_all(store.root());
    }

    #[tokio::test]
    async fn test_stats_reports_footprint() {
        let store = temp_store();
        assert_eq!(store.stats("t-4").await.unwrap(), ArtifactStats::default());

        store.save_screenshot("t-4", 1, b"png1").await.unwrap();
        store.save_screenshot("t-4", 2, b"png22").await.unwrap();
        store.save_sources("t-4", &[]).await.unwrap();

        let stats = store.stats("t-4").await.unwrap();
        assert!(stats.exists);
        assert_eq!(stats.screenshot_count, 2);
        assert!(stats.has_sources);
        assert!(!stats.has_result);
        assert!(!stats.has_events);
        // Two screenshots plus the "[]" sources file
        assert_eq!(stats.total_size_bytes, 4 + 5 + 2);

        store.save_task(&task("t-4")).await.unwrap();
        assert!(store.stats("t-4").await.unwrap().has_result);

        assert!(store.stats("../x").await.is_err());
        let _ = std::fs::remove_dir_all(store.root());
    }

    #[tokio::test]
    async fn test_list_and_reject_bad_ids() {
        let store = temp_store();
        assert!(store.list().await.unwrap().is_empty());

        store.save_task(&task("a")).await.unwrap();
        store.save_task(&task("b")).await.unwrap();
        let ids: Vec<String> = store.list().await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids.len(), 2);

        assert!(matches!(
            store.load_task("../etc").await,
            Err(ResearchError::Validation(_))
        ));
        let _ = std::fs::remove_dir_all(store.root());
    }
}
