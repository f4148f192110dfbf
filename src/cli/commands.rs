use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::agent::{AgentServices, HttpOracle, ResearchAgent};
use crate::browser::{Browser, BrowserContextManager, FingerprintGenerator};
use crate::cli::config::AppConfig;
use crate::crawler::{DomainPolicy, RateLimiter};
use crate::error::ResearchError;
use crate::events::{EventKind, EventStream};
use crate::storage::{ArtifactStore, Artifacts};
use crate::task::model::{paginate, TaskSpec, TaskStatus};
use crate::task::scheduler::TaskScheduler;

/// Wire the engine together from the configuration
pub fn build_scheduler(config: &AppConfig) -> Result<TaskScheduler> {
    let backend = Browser::create(&config.browser);
    let contexts = BrowserContextManager::new(
        backend,
        FingerprintGenerator::new(&config.browser),
        config.browser.max_contexts,
    );
    let artifacts = Artifacts::create(&config.artifacts);

    let services = Arc::new(AgentServices {
        policy: Arc::new(DomainPolicy::from_settings(&config.domains)),
        limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
        contexts: contexts.clone(),
        artifacts: artifacts.clone(),
        settings: config.agent.clone(),
        navigation_timeout: config.browser.navigation_timeout(),
        exclude_patterns: config.frontier.exclude_patterns.clone(),
    });

    let oracle = HttpOracle::new(&config.oracle).context("Failed to create oracle client")?;
    let agent = ResearchAgent::new(Arc::new(oracle), services, config.oracle.clone());

    Ok(TaskScheduler::new(
        config.scheduler.clone(),
        Arc::new(agent),
        Arc::new(EventStream::new(config.events.retain)),
        contexts,
        artifacts,
    ))
}

/// Run one research task, streaming its events to stdout
pub async fn research(config: AppConfig, spec: TaskSpec) -> Result<()> {
    let scheduler = build_scheduler(&config)?;
    let task_id = scheduler.submit(spec).context("Failed to submit task")?;
    info!("Task submitted with ID: {}", task_id);

    let mut subscription = scheduler.subscribe(&task_id, 0)?;
    let mut interrupted = false;

    loop {
        tokio::select! {
            item = subscription.next() => match item {
                Some(Ok(event)) => println!("{}", serde_json::to_string(&event)?),
                Some(Err(lagged)) => warn!("Skipped {} events", lagged.skipped),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                info!("Interrupted, cancelling task {}", task_id);
                interrupted = true;
                scheduler.cancel(&task_id, "interrupted").await?;
            }
        }
    }

    if let Ok(last_seq) = scheduler.events().last_seq(&task_id) {
        if subscription.cursor() < last_seq {
            warn!("Stream ended at event {} of {}", subscription.cursor(), last_seq);
        }
    }

    let task = scheduler.wait(&task_id).await?;
    scheduler.shutdown().await.context("Failed to shut down the browser")?;

    match task.status {
        TaskStatus::Completed => {
            eprintln!();
            eprintln!("Answer: {}", task.answer.unwrap_or_default());
            for (index, citation) in task.citations.iter().enumerate() {
                eprintln!("  [{}] {} - {}", index + 1, citation.title, citation.url);
            }
            Ok(())
        }
        status => anyhow::bail!(
            "Task {} {}: {}",
            task_id,
            status,
            task.error.unwrap_or_default()
        ),
    }
}

/// Show a stored task
pub async fn status(config: &AppConfig, task_id: &str) -> Result<()> {
    let store = Artifacts::create(&config.artifacts);
    let task = store
        .load_task(task_id)
        .await
        .context(format!("Failed to load task {}", task_id))?;

    println!("Task ID: {}", task.id);
    println!("Status: {}", task.status);
    println!("Question: {}", task.config.question);
    println!("Created: {}", task.created_at);
    if let Some(duration) = task.duration() {
        println!("Duration: {:.1}s", duration);
    }
    if let Some(answer) = &task.answer {
        println!("Answer: {}", answer);
    }
    if let Some(error) = &task.error {
        println!("Error: {}", error);
    }

    if !task.citations.is_empty() {
        println!("Sources:");
        for citation in &task.citations {
            println!("  - {} ({})", citation.title, citation.url);
        }
    }
    for screenshot in &task.screenshots {
        println!("Screenshot: {}", screenshot);
    }

    let stats = store
        .stats(task_id)
        .await
        .context(format!("Failed to read artifact stats for {}", task_id))?;
    println!(
        "Artifacts: {} bytes, {} screenshots, sources {}, events {}",
        stats.total_size_bytes,
        stats.screenshot_count,
        if stats.has_sources { "saved" } else { "missing" },
        if stats.has_events { "saved" } else { "missing" },
    );

    Ok(())
}

/// List one page of stored tasks, newest first
pub async fn list(config: &AppConfig, offset: usize, limit: usize) -> Result<()> {
    let store = Artifacts::create(&config.artifacts);
    let (tasks, total) = paginate(store.list().await.context("Failed to list tasks")?, offset, limit);

    if total == 0 {
        println!("No tasks found in {}", config.artifacts.dir.display());
        return Ok(());
    }

    for task in &tasks {
        println!("{}  {:<9}  {}  {}", task.id, task.status, task.created_at, task.question);
    }
    println!("Showing {} of {} tasks (offset {})", tasks.len(), total, offset);

    Ok(())
}

/// Print a stored task's events as JSON lines
pub async fn events(config: &AppConfig, task_id: &str, since: u64) -> Result<()> {
    let store = Artifacts::create(&config.artifacts);
    let events = store
        .load_events(task_id)
        .await
        .context(format!("Failed to load events for task {}", task_id))?;

    for event in events.iter().filter(|event| event.seq > since) {
        println!("{}", serde_json::to_string(event)?);
    }

    if !events.iter().any(|event| event.kind.is_terminal()) {
        warn!("Event log for {} has no terminal event", task_id);
    }
    if let Some(EventKind::Complete { answer, .. }) = events.last().map(|event| &event.kind) {
        info!("Final answer: {}", answer);
    }

    Ok(())
}

/// Delete a stored task and everything written for it
pub async fn delete(config: &AppConfig, task_id: &str) -> Result<()> {
    let store = Artifacts::create(&config.artifacts);
    match store.load_task(task_id).await {
        Ok(_) => {}
        Err(ResearchError::NotFound(_)) => anyhow::bail!("Task not found: {}", task_id),
        Err(e) => return Err(e).context(format!("Failed to load task {}", task_id)),
    }

    store.delete(task_id).await?;
    println!("Deleted task {}", task_id);

    Ok(())
}

/// Show the configuration, or write the default one
pub fn config(explicit: Option<&Path>, init: bool) -> Result<()> {
    let path = explicit.map(Path::to_path_buf).unwrap_or_else(AppConfig::default_path);

    if init {
        if path.exists() {
            warn!("Configuration already exists at {}", path.display());
        } else {
            AppConfig::default().save_to_file(&path)?;
            println!("Created default configuration: {}", path.display());
        }
        return Ok(());
    }

    // Without an explicit path a missing default file is created on load
    let config = AppConfig::load(explicit)?;
    println!("Configuration: {}", path.display());
    println!("{}", serde_yaml::to_string(&config)?);

    Ok(())
}
