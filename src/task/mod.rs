pub mod model;
pub mod scheduler;

// Re-export common types
pub use model::{
    normalize_seed, paginate, Citation, ResearchOutcome, SearchEngine, Task, TaskConfig, TaskSpec, TaskStatus, TaskSummary,
};
pub use scheduler::{RunProgress, TaskExecutor, TaskRun, TaskScheduler};
