//! Autonomous web research engine.
//!
//! A question drives an agent through search, navigation and extraction tool
//! calls inside an isolated browser context, under per-domain rate limits and a
//! bounded crawl frontier, while progress is streamed as ordered task events.

pub mod agent;
pub mod browser;
pub mod cli;
pub mod crawler;
pub mod error;
pub mod events;
pub mod storage;
pub mod task;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ResearchError, Result};
pub use events::{EventKind, EventStream, TaskEvent};
pub use task::{Task, TaskScheduler, TaskSpec, TaskStatus};
