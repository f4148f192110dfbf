pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::task::model::{SearchEngine, TaskSpec};
use crate::utils::default_log_file;
use config::AppConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also append logs to a file (the platform data directory when no path is given)
    #[arg(long, global = true, num_args = 0..=1, value_name = "PATH")]
    log_file: Option<Option<PathBuf>>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// Log file to write, if any
    pub fn log_file(&self) -> Option<PathBuf> {
        self.log_file
            .as_ref()
            .map(|path| path.clone().unwrap_or_else(default_log_file))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Research a question and stream progress as JSON lines
    Research(ResearchArgs),

    /// Show a stored task
    Status {
        #[arg(required = true)]
        task_id: String,
    },

    /// List stored tasks, newest first
    List {
        /// Number of tasks to skip
        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Maximum number of tasks to show
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Print a stored task's events
    Events {
        #[arg(required = true)]
        task_id: String,

        /// Only events with a greater sequence number
        #[arg(long, default_value_t = 0)]
        since: u64,
    },

    /// Delete a stored task and its artifacts
    Delete {
        #[arg(required = true)]
        task_id: String,
    },

    /// Show the configuration
    Config {
        /// Write a default configuration file
        #[arg(long)]
        init: bool,
    },
}

#[derive(Args)]
struct ResearchArgs {
    /// The question to research
    #[arg(required = true)]
    question: String,

    /// Page to start from
    #[arg(short, long)]
    seed_url: Option<String>,

    /// Maximum link depth (1-5)
    #[arg(short, long)]
    depth: Option<u32>,

    /// Maximum pages to visit (1-50)
    #[arg(short, long)]
    pages: Option<u32>,

    /// Time budget in seconds (30-600)
    #[arg(short, long)]
    budget: Option<u64>,

    /// duckduckgo, bing, google or custom
    #[arg(short, long)]
    engine: Option<SearchEngine>,

    /// Search results to consider (1-50)
    #[arg(short, long)]
    results: Option<u32>,

    #[arg(long)]
    no_safe_mode: bool,

    /// Stay on the seed domain
    #[arg(long)]
    same_domain: bool,

    /// Explicitly allow or forbid leaving the seed domain
    #[arg(long)]
    external: Option<bool>,
}

impl ResearchArgs {
    fn into_spec(self) -> TaskSpec {
        let mut spec = TaskSpec::new(self.question);
        spec.seed_url = self.seed_url;
        if let Some(depth) = self.depth {
            spec.max_depth = depth;
        }
        if let Some(pages) = self.pages {
            spec.max_pages = pages;
        }
        if let Some(budget) = self.budget {
            spec.time_budget = budget;
        }
        if let Some(engine) = self.engine {
            spec.search_engine = engine;
        }
        if let Some(results) = self.results {
            spec.max_results = results;
        }
        spec.safe_mode = !self.no_safe_mode;
        spec.same_domain_only = self.same_domain;
        spec.allow_external_links = self.external;
        spec
    }
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    if let Commands::Config { init } = cli.command {
        return commands::config(cli.config.as_deref(), init);
    }

    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Research(args) => {
            info!("Researching: {}", args.question);
            commands::research(config, args.into_spec()).await
        }
        Commands::Status { task_id } => commands::status(&config, &task_id).await,
        Commands::List { offset, limit } => commands::list(&config, offset, limit).await,
        Commands::Events { task_id, since } => commands::events(&config, &task_id, since).await,
        Commands::Delete { task_id } => {
            info!("Deleting task {}", task_id);
            commands::delete(&config, &task_id).await
        }
        Commands::Config { .. } => Ok(()),
    }
}
