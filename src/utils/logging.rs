use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the logging system
///
/// Console output goes to stderr so that streamed events on stdout stay
/// machine-readable. With a log file, every run appends to it.
pub fn init_logging(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let console_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::CLOSE);

    let file_layer = match log_file {
        Some(path) => {
            let file = open_log_file(&path)?;
            Some(fmt::layer().with_target(true).with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter(verbose)?)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(())
}

/// `RUST_LOG` directives, narrowed by our own level for this crate
fn env_filter(verbose: bool) -> Result<EnvFilter> {
    let level = if verbose { "debug" } else { "info" };
    Ok(EnvFilter::from_default_env()
        .add_directive(format!("web_reader={}", level).parse()?)
        .add_directive("warn".parse()?))
}

fn open_log_file(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

/// Where `--log-file` writes when given without a path
pub fn default_log_file() -> PathBuf {
    let dir = match directories::ProjectDirs::from("com", "web-reader", "web-reader") {
        Some(proj_dirs) => proj_dirs.data_dir().join("logs"),
        None => PathBuf::from("./logs"),
    };
    dir.join("web-reader.log")
}
