use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::browser::fingerprint::Fingerprint;
use crate::browser::webdriver::WebDriverBackend;
use crate::cli::config::BrowserSettings;
use crate::error::Result;

/// What a navigation produced
#[derive(Debug, Clone, PartialEq)]
pub struct NavigationResponse {
    /// HTTP status when the backend can observe it
    pub status: Option<u16>,
    pub final_url: String,
    pub title: String,
}

/// Rendered state of the current page
#[derive(Debug, Clone, PartialEq)]
pub struct PageSnapshot {
    pub url: String,
    pub title: String,
    pub html: String,
}

/// Interface for browser engines
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    /// Open an isolated context presenting the given fingerprint
    async fn create_context(&self, fingerprint: &Fingerprint) -> Result<Box<dyn PageSession>>;

    /// Release engine-wide resources
    async fn shutdown(&self) -> Result<()>;
}

/// A single isolated browsing context with one page
#[async_trait]
pub trait PageSession: Send {
    /// Load `url`, failing with `NavigationTimeout` after `timeout`
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<NavigationResponse>;

    async fn content(&mut self) -> Result<PageSnapshot>;

    /// PNG bytes of the viewport, or of the whole page when supported
    async fn screenshot(&mut self, full_page: bool) -> Result<Vec<u8>>;

    async fn close(&mut self) -> Result<()>;
}

/// Factory for browser backends
pub struct Browser;

impl Browser {
    /// Create the backend named by the settings
    pub fn create(settings: &BrowserSettings) -> Arc<dyn BrowserBackend> {
        Arc::new(WebDriverBackend::new(settings.clone()))
    }
}
