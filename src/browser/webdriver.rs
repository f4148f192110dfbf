use async_trait::async_trait;
use std::time::Duration;
use thirtyfour::prelude::*;
use thirtyfour::ChromeCapabilities;
use tracing::{debug, error};

use crate::browser::backend::{BrowserBackend, NavigationResponse, PageSession, PageSnapshot};
use crate::browser::fingerprint::Fingerprint;
use crate::cli::config::BrowserSettings;
use crate::error::{ResearchError, Result};

/// Chrome driven over WebDriver, one browser session per context
pub struct WebDriverBackend {
    config: BrowserSettings,
}

impl WebDriverBackend {
    pub fn new(config: BrowserSettings) -> Self {
        Self { config }
    }

    fn capabilities(&self, fingerprint: &Fingerprint) -> WebDriverResult<ChromeCapabilities> {
        let mut caps = DesiredCapabilities::chrome();

        // Present the fingerprint
        caps.add_chrome_arg(&format!("--user-agent={}", fingerprint.user_agent))?;
        caps.add_chrome_arg(&format!("--lang={}", fingerprint.language()))?;
        caps.add_chrome_arg(&format!(
            "--window-size={},{}",
            fingerprint.viewport.width, fingerprint.viewport.height
        ))?;

        if self.config.headless {
            caps.set_headless()?;
        }

        caps.add_chrome_arg("--disable-blink-features=AutomationControlled")?;
        caps.add_chrome_arg("--disable-dev-shm-usage")?;
        caps.add_chrome_arg("--no-first-run")?;

        Ok(caps)
    }
}

#[async_trait]
impl BrowserBackend for WebDriverBackend {
    async fn create_context(&self, fingerprint: &Fingerprint) -> Result<Box<dyn PageSession>> {
        let caps = self
            .capabilities(fingerprint)
            .map_err(|e| ResearchError::ContextCreation(format!("Invalid capabilities: {}", e)))?;

        let driver = WebDriver::new(&self.config.webdriver_url, caps)
            .await
            .map_err(|e| {
                ResearchError::ContextCreation(format!(
                    "Failed to connect to WebDriver at {}: {}",
                    self.config.webdriver_url, e
                ))
            })?;

        // Navigation deadlines are enforced by the caller; this is a backstop
        if let Err(e) = driver
            .set_page_load_timeout(self.config.navigation_timeout() + Duration::from_secs(5))
            .await
        {
            debug!("Could not set page load timeout: {}", e);
        }

        debug!("Browser context created for {}", fingerprint.user_agent);

        Ok(Box::new(WebDriverPage { driver: Some(driver) }))
    }

    async fn shutdown(&self) -> Result<()> {
        // Sessions are owned by their contexts; nothing engine-wide to release
        Ok(())
    }
}

/// One WebDriver session
pub struct WebDriverPage {
    driver: Option<WebDriver>,
}

impl WebDriverPage {
    fn driver(&self) -> Result<&WebDriver> {
        self.driver
            .as_ref()
            .ok_or_else(|| ResearchError::Browser("Browser session already closed".to_string()))
    }
}

fn browser_error(action: &str, e: WebDriverError) -> ResearchError {
    ResearchError::Browser(format!("Failed to {}: {}", action, e))
}

#[async_trait]
impl PageSession for WebDriverPage {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<NavigationResponse> {
        let driver = self.driver()?;

        debug!("Navigating to: {}", url);
        match tokio::time::timeout(timeout, driver.goto(url)).await {
            Err(_) => {
                return Err(ResearchError::NavigationTimeout {
                    url: url.to_string(),
                    timeout,
                })
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                if message.to_lowercase().contains("timeout") {
                    return Err(ResearchError::NavigationTimeout {
                        url: url.to_string(),
                        timeout,
                    });
                }
                return Err(ResearchError::TransientNetwork(format!(
                    "Failed to navigate to {}: {}",
                    url, message
                )));
            }
            Ok(Ok(())) => {}
        }

        let final_url = driver
            .current_url()
            .await
            .map(|u| u.to_string())
            .unwrap_or_else(|_| url.to_string());
        let title = driver.title().await.unwrap_or_default();

        // WebDriver does not expose the response status
        Ok(NavigationResponse {
            status: None,
            final_url,
            title,
        })
    }

    async fn content(&mut self) -> Result<PageSnapshot> {
        let driver = self.driver()?;

        let html = driver.source().await.map_err(|e| browser_error("get page source", e))?;
        let title = driver.title().await.map_err(|e| browser_error("get page title", e))?;
        let url = driver
            .current_url()
            .await
            .map_err(|e| browser_error("get current URL", e))?
            .to_string();

        Ok(PageSnapshot { url, title, html })
    }

    async fn screenshot(&mut self, _full_page: bool) -> Result<Vec<u8>> {
        // Plain WebDriver only captures the viewport
        self.driver()?
            .screenshot_as_png()
            .await
            .map_err(|e| browser_error("take screenshot", e))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.quit().await {
                error!("Error closing browser session: {}", e);
            }
            debug!("Browser session closed");
        }
        Ok(())
    }
}

impl Drop for WebDriverPage {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            // Spawn a task to quit the driver
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = driver.quit().await {
                        error!("Error closing browser session during drop: {}", e);
                    }
                });
            }
        }
    }
}
