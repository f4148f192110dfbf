use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::cli::config::{BrowserSettings, ViewportRange};

/// Used when the configured pool is empty
const FALLBACK_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Viewport dimensions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Identity presented by one browser context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub user_agent: String,
    pub accept_language: String,
    pub platform: String,
    pub viewport: Viewport,
    pub headers: HashMap<String, String>,
}

impl Fingerprint {
    /// Primary language tag, e.g. `en-US` out of `en-US,en;q=0.9`
    pub fn language(&self) -> &str {
        self.accept_language
            .split(',')
            .next()
            .map(str::trim)
            .filter(|lang| !lang.is_empty())
            .unwrap_or("en-US")
    }
}

/// Randomized fingerprint generator, one fresh identity per context
#[derive(Debug, Clone)]
pub struct FingerprintGenerator {
    user_agents: Vec<String>,
    accept_language: String,
    viewport: ViewportRange,
}

impl FingerprintGenerator {
    pub fn new(settings: &BrowserSettings) -> Self {
        Self {
            user_agents: settings.user_agents.clone(),
            accept_language: settings.accept_language.clone(),
            viewport: settings.viewport.clone(),
        }
    }

    /// Draw a new fingerprint
    pub fn generate(&self) -> Fingerprint {
        let mut rng = thread_rng();

        let user_agent = self
            .user_agents
            .choose(&mut rng)
            .cloned()
            .unwrap_or_else(|| FALLBACK_USER_AGENT.to_string());

        let viewport = Viewport {
            width: random_in(&mut rng, self.viewport.min_width, self.viewport.max_width),
            height: random_in(&mut rng, self.viewport.min_height, self.viewport.max_height),
        };

        // Create headers map
        let mut headers = HashMap::new();
        headers.insert("User-Agent".to_string(), user_agent.clone());
        headers.insert("Accept-Language".to_string(), self.accept_language.clone());
        headers.insert(
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8".to_string(),
        );
        headers.insert("Upgrade-Insecure-Requests".to_string(), "1".to_string());

        let fingerprint = Fingerprint {
            platform: platform_for(&user_agent).to_string(),
            user_agent,
            accept_language: self.accept_language.clone(),
            viewport,
            headers,
        };

        debug!(
            "Generated fingerprint: {} {}x{}",
            fingerprint.platform, fingerprint.viewport.width, fingerprint.viewport.height
        );

        fingerprint
    }
}

fn random_in<R: Rng>(rng: &mut R, min: u32, max: u32) -> u32 {
    if min >= max {
        min
    } else {
        rng.gen_range(min..=max)
    }
}

/// Navigator platform consistent with the user agent
fn platform_for(user_agent: &str) -> &'static str {
    if user_agent.contains("Windows") {
        "Win32"
    } else if user_agent.contains("Macintosh") || user_agent.contains("Mac OS X") {
        "MacIntel"
    } else {
        "Linux x86_64"
    }
}
