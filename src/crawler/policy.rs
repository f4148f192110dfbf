use regex::Regex;
use std::fs;
use std::path::Path;
use tracing::{info, warn};
use url::Url;

use crate::cli::config::DomainSettings;
use crate::error::{ResearchError, Result};

/// Allow/deny lists consulted before any request reaches the rate limiter
#[derive(Debug, Default)]
pub struct DomainPolicy {
    allowed: Vec<DomainPattern>,
    denied: Vec<DomainPattern>,
}

/// A glob-style domain pattern (`example.com`, `*.example.com`, `news.*`)
#[derive(Debug)]
struct DomainPattern {
    regex: Regex,
    /// `*.example.com` also covers `example.com` itself
    apex: Option<String>,
}

impl DomainPattern {
    fn parse(pattern: &str) -> Option<Self> {
        let pattern = pattern.trim().to_lowercase();
        if pattern.is_empty() {
            return None;
        }

        let escaped = regex::escape(&pattern).replace(r"\*", ".*").replace(r"\?", ".");
        match Regex::new(&format!("^{}$", escaped)) {
            Ok(regex) => Some(Self {
                regex,
                apex: pattern.strip_prefix("*.").map(str::to_string),
            }),
            Err(e) => {
                warn!("Invalid domain pattern '{}': {}", pattern, e);
                None
            }
        }
    }

    fn matches(&self, host: &str) -> bool {
        self.apex.as_deref() == Some(host) || self.regex.is_match(host)
    }
}

impl DomainPolicy {
    pub fn new(allowed: &[String], denied: &[String]) -> Self {
        Self {
            allowed: allowed.iter().filter_map(|p| DomainPattern::parse(p)).collect(),
            denied: denied.iter().filter_map(|p| DomainPattern::parse(p)).collect(),
        }
    }

    /// Build from settings, merging the inline lists with any list files
    pub fn from_settings(settings: &DomainSettings) -> Self {
        let mut allowed = settings.allowed.clone();
        let mut denied = settings.denied.clone();

        if let Some(path) = &settings.allowed_file {
            allowed.extend(load_domain_list(path));
        }
        if let Some(path) = &settings.denied_file {
            denied.extend(load_domain_list(path));
        }

        Self::new(&allowed, &denied)
    }

    /// Deny list first, then the allow list when one is configured
    pub fn is_allowed(&self, host: &str) -> bool {
        let host = host.to_lowercase();

        if self.denied.iter().any(|p| p.matches(&host)) {
            warn!("Domain blocked by deny list: {}", host);
            return false;
        }

        if !self.allowed.is_empty() && !self.allowed.iter().any(|p| p.matches(&host)) {
            warn!("Domain not in allow list: {}", host);
            return false;
        }

        true
    }

    /// Check a URL and hand back its host, failing fast with `DomainDenied`
    pub fn check(&self, url: &Url) -> Result<String> {
        let host = url
            .host_str()
            .map(str::to_lowercase)
            .ok_or_else(|| ResearchError::Validation(format!("URL has no host: {}", url)))?;

        if self.is_allowed(&host) {
            Ok(host)
        } else {
            Err(ResearchError::DomainDenied(host))
        }
    }
}

/// Read one pattern per line, skipping blanks and `#` comments
pub fn load_domain_list(path: &Path) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let domains: Vec<String> = contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect();
            info!("Loaded {} domains from {}", domains.len(), path.display());
            domains
        }
        Err(e) => {
            warn!("Domain list file not readable {}: {}", path.display(), e);
            Vec::new()
        }
    }
}
