use url::form_urlencoded::byte_serialize;
use url::Url;

use crate::error::{ResearchError, Result};
use crate::task::model::SearchEngine;

/// Build the results-page URL for a query
pub fn search_url(
    engine: SearchEngine,
    query: &str,
    safe_mode: bool,
    max_results: u32,
    custom_template: Option<&str>,
) -> Result<String> {
    let query = query.trim();
    if query.is_empty() {
        return Err(ResearchError::Validation("search query must not be empty".into()));
    }
    let count = max_results.to_string();

    let url = match engine {
        // The lite endpoint renders without JavaScript
        SearchEngine::Duckduckgo => Url::parse_with_params(
            "https://lite.duckduckgo.com/lite/",
            &[("q", query), ("kp", if safe_mode { "1" } else { "-2" })],
        ),
        SearchEngine::Bing => Url::parse_with_params(
            "https://www.bing.com/search",
            &[
                ("q", query),
                ("count", count.as_str()),
                ("adlt", if safe_mode { "strict" } else { "off" }),
            ],
        ),
        SearchEngine::Google => Url::parse_with_params(
            "https://www.google.com/search",
            &[
                ("q", query),
                ("num", count.as_str()),
                ("safe", if safe_mode { "active" } else { "off" }),
            ],
        ),
        SearchEngine::Custom => {
            let template = custom_template.ok_or_else(|| {
                ResearchError::Config("search_engine 'custom' requires agent.custom_search_url".into())
            })?;
            let encoded: String = byte_serialize(query.as_bytes()).collect();
            let filled = template
                .replace("{query}", &encoded)
                .replace("{max_results}", &count)
                .replace("{safe}", if safe_mode { "1" } else { "0" });
            Url::parse(&filled)
        }
    }
    .map_err(|e| ResearchError::Config(format!("Invalid search URL: {}", e)))?;

    Ok(url.to_string())
}
