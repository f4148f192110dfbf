use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use std::collections::HashSet;
use url::Url;

/// Elements whose text never counts as page content
const SKIPPED_TAGS: &[&str] = &["nav", "footer", "aside", "script", "style", "noscript", "template"];

/// Candidates for the main content container, most specific first
const CONTENT_SELECTORS: &[&str] = &["main", "article", "#content", "body"];

/// An anchor harvested from a page
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageLink {
    pub url: String,
    pub text: String,
}

/// Readable content of a page
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageContent {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub text: String,
    pub word_count: usize,
    pub truncated: bool,
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn collapse_whitespace<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Collect absolute http(s) links, resolved against `base`, at most `limit` of them
pub fn extract_links(html: &str, base: &Url, limit: usize) -> Vec<PageLink> {
    let document = Html::parse_document(html);
    let anchors = match selector("a[href]") {
        Some(anchors) => anchors,
        None => return Vec::new(),
    };

    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for element in document.select(&anchors) {
        if links.len() >= limit {
            break;
        }

        let href = match element.value().attr("href") {
            Some(href) => href.trim(),
            None => continue,
        };
        let lowered = href.to_ascii_lowercase();
        if href.is_empty()
            || href.starts_with('#')
            || lowered.starts_with("javascript:")
            || lowered.starts_with("mailto:")
            || lowered.starts_with("tel:")
        {
            continue;
        }

        let mut resolved = match base.join(href) {
            Ok(url) => url,
            Err(_) => continue,
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        resolved.set_fragment(None);

        let url = resolved.to_string();
        if seen.insert(url.clone()) {
            links.push(PageLink {
                url,
                text: collapse_whitespace(element.text()),
            });
        }
    }

    links
}

/// Harvest result links from a search page: anchors pointing away from the engine
pub fn search_results(html: &str, page_url: &Url, limit: usize) -> Vec<PageLink> {
    // `lite.duckduckgo.com` and `duckduckgo.com` both belong to the engine
    let engine_host = page_url.host_str().unwrap_or_default().to_lowercase();
    let labels: Vec<&str> = engine_host.split('.').collect();
    let engine_root = labels[labels.len().saturating_sub(2)..].join(".");

    let mut seen = HashSet::new();
    extract_links(html, page_url, usize::MAX)
        .into_iter()
        .filter_map(|link| {
            let parsed = Url::parse(&link.url).ok()?;
            let host = parsed.host_str()?.to_lowercase();

            if host == engine_root || host.ends_with(&format!(".{}", engine_root)) {
                // Redirect wrappers carry the target in a query parameter
                let target = parsed
                    .query_pairs()
                    .find(|(key, _)| key == "uddg" || key == "q" || key == "url")
                    .map(|(_, value)| value.into_owned())?;
                let target = Url::parse(&target).ok()?;
                if !matches!(target.scheme(), "http" | "https") {
                    return None;
                }
                return Some(PageLink {
                    url: target.to_string(),
                    text: link.text,
                });
            }

            Some(link)
        })
        .filter(|link| seen.insert(link.url.clone()))
        .take(limit)
        .collect()
}

fn is_skipped(element: &ElementRef) -> bool {
    SKIPPED_TAGS.contains(&element.value().name())
}

/// Text of `root`, leaving out navigation, scripts and other chrome
fn visible_text(root: ElementRef) -> String {
    let mut parts = Vec::new();

    for node in root.descendants() {
        let text = match node.value().as_text() {
            Some(text) => text,
            None => continue,
        };

        let hidden = node
            .ancestors()
            .filter_map(ElementRef::wrap)
            .any(|ancestor| is_skipped(&ancestor));
        if !hidden {
            parts.push(&**text);
        }
    }

    collapse_whitespace(parts.into_iter())
}

/// Extract title, description and main text, truncated to `max_chars`
pub fn extract_content(html: &str, max_chars: usize) -> PageContent {
    let document = Html::parse_document(html);

    let title = selector("title")
        .and_then(|s| document.select(&s).next().map(|e| collapse_whitespace(e.text())))
        .unwrap_or_default();

    let description = selector(r#"meta[name="description"]"#)
        .and_then(|s| document.select(&s).next())
        .and_then(|e| e.value().attr("content"))
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty());

    let text = CONTENT_SELECTORS
        .iter()
        .filter_map(|css| selector(css))
        .find_map(|s| {
            document
                .select(&s)
                .next()
                .map(visible_text)
                .filter(|text| !text.is_empty())
        })
        .unwrap_or_default();

    let word_count = text.split_whitespace().count();
    let truncated = text.chars().count() > max_chars;
    let text = if truncated {
        text.chars().take(max_chars).collect()
    } else {
        text
    };

    PageContent {
        title,
        description,
        text,
        word_count,
        truncated,
    }
}
