use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{ResearchError, Result};

/// The closed set of tools the oracle may invoke
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    Search { query: String },
    Navigate { url: String },
    /// Next link from the frontier, or a specific queued one
    FollowLink { url: Option<String> },
    ExtractLinks,
    ExtractContent,
    Screenshot { full_page: bool },
}

/// Description of a tool handed to the oracle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSchema {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

impl ToolCall {
    /// Validate a `(name, args)` pair coming from the oracle
    pub fn parse(name: &str, args: &Value) -> Result<Self> {
        match name {
            "search" | "web_search" => {
                let query = required_str(name, args, "query")?;
                Ok(ToolCall::Search { query })
            }
            "navigate" | "navigate_to" => {
                let url = required_str(name, args, "url")?;
                Ok(ToolCall::Navigate { url })
            }
            "follow_link" => Ok(ToolCall::FollowLink {
                url: optional_str(name, args, "url")?,
            }),
            "extract_links" => Ok(ToolCall::ExtractLinks),
            "extract_content" | "get_page_content" => Ok(ToolCall::ExtractContent),
            "screenshot" | "take_screenshot" => {
                let full_page = match args.get("full_page") {
                    None | Some(Value::Null) => false,
                    Some(Value::Bool(flag)) => *flag,
                    Some(other) => {
                        return Err(ResearchError::Validation(format!(
                            "{}: full_page must be a boolean, got {}",
                            name, other
                        )))
                    }
                };
                Ok(ToolCall::Screenshot { full_page })
            }
            other => Err(ResearchError::Validation(format!("Unknown tool: {}", other))),
        }
    }

    /// Canonical tool name
    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::Search { .. } => "search",
            ToolCall::Navigate { .. } => "navigate",
            ToolCall::FollowLink { .. } => "follow_link",
            ToolCall::ExtractLinks => "extract_links",
            ToolCall::ExtractContent => "extract_content",
            ToolCall::Screenshot { .. } => "screenshot",
        }
    }

    /// Canonical arguments, as reported in `tool_call` events
    pub fn args(&self) -> Value {
        match self {
            ToolCall::Search { query } => json!({ "query": query }),
            ToolCall::Navigate { url } => json!({ "url": url }),
            ToolCall::FollowLink { url: Some(url) } => json!({ "url": url }),
            ToolCall::FollowLink { url: None } => json!({}),
            ToolCall::ExtractLinks | ToolCall::ExtractContent => json!({}),
            ToolCall::Screenshot { full_page } => json!({ "full_page": full_page }),
        }
    }

    pub fn schemas() -> Vec<ToolSchema> {
        vec![
            ToolSchema {
                name: "search",
                description: "Run a web search and queue the result links",
                parameters: json!({
                    "type": "object",
                    "properties": { "query": { "type": "string" } },
                    "required": ["query"]
                }),
            },
            ToolSchema {
                name: "navigate",
                description: "Load a URL in the task's browser context",
                parameters: json!({
                    "type": "object",
                    "properties": { "url": { "type": "string" } },
                    "required": ["url"]
                }),
            },
            ToolSchema {
                name: "follow_link",
                description: "Load the next queued link, or the given queued URL",
                parameters: json!({
                    "type": "object",
                    "properties": { "url": { "type": "string" } }
                }),
            },
            ToolSchema {
                name: "extract_links",
                description: "Collect links from the current page and queue them",
                parameters: json!({ "type": "object", "properties": {} }),
            },
            ToolSchema {
                name: "extract_content",
                description: "Read the title and main text of the current page",
                parameters: json!({ "type": "object", "properties": {} }),
            },
            ToolSchema {
                name: "screenshot",
                description: "Capture the current page as PNG",
                parameters: json!({
                    "type": "object",
                    "properties": { "full_page": { "type": "boolean" } }
                }),
            },
        ]
    }
}

fn optional_str(tool: &str, args: &Value, key: &str) -> Result<Option<String>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) if !value.trim().is_empty() => Ok(Some(value.trim().to_string())),
        Some(Value::String(_)) => Ok(None),
        Some(other) => Err(ResearchError::Validation(format!(
            "{}: {} must be a string, got {}",
            tool, key, other
        ))),
    }
}

fn required_str(tool: &str, args: &Value, key: &str) -> Result<String> {
    optional_str(tool, args, key)?
        .ok_or_else(|| ResearchError::Validation(format!("{}: missing required argument '{}'", tool, key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_tools() {
        assert_eq!(
            ToolCall::parse("search", &json!({"query": " rust async "})).unwrap(),
            ToolCall::Search { query: "rust async".into() }
        );
        assert_eq!(
            ToolCall::parse("navigate_to", &json!({"url": "example.com"})).unwrap(),
            ToolCall::Navigate { url: "example.com".into() }
        );
        assert_eq!(
            ToolCall::parse("follow_link", &Value::Null).unwrap(),
            ToolCall::FollowLink { url: None }
        );
        assert_eq!(
            ToolCall::parse("take_screenshot", &json!({"full_page": true})).unwrap(),
            ToolCall::Screenshot { full_page: true }
        );
        assert_eq!(ToolCall::parse("get_page_content", &json!({})).unwrap(), ToolCall::ExtractContent);
    }

    #[test]
    fn test_parse_rejects_bad_calls() {
        assert!(matches!(
            ToolCall::parse("search", &json!({})),
            Err(ResearchError::Validation(_))
        ));
        assert!(ToolCall::parse("navigate", &json!({"url": 42})).is_err());
        assert!(ToolCall::parse("screenshot", &json!({"full_page": "yes"})).is_err());
        assert!(ToolCall::parse("rm_rf", &json!({})).is_err());
    }

    #[test]
    fn test_canonical_names_match_schemas() {
        let names: Vec<&str> = ToolCall::schemas().iter().map(|s| s.name).collect();
        for call in [
            ToolCall::Search { query: "q".into() },
            ToolCall::Navigate { url: "u".into() },
            ToolCall::FollowLink { url: None },
            ToolCall::ExtractLinks,
            ToolCall::ExtractContent,
            ToolCall::Screenshot { full_page: false },
        ] {
            assert!(names.contains(&call.name()));
            assert_eq!(ToolCall::parse(call.name(), &call.args()).unwrap(), call);
        }
    }
}
