//! Web search through the Google Custom Search JSON API.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use super::{required_str, Tool, ToolContext};
use crate::error::{Result, TachikomaError};

const GOOGLE_CSE_ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";

/// Search tool.
///
/// # Parameters
/// - `query`: The query to search for (required)
///
/// Returns a list of `{title, link, snippet}` objects.
pub struct SearchTool {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    engine_id: String,
}

impl SearchTool {
    pub fn new(api_key: &str, engine_id: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: GOOGLE_CSE_ENDPOINT.to_string(),
            api_key: api_key.to_string(),
            engine_id: engine_id.to_string(),
        }
    }

    /// Point the tool at another endpoint.
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    fn request_url(&self, query: &str) -> Result<Url> {
        Url::parse_with_params(
            &self.endpoint,
            &[
                ("key", self.api_key.as_str()),
                ("cx", self.engine_id.as_str()),
                ("q", query),
            ],
        )
        .map_err(|e| TachikomaError::Tool(format!("Invalid search endpoint: {}", e)))
    }
}

/// Reduce a Custom Search response to its result items.
fn parse_items(body: &Value) -> Vec<Value> {
    body.get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    json!({
                        "title": item.get("title").and_then(Value::as_str).unwrap_or_default(),
                        "link": item.get("link").and_then(Value::as_str).unwrap_or_default(),
                        "snippet": item.get("snippet").and_then(Value::as_str).unwrap_or_default(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search the web for information"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "required": ["query"],
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The query to search for"
                }
            }
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
        let query = required_str(&args, "query")?;
        let url = self.request_url(query)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TachikomaError::Tool(format!("Search request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(TachikomaError::Tool(format!(
                "Search returned HTTP {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| TachikomaError::Tool(format!("Invalid search response: {}", e)))?;

        let items = parse_items(&body);
        debug!(query = %query, results = items.len(), "Search finished");
        Ok(Value::Array(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_url_encodes_query() {
        let tool = SearchTool::new("k", "cx1");
        let url = tool.request_url("rust & tokio").unwrap();
        assert_eq!(url.host_str(), Some("www.googleapis.com"));
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("q".into(), "rust & tokio".into())));
        assert!(pairs.contains(&("cx".into(), "cx1".into())));
    }

    #[test]
    fn test_parse_items() {
        let body = json!({
            "items": [
                {"title": "Rust", "link": "https://rust-lang.org", "snippet": "A language", "kind": "x"},
                {"title": "No link"}
            ]
        });
        let items = parse_items(&body);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["link"], "https://rust-lang.org");
        assert!(items[0].get("kind").is_none());
        assert_eq!(items[1]["snippet"], "");
    }

    #[test]
    fn test_parse_items_without_results() {
        assert!(parse_items(&json!({"searchInformation": {}})).is_empty());
    }

    #[tokio::test]
    async fn test_missing_query() {
        let tool = SearchTool::new("k", "cx");
        let result = tool.execute(json!({}), &ToolContext::new("a")).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_endpoint() {
        let tool = SearchTool::new("k", "cx").with_endpoint("not a url");
        assert!(tool.request_url("q").is_err());
    }
}
