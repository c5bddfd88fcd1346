//! Page scraping: fetch a URL and return its visible body text.

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::{json, Value};
use url::Url;

use super::{required_str, Tool, ToolContext};
use crate::error::{Result, TachikomaError};

/// Scrape tool.
///
/// # Parameters
/// - `url`: The http(s) URL to scrape (required)
///
/// Text is whitespace-collapsed and cut to `max_chars` characters so that
/// it fits in the backend's context.
pub struct ScrapeTool {
    client: reqwest::Client,
    max_chars: usize,
}

impl ScrapeTool {
    pub fn new(max_chars: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            max_chars,
        }
    }
}

/// Extract `<body>` text, collapse whitespace and truncate on a char boundary.
pub fn body_text(html: &str, max_chars: usize) -> String {
    let document = Html::parse_document(html);
    let text: String = match Selector::parse("body") {
        Ok(selector) => document
            .select(&selector)
            .flat_map(|body| body.text())
            .collect::<Vec<_>>()
            .join(" "),
        Err(_) => String::new(),
    };
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(max_chars)
        .collect()
}

fn parse_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| TachikomaError::Tool(format!("Invalid URL: {}", e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(TachikomaError::Tool(format!("Unsupported URL scheme '{}'", other))),
    }
}

#[async_trait]
impl Tool for ScrapeTool {
    fn name(&self) -> &str {
        "scrape"
    }

    fn description(&self) -> &str {
        "Scrape the web page"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "required": ["url"],
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to scrape"
                }
            }
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
        let url = parse_url(required_str(&args, "url")?)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TachikomaError::Tool(format!("Fetch failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(TachikomaError::Tool(format!(
                "Fetch returned HTTP {}",
                response.status()
            )));
        }
        let html = response
            .text()
            .await
            .map_err(|e| TachikomaError::Tool(format!("Failed to read page: {}", e)))?;
        Ok(Value::String(body_text(&html, self.max_chars)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_text_collapses_whitespace() {
        let html = "<html><head><title>T</title></head><body>\n  <h1>Hello</h1>\n\n<p>big   world</p></body></html>";
        assert_eq!(body_text(html, 100), "Hello big world");
    }

    #[test]
    fn test_body_text_truncates_on_char_boundary() {
        let html = "<body>こんにちは世界</body>";
        assert_eq!(body_text(html, 5), "こんにちは");
    }

    #[test]
    fn test_parse_url() {
        assert!(parse_url("https://example.com/a").is_ok());
        assert!(parse_url("file:///etc/passwd").is_err());
        assert!(parse_url("nonsense").is_err());
    }

    #[tokio::test]
    async fn test_missing_url() {
        let tool = ScrapeTool::new(10);
        assert!(tool.execute(json!({}), &ToolContext::new("a")).await.is_err());
    }
}
