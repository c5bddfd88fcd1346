//! Tools module - Callable capabilities offered to the backend
//!
//! A [`Tool`] is an async function with a JSON argument/result contract.
//! The [`ToolRegistry`] advertises every registered tool's schema to the
//! backend and dispatches the calls it requests:
//!
//! - [`Dispatch::Completed`] carries the tool's JSON result
//! - [`Dispatch::Failed`] carries an error message (including timeouts)
//! - [`Dispatch::NotFound`] means no tool has that name; callers skip it
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use tachikoma::tools::{Dispatch, ToolContext, ToolRegistry};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let registry = ToolRegistry::new();
//! let ctx = ToolContext::new("agent-a");
//! let outcome = registry
//!     .dispatch("missing", json!({}), &ctx, Duration::from_secs(1))
//!     .await;
//! assert!(matches!(outcome, Dispatch::NotFound));
//! # });
//! ```

pub mod publish;
pub mod recall;
pub mod scrape;
pub mod search;

pub use publish::PublishTool;
pub use recall::RecallTool;
pub use scrape::ScrapeTool;
pub use search::SearchTool;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Result, TachikomaError};
use crate::providers::ToolDefinition;

/// Invocation context passed to every tool.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Agent on whose behalf the tool runs
    pub speaker_id: String,
}

impl ToolContext {
    pub fn new(speaker_id: &str) -> Self {
        Self {
            speaker_id: speaker_id.to_string(),
        }
    }
}

/// A callable capability.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name the backend uses to request this tool.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON-schema-like `{type: "object", required: [...], properties: {...}}`.
    fn parameters(&self) -> Value;

    /// Run the tool.
    ///
    /// # Errors
    ///
    /// Returns [`TachikomaError::Tool`] for bad arguments or a failed call.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Outcome of dispatching one tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Completed(Value),
    Failed(String),
    NotFound,
}

/// Closed name-to-tool lookup.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            warn!(tool = %name, "Replaced previously registered tool");
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool catalog for a backend request, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> =
            self.tools.values().map(|tool| tool.definition()).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Invoke `name` with `args`, bounded by `timeout`.
    pub async fn dispatch(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
        timeout: Duration,
    ) -> Dispatch {
        let Some(tool) = self.tools.get(name) else {
            return Dispatch::NotFound;
        };

        let started = Instant::now();
        let outcome = match tokio::time::timeout(timeout, tool.execute(args, ctx)).await {
            Ok(Ok(value)) => Dispatch::Completed(value),
            Ok(Err(e)) => Dispatch::Failed(e.to_string()),
            Err(_) => Dispatch::Failed(TachikomaError::Timeout(timeout.as_secs()).to_string()),
        };
        debug!(
            tool = %name,
            latency_ms = started.elapsed().as_millis() as u64,
            ok = matches!(outcome, Dispatch::Completed(_)),
            "Tool dispatched"
        );
        outcome
    }
}

/// Required string argument.
pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| TachikomaError::Tool(format!("Missing '{}' argument", key)))
}
