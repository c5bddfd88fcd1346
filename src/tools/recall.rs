//! Recall: similarity search over the long-term archive.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{required_str, Tool, ToolContext};
use crate::archive::Archive;
use crate::error::{Result, TachikomaError};

/// Recall tool.
///
/// # Parameters
/// - `query`: What to look for (required)
/// - `limit`: Maximum number of hits (optional)
pub struct RecallTool {
    archive: Arc<dyn Archive>,
    default_limit: usize,
}

impl RecallTool {
    pub fn new(archive: Arc<dyn Archive>, default_limit: usize) -> Self {
        Self {
            archive,
            default_limit,
        }
    }
}

#[async_trait]
impl Tool for RecallTool {
    fn name(&self) -> &str {
        "recall"
    }

    fn description(&self) -> &str {
        "Recall earlier messages similar to a query from long-term memory"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "required": ["query"],
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to remember"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of memories to return"
                }
            }
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
        let query = required_str(&args, "query")?;
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .unwrap_or(self.default_limit);

        let hits = self.archive.search(query, limit).await?;
        let results: Vec<Value> = hits
            .into_iter()
            .map(|hit| {
                json!({
                    "speaker_id": hit.record.tuple.speaker_id,
                    "role": hit.record.tuple.role,
                    "content": hit.record.content,
                    "timestamp": hit.record.timestamp.to_rfc3339(),
                    "score": hit.score,
                })
            })
            .collect();
        serde_json::to_value(results).map_err(|e| TachikomaError::Tool(e.to_string()))
    }
}
