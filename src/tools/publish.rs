//! Publish: let the backend post a message on an arbitrary bus topic.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use super::{required_str, Tool, ToolContext};
use crate::bus::{Bus, Qos};
use crate::error::Result;
use crate::session::Message;
use crate::topic::encode_payload;

/// Bus publish tool.
///
/// # Parameters
/// - `topic`: Destination topic (required)
/// - `payload`: Message text (required)
pub struct PublishTool {
    bus: Arc<dyn Bus>,
}

impl PublishTool {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Tool for PublishTool {
    fn name(&self) -> &str {
        "publish"
    }

    fn description(&self) -> &str {
        "Publish a message to a topic on the message bus"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "required": ["topic", "payload"],
            "properties": {
                "topic": {
                    "type": "string",
                    "description": "The topic to publish to"
                },
                "payload": {
                    "type": "string",
                    "description": "The message to publish"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value> {
        let topic = required_str(&args, "topic")?;
        let payload = required_str(&args, "payload")?;

        let message = Message::assistant(&ctx.speaker_id, payload);
        self.bus
            .publish(topic, encode_payload(&message)?, Qos::AtMostOnce)
            .await?;
        info!(topic = %topic, speaker = %ctx.speaker_id, "Tool published message");
        Ok(json!({"status": "published", "message": message.id}))
    }
}
