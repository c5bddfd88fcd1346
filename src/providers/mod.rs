//! Providers module - Generation and embedding backends
//!
//! The run loop talks to a generation backend only through [`ChatBackend`]:
//! given role-tagged messages and a tool catalog it returns an incremental
//! stream of [`StreamEvent`]s. Dropping the stream cancels the request.
//!
//! # Example
//!
//! ```rust,ignore
//! use futures::StreamExt;
//! use tachikoma::providers::{ChatBackend, ChatRequest, OllamaBackend, StreamEvent};
//!
//! let backend = OllamaBackend::new("http://localhost:11434", "cogito:14b");
//! let mut stream = backend.chat(ChatRequest::default()).await?;
//! while let Some(event) = stream.next().await {
//!     if let StreamEvent::Content(text) = event? {
//!         print!("{}", text);
//!     }
//! }
//! ```

pub mod ollama;

pub use ollama::{OllamaBackend, OllamaEmbedder};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::session::{Role, ToolCall};

/// One message as the backend sees it. Bus metadata such as ids and
/// `context_ids` is deliberately absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
        }
    }
}

/// Schema advertised to the backend for one callable tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON-schema-like `{type: "object", required: [...], properties: {...}}`
    pub parameters: Value,
}

/// A full backend request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

/// One increment of a streamed generation.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A fragment of reply text.
    Content(String),
    /// The backend asks for one or more tool invocations.
    ToolCalls(Vec<ToolCall>),
    /// Generation finished.
    Done,
}

/// Stream of generation increments.
pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

/// Streaming text-generation backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Submit a request and return its cancellable stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be started; errors that occur
    /// mid-stream are yielded as stream items.
    async fn chat(&self, request: ChatRequest) -> Result<EventStream>;
}

/// Text embedding backend used by the archive.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed every text, one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}
