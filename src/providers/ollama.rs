//! Ollama backend
//!
//! `/api/chat` with `stream: true` answers with newline-delimited JSON
//! chunks; each is decoded as soon as its line is complete.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{ChatBackend, ChatMessage, ChatRequest, Embedder, EventStream, StreamEvent, ToolDefinition};
use crate::error::{Result, TachikomaError};
use crate::session::ToolCall;

/// Streaming chat against an Ollama server.
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaBackend {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(message_json).collect();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request.tools.iter().map(tool_json).collect();
            body["tools"] = Value::Array(tools);
        }
        body
    }
}

fn message_json(message: &ChatMessage) -> Value {
    let mut value = json!({
        "role": message.role.as_str(),
        "content": message.content,
    });
    if let Some(calls) = &message.tool_calls {
        value["tool_calls"] = calls
            .iter()
            .map(|c| json!({"function": {"name": c.name, "arguments": c.arguments}}))
            .collect();
    }
    value
}

fn tool_json(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn chat(&self, request: ChatRequest) -> Result<EventStream> {
        let url = format!("{}/api/chat", self.base_url);
        debug!(model = %self.model, messages = request.messages.len(), tools = request.tools.len(), "Submitting chat");
        let response = self
            .client
            .post(&url)
            .json(&self.request_body(&request))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TachikomaError::Provider(format!(
                "ollama returned {}: {}",
                status, text
            )));
        }
        Ok(ndjson_events(Box::pin(response.bytes_stream())).boxed())
    }
}

#[derive(Debug, Deserialize)]
struct Chunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    id: Option<String>,
    function: ChunkFunction,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Decode one NDJSON line into zero or more events.
fn parse_line(line: &[u8]) -> Vec<Result<StreamEvent>> {
    let chunk: Chunk = match serde_json::from_slice(line) {
        Ok(chunk) => chunk,
        Err(e) => {
            return vec![Err(TachikomaError::Provider(format!(
                "undecodable stream chunk: {}",
                e
            )))]
        }
    };
    if let Some(error) = chunk.error {
        return vec![Err(TachikomaError::Provider(error))];
    }

    let mut events = Vec::new();
    if let Some(message) = chunk.message {
        if let Some(content) = message.content.filter(|c| !c.is_empty()) {
            events.push(Ok(StreamEvent::Content(content)));
        }
        if let Some(calls) = message.tool_calls.filter(|c| !c.is_empty()) {
            let calls = calls
                .into_iter()
                .map(|call| ToolCall {
                    id: call
                        .id
                        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
                    name: call.function.name,
                    arguments: call.function.arguments,
                })
                .collect();
            events.push(Ok(StreamEvent::ToolCalls(calls)));
        }
    }
    if chunk.done {
        events.push(Ok(StreamEvent::Done));
    }
    events
}

struct LineDecoder<S> {
    inner: S,
    buffer: Vec<u8>,
    pending: VecDeque<Result<StreamEvent>>,
    finished: bool,
}

impl<S> LineDecoder<S> {
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.push_line(&line);
        }
    }

    fn push_line(&mut self, line: &[u8]) {
        let trimmed = line.trim_ascii();
        if !trimmed.is_empty() {
            self.pending.extend(parse_line(trimmed));
        }
    }
}

/// Turn a byte stream of NDJSON into a stream of events.
fn ndjson_events<S, B, E>(inner: S) -> impl Stream<Item = Result<StreamEvent>>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<TachikomaError>,
{
    let decoder = LineDecoder {
        inner,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };
    stream::unfold(decoder, |mut decoder| async move {
        loop {
            if let Some(item) = decoder.pending.pop_front() {
                return Some((item, decoder));
            }
            if decoder.finished {
                return None;
            }
            match decoder.inner.next().await {
                Some(Ok(bytes)) => {
                    decoder.buffer.extend_from_slice(bytes.as_ref());
                    decoder.drain_lines();
                }
                Some(Err(e)) => {
                    decoder.finished = true;
                    decoder.pending.push_back(Err(e.into()));
                }
                None => {
                    decoder.finished = true;
                    let rest = std::mem::take(&mut decoder.buffer);
                    decoder.push_line(&rest);
                }
            }
        }
    })
}

/// Embeddings through Ollama's `/api/embed`.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({"model": self.model, "input": texts}))
            .send()
            .await?
            .error_for_status()?;
        let body: EmbedResponse = response.json().await?;
        if body.embeddings.len() != texts.len() {
            return Err(TachikomaError::Provider(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                body.embeddings.len()
            )));
        }
        Ok(body.embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;

    fn collect(chunks: Vec<&str>) -> Vec<Result<StreamEvent>> {
        let inner = stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<Vec<u8>, TachikomaError>(c.as_bytes().to_vec()))
                .collect::<Vec<_>>(),
        );
        tokio_test::block_on(ndjson_events(inner).collect::<Vec<_>>())
    }

    #[test]
    fn test_parse_content_and_done() {
        let events = collect(vec![
            "{\"message\":{\"role\":\"assistant\",\"content\":\"he\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"llo\"},\"done\":false}\n{\"message\":{\"content\":\"\"},\"done\":true}\n",
        ]);
        let events: Vec<StreamEvent> = events.into_iter().map(|e| e.unwrap()).collect();
        assert_eq!(
            events,
            vec![
                StreamEvent::Content("he".into()),
                StreamEvent::Content("llo".into()),
                StreamEvent::Done
            ]
        );
    }

    #[test]
    fn test_line_split_across_chunks() {
        let events = collect(vec!["{\"message\":{\"cont", "ent\":\"hi\"}}\n{\"done\":", "true}"]);
        let events: Vec<StreamEvent> = events.into_iter().map(|e| e.unwrap()).collect();
        assert_eq!(events, vec![StreamEvent::Content("hi".into()), StreamEvent::Done]);
    }

    #[test]
    fn test_parse_tool_calls() {
        let line = br#"{"message":{"content":"","tool_calls":[{"function":{"name":"search","arguments":{"query":"rust"}}}]},"done":false}"#;
        let events = parse_line(line);
        assert_eq!(events.len(), 1);
        match events.into_iter().next().unwrap().unwrap() {
            StreamEvent::ToolCalls(calls) => {
                assert_eq!(calls[0].name, "search");
                assert_eq!(calls[0].arguments["query"], "rust");
                assert!(calls[0].id.starts_with("call_"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_line() {
        let events = parse_line(br#"{"error":"model not found"}"#);
        assert!(matches!(&events[0], Err(TachikomaError::Provider(m)) if m == "model not found"));
        assert!(parse_line(b"not json")[0].is_err());
    }

    #[test]
    fn test_request_body_shape() {
        let backend = OllamaBackend::new("http://localhost:11434/", "m");
        assert_eq!(backend.base_url, "http://localhost:11434");
        let mut assistant = ChatMessage::new(Role::Assistant, "");
        assistant.tool_calls = Some(vec![ToolCall::new("c", "scrape", json!({"url": "x"}))]);
        let request = ChatRequest {
            messages: vec![ChatMessage::new(Role::User, "hi"), assistant],
            tools: vec![ToolDefinition {
                name: "scrape".into(),
                description: "Scrape".into(),
                parameters: json!({"type": "object"}),
            }],
        };
        let body = backend.request_body(&request);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][1]["tool_calls"][0]["function"]["name"], "scrape");
        assert_eq!(body["tools"][0]["type"], "function");

        let bare = backend.request_body(&ChatRequest::default());
        assert!(bare.get("tools").is_none());
    }
}
