//! Archive module - Long-term store of everything seen on the bus
//!
//! The archiver process ingests every bus message as an [`ArchiveRecord`];
//! agents query it through the `recall` tool. [`MemoryArchive`] embeds each
//! record and ranks searches by cosine similarity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::bus::BusMessage;
use crate::error::Result;
use crate::providers::Embedder;
use crate::topic::{decode_payload, RoutingTuple, TopicTemplate};

/// One archived bus message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveRecord {
    pub topic: String,
    pub tuple: RoutingTuple,
    /// Raw payload text
    pub payload: String,
    /// Text used for similarity search
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ArchiveRecord {
    /// Build a record from a raw bus message.
    ///
    /// Chat envelopes contribute their `content`; any other payload is
    /// archived and searched as raw text.
    pub fn from_bus(template: &TopicTemplate, message: &BusMessage) -> Self {
        let payload = String::from_utf8_lossy(&message.payload).into_owned();
        let (content, timestamp) = match decode_payload(&message.payload) {
            Ok(decoded) if !decoded.content.is_empty() => (decoded.content, decoded.timestamp),
            _ => (payload.clone(), Utc::now()),
        };
        Self {
            topic: message.topic.clone(),
            tuple: template.decode(&message.topic),
            payload,
            content,
            timestamp,
        }
    }
}

/// A search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub record: ArchiveRecord,
    pub score: f32,
}

/// Archive seam used by the archiver and the `recall` tool.
#[async_trait]
pub trait Archive: Send + Sync {
    async fn ingest(&self, record: ArchiveRecord) -> Result<()>;

    /// Most similar records first, at most `limit`.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>>;
}

/// In-memory archive ranked by embedding similarity.
pub struct MemoryArchive {
    embedder: Arc<dyn Embedder>,
    entries: RwLock<Vec<(ArchiveRecord, Vec<f32>)>>,
}

impl MemoryArchive {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            entries: RwLock::new(Vec::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Archive for MemoryArchive {
    async fn ingest(&self, record: ArchiveRecord) -> Result<()> {
        let vector = self
            .embedder
            .embed(std::slice::from_ref(&record.content))
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();
        debug!(topic = %record.topic, dims = vector.len(), "Archived record");
        self.entries.write().await.push((record, vector));
        Ok(())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        if limit == 0 || self.is_empty().await {
            return Ok(Vec::new());
        }
        let query_vector = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        let entries = self.entries.read().await;
        let mut hits: Vec<SearchHit> = entries
            .iter()
            .map(|(record, vector)| SearchHit {
                record: record.clone(),
                score: cosine_similarity(&query_vector, vector),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Cosine similarity; 0 for empty, mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::DEFAULT_TOPIC_TEMPLATE;
    use crate::session::Message;
    use crate::topic::encode_payload;

    /// Embeds text as counts of the letters a, b and c.
    pub(crate) struct LetterEmbedder;

    #[async_trait]
    impl Embedder for LetterEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    ['a', 'b', 'c']
                        .iter()
                        .map(|l| t.chars().filter(|c| c == l).count() as f32)
                        .collect()
                })
                .collect())
        }
    }

    fn record(content: &str) -> ArchiveRecord {
        let template = TopicTemplate::parse(DEFAULT_TOPIC_TEMPLATE).unwrap();
        let payload = encode_payload(&Message::user("bob", content)).unwrap();
        ArchiveRecord::from_bus(&template, &BusMessage::new("a2a/lobby/bob/INFO/user//", payload))
    }

    #[test]
    fn test_record_from_envelope() {
        let record = record("hello");
        assert_eq!(record.content, "hello");
        assert_eq!(record.tuple.speaker_id, "bob");
        assert_eq!(record.tuple.channel, "lobby");
    }

    #[test]
    fn test_record_from_raw_payload() {
        let template = TopicTemplate::parse(DEFAULT_TOPIC_TEMPLATE).unwrap();
        let record = ArchiveRecord::from_bus(&template, &BusMessage::new("a2a/x", "plain text"));
        assert_eq!(record.content, "plain text");
        assert_eq!(record.tuple.channel, "x");
    }

    #[tokio::test]
    async fn test_search_ranks_by_similarity() {
        let archive = MemoryArchive::new(Arc::new(LetterEmbedder));
        archive.ingest(record("aaaa")).await.unwrap();
        archive.ingest(record("bbbb")).await.unwrap();
        archive.ingest(record("ccca")).await.unwrap();
        assert_eq!(archive.len().await, 3);

        let hits = archive.search("bb", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.content, "bbbb");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_search_empty_archive() {
        let archive = MemoryArchive::new(Arc::new(LetterEmbedder));
        assert!(archive.search("a", 5).await.unwrap().is_empty());
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }
}
