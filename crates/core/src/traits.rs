use crate::error::IndexError;
use crate::models::{Chunk, RetrievalResult, SourceSummary};
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

impl IndexRecord {
    pub fn new(chunk: Chunk, vector: Vec<f32>) -> Self {
        Self { chunk, vector }
    }
}

/// Similarity store over chunk embeddings.
///
/// Each mutating call is applied as one batch: concurrent readers observe the
/// state before or after it, never a mix. Implementations must make the batch
/// durable before returning.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Inserts or overwrites records by chunk id.
    async fn upsert(&self, records: Vec<IndexRecord>) -> Result<(), IndexError>;

    /// Like `upsert`, but also drops records of `source` that the batch does not mention.
    async fn replace_source(&self, source: &str, records: Vec<IndexRecord>)
        -> Result<(), IndexError>;

    /// Up to `k` records ordered by descending relevance.
    async fn search(&self, query_vector: &[f32], k: usize) -> Result<RetrievalResult, IndexError>;

    async fn clear(&self) -> Result<(), IndexError>;

    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn sources(&self) -> Vec<SourceSummary>;
}
