use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A source document handed to the pipeline. Read once during ingestion.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub source_name: String,
    pub bytes: Vec<u8>,
}

impl DocumentInput {
    pub fn from_bytes(source_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            source_name: source_name.into(),
            bytes: bytes.into(),
        }
    }

    /// Reads the file and names the document after its canonical path.
    pub fn from_path(path: &Path) -> Result<Self, IngestError> {
        crate::ingest::load_document(path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub source: String,
    /// 1-based page number, 0 when the format has no pages.
    pub page: u32,
    pub sequence_index: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub relevance: f32,
}

/// Ordered by descending relevance.
pub type RetrievalResult = Vec<RetrievedChunk>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRef {
    pub source: String,
    pub page: u32,
    pub relevance: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<SourceRef>,
}

impl Answer {
    /// Collects `(source, page)` pairs in first-seen order, keeping the best relevance per page.
    pub fn with_sources<'a>(
        text: impl Into<String>,
        used: impl IntoIterator<Item = &'a RetrievedChunk>,
    ) -> Self {
        let mut sources: Vec<SourceRef> = Vec::new();
        for item in used {
            match sources
                .iter_mut()
                .find(|known| known.source == item.chunk.source && known.page == item.chunk.page)
            {
                Some(known) => known.relevance = known.relevance.max(item.relevance),
                None => sources.push(SourceRef {
                    source: item.chunk.source.clone(),
                    page: item.chunk.page,
                    relevance: item.relevance,
                }),
            }
        }

        Self {
            text: text.into(),
            sources,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AskResponse {
    pub question: String,
    pub answer: String,
    pub sources: Vec<SourceRef>,
    /// Set when a generative backend failed and the extractive answer was used instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestResult {
    pub source: String,
    pub chunks_indexed: usize,
}

#[derive(Debug, Clone)]
pub struct SkippedDocument {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct CorpusReport {
    pub ingested: Vec<IngestResult>,
    pub skipped: Vec<SkippedDocument>,
}

impl CorpusReport {
    pub fn documents_ingested(&self) -> usize {
        self.ingested.len()
    }

    pub fn chunks_indexed(&self) -> usize {
        self.ingested.iter().map(|item| item.chunks_indexed).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceSummary {
    pub source: String,
    pub chunks: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub normalize_whitespace: bool,
    pub embedding_timeout_secs: u64,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            normalize_whitespace: true,
            embedding_timeout_secs: 60,
        }
    }
}

pub const DEFAULT_TOP_K: usize = 5;
