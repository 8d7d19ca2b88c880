pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod generation;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod stores;
pub mod synthesis;
pub mod traits;

pub use chunking::{make_chunk_id, normalize_whitespace, split_pages, window_text, ChunkingConfig};
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, OllamaEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
    DEFAULT_OLLAMA_EMBEDDING_MODEL,
};
pub use error::{AskError, EmbeddingError, GenerationError, IndexError, IngestError};
pub use extractor::{
    detect_format, extract_metadata, extract_page_texts, AutoExtractor, DocumentFormat,
    DocumentMetadata, LopdfExtractor, PageText, PlainTextExtractor, TextExtractor,
};
pub use generation::{
    create_generator, BackendKind, GeneratorSettings, OllamaGenerator, OpenAiGenerator,
    TextGenerator,
};
pub use ingest::{discover_documents, is_supported_path, load_document, source_name_for};
pub use models::{
    Answer, AskResponse, Chunk, CorpusReport, DocumentInput, IngestResult, PipelineOptions,
    RetrievalResult, RetrievedChunk, SkippedDocument, SourceRef, SourceSummary, DEFAULT_TOP_K,
};
pub use orchestrator::DocumentPipeline;
pub use stores::JsonFileIndex;
pub use synthesis::{AnswerSynthesizer, Synthesis, DEFAULT_GENERATION_TIMEOUT};
pub use traits::{IndexRecord, VectorIndex};
