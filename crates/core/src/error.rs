use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported document format for {source_name}: {reason}")]
    UnsupportedFormat { source_name: String, reason: String },

    #[error("document {source_name} has no extractable text")]
    EmptyDocument { source_name: String },

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("embedding timed out after {seconds}s")]
    EmbeddingTimeout { seconds: u64 },

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("corpus ingestion stopped after {succeeded} document(s): {error}")]
    CorpusAborted {
        succeeded: usize,
        error: Box<IngestError>,
    },
}

impl IngestError {
    /// Failures that only concern the one document and must not abort a corpus reload.
    pub fn is_per_document(&self) -> bool {
        matches!(
            self,
            IngestError::Io(_)
                | IngestError::UnsupportedFormat { .. }
                | IngestError::EmptyDocument { .. }
                | IngestError::PdfParse(_)
                | IngestError::MissingFileName(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("embedding dimension {found} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("index holds no records")]
    EmptyIndex,

    #[error("chunk id {0} appears more than once in one batch")]
    DuplicateId(String),

    #[error("index file uses {found}, this build reads {supported}")]
    UnsupportedSchema { found: String, supported: String },

    #[error("io error on index file: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("embedder returned {found} vectors for {expected} texts")]
    CountMismatch { expected: usize, found: usize },
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("{backend} did not answer within {seconds}s")]
    Timeout { backend: String, seconds: u64 },

    #[error("{backend} returned an empty answer")]
    EmptyResponse { backend: String },

    #[error("generator misconfigured: {0}")]
    Configuration(String),
}

#[derive(Debug, Error)]
pub enum AskError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("no documents have been indexed yet; ingest a document first")]
    NoDocumentsIndexed,

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("question embedding timed out after {seconds}s")]
    EmbeddingTimeout { seconds: u64 },

    #[error(transparent)]
    Index(IndexError),
}

impl From<IndexError> for AskError {
    fn from(value: IndexError) -> Self {
        match value {
            IndexError::EmptyIndex => AskError::NoDocumentsIndexed,
            other => AskError::Index(other),
        }
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
