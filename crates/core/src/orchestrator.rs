use crate::chunking::{normalize_whitespace, split_pages, ChunkingConfig};
use crate::embeddings::Embedder;
use crate::error::{AskError, EmbeddingError, IndexError, IngestError};
use crate::extractor::{AutoExtractor, TextExtractor};
use crate::ingest::{discover_documents, load_document};
use crate::models::{
    AskResponse, CorpusReport, DocumentInput, IngestResult, PipelineOptions, SkippedDocument,
    SourceSummary,
};
use crate::synthesis::AnswerSynthesizer;
use crate::traits::{IndexRecord, VectorIndex};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Wires extraction, chunking, embedding, the vector index and answer synthesis.
///
/// Holds no document data itself; everything ingested lives in the index.
pub struct DocumentPipeline<E, V>
where
    E: Embedder,
    V: VectorIndex,
{
    embedder: E,
    index: V,
    synthesizer: AnswerSynthesizer,
    extractor: Box<dyn TextExtractor>,
    chunking: ChunkingConfig,
    options: PipelineOptions,
}

impl<E, V> DocumentPipeline<E, V>
where
    E: Embedder,
    V: VectorIndex,
{
    pub fn new(
        embedder: E,
        index: V,
        synthesizer: AnswerSynthesizer,
        options: PipelineOptions,
    ) -> Result<Self, IngestError> {
        let chunking = ChunkingConfig::from(&options);
        chunking.validate()?;

        Ok(Self {
            embedder,
            index,
            synthesizer,
            extractor: Box::new(AutoExtractor),
            chunking,
            options,
        })
    }

    pub fn with_extractor(mut self, extractor: impl TextExtractor + 'static) -> Self {
        self.extractor = Box::new(extractor);
        self
    }

    pub fn index(&self) -> &V {
        &self.index
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn strategy_name(&self) -> &str {
        self.synthesizer.strategy_name()
    }

    /// Extracts, chunks, embeds and indexes one document, replacing whatever the
    /// index held for the same source name.
    pub async fn ingest(&self, document: &DocumentInput) -> Result<IngestResult, IngestError> {
        let source = document.source_name.trim();
        if source.is_empty() {
            return Err(IngestError::MissingFileName(
                "document has no source name".to_string(),
            ));
        }

        let mut pages = self.extractor.extract_pages(document)?;
        if self.options.normalize_whitespace {
            for page in &mut pages {
                page.text = normalize_whitespace(&page.text);
            }
        }
        if pages.iter().all(|page| page.text.trim().is_empty()) {
            return Err(IngestError::EmptyDocument {
                source_name: source.to_string(),
            });
        }

        let chunks = split_pages(&pages, source, self.chunking)?;
        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let vectors = self
            .embed(&texts)
            .await
            .map_err(|error| match error {
                EmbedFailure::Backend(error) => IngestError::Embedding(error),
                EmbedFailure::Timeout(seconds) => IngestError::EmbeddingTimeout { seconds },
            })?;

        let chunks_indexed = chunks.len();
        let records = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexRecord::new(chunk, vector))
            .collect();
        self.index.replace_source(source, records).await?;

        info!(
            source,
            pages = pages.len(),
            chunks = chunks_indexed,
            "document indexed"
        );

        Ok(IngestResult {
            source: source.to_string(),
            chunks_indexed,
        })
    }

    pub async fn ingest_path(&self, path: &Path) -> Result<IngestResult, IngestError> {
        let document = DocumentInput::from_path(path)?;
        self.ingest(&document).await
    }

    /// Retrieves the `top_k` most relevant chunks and answers from them.
    pub async fn ask(&self, question: &str, top_k: usize) -> Result<AskResponse, AskError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AskError::InvalidQuery("question is empty".to_string()));
        }
        if top_k == 0 {
            return Err(AskError::InvalidQuery("top_k must be at least 1".to_string()));
        }
        if self.index.is_empty().await {
            return Err(AskError::NoDocumentsIndexed);
        }

        let query_vector = self
            .embed(&[question.to_string()])
            .await
            .map_err(|error| match error {
                EmbedFailure::Backend(error) => AskError::Embedding(error),
                EmbedFailure::Timeout(seconds) => AskError::EmbeddingTimeout { seconds },
            })?
            .into_iter()
            .next()
            .ok_or(AskError::Embedding(EmbeddingError::CountMismatch {
                expected: 1,
                found: 0,
            }))?;

        let retrieved = self.index.search(&query_vector, top_k).await?;
        let synthesis = self.synthesizer.synthesize(question, &retrieved).await;

        if let Some(reason) = &synthesis.degraded {
            warn!(
                backend = self.synthesizer.strategy_name(),
                reason = %reason,
                "generative backend unavailable, answered extractively"
            );
        }

        info!(
            top_k,
            retrieved = retrieved.len(),
            sources = synthesis.answer.sources.len(),
            "question answered"
        );

        Ok(AskResponse {
            question: question.to_string(),
            answer: synthesis.answer.text,
            sources: synthesis.answer.sources,
            degraded: synthesis.degraded,
        })
    }

    pub async fn clear(&self) -> Result<(), IndexError> {
        self.index.clear().await?;
        info!("index cleared");
        Ok(())
    }

    pub async fn sources(&self) -> Vec<SourceSummary> {
        self.index.sources().await
    }

    /// Best-effort ingestion of every supported file under `folder`.
    pub async fn ingest_folder(&self, folder: &Path) -> Result<CorpusReport, IngestError> {
        let files = self.discover(folder)?;
        self.ingest_files(folder, &files).await
    }

    /// Clears the index, then ingests every supported file under `folder`.
    pub async fn reload_folder(&self, folder: &Path) -> Result<CorpusReport, IngestError> {
        let files = self.discover(folder)?;
        self.clear().await?;
        self.ingest_files(folder, &files).await
    }

    /// Clears the index, then ingests `documents` one by one.
    ///
    /// Not atomic across the corpus: documents that fail on their own are
    /// reported in the returned [`CorpusReport`], while an index or embedder
    /// failure stops the reload with [`IngestError::CorpusAborted`] carrying
    /// how many documents made it in.
    pub async fn reload_corpus(
        &self,
        documents: &[DocumentInput],
    ) -> Result<CorpusReport, IngestError> {
        self.clear().await?;

        let mut report = CorpusReport::default();
        for document in documents {
            let outcome = self.ingest(document).await;
            record_outcome(
                &mut report,
                PathBuf::from(&document.source_name),
                outcome,
            )?;
        }

        Ok(report)
    }

    async fn ingest_files(
        &self,
        root: &Path,
        files: &[PathBuf],
    ) -> Result<CorpusReport, IngestError> {
        let mut report = CorpusReport::default();

        for path in files {
            let outcome = match load_document(path) {
                Ok(document) => self.ingest(&document).await,
                Err(error) => Err(error),
            };
            record_outcome(&mut report, path.clone(), outcome)?;
        }

        info!(
            folder = %root.display(),
            ingested = report.documents_ingested(),
            skipped = report.skipped.len(),
            chunks = report.chunks_indexed(),
            "corpus ingestion finished"
        );

        Ok(report)
    }

    fn discover(&self, folder: &Path) -> Result<Vec<PathBuf>, IngestError> {
        let files = discover_documents(folder);
        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no supported documents found in {}",
                folder.display()
            )));
        }
        Ok(files)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedFailure> {
        let seconds = self.options.embedding_timeout_secs;
        let vectors = tokio::time::timeout(Duration::from_secs(seconds), self.embedder.embed(texts))
            .await
            .map_err(|_| EmbedFailure::Timeout(seconds))?
            .map_err(EmbedFailure::Backend)?;

        if vectors.len() != texts.len() {
            return Err(EmbedFailure::Backend(EmbeddingError::CountMismatch {
                expected: texts.len(),
                found: vectors.len(),
            }));
        }
        Ok(vectors)
    }
}

enum EmbedFailure {
    Backend(EmbeddingError),
    Timeout(u64),
}

fn record_outcome(
    report: &mut CorpusReport,
    path: PathBuf,
    outcome: Result<IngestResult, IngestError>,
) -> Result<(), IngestError> {
    match outcome {
        Ok(result) => {
            report.ingested.push(result);
            Ok(())
        }
        Err(error) if error.is_per_document() => {
            warn!(path = %path.display(), reason = %error, "skipped document");
            report.skipped.push(SkippedDocument {
                path,
                reason: error.to_string(),
            });
            Ok(())
        }
        Err(error) => Err(IngestError::CorpusAborted {
            succeeded: report.documents_ingested(),
            error: Box::new(error),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::GenerationError;
    use crate::generation::TextGenerator;
    use crate::ingest::source_name_for;
    use crate::models::SourceRef;
    use crate::stores::JsonFileIndex;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::Arc;
    use tempfile::tempdir;

    const SKY: &str = "The sky is blue. The grass is green.";

    fn options(chunk_size: usize, chunk_overlap: usize) -> PipelineOptions {
        PipelineOptions {
            chunk_size,
            chunk_overlap,
            ..PipelineOptions::default()
        }
    }

    fn extractive_pipeline(
        chunk_size: usize,
        overlap: usize,
    ) -> DocumentPipeline<CharacterNgramEmbedder, JsonFileIndex> {
        DocumentPipeline::new(
            CharacterNgramEmbedder::default(),
            JsonFileIndex::in_memory(),
            AnswerSynthesizer::extractive(),
            options(chunk_size, overlap),
        )
        .expect("valid options")
    }

    struct HangingGenerator;

    #[async_trait]
    impl TextGenerator for HangingGenerator {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok("never".to_string())
        }
    }

    struct SlowEmbedder;

    #[async_trait]
    impl Embedder for SlowEmbedder {
        fn dimensions(&self) -> usize {
            4
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(vec![vec![0.0; 4]; texts.len()])
        }
    }

    #[test]
    fn invalid_chunking_is_rejected_at_construction() {
        let result = DocumentPipeline::new(
            CharacterNgramEmbedder::default(),
            JsonFileIndex::in_memory(),
            AnswerSynthesizer::extractive(),
            options(100, 100),
        );
        assert!(matches!(result, Err(IngestError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn single_page_document_answers_with_citation() {
        let pipeline = extractive_pipeline(100, 0);
        let result = pipeline
            .ingest(&DocumentInput::from_bytes("colors.txt", SKY))
            .await
            .expect("ingest");
        assert_eq!(result.chunks_indexed, 1);

        let response = pipeline
            .ask("What color is the sky?", 5)
            .await
            .expect("ask");

        assert!(response.answer.contains("The sky is blue"));
        assert_eq!(response.sources.len(), 1);
        assert_eq!(response.sources[0].source, "colors.txt");
        assert_eq!(response.sources[0].page, 1);
        assert!(response.degraded.is_none());
    }

    #[tokio::test]
    async fn reingesting_same_document_does_not_duplicate() {
        let pipeline = extractive_pipeline(20, 5);
        let document = DocumentInput::from_bytes("colors.txt", SKY);

        let first = pipeline.ingest(&document).await.expect("first ingest");
        let count = pipeline.index().len().await;
        let second = pipeline.ingest(&document).await.expect("second ingest");

        assert_eq!(first, second);
        assert_eq!(pipeline.index().len().await, count);
        assert_eq!(count, first.chunks_indexed);
    }

    #[tokio::test]
    async fn shrunk_document_leaves_no_stale_chunks() {
        let pipeline = extractive_pipeline(10, 0);
        pipeline
            .ingest(&DocumentInput::from_bytes("doc.txt", "a".repeat(50)))
            .await
            .expect("long version");
        pipeline
            .ingest(&DocumentInput::from_bytes("doc.txt", "b".repeat(15)))
            .await
            .expect("short version");

        assert_eq!(
            pipeline.sources().await,
            vec![SourceSummary {
                source: "doc.txt".to_string(),
                chunks: 2
            }]
        );
    }

    #[tokio::test]
    async fn asking_an_empty_index_is_user_actionable() {
        let pipeline = extractive_pipeline(100, 0);
        let result = pipeline.ask("What color is the sky?", 5).await;
        assert!(matches!(result, Err(AskError::NoDocumentsIndexed)));
    }

    #[tokio::test]
    async fn clear_then_ask_reports_no_documents() {
        let pipeline = extractive_pipeline(100, 0);
        pipeline
            .ingest(&DocumentInput::from_bytes("colors.txt", SKY))
            .await
            .expect("ingest");
        pipeline.clear().await.expect("clear");

        let result = pipeline.ask("What color is the sky?", 5).await;
        assert!(matches!(result, Err(AskError::NoDocumentsIndexed)));
    }

    #[tokio::test]
    async fn invalid_queries_are_rejected() {
        let pipeline = extractive_pipeline(100, 0);
        assert!(matches!(
            pipeline.ask("   ", 5).await,
            Err(AskError::InvalidQuery(_))
        ));
        assert!(matches!(
            pipeline.ask("sky", 0).await,
            Err(AskError::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn blank_and_unknown_documents_fail_per_document() {
        let pipeline = extractive_pipeline(100, 0);

        let empty = pipeline
            .ingest(&DocumentInput::from_bytes("blank.txt", " \n\u{000C}  "))
            .await;
        assert!(matches!(
            empty,
            Err(IngestError::EmptyDocument { ref source_name }) if source_name == "blank.txt"
        ));

        let binary = pipeline
            .ingest(&DocumentInput::from_bytes("blob.bin", vec![0u8, 159, 146, 150]))
            .await;
        assert!(matches!(binary, Err(IngestError::UnsupportedFormat { .. })));
    }

    #[tokio::test]
    async fn dimension_mismatch_propagates_from_index() {
        let pipeline = DocumentPipeline::new(
            CharacterNgramEmbedder { dimensions: 16 },
            JsonFileIndex::in_memory(),
            AnswerSynthesizer::extractive(),
            options(100, 0),
        )
        .expect("valid options");
        pipeline
            .index()
            .upsert(vec![IndexRecord::new(
                crate::models::Chunk {
                    id: "other".to_string(),
                    text: "older embedder".to_string(),
                    source: "old.txt".to_string(),
                    page: 1,
                    sequence_index: 0,
                },
                vec![1.0; 8],
            )])
            .await
            .expect("seed");

        let result = pipeline
            .ingest(&DocumentInput::from_bytes("colors.txt", SKY))
            .await;
        assert!(matches!(
            result,
            Err(IngestError::Index(IndexError::DimensionMismatch {
                expected: 8,
                found: 16
            }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn generation_timeout_still_answers_extractively() {
        let synthesizer = AnswerSynthesizer::generative(Arc::new(HangingGenerator))
            .with_timeout(Duration::from_secs(5));
        let pipeline = DocumentPipeline::new(
            CharacterNgramEmbedder::default(),
            JsonFileIndex::in_memory(),
            synthesizer,
            options(100, 0),
        )
        .expect("valid options");
        pipeline
            .ingest(&DocumentInput::from_bytes("colors.txt", SKY))
            .await
            .expect("ingest");

        let response = pipeline
            .ask("What color is the sky?", 3)
            .await
            .expect("ask must not fail on backend timeout");

        assert!(response.answer.contains("The sky is blue"));
        assert!(response.degraded.is_some());
        assert_eq!(
            response.sources,
            vec![SourceRef {
                source: "colors.txt".to_string(),
                page: 1,
                relevance: response.sources[0].relevance,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn embedding_is_timeout_bounded() {
        let pipeline = DocumentPipeline::new(
            SlowEmbedder,
            JsonFileIndex::in_memory(),
            AnswerSynthesizer::extractive(),
            PipelineOptions {
                embedding_timeout_secs: 2,
                ..options(100, 0)
            },
        )
        .expect("valid options");

        let result = pipeline
            .ingest(&DocumentInput::from_bytes("colors.txt", SKY))
            .await;
        assert!(matches!(result, Err(IngestError::EmbeddingTimeout { seconds: 2 })));
    }

    #[tokio::test]
    async fn concurrent_questions_share_the_index() {
        let pipeline = extractive_pipeline(100, 0);
        pipeline
            .ingest(&DocumentInput::from_bytes("colors.txt", SKY))
            .await
            .expect("ingest");

        let (sky, grass) = tokio::join!(
            pipeline.ask("What color is the sky?", 1),
            pipeline.ask("What color is the grass?", 1)
        );
        assert!(sky.expect("sky").answer.contains("sky"));
        assert!(grass.expect("grass").answer.contains("grass"));
    }

    #[tokio::test]
    async fn folder_reload_reports_skipped_documents() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::create_dir(dir.path().join("nested"))?;
        fs::write(dir.path().join("colors.txt"), SKY)?;
        fs::write(dir.path().join("nested").join("pumps.md"), "Pumps move water.")?;
        fs::write(dir.path().join("broken.pdf"), b"%PDF-1.4\n%broken")?;
        fs::write(dir.path().join("blank.txt"), "   ")?;

        let pipeline = extractive_pipeline(100, 0);
        pipeline
            .ingest(&DocumentInput::from_bytes("stale.txt", "Old corpus content."))
            .await?;

        let report = pipeline.reload_folder(dir.path()).await?;

        assert_eq!(report.documents_ingested(), 2);
        assert_eq!(report.skipped.len(), 2);
        let sources: Vec<String> = pipeline
            .sources()
            .await
            .into_iter()
            .map(|summary| summary.source)
            .collect();
        let expected = vec![
            source_name_for(&dir.path().join("colors.txt"))?,
            source_name_for(&dir.path().join("nested").join("pumps.md"))?,
        ];
        assert_eq!(sources, expected);
        Ok(())
    }

    #[tokio::test]
    async fn same_named_files_keep_their_own_chunks() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        for (folder, text) in [("a", "Alpha pumps move water."), ("b", "Beta valves hold pressure.")] {
            fs::create_dir(dir.path().join(folder))?;
            fs::write(dir.path().join(folder).join("notes.txt"), text)?;
        }

        let pipeline = extractive_pipeline(100, 0);
        pipeline.ingest_path(&dir.path().join("a").join("notes.txt")).await?;
        pipeline.ingest_path(&dir.path().join("b").join("notes.txt")).await?;
        assert_eq!(pipeline.sources().await.len(), 2);
        assert_eq!(pipeline.index().len().await, 2);

        // the folder walk names files the same way as single-file ingestion
        let report = pipeline.ingest_folder(dir.path()).await?;
        assert_eq!(report.documents_ingested(), 2);
        assert_eq!(pipeline.sources().await.len(), 2);
        assert_eq!(pipeline.index().len().await, 2);

        let response = pipeline.ask("What do alpha pumps move?", 1).await?;
        assert!(response.sources[0].source.ends_with("a/notes.txt"));
        Ok(())
    }

    #[tokio::test]
    async fn reload_of_empty_folder_keeps_existing_index() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let pipeline = extractive_pipeline(100, 0);
        pipeline
            .ingest(&DocumentInput::from_bytes("colors.txt", SKY))
            .await?;

        let result = pipeline.reload_folder(dir.path()).await;

        assert!(matches!(result, Err(IngestError::InvalidArgument(_))));
        assert_eq!(pipeline.index().len().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn corpus_reload_stops_on_fatal_errors_and_counts_successes() {
        let pipeline = DocumentPipeline::new(
            CharacterNgramEmbedder { dimensions: 16 },
            JsonFileIndex::in_memory(),
            AnswerSynthesizer::extractive(),
            options(100, 0),
        )
        .expect("valid options");

        let documents = vec![
            DocumentInput::from_bytes("colors.txt", SKY),
            DocumentInput::from_bytes("blank.txt", " "),
        ];
        let report = pipeline.reload_corpus(&documents).await.expect("reload");
        assert_eq!(report.documents_ingested(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.chunks_indexed(), 1);

        let mismatched = DocumentPipeline::new(
            CharacterNgramEmbedder { dimensions: 8 },
            pipeline.index,
            AnswerSynthesizer::extractive(),
            options(100, 0),
        )
        .expect("valid options");
        // reload clears first, so the new dimension is accepted
        let report = mismatched.reload_corpus(&documents).await.expect("reload");
        assert_eq!(report.documents_ingested(), 1);
    }

    #[tokio::test]
    async fn persistent_pipeline_survives_restart() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("index.json");

        {
            let pipeline = DocumentPipeline::new(
                CharacterNgramEmbedder::default(),
                JsonFileIndex::open(&path).await?,
                AnswerSynthesizer::extractive(),
                options(100, 0),
            )?;
            pipeline
                .ingest(&DocumentInput::from_bytes("colors.txt", SKY))
                .await?;
        }

        let restarted = DocumentPipeline::new(
            CharacterNgramEmbedder::default(),
            JsonFileIndex::open(&path).await?,
            AnswerSynthesizer::extractive(),
            options(100, 0),
        )?;
        let response = restarted.ask("What color is the sky?", 5).await?;
        assert!(response.answer.contains("The sky is blue"));
        Ok(())
    }
}
