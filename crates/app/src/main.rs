use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use docqa_core::{
    create_generator, extract_metadata, AnswerSynthesizer, BackendKind, CharacterNgramEmbedder,
    CorpusReport, DocumentInput, DocumentPipeline, Embedder, GeneratorSettings, JsonFileIndex,
    OllamaEmbedder, PipelineOptions, DEFAULT_EMBEDDING_DIMENSIONS, DEFAULT_OLLAMA_EMBEDDING_MODEL,
    DEFAULT_TOP_K,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type Pipeline = DocumentPipeline<Box<dyn Embedder>, JsonFileIndex>;

#[derive(Parser)]
#[command(name = "docqa", version, about = "Ask cited questions over your documents")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON file holding the vector index
    #[arg(long, global = true, env = "DOCQA_INDEX_PATH", default_value = "docqa-index.json")]
    index_path: PathBuf,

    /// Characters per chunk
    #[arg(long, global = true, env = "DOCQA_CHUNK_SIZE", default_value_t = 500)]
    chunk_size: usize,

    /// Characters shared by consecutive chunks
    #[arg(long, global = true, env = "DOCQA_CHUNK_OVERLAP", default_value_t = 50)]
    chunk_overlap: usize,

    #[command(flatten)]
    embedding: EmbeddingArgs,

    #[command(flatten)]
    generation: GenerationArgs,

    /// Log filter, e.g. `info` or `docqa_core=debug`. Falls back to RUST_LOG.
    #[arg(long, global = true, env = "DOCQA_LOG_LEVEL")]
    log_level: Option<String>,
}

#[derive(Args)]
struct EmbeddingArgs {
    /// Embedding backend
    #[arg(long, global = true, env = "DOCQA_EMBEDDER", value_enum, default_value_t = EmbedderKind::Ngram)]
    embedder: EmbedderKind,

    /// Vector size produced by the embedder
    #[arg(long, global = true, env = "DOCQA_EMBEDDING_DIMENSIONS", default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,

    /// Ollama embedding model
    #[arg(long, global = true, env = "OLLAMA_EMBEDDING_MODEL", default_value = DEFAULT_OLLAMA_EMBEDDING_MODEL)]
    ollama_embedding_model: String,

    /// Seconds allowed for one embedding call
    #[arg(long, global = true, env = "DOCQA_EMBEDDING_TIMEOUT_SECS", default_value_t = 60)]
    embedding_timeout_secs: u64,
}

#[derive(Args)]
struct GenerationArgs {
    /// Answer backend: extractive, ollama or openai
    #[arg(long, global = true, env = "LLM_MODE", default_value = "extractive")]
    backend: BackendKind,

    /// Ollama base URL
    #[arg(long, global = true, env = "OLLAMA_URL", default_value = docqa_core::generation::DEFAULT_OLLAMA_URL)]
    ollama_url: String,

    /// Ollama generation model
    #[arg(long, global = true, env = "OLLAMA_MODEL", default_value = docqa_core::generation::DEFAULT_OLLAMA_MODEL)]
    ollama_model: String,

    /// OpenAI-compatible base URL
    #[arg(long, global = true, env = "OPENAI_URL", default_value = docqa_core::generation::DEFAULT_OPENAI_URL)]
    openai_url: String,

    /// OpenAI model
    #[arg(long, global = true, env = "OPENAI_MODEL", default_value = docqa_core::generation::DEFAULT_OPENAI_MODEL)]
    openai_model: String,

    /// OpenAI API key
    #[arg(long, global = true, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    /// Seconds allowed for one generative answer before falling back to extractive
    #[arg(long, global = true, env = "DOCQA_GENERATION_TIMEOUT_SECS", default_value_t = 120)]
    generation_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EmbedderKind {
    /// Hashed character trigrams, fully offline
    Ngram,
    /// Ollama `/api/embed`
    Ollama,
}

#[derive(Subcommand)]
enum Command {
    /// Index documents, replacing earlier chunks of the same source.
    #[command(group(clap::ArgGroup::new("input").required(true).args(["file", "folder"])))]
    Ingest {
        /// Document to ingest; repeat for several.
        #[arg(long)]
        file: Vec<PathBuf>,
        /// Folder scanned recursively for .pdf, .txt and .md files.
        #[arg(long)]
        folder: Option<PathBuf>,
    },
    /// Clear the index and ingest a folder from scratch.
    Reload {
        #[arg(long)]
        folder: PathBuf,
    },
    /// Answer a question from the indexed documents.
    Ask {
        #[arg(long)]
        question: String,
        /// Number of chunks to retrieve.
        #[arg(long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,
        /// Print the response as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Remove every indexed chunk.
    Clear,
    /// List indexed sources with their chunk counts.
    Sources,
    /// Show document metadata without indexing it.
    Info {
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        "docqa boot"
    );

    if let Command::Info { file } = &cli.command {
        let document = DocumentInput::from_path(file)?;
        let metadata = extract_metadata(&document)?;
        println!("file: {}", metadata.file_name);
        println!("size: {} bytes", metadata.file_size);
        println!("pages: {}", metadata.num_pages);
        for (label, value) in [
            ("title", &metadata.title),
            ("author", &metadata.author),
            ("subject", &metadata.subject),
        ] {
            if let Some(value) = value {
                println!("{label}: {value}");
            }
        }
        return Ok(());
    }

    let pipeline = build_pipeline(&cli).await?;

    match cli.command {
        Command::Ingest { file, folder } => {
            if let Some(folder) = folder {
                let report = pipeline.ingest_folder(&folder).await?;
                print_report(&report);
            }
            let mut skipped = 0usize;
            for path in file {
                match pipeline.ingest_path(&path).await {
                    Ok(result) => println!("{}: {} chunks", result.source, result.chunks_indexed),
                    Err(error) if error.is_per_document() => {
                        warn!(path = %path.display(), reason = %error, "skipped document");
                        println!("skipped {}: {error}", path.display());
                        skipped += 1;
                    }
                    Err(error) => return Err(error.into()),
                }
            }
            if skipped > 0 {
                println!("{skipped} file(s) skipped");
            }
        }
        Command::Reload { folder } => {
            let report = pipeline.reload_folder(&folder).await?;
            print_report(&report);
        }
        Command::Ask {
            question,
            top_k,
            json,
        } => {
            let response = pipeline.ask(&question, top_k).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!("{}", response.answer);
                if !response.sources.is_empty() {
                    println!();
                    println!("sources:");
                    for source in &response.sources {
                        println!(
                            "  {} (page {}) relevance={:.3}",
                            source.source, source.page, source.relevance
                        );
                    }
                }
                if let Some(reason) = &response.degraded {
                    println!();
                    println!(
                        "note: {} backend unavailable ({reason}); extractive answer shown",
                        pipeline.strategy_name()
                    );
                }
            }
        }
        Command::Clear => {
            pipeline.clear().await?;
            println!("index cleared: {}", cli.index_path.display());
        }
        Command::Sources => {
            let sources = pipeline.sources().await;
            if sources.is_empty() {
                println!("no documents indexed");
            }
            for summary in sources {
                println!("{} ({} chunks)", summary.source, summary.chunks);
            }
        }
        Command::Info { .. } => {}
    }

    Ok(())
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn build_pipeline(cli: &Cli) -> anyhow::Result<Pipeline> {
    let embedding = &cli.embedding;
    let embedder: Box<dyn Embedder> = match embedding.embedder {
        EmbedderKind::Ngram => Box::new(CharacterNgramEmbedder {
            dimensions: embedding.embedding_dimensions,
        }),
        EmbedderKind::Ollama => Box::new(OllamaEmbedder::new(
            cli.generation.ollama_url.clone(),
            embedding.ollama_embedding_model.clone(),
            embedding.embedding_dimensions,
        )),
    };

    let index = JsonFileIndex::open(&cli.index_path)
        .await
        .with_context(|| format!("opening index {}", cli.index_path.display()))?;

    let generation = &cli.generation;
    let settings = GeneratorSettings {
        ollama_url: generation.ollama_url.clone(),
        ollama_model: generation.ollama_model.clone(),
        openai_url: generation.openai_url.clone(),
        openai_model: generation.openai_model.clone(),
        openai_api_key: generation.openai_api_key.clone(),
        ..GeneratorSettings::default()
    };
    let generator = create_generator(generation.backend, &settings)?;
    let synthesizer = AnswerSynthesizer::from_generator(generator)
        .with_timeout(Duration::from_secs(generation.generation_timeout_secs));

    let options = PipelineOptions {
        chunk_size: cli.chunk_size,
        chunk_overlap: cli.chunk_overlap,
        embedding_timeout_secs: embedding.embedding_timeout_secs,
        ..PipelineOptions::default()
    };

    info!(
        backend = %generation.backend,
        embedder = ?embedding.embedder,
        index = %cli.index_path.display(),
        "pipeline ready"
    );

    Ok(DocumentPipeline::new(embedder, index, synthesizer, options)?)
}

fn print_report(report: &CorpusReport) {
    for result in &report.ingested {
        println!("{}: {} chunks", result.source, result.chunks_indexed);
    }
    for skipped in &report.skipped {
        println!("skipped {}: {}", skipped.path.display(), skipped.reason);
    }
    println!(
        "{} document(s), {} chunk(s) indexed, {} skipped",
        report.documents_ingested(),
        report.chunks_indexed(),
        report.skipped.len()
    );
}
