mod error;
mod server;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use pdf_rag_core::{
    run_ingestion, CharacterNgramEmbedder, Embedder, GeminiClient, GeminiConfig, GeminiEmbedder,
    IngestError, IngestionOptions, LocalVectorStore, MiniLmEmbedder, PipelineError, RagPipeline,
    WriteMode, MINILM_MODEL_NAME,
    DEFAULT_EMBEDDING_MODEL, DEFAULT_GEMINI_BASE_URL, DEFAULT_GENERATION_MODEL,
};
use server::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pdf-rag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the persisted vector index
    #[arg(long, env = "RAG_INDEX_DIR", default_value = "./vector_store")]
    index_dir: PathBuf,

    /// Embedder used for both chunks and questions
    #[arg(long, env = "RAG_EMBEDDER", value_enum, default_value_t = EmbedderKind::Ngram)]
    embedder: EmbedderKind,

    /// Directory with `model.onnx` and `tokenizer.json` (only with `--embedder minilm`)
    #[arg(long, env = "RAG_MINILM_DIR", default_value = "./models/all-MiniLM-L6-v2")]
    minilm_dir: PathBuf,

    /// Gemini API key
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    gemini_api_key: Option<String>,

    /// Gemini generation model
    #[arg(long, env = "GEMINI_MODEL", default_value = DEFAULT_GENERATION_MODEL)]
    gemini_model: String,

    /// Gemini embedding model (only with `--embedder gemini`)
    #[arg(long, env = "GEMINI_EMBEDDING_MODEL", default_value = DEFAULT_EMBEDDING_MODEL)]
    gemini_embedding_model: String,

    /// Gemini API base URL
    #[arg(long, env = "GEMINI_BASE_URL", default_value = DEFAULT_GEMINI_BASE_URL)]
    gemini_base_url: String,
}

#[derive(Subcommand)]
enum Command {
    /// Load a PDF (or a folder of PDFs) into the vector index.
    Ingest {
        /// PDF file or folder searched recursively.
        #[arg(long, default_value = "./data/Data.pdf")]
        pdf: PathBuf,
        /// `replace` rebuilds the index, `append` upserts the given documents.
        #[arg(long, default_value = "replace")]
        mode: WriteMode,
        /// Maximum chunk length in characters.
        #[arg(long, default_value_t = 1_000)]
        chunk_size: usize,
        /// Characters shared between neighbouring chunks.
        #[arg(long, default_value_t = 200)]
        chunk_overlap: usize,
    },
    /// Serve `POST /ask` over HTTP.
    Serve {
        /// Address to bind.
        #[arg(long, env = "RAG_BIND", default_value = "0.0.0.0:8000")]
        bind: String,
    },
    /// Answer one question from the command line.
    Ask {
        /// Question to answer.
        #[arg(long)]
        question: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EmbedderKind {
    /// Local hashed character trigrams.
    Ngram,
    /// Local `all-MiniLM-L6-v2` ONNX model.
    Minilm,
    /// Gemini `batchEmbedContents`.
    Gemini,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "pdf-rag boot"
    );

    match &cli.command {
        Command::Ingest {
            pdf,
            mode,
            chunk_size,
            chunk_overlap,
        } => {
            let embedder = build_embedder(&cli)?;
            let store = LocalVectorStore::create(
                &cli.index_dir,
                embedder.name(),
                embedder.dimensions(),
                *mode,
            )
            .await
            .context("preparing vector index")?;
            let options = IngestionOptions {
                chunk_max_chars: *chunk_size,
                chunk_overlap_chars: *chunk_overlap,
            };

            info!(pdf = %pdf.display(), index_dir = %cli.index_dir.display(), ?mode, "ingestion started");
            let report = match run_ingestion(pdf, &options, &embedder, &store).await {
                Ok(report) => report,
                Err(PipelineError::Ingest(IngestError::MissingInput(path))) => {
                    error!(%path, "input pdf not found, index left untouched");
                    eprintln!("error: {path} not found");
                    return Ok(());
                }
                Err(error) => return Err(error).context("ingestion failed"),
            };

            println!(
                "{} chunks from {} page(s) in {} document(s) stored in {} at {}",
                report.chunks.len(),
                report.page_count,
                report.documents.len(),
                store.directory().display(),
                Utc::now().to_rfc3339()
            );
        }
        Command::Serve { bind } => {
            let (pipeline, entries) = build_pipeline(&cli).await?;
            let state = AppState {
                answerer: Arc::new(pipeline),
                indexed_entries: entries,
            };
            server::serve(bind, state).await?;
        }
        Command::Ask { question } => {
            let (pipeline, _) = build_pipeline(&cli).await?;
            let answer = pipeline.answer(question).await.context("answering question")?;

            println!("{}", answer.answer.trim_end());
            if !answer.sources.is_empty() {
                println!("sources: {}", answer.sources.join(", "));
            }
        }
    }

    Ok(())
}

fn gemini_config(cli: &Cli, model: &str) -> anyhow::Result<GeminiConfig> {
    let api_key = cli.gemini_api_key.clone().unwrap_or_default();
    GeminiConfig::new(&cli.gemini_base_url, api_key, model).context("configuring gemini")
}

fn build_embedder(cli: &Cli) -> anyhow::Result<Box<dyn Embedder>> {
    Ok(match cli.embedder {
        EmbedderKind::Ngram => Box::new(CharacterNgramEmbedder::default()),
        EmbedderKind::Minilm => {
            info!(model = MINILM_MODEL_NAME, dir = %cli.minilm_dir.display(), "loading onnx embedder");
            Box::new(MiniLmEmbedder::load(&cli.minilm_dir).context("loading onnx embedder")?)
        }
        EmbedderKind::Gemini => Box::new(GeminiEmbedder::new(gemini_config(
            cli,
            &cli.gemini_embedding_model,
        )?)),
    })
}

type ServicePipeline = RagPipeline<Box<dyn Embedder>, LocalVectorStore, GeminiClient>;

/// Opens the index read-only and wires embedder, index and generator.
async fn build_pipeline(cli: &Cli) -> anyhow::Result<(ServicePipeline, usize)> {
    let generator = GeminiClient::new(gemini_config(cli, &cli.gemini_model)?);
    let embedder = build_embedder(cli)?;

    let store = LocalVectorStore::open(&cli.index_dir)
        .await
        .context("opening vector index")?;
    store
        .ensure_embedder(&embedder.name(), embedder.dimensions())
        .context("index and embedder disagree")?;

    let entries = store.len();
    info!(
        entries,
        embedder = %embedder.name(),
        model = %generator.model(),
        "query pipeline ready"
    );

    Ok((RagPipeline::new(embedder, store, generator), entries))
}
