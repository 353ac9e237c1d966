use crate::embeddings::Embedder;
use crate::ingest::{load_pdf_chunks, IngestionReport};
use crate::prompt::{build_prompt, collect_sources, format_context};
use crate::traits::{Generator, QuestionAnswerer, VectorIndex};
use crate::{Answer, IngestionOptions, PipelineError, RetrievedChunk, SearchError};
use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};

pub const DEFAULT_TOP_K: usize = 3;

/// embed → retrieve → prompt → generate.
pub struct RagPipeline<E, V, G>
where
    E: Embedder,
    V: VectorIndex,
    G: Generator,
{
    embedder: E,
    index: V,
    generator: G,
    top_k: usize,
}

impl<E, V, G> RagPipeline<E, V, G>
where
    E: Embedder,
    V: VectorIndex,
    G: Generator,
{
    pub fn new(embedder: E, index: V, generator: G) -> Self {
        Self {
            embedder,
            index,
            generator,
            top_k: DEFAULT_TOP_K,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn index(&self) -> &V {
        &self.index
    }

    pub async fn retrieve(&self, question: &str) -> Result<Vec<RetrievedChunk>, SearchError> {
        let query_vector = self.embedder.embed(question).await?;
        self.index.search_vector(&query_vector, self.top_k).await
    }

    pub async fn answer(&self, question: &str) -> Result<Answer, SearchError> {
        let retrieved = self.retrieve(question).await?;
        let prompt = build_prompt(&format_context(&retrieved), question);
        debug!(hits = retrieved.len(), prompt_chars = prompt.chars().count(), "prompt assembled");

        let answer = self.generator.generate(&prompt).await?;
        let sources = collect_sources(&retrieved);

        info!(
            question_chars = question.chars().count(),
            hits = retrieved.len(),
            sources = ?sources,
            "question answered"
        );

        Ok(Answer { answer, sources })
    }
}

#[async_trait]
impl<E, V, G> QuestionAnswerer for RagPipeline<E, V, G>
where
    E: Embedder,
    V: VectorIndex,
    G: Generator,
{
    async fn ask(&self, question: &str) -> Result<Answer, SearchError> {
        self.answer(question).await
    }
}

/// Loads, chunks, embeds and persists in one pass. Nothing is written unless
/// every earlier step succeeded.
pub async fn run_ingestion<E, V>(
    path: &Path,
    options: &IngestionOptions,
    embedder: &E,
    index: &V,
) -> Result<IngestionReport, PipelineError>
where
    E: Embedder + ?Sized,
    V: VectorIndex + ?Sized,
{
    let report = load_pdf_chunks(path, options)?;
    info!(
        documents = report.documents.len(),
        pages = report.page_count,
        chunks = report.chunks.len(),
        "documents chunked"
    );

    let texts = report
        .chunks
        .iter()
        .map(|chunk| chunk.text.clone())
        .collect::<Vec<_>>();
    let embeddings = embedder.embed_batch(&texts).await?;
    info!(embedder = %embedder.name(), vectors = embeddings.len(), "chunks embedded");

    index.index_vector_chunks(&report.chunks, &embeddings).await?;
    Ok(report)
}
