pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod gemini;
pub mod ingest;
pub mod minilm;
pub mod models;
pub mod orchestrator;
pub mod prompt;
pub mod stores;
pub mod traits;

pub use chunking::{build_chunks, split_text, ChunkingConfig, DEFAULT_SEPARATORS};
pub use embeddings::{cosine_similarity, CharacterNgramEmbedder, Embedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{IngestError, PipelineError, SearchError};
pub use extractor::{clean_page_text, extract_page_texts, LopdfExtractor, PageText, PdfExtractor};
pub use gemini::{
    GeminiClient, GeminiConfig, GeminiEmbedder, DEFAULT_EMBEDDING_MODEL, DEFAULT_GEMINI_BASE_URL,
    DEFAULT_GENERATION_MODEL, GEMINI_EMBEDDING_DIMENSIONS,
};
pub use ingest::{
    digest_file, discover_pdf_files, load_pdf_chunks, resolve_inputs, IngestionReport,
};
pub use minilm::{MiniLmEmbedder, MINILM_DIMENSIONS, MINILM_MODEL_NAME};
pub use models::{
    Answer, DocumentFingerprint, IndexEntry, IngestionOptions, PdfChunk, RetrievedChunk,
    WriteMode, UNKNOWN_SOURCE,
};
pub use orchestrator::{run_ingestion, RagPipeline, DEFAULT_TOP_K};
pub use prompt::{build_prompt, collect_sources, format_context, INSTRUCTIONS};
pub use stores::{IndexManifest, IndexedDocument, LocalVectorStore, ENTRIES_FILE, MANIFEST_FILE};
pub use traits::{Generator, QuestionAnswerer, VectorIndex};
