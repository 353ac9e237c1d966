//! Directory-backed vector index.
//!
//! Layout under the index directory:
//! - `manifest.json`: embedder identity, dimensions, entry count, documents,
//!   and the name of the live entries file
//! - `entries-<digest>.jsonl`: one [`IndexEntry`] per line
//!
//! A write lands the new entries file under a content-derived name first and
//! then renames `manifest.json.tmp` over the manifest. That rename is the only
//! commit point: a crash before it leaves the previous manifest pointing at
//! the previous entries file.

use crate::embeddings::cosine_similarity;
use crate::traits::VectorIndex;
use crate::{IndexEntry, PdfChunk, RetrievedChunk, SearchError, WriteMode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info, warn};

pub const MANIFEST_FILE: &str = "manifest.json";
/// Entries file of indexes written before the manifest named its entries file.
pub const ENTRIES_FILE: &str = "entries.jsonl";
const FORMAT_VERSION: u32 = 1;
const BACKEND: &str = "local-index";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexedDocument {
    pub document_id: String,
    pub source_path: String,
    pub title: String,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexManifest {
    pub format_version: u32,
    pub embedder: String,
    pub dimensions: usize,
    pub entry_count: usize,
    #[serde(default = "default_entries_file")]
    pub entries_file: String,
    pub documents: Vec<IndexedDocument>,
    pub updated_at: DateTime<Utc>,
}

fn default_entries_file() -> String {
    ENTRIES_FILE.to_string()
}

pub struct LocalVectorStore {
    directory: PathBuf,
    embedder: String,
    dimensions: usize,
    mode: WriteMode,
    read_only: bool,
    entries: RwLock<Vec<IndexEntry>>,
}

impl LocalVectorStore {
    /// Prepares a writable store for an ingestion run.
    ///
    /// In [`WriteMode::Append`] the existing index, if any, is loaded and must
    /// have been built by the same embedder.
    pub async fn create(
        directory: impl Into<PathBuf>,
        embedder: impl Into<String>,
        dimensions: usize,
        mode: WriteMode,
    ) -> Result<Self, SearchError> {
        let directory = directory.into();
        let embedder = embedder.into();

        let existing = match mode {
            WriteMode::Replace => Vec::new(),
            WriteMode::Append if manifest_path(&directory).exists() => {
                let (manifest, entries) = load_index(&directory).await?;
                if manifest.dimensions != dimensions {
                    return Err(SearchError::DimensionMismatch {
                        expected: manifest.dimensions,
                        actual: dimensions,
                    });
                }
                if manifest.embedder != embedder {
                    return Err(SearchError::Config(format!(
                        "index at {} was built with embedder `{}`, cannot append with `{}`",
                        directory.display(),
                        manifest.embedder,
                        embedder
                    )));
                }
                entries
            }
            WriteMode::Append => Vec::new(),
        };

        Ok(Self {
            directory,
            embedder,
            dimensions,
            mode,
            read_only: false,
            entries: RwLock::new(existing),
        })
    }

    /// Opens a persisted index for querying. Writes are rejected.
    pub async fn open(directory: impl Into<PathBuf>) -> Result<Self, SearchError> {
        let directory = directory.into();
        if !manifest_path(&directory).exists() {
            return Err(SearchError::NotReady(format!(
                "no index found in {} (run ingestion first)",
                directory.display()
            )));
        }

        let (manifest, entries) = load_index(&directory).await?;
        info!(
            directory = %directory.display(),
            entries = entries.len(),
            embedder = %manifest.embedder,
            "opened vector index"
        );

        Ok(Self {
            directory,
            embedder: manifest.embedder,
            dimensions: manifest.dimensions,
            mode: WriteMode::Replace,
            read_only: true,
            entries: RwLock::new(entries),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn embedder_name(&self) -> &str {
        &self.embedder
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fails when queries would be embedded differently from the stored entries.
    pub fn ensure_embedder(&self, name: &str, dimensions: usize) -> Result<(), SearchError> {
        if self.dimensions != dimensions {
            return Err(SearchError::DimensionMismatch {
                expected: self.dimensions,
                actual: dimensions,
            });
        }
        if self.embedder != name {
            return Err(SearchError::Config(format!(
                "index was built with embedder `{}` but `{}` is configured",
                self.embedder, name
            )));
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<IndexEntry>, SearchError> {
        self.entries
            .read()
            .map(|entries| entries.clone())
            .map_err(|_| SearchError::Request("index lock poisoned".to_string()))
    }

    async fn persist(&self, entries: &[IndexEntry]) -> Result<IndexManifest, SearchError> {
        tokio::fs::create_dir_all(&self.directory).await?;

        let mut lines = String::new();
        for entry in entries {
            lines.push_str(&serde_json::to_string(entry)?);
            lines.push('\n');
        }

        let entries_file = entries_file_name(&lines);
        let manifest = IndexManifest {
            format_version: FORMAT_VERSION,
            embedder: self.embedder.clone(),
            dimensions: self.dimensions,
            entry_count: entries.len(),
            entries_file: entries_file.clone(),
            documents: summarize_documents(entries),
            updated_at: Utc::now(),
        };
        let manifest_json = serde_json::to_string_pretty(&manifest)?;

        let entries_tmp = self.directory.join(format!("{entries_file}.tmp"));
        tokio::fs::write(&entries_tmp, lines).await?;
        tokio::fs::rename(&entries_tmp, self.directory.join(&entries_file)).await?;

        let manifest_tmp = self.directory.join(format!("{MANIFEST_FILE}.tmp"));
        tokio::fs::write(&manifest_tmp, manifest_json).await?;
        tokio::fs::rename(&manifest_tmp, manifest_path(&self.directory)).await?;

        remove_stale_entries(&self.directory, &entries_file).await;
        Ok(manifest)
    }
}

#[async_trait]
impl VectorIndex for LocalVectorStore {
    async fn index_vector_chunks(
        &self,
        chunks: &[PdfChunk],
        embeddings: &[Vec<f32>],
    ) -> Result<(), SearchError> {
        if self.read_only {
            return Err(SearchError::Request(format!(
                "index at {} is open read-only",
                self.directory.display()
            )));
        }

        if chunks.len() != embeddings.len() {
            return Err(SearchError::Request(format!(
                "embedding count {} doesn't match chunk count {}",
                embeddings.len(),
                chunks.len()
            )));
        }

        if let Some(bad) = embeddings.iter().find(|embedding| embedding.len() != self.dimensions) {
            return Err(SearchError::DimensionMismatch {
                expected: self.dimensions,
                actual: bad.len(),
            });
        }

        let mut entries = match self.mode {
            WriteMode::Replace => Vec::new(),
            WriteMode::Append => {
                let incoming = chunks
                    .iter()
                    .map(|chunk| chunk.document_id.as_str())
                    .collect::<HashSet<_>>();
                let mut kept = self.snapshot()?;
                kept.retain(|entry| !incoming.contains(entry.chunk.document_id.as_str()));
                kept
            }
        };

        entries.extend(
            chunks
                .iter()
                .zip(embeddings)
                .map(|(chunk, embedding)| IndexEntry {
                    chunk: chunk.clone(),
                    embedding: embedding.clone(),
                }),
        );

        let manifest = self.persist(&entries).await?;
        debug!(
            entries = manifest.entry_count,
            documents = manifest.documents.len(),
            "index persisted"
        );

        let mut guard = self
            .entries
            .write()
            .map_err(|_| SearchError::Request("index lock poisoned".to_string()))?;
        *guard = entries;

        Ok(())
    }

    async fn search_vector(
        &self,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, SearchError> {
        if query_vector.len() != self.dimensions {
            return Err(SearchError::DimensionMismatch {
                expected: self.dimensions,
                actual: query_vector.len(),
            });
        }

        let entries = self
            .entries
            .read()
            .map_err(|_| SearchError::Request("index lock poisoned".to_string()))?;

        let mut scored = entries
            .iter()
            .map(|entry| (cosine_similarity(query_vector, &entry.embedding), entry))
            .collect::<Vec<_>>();

        scored.sort_by(|left, right| {
            right
                .0
                .total_cmp(&left.0)
                .then_with(|| left.1.chunk.chunk_index.cmp(&right.1.chunk.chunk_index))
                .then_with(|| left.1.chunk.chunk_id.cmp(&right.1.chunk.chunk_id))
        });

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(score, entry)| RetrievedChunk {
                chunk: entry.chunk.clone(),
                score,
            })
            .collect())
    }
}

fn manifest_path(directory: &Path) -> PathBuf {
    directory.join(MANIFEST_FILE)
}

async fn load_index(directory: &Path) -> Result<(IndexManifest, Vec<IndexEntry>), SearchError> {
    let manifest_raw = tokio::fs::read_to_string(manifest_path(directory)).await?;
    let manifest: IndexManifest = serde_json::from_str(&manifest_raw)?;

    if manifest.format_version != FORMAT_VERSION {
        return Err(SearchError::BackendResponse {
            backend: BACKEND.to_string(),
            details: format!(
                "unsupported index format version {} (expected {FORMAT_VERSION})",
                manifest.format_version
            ),
        });
    }

    let entries_path = directory.join(&manifest.entries_file);
    let raw = match tokio::fs::read_to_string(&entries_path).await {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound && manifest.entry_count == 0 => {
            String::new()
        }
        Err(error) => return Err(error.into()),
    };

    let mut entries = Vec::with_capacity(manifest.entry_count);
    for line in raw.lines().filter(|line| !line.trim().is_empty()) {
        let entry: IndexEntry = serde_json::from_str(line)?;
        if entry.embedding.len() != manifest.dimensions {
            return Err(SearchError::DimensionMismatch {
                expected: manifest.dimensions,
                actual: entry.embedding.len(),
            });
        }
        entries.push(entry);
    }

    if entries.len() != manifest.entry_count {
        return Err(SearchError::BackendResponse {
            backend: BACKEND.to_string(),
            details: format!(
                "manifest lists {} entries but {} were found",
                manifest.entry_count,
                entries.len()
            ),
        });
    }

    Ok((manifest, entries))
}

fn entries_file_name(lines: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(lines.as_bytes()));
    format!("entries-{}.jsonl", &digest[..16])
}

fn is_entries_file(name: &str) -> bool {
    name == ENTRIES_FILE || (name.starts_with("entries-") && name.ends_with(".jsonl"))
}

/// Drops entries files the committed manifest no longer points at.
async fn remove_stale_entries(directory: &Path, live: &str) {
    let mut listing = match tokio::fs::read_dir(directory).await {
        Ok(listing) => listing,
        Err(error) => {
            warn!(%error, directory = %directory.display(), "could not list index directory");
            return;
        }
    };

    while let Ok(Some(item)) = listing.next_entry().await {
        let name = item.file_name().to_string_lossy().to_string();
        if name == live || !is_entries_file(&name) {
            continue;
        }
        if let Err(error) = tokio::fs::remove_file(item.path()).await {
            warn!(%error, file = %name, "could not remove stale entries file");
        }
    }
}

fn summarize_documents(entries: &[IndexEntry]) -> Vec<IndexedDocument> {
    let mut documents = BTreeMap::<&str, IndexedDocument>::new();
    for entry in entries {
        documents
            .entry(entry.chunk.document_id.as_str())
            .or_insert_with(|| IndexedDocument {
                document_id: entry.chunk.document_id.clone(),
                source_path: entry.chunk.source_path.clone(),
                title: entry.chunk.title.clone(),
                chunk_count: 0,
            })
            .chunk_count += 1;
    }

    let mut documents = documents.into_values().collect::<Vec<_>>();
    documents.sort_by(|left, right| match left.source_path.cmp(&right.source_path) {
        Ordering::Equal => left.document_id.cmp(&right.document_id),
        other => other,
    });
    documents
}
