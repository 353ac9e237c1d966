use crate::{build_chunks, extract_page_texts, DocumentFingerprint, IngestError, IngestionOptions, PdfChunk};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// A single PDF, or every PDF below a folder.
pub fn resolve_inputs(path: &Path) -> Result<Vec<PathBuf>, IngestError> {
    if !path.exists() {
        return Err(IngestError::MissingInput(path.display().to_string()));
    }

    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let files = discover_pdf_files(path);
    if files.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "no pdf files found in {}",
            path.display()
        )));
    }
    Ok(files)
}

#[derive(Debug, Clone)]
pub struct IngestionReport {
    pub documents: Vec<DocumentFingerprint>,
    pub chunks: Vec<PdfChunk>,
    pub page_count: usize,
}

/// Extracts and chunks every input PDF. Any failure aborts the whole run.
pub fn load_pdf_chunks(path: &Path, options: &IngestionOptions) -> Result<IngestionReport, IngestError> {
    let files = resolve_inputs(path)?;

    let mut documents = Vec::with_capacity(files.len());
    let mut chunks = Vec::new();
    let mut page_count = 0usize;
    let mut cursor = 0u64;

    for file in files {
        // One document id per file, however its path was spelled.
        let file = fs::canonicalize(&file)?;
        info!(path = %file.display(), "loading pdf");
        let pages = extract_page_texts(&file)?;
        let fingerprint = build_document_fingerprint(&file, pages.len() as u32)?;

        for page in &pages {
            let (page_chunks, next_cursor) =
                build_chunks(&fingerprint, page.number, &page.text, options, cursor)?;
            debug!(page = page.number, chunks = page_chunks.len(), "page chunked");
            cursor = next_cursor;
            chunks.extend(page_chunks);
        }

        page_count += pages.len();
        documents.push(fingerprint);
    }

    Ok(IngestionReport {
        documents,
        chunks,
        page_count,
    })
}

fn build_document_fingerprint(path: &Path, page_count: u32) -> Result<DocumentFingerprint, IngestError> {
    let checksum = digest_file(path)?;
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            IngestError::MissingFileName(format!("path missing filename: {}", path.display()))
        })?;

    Ok(DocumentFingerprint {
        document_id: generate_document_id(path),
        document_title: name.to_string(),
        source_path: path.to_string_lossy().to_string(),
        checksum,
        page_count,
        ingested_at: Utc::now(),
    })
}

fn generate_document_id(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}
