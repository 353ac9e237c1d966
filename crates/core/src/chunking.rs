use crate::error::IngestError;
use crate::models::{DocumentFingerprint, IngestionOptions, PdfChunk};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;

/// Boundaries tried from coarsest to finest. The empty separator splits into chars.
pub const DEFAULT_SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
}

impl From<&IngestionOptions> for ChunkingConfig {
    fn from(value: &IngestionOptions) -> Self {
        Self {
            max_chars: value.chunk_max_chars,
            overlap_chars: value.chunk_overlap_chars,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.max_chars == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk size must be greater than zero".to_string(),
            ));
        }
        if self.overlap_chars >= self.max_chars {
            return Err(IngestError::InvalidChunkConfig(format!(
                "chunk overlap {} must be smaller than chunk size {}",
                self.overlap_chars, self.max_chars
            )));
        }
        Ok(())
    }
}

/// Splits `text` into pieces of at most `max_chars` chars, preferring paragraph,
/// then line, then word boundaries, with up to `overlap_chars` carried between
/// neighbours.
pub fn split_text(text: &str, config: ChunkingConfig) -> Vec<String> {
    split_recursive(text, &DEFAULT_SEPARATORS, config)
}

fn split_recursive(text: &str, separators: &[&str], config: ChunkingConfig) -> Vec<String> {
    let (separator, finer) = pick_separator(text, separators);
    let mut chunks = Vec::new();
    let mut fitting: Vec<(String, usize)> = Vec::new();

    for piece in split_keeping_separator(text, separator) {
        let length = char_len(&piece);
        if length < config.max_chars {
            fitting.push((piece, length));
            continue;
        }

        if !fitting.is_empty() {
            chunks.extend(merge_pieces(&fitting, config));
            fitting.clear();
        }

        if finer.is_empty() {
            chunks.push(piece);
        } else {
            chunks.extend(split_recursive(&piece, finer, config));
        }
    }

    if !fitting.is_empty() {
        chunks.extend(merge_pieces(&fitting, config));
    }

    chunks
}

fn pick_separator<'s, 'a>(text: &str, separators: &'s [&'a str]) -> (&'a str, &'s [&'a str]) {
    for (position, separator) in separators.iter().copied().enumerate() {
        if separator.is_empty() {
            return (separator, &[]);
        }
        if text.contains(separator) {
            return (separator, &separators[position + 1..]);
        }
    }
    ("", &[])
}

/// The separator stays attached to the start of the piece that follows it.
fn split_keeping_separator(text: &str, separator: &str) -> Vec<String> {
    if separator.is_empty() {
        return text.chars().map(String::from).collect();
    }

    let mut pieces = Vec::new();
    for (position, part) in text.split(separator).enumerate() {
        if position == 0 {
            if !part.is_empty() {
                pieces.push(part.to_string());
            }
            continue;
        }
        pieces.push(format!("{separator}{part}"));
    }
    pieces
}

fn merge_pieces(pieces: &[(String, usize)], config: ChunkingConfig) -> Vec<String> {
    let mut merged = Vec::new();
    let mut window: VecDeque<&(String, usize)> = VecDeque::new();
    let mut total = 0usize;

    for piece in pieces {
        let length = piece.1;
        if total + length > config.max_chars && !window.is_empty() {
            if let Some(chunk) = join_trimmed(&window) {
                merged.push(chunk);
            }

            while total > config.overlap_chars || (total + length > config.max_chars && total > 0) {
                match window.pop_front() {
                    Some(dropped) => total -= dropped.1,
                    None => break,
                }
            }
        }

        window.push_back(piece);
        total += length;
    }

    if let Some(chunk) = join_trimmed(&window) {
        merged.push(chunk);
    }

    merged
}

fn join_trimmed(window: &VecDeque<&(String, usize)>) -> Option<String> {
    let joined = window.iter().map(|piece| piece.0.as_str()).collect::<String>();
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

pub fn build_chunks(
    document: &DocumentFingerprint,
    page: u32,
    page_text: &str,
    options: &IngestionOptions,
    global_index: u64,
) -> Result<(Vec<PdfChunk>, u64), IngestError> {
    let config = ChunkingConfig::from(options);
    config.validate()?;

    let mut chunks = Vec::new();
    let mut cursor = global_index;
    let mut search_from = 0usize;

    for text in split_text(page_text, config) {
        let start_offset = match page_text[search_from..].find(&text) {
            Some(found) => {
                let byte_start = search_from + found;
                search_from = next_char_boundary(page_text, byte_start);
                page_text[..byte_start].chars().count()
            }
            None => 0,
        };

        chunks.push(PdfChunk {
            chunk_id: make_chunk_id(&document.document_id, page, cursor, &text),
            document_id: document.document_id.clone(),
            source_path: document.source_path.clone(),
            title: document.document_title.clone(),
            page,
            chunk_index: cursor,
            start_offset,
            text,
        });

        cursor = cursor.saturating_add(1);
    }

    Ok((chunks, cursor))
}

fn next_char_boundary(text: &str, byte_index: usize) -> usize {
    text[byte_index..]
        .chars()
        .next()
        .map(|ch| byte_index + ch.len_utf8())
        .unwrap_or(text.len())
}

fn make_chunk_id(document_id: &str, page: u32, index: u64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(page.to_le_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
