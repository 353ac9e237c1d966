use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder reported as a source when a chunk carries no source path.
pub const UNKNOWN_SOURCE: &str = "Inconnu";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentFingerprint {
    pub document_id: String,
    pub document_title: String,
    pub source_path: String,
    pub checksum: String,
    pub page_count: u32,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PdfChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub source_path: String,
    pub title: String,
    pub page: u32,
    pub chunk_index: u64,
    /// Char offset of the chunk inside its page text.
    pub start_offset: usize,
    pub text: String,
}

impl PdfChunk {
    /// Base file name of the source, or [`UNKNOWN_SOURCE`] when there is none.
    pub fn source_name(&self) -> String {
        let trimmed = self.source_path.trim();
        if trimmed.is_empty() {
            return UNKNOWN_SOURCE.to_string();
        }

        std::path::Path::new(trimmed)
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| UNKNOWN_SOURCE.to_string())
    }
}

/// One persisted row of the vector index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    pub chunk: PdfChunk,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk: PdfChunk,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Drop whatever the index held before.
    #[default]
    Replace,
    /// Keep existing entries, replacing only those of re-ingested documents.
    Append,
}

impl std::str::FromStr for WriteMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "append" => Ok(Self::Append),
            other => Err(format!("unknown write mode `{other}` (expected replace or append)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub chunk_max_chars: usize,
    pub chunk_overlap_chars: usize,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunk_max_chars: 1_000,
            chunk_overlap_chars: 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_with_source(source_path: &str) -> PdfChunk {
        PdfChunk {
            chunk_id: "c".to_string(),
            document_id: "d".to_string(),
            source_path: source_path.to_string(),
            title: String::new(),
            page: 1,
            chunk_index: 0,
            start_offset: 0,
            text: "text".to_string(),
        }
    }

    #[test]
    fn source_name_is_the_base_file_name() {
        let chunk = chunk_with_source("./data/reports/Data.pdf");
        assert_eq!(chunk.source_name(), "Data.pdf");
    }

    #[test]
    fn empty_source_falls_back_to_placeholder() {
        let chunk = chunk_with_source("   ");
        assert_eq!(chunk.source_name(), UNKNOWN_SOURCE);
    }

    #[test]
    fn write_mode_parses_case_insensitively() {
        assert_eq!("Append".parse::<WriteMode>(), Ok(WriteMode::Append));
        assert_eq!("replace".parse::<WriteMode>(), Ok(WriteMode::Replace));
        assert!("merge".parse::<WriteMode>().is_err());
    }
}
