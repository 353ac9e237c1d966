//! Prompt assembly: fixed template filled with retrieved context and the question.

use crate::RetrievedChunk;
use std::collections::BTreeSet;

/// Instruction lines sent verbatim with every question.
pub const INSTRUCTIONS: &str = "Réponds à la question en te basant uniquement sur le contexte fourni. \nSi tu ne sais pas, dis que tu ne sais pas.\n";

pub const CONTEXT_SEPARATOR: &str = "\n\n";

/// Retrieved chunk texts, in retrieval order.
pub fn format_context(retrieved: &[RetrievedChunk]) -> String {
    retrieved
        .iter()
        .map(|hit| hit.chunk.text.as_str())
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}

pub fn build_prompt(context: &str, question: &str) -> String {
    format!("{INSTRUCTIONS}Contexte: {context}\nQuestion: {question}\n")
}

/// Distinct base file names of the retrieved chunks, sorted.
pub fn collect_sources(retrieved: &[RetrievedChunk]) -> Vec<String> {
    retrieved
        .iter()
        .map(|hit| hit.chunk.source_name())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
