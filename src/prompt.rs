//! Prompt rendering for tier templates
//!
//! Templates carry `{instructions}`, `{history}`, `{context}` and `{question}`
//! slots. Context blocks are labeled `[n]` so answers can cite them.

use crate::memory::Exchange;
use crate::retrieval::RetrievalResult;

/// Context placeholder when nothing was retrieved
pub const NO_CONTEXT: &str = "(no context)";
const NO_HISTORY: &str = "(no history)";
const HISTORY_ANSWER_CHARS: usize = 300;

pub const DOCUMENT_INSTRUCTIONS: &str = "You answer questions for a company knowledge assistant. Use only the numbered context blocks and cite them as [n]. If the context does not contain the answer, say so.";

pub const BUSINESS_INSTRUCTIONS: &str = "You summarize sales activity analysis. The figures in the context are final; do not recompute or invent numbers.";

pub const MIXED_INSTRUCTIONS: &str = "The question touches both technical documents and business activity. Answer each part from its own labeled context and keep them apart.";

/// Fill a tier template
pub fn render(
    template: &str,
    instructions: &str,
    history: &[Exchange],
    context: &str,
    question: &str,
) -> String {
    let context = if context.trim().is_empty() {
        NO_CONTEXT
    } else {
        context
    };

    template
        .replace("{instructions}", instructions)
        .replace("{history}", &format_history(history))
        .replace("{context}", context)
        .replace("{question}", question.trim())
}

/// Prior exchanges, oldest first
pub fn format_history(history: &[Exchange]) -> String {
    if history.is_empty() {
        return NO_HISTORY.to_string();
    }

    history
        .iter()
        .map(|exchange| {
            let answer: String = exchange.answer.chars().take(HISTORY_ANSWER_CHARS).collect();
            format!("Q: {}\nA: {}", exchange.question.trim(), answer.trim())
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Numbered document blocks for a retrieval result
pub fn document_context(result: &RetrievalResult) -> String {
    result
        .chunks
        .iter()
        .enumerate()
        .map(|(i, retrieved)| {
            format!(
                "[{}] {} ({})\n{}",
                i + 1,
                retrieved.provenance.doc_name,
                retrieved.provenance.scope,
                retrieved.chunk.text.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
