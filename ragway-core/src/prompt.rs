//! Grounding prompt assembly.

use crate::types::{ChatMessage, Hit};
use std::fmt::Write;

/// Persona used when the configuration does not set one.
pub const DEFAULT_PERSONA: &str = "You are a study assistant for the knowledge base.";

/// Rules appended to the persona in every system prompt.
pub const CITATION_RULES: &str = "Answer only from the numbered [Sources]; if they do not cover the question, say you do not know.\n\
Requirements:\n\
1) Give the conclusion first.\n\
2) End the answer with the numbers of the sources you used, e.g. [1][3].\n\
3) Never invent content that is not in the sources.";

/// Build the user prompt: the question followed by every hit numbered
/// `[1]`, `[2]`, ... in retrieval order.
pub fn build_prompt(query: &str, hits: &[Hit]) -> String {
    let mut prompt = format!("Question: {query}\n\n[Sources]\n");
    for (i, hit) in hits.iter().enumerate() {
        let _ = writeln!(prompt, "[{}] {}", i + 1, hit.text);
    }
    prompt
}

/// System message followed by the user prompt.
pub fn build_messages(persona: &str, query: &str, hits: &[Hit]) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(format!("{persona}\n{CITATION_RULES}")),
        ChatMessage::user(build_prompt(query, hits)),
    ]
}
