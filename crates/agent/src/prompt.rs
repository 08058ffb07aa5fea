//! Prompt building: system prompt, retrieval query, history window.

use parley_core::message::{Message, Role};
use parley_core::retrieval::RetrievalBundle;

/// Characters of the last assistant text added to later retrieval queries.
pub const QUERY_CONTEXT_CHARS: usize = 300;

/// Instructions followed by the retrieved context, if any.
pub fn build_system_prompt(instructions: &str, bundle: &RetrievalBundle) -> String {
    if bundle.is_empty() {
        return instructions.to_string();
    }

    let mut prompt = String::with_capacity(instructions.len() + bundle.tokens_used * 4 + 64);
    prompt.push_str(instructions);
    prompt.push_str("\n\n[Retrieved Context]\n");
    for chunk in &bundle.selected_chunks {
        prompt.push_str(&format!("[Source: {}] {}\n", chunk.document_id, chunk.text));
    }
    prompt
}

/// The user message on the first round; afterwards the user message plus
/// the tail of the most recent assistant text.
pub fn retrieval_query(user_message: &str, last_assistant_text: Option<&str>) -> String {
    match last_assistant_text.map(str::trim).filter(|t| !t.is_empty()) {
        None => user_message.to_string(),
        Some(text) => {
            let skip = text.chars().count().saturating_sub(QUERY_CONTEXT_CHARS);
            let tail: String = text.chars().skip(skip).collect();
            format!("{user_message}\n{tail}")
        }
    }
}

/// Recent history for the next request, oldest first.
///
/// Messages are windowed by whole rounds: an assistant message travels
/// with every operation result that answers it, so a round is never split.
/// The newest round is always kept even when it alone exceeds `window`,
/// and the latest user message is always kept. System messages are dropped
/// (instructions travel in the system prompt), as are tool messages whose
/// call is no longer in the history.
pub fn window_history(messages: &[Message], window: usize) -> Vec<Message> {
    let mut rounds: Vec<Vec<&Message>> = Vec::new();
    for message in messages.iter().filter(|m| m.role != Role::System) {
        match (message.role == Role::Tool, rounds.last_mut()) {
            (true, Some(round)) => round.push(message),
            (true, None) => {}
            (false, _) => rounds.push(vec![message]),
        }
    }

    let mut kept = 0;
    let mut used = 0;
    for round in rounds.iter().rev() {
        if kept > 0 && used + round.len() > window {
            break;
        }
        used += round.len();
        kept += 1;
    }
    let first_kept = rounds.len() - kept;

    let anchor = rounds[..first_kept]
        .iter()
        .rposition(|round| round[0].role == Role::User)
        .filter(|_| !rounds[first_kept..].iter().any(|r| r[0].role == Role::User));

    anchor
        .into_iter()
        .chain(first_kept..rounds.len())
        .flat_map(|i| rounds[i].iter().map(|m| (*m).clone()))
        .collect()
}
