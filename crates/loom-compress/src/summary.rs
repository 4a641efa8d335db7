//! Extractive summaries and safe truncation.
//!
//! Summaries here are deterministic and cheap: counts plus the opening and
//! closing lines of what was elided. A caller wanting something better puts
//! it in `CompressionHint::suggested_summary`.

use crate::element::ConversationMessage;

const ELLIPSIS: char = '…';

/// `text` cut to at most `max_chars` characters, ending in `…` when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }
    let end = text
        .char_indices()
        .nth(max_chars - 1)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let mut out = text[..end].trim_end().to_string();
    out.push(ELLIPSIS);
    out
}

fn first_line(text: &str) -> &str {
    text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}

/// Summary of free text: its first non-empty line, truncated.
pub fn summarize_text(text: &str, max_chars: usize) -> String {
    truncate_chars(first_line(text), max_chars)
}

/// Summary of a run of messages: how many, and how it opened and closed.
pub fn summarize_messages<'a>(
    messages: impl IntoIterator<Item = &'a ConversationMessage>,
    max_chars: usize,
) -> String {
    let messages: Vec<&ConversationMessage> = messages.into_iter().collect();
    let body = match messages.as_slice() {
        [] => return "[nothing elided]".to_string(),
        [only] => first_line(&only.text).to_string(),
        [first, .., last] => format!("{} … {}", first_line(&first.text), first_line(&last.text)),
    };
    let noun = if messages.len() == 1 { "message" } else { "messages" };
    truncate_chars(&format!("[{} {noun} elided] {body}", messages.len()), max_chars)
}
