//! Plain-text rendering of stored messages.

use nearmeet_types::ChatMessage;

const ELLIPSIS: &str = "...";

/// `[HH:MM:SS] sender: content`, with the time in UTC.
pub fn display_line(message: &ChatMessage) -> String {
    format!(
        "[{}] {}: {}",
        message.timestamp.format("%H:%M:%S"),
        message.sender,
        message.content
    )
}

/// Shorten `text` to at most `max_chars` characters, ending in `...` when
/// anything was cut. Limits too small to fit the ellipsis keep a bare
/// prefix instead.
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars <= ELLIPSIS.len() {
        return text.chars().take(max_chars).collect();
    }
    let keep = max_chars - ELLIPSIS.len();
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    out
}
