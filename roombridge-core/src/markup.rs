// ABOUTME: Text helpers for chat messages: markdown rendering, character-safe truncation and chunking.
// ABOUTME: Also strips rich-reply quote fallbacks from inbound bodies.

use pulldown_cmark::{html, Options, Parser};

/// Default maximum message size (chars)
pub const MAX_CHUNK_SIZE: usize = 8000;

/// Convert markdown to HTML for formatted messages
pub fn markdown_to_html(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TABLES);
    let parser = Parser::new_ext(markdown, options);
    let mut html_output = String::new();
    html::push_html(&mut html_output, parser);
    html_output
}

/// Truncate to at most `max_chars` characters, ending in "..." when cut.
/// Counts characters, not bytes, so multi-byte text never splits.
/// Caps of three or fewer are hard cuts with no ellipsis.
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    let mut indices = s.char_indices();
    match indices.nth(max_chars) {
        None => s.to_string(),
        Some((limit, _)) if max_chars <= 3 => s[..limit].to_string(),
        Some(_) => {
            let keep = max_chars - 3;
            let end = s.char_indices().nth(keep).map(|(i, _)| i).unwrap_or(s.len());
            format!("{}...", &s[..end])
        }
    }
}

/// Split long text into chunks of at most `max_chars` characters,
/// preferring line breaks, then spaces, then a hard cut
pub fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.chars().count() > max_chars {
        // Byte offset just past the max_chars-th character
        let limit = rest
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let window = &rest[..limit];

        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(limit);

        let chunk = rest[..cut].trim_end();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        rest = rest[cut..].trim_start_matches(['\n', ' ']);
    }

    if !rest.trim().is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Prefix each chunk with "[Part i/n]" when there is more than one
pub fn label_parts(chunks: Vec<String>) -> Vec<String> {
    let total = chunks.len();
    if total <= 1 {
        return chunks;
    }
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| format!("[Part {}/{}]\n{}", i + 1, total, chunk))
        .collect()
}

/// Drop the leading "> " quote block a client adds when replying to a message
pub fn strip_reply_fallback(body: &str) -> &str {
    if !body.starts_with("> ") {
        return body;
    }
    let mut offset = 0;
    for line in body.split_inclusive('\n') {
        if line.starts_with('>') {
            offset += line.len();
        } else {
            break;
        }
    }
    body[offset..].trim_start_matches('\n')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello world", 8), "hello...");
    }

    #[test]
    fn test_truncate_tiny_caps_never_exceed_limit() {
        assert_eq!(truncate_str("abcdef", 2), "ab");
        assert_eq!(truncate_str("abcdef", 3), "abc");
        assert_eq!(truncate_str("abcdef", 0), "");
        assert_eq!(truncate_str("日本語", 1), "日");
        assert_eq!(truncate_str("abcdef", 4), "a...");
    }

    #[test]
    fn test_truncate_multibyte() {
        let s = "日本語のテキスト".repeat(10);
        let out = truncate_str(&s, 7);
        assert_eq!(out.chars().count(), 7);
        assert!(out.ends_with("..."));
        assert_eq!(truncate_str("🦀🦀", 2), "🦀🦀");
    }

    #[test]
    fn test_chunk_short_message_untouched() {
        assert_eq!(chunk_message("hi", 10), vec!["hi".to_string()]);
    }

    #[test]
    fn test_chunk_prefers_line_breaks() {
        let chunks = chunk_message("aaaa\nbbbb\ncccc", 10);
        assert_eq!(chunks, vec!["aaaa\nbbbb".to_string(), "cccc".to_string()]);
    }

    #[test]
    fn test_chunk_hard_cuts_long_words_on_char_boundaries() {
        let text = "é".repeat(25);
        let chunks = chunk_message(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_label_parts() {
        let labeled = label_parts(vec!["a".into(), "b".into()]);
        assert_eq!(labeled[0], "[Part 1/2]\na");
        assert_eq!(labeled[1], "[Part 2/2]\nb");
        assert_eq!(label_parts(vec!["solo".into()]), vec!["solo".to_string()]);
    }

    #[test]
    fn test_strip_reply_fallback() {
        let body = "> <@alice:example.org> earlier message\n> more\n\nactual reply";
        assert_eq!(strip_reply_fallback(body), "actual reply");
        assert_eq!(strip_reply_fallback("plain text"), "plain text");
    }

    #[test]
    fn test_markdown_to_html() {
        assert_eq!(markdown_to_html("**bold**"), "<p><strong>bold</strong></p>\n");
    }
}
