/// Telegram's limit for message text, in characters.
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Telegram's limit for media captions, in characters.
pub const CAPTION_LIMIT: usize = 1024;

/// Split `text` into pieces of at most `max_chars` characters.
///
/// Breaks at the last newline inside the window, else the last space, else
/// hard at the limit. The separator a piece was split on is dropped.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let window_end = rest
            .char_indices()
            .nth(max_chars)
            .map_or(rest.len(), |(i, _)| i);
        if window_end == rest.len() {
            chunks.push(rest.to_string());
            break;
        }

        let window = &rest[..window_end];
        match window.rfind('\n').or_else(|| window.rfind(' ')) {
            Some(at) if at > 0 => {
                chunks.push(rest[..at].to_string());
                rest = &rest[at + 1..];
            },
            _ => {
                chunks.push(window.to_string());
                rest = &rest[window_end..];
            },
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("", 10, &[])]
    #[case("short", 10, &["short"])]
    #[case("exactly10!", 10, &["exactly10!"])]
    #[case("first line\nsecond", 12, &["first line", "second"])]
    #[case("one two three", 8, &["one two", "three"])]
    #[case("abcdefghij", 4, &["abcd", "efgh", "ij"])]
    fn splits(#[case] text: &str, #[case] max: usize, #[case] expected: &[&str]) {
        assert_eq!(chunk_text(text, max), expected);
    }

    #[test]
    fn counts_characters_not_bytes() {
        let text = "л".repeat(5);
        let chunks = chunk_text(&text, 2);
        assert_eq!(chunks, vec!["лл", "лл", "л"]);
    }

    #[test]
    fn every_chunk_respects_limit() {
        let text = "lorem ipsum dolor sit amet ".repeat(400);
        for chunk in chunk_text(&text, MAX_MESSAGE_LEN) {
            assert!(chunk.chars().count() <= MAX_MESSAGE_LEN);
        }
    }
}
