//! Token-window text chunker.
//!
//! Splits document text into overlapping windows sized in tokens, where a
//! token is an ASCII alphanumeric run or a single non-whitespace character
//! (so CJK text tokenizes per character, approximating the embedding
//! model's subword segmentation). Window edges prefer clean boundaries:
//! paragraph break, then line break, then sentence punctuation, then comma,
//! then space, then a hard cut at the token limit.

pub const DEFAULT_MAX_TOKENS: usize = 512;
pub const DEFAULT_OVERLAP_TOKENS: usize = 128;

#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        ChunkParams {
            max_tokens: DEFAULT_MAX_TOKENS,
            overlap_tokens: DEFAULT_OVERLAP_TOKENS,
        }
    }
}

/// Split `text` into overlapping token windows.
///
/// Empty or whitespace-only input yields no chunks. Text that fits in one
/// window comes back as a single chunk.
pub fn chunk(text: &str, params: ChunkParams) -> Vec<String> {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return Vec::new();
    }

    let max_tokens = params.max_tokens.max(1);
    let overlap = params.overlap_tokens.min(max_tokens - 1);

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < tokens.len() {
        let end = (start + max_tokens).min(tokens.len());
        let mut cut = end;

        if end < tokens.len() {
            let window = &text[tokens[start].0..tokens[end - 1].1];
            if let Some(boundary) = boundary_cut(window) {
                let absolute = tokens[start].0 + boundary;
                // Last token that still ends at or before the boundary.
                let mut candidate = end;
                while candidate > start + 1 && tokens[candidate - 1].1 > absolute {
                    candidate -= 1;
                }
                cut = candidate;
            }
        }

        let piece = text[tokens[start].0..tokens[cut - 1].1].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }

        if cut >= tokens.len() {
            break;
        }
        start = cut.saturating_sub(overlap).max(start + 1);
    }

    chunks
}

/// Byte ranges of tokens: ASCII alphanumeric runs, or one char each for
/// everything else that is not whitespace.
fn tokenize(text: &str) -> Vec<(usize, usize)> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        if c.is_whitespace() {
            continue;
        }
        let mut end = start + c.len_utf8();
        if c.is_ascii_alphanumeric() {
            while let Some(&(next_start, next)) = chars.peek() {
                if next.is_ascii_alphanumeric() {
                    end = next_start + next.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
        }
        tokens.push((start, end));
    }

    tokens
}

const SENTENCE_ENDERS: [char; 6] = ['.', '!', '?', '\u{3002}', '\u{ff01}', '\u{ff1f}'];
const CLAUSE_BREAKS: [char; 3] = [',', '\u{3001}', '\u{ff0c}'];

/// Find the best cut position (byte index past the boundary) in the tail
/// of a window, or `None` to cut hard at the token limit. Only the last
/// fifth of the window is searched so short windows are not produced.
fn boundary_cut(window: &str) -> Option<usize> {
    let mut tail_start = window.len() * 4 / 5;
    while tail_start < window.len() && !window.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    let tail = &window[tail_start..];

    if let Some(pos) = tail.rfind("\n\n") {
        return Some(tail_start + pos + 2);
    }
    if let Some(pos) = tail.rfind('\n') {
        return Some(tail_start + pos + 1);
    }
    if let Some(pos) = rfind_char(tail, &SENTENCE_ENDERS) {
        return Some(tail_start + pos);
    }
    if let Some(pos) = rfind_char(tail, &CLAUSE_BREAKS) {
        return Some(tail_start + pos);
    }
    if let Some(pos) = tail.rfind(' ') {
        return Some(tail_start + pos + 1);
    }
    None
}

/// Byte position just past the last occurrence of any of `needles`.
fn rfind_char(haystack: &str, needles: &[char]) -> Option<usize> {
    haystack
        .char_indices()
        .rev()
        .find(|(_, c)| needles.contains(c))
        .map(|(idx, c)| idx + c.len_utf8())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(max_tokens: usize, overlap_tokens: usize) -> ChunkParams {
        ChunkParams {
            max_tokens,
            overlap_tokens,
        }
    }

    #[test]
    fn empty_and_whitespace_yield_nothing() {
        assert!(chunk("", ChunkParams::default()).is_empty());
        assert!(chunk("   \n\t  ", ChunkParams::default()).is_empty());
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = chunk("hello world", ChunkParams::default());
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn long_text_produces_overlapping_windows() {
        let text = (0..40)
            .map(|i| format!("word{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk(&text, params(10, 3));

        assert!(chunks.len() > 2);
        // Each successor repeats the tail of its predecessor.
        for pair in chunks.windows(2) {
            let prev_last = pair[0].split_whitespace().last().unwrap();
            assert!(
                pair[1].contains(prev_last),
                "chunk {:?} should overlap with {:?}",
                pair[1],
                pair[0]
            );
        }
        // Full coverage: every word appears somewhere.
        let joined = chunks.join(" ");
        for i in 0..40 {
            assert!(joined.contains(&format!("word{i}")));
        }
    }

    #[test]
    fn prefers_paragraph_boundary() {
        // 14 tokens per paragraph; the paragraph break lands in the tail of
        // the first 16-token window, so the window ends at the break.
        let para: String = (0..14)
            .map(|i| format!("alpha{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        let text = format!("{para}\n\n{para}\n\n{para}");
        let chunks = chunk(&text, params(16, 0));

        assert!(!chunks[0].contains('\n'), "chunk: {:?}", chunks[0]);
        assert!(chunks[0].ends_with("alpha13"));
    }

    #[test]
    fn falls_back_to_sentence_boundary() {
        let text = "One two three four five. Six seven eight nine ten eleven twelve";
        let chunks = chunk(text, params(7, 0));
        assert!(chunks[0].ends_with('.'), "chunk: {:?}", chunks[0]);
    }

    #[test]
    fn cjk_text_tokenizes_per_character() {
        let text = "\u{4f60}\u{597d}\u{4e16}\u{754c}";
        let chunks = chunk(text, params(2, 0));
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn deterministic() {
        let text = "Paragraph one.\n\nParagraph two is a bit longer than one.\n\nThree.";
        let a = chunk(text, params(6, 2));
        let b = chunk(text, params(6, 2));
        assert_eq!(a, b);
    }
}
