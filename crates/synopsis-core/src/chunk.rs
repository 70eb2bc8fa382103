//! Paragraph-boundary text splitting for the encoding stage.
//!
//! Long sources are split into [`TextChunk`]s no larger than a token budget
//! so each piece can be summarized on its own. Splits prefer paragraph
//! boundaries (`\n\n`); a paragraph that is larger than the budget on its
//! own is cut at the last newline or space before the limit.
//!
//! Token counts are approximated at four characters per token.
//!
//! ```rust
//! use synopsis_core::chunk::split_text;
//!
//! let chunks = split_text("First paragraph.\n\nSecond paragraph.", 512);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].index, 0);
//! ```

use serde::{Deserialize, Serialize};

use crate::identity::source_identity;

const CHARS_PER_TOKEN: usize = 4;

/// One piece of an encoded source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    /// Position within the source, contiguous from 0.
    pub index: usize,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// Split `text` into chunks of at most `max_tokens` (approximate) tokens.
///
/// Always returns at least one chunk, even for empty input.
pub fn split_text(text: &str, max_tokens: usize) -> Vec<TextChunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut out = ChunkSink::default();
    let mut buf = String::new();

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let joined_len = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };
        if joined_len > max_chars && !buf.is_empty() {
            out.push(&buf);
            buf.clear();
        }

        if para.len() > max_chars {
            hard_split(para, max_chars, &mut out);
            continue;
        }

        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(para);
    }

    if !buf.is_empty() {
        out.push(&buf);
    }
    if out.chunks.is_empty() {
        out.push(text.trim());
    }
    out.chunks
}

#[derive(Default)]
struct ChunkSink {
    chunks: Vec<TextChunk>,
}

impl ChunkSink {
    fn push(&mut self, text: &str) {
        self.chunks.push(TextChunk {
            index: self.chunks.len(),
            text: text.to_string(),
            hash: source_identity(text),
        });
    }
}

/// Cut an oversized paragraph at whitespace boundaries.
fn hard_split(para: &str, max_chars: usize, out: &mut ChunkSink) {
    let mut rest = para;
    while !rest.is_empty() {
        if rest.len() <= max_chars {
            if !rest.trim().is_empty() {
                out.push(rest.trim());
            }
            break;
        }
        let limit = floor_char_boundary(rest, max_chars);
        let cut = rest[..limit]
            .rfind(['\n', ' '])
            .map(|pos| pos + 1)
            .unwrap_or(limit);
        // A single character wider than the budget still has to move forward.
        let cut = if cut == 0 {
            rest.chars().next().map(char::len_utf8).unwrap_or(rest.len())
        } else {
            cut
        };
        let piece = rest[..cut].trim();
        if !piece.is_empty() {
            out.push(piece);
        }
        rest = &rest[cut..];
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
