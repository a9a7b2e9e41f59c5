// Text chunking over a lossless word-bound tokenizer.
//
// Tokens are Unicode word bounds, so concatenating a token slice
// reproduces the source text exactly, whitespace included. Two chunking
// modes exist and number their chunks differently: fixed token windows
// carry the starting token offset, character-split chunks carry their
// position in the final chunk list.

#[cfg(test)]
mod tests;

use unicode_segmentation::UnicodeSegmentation;

pub const DEFAULT_CHUNK_TOKEN_SIZE: usize = 1200;
pub const DEFAULT_CHUNK_OVERLAP: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub content: String,
    pub chunk_index: u64,
    pub token_count: usize,
}

/// Split text into word-bound tokens. `detokenize` of the result is the
/// identity.
#[inline]
pub fn tokenize(text: &str) -> Vec<&str> {
    text.split_word_bounds().collect()
}

#[inline]
pub fn detokenize(tokens: &[&str]) -> String {
    tokens.concat()
}

#[inline]
pub fn token_count(text: &str) -> usize {
    text.split_word_bounds().count()
}

/// Chunk a document.
///
/// With `split_by_character` unset, the text is cut into fixed windows
/// of `chunk_token_size` tokens advancing by `chunk_token_size -
/// chunk_overlap`, and each chunk's `chunk_index` is its starting token
/// offset. With a split character, the text is split on it first,
/// oversized pieces are re-cut into token windows, and `chunk_index` is
/// the chunk's position in the final list.
#[inline]
pub fn chunk_text(
    text: &str,
    chunk_token_size: usize,
    chunk_overlap: usize,
    split_by_character: Option<&str>,
) -> Vec<TextChunk> {
    let size = chunk_token_size.max(1);
    let overlap = chunk_overlap.min(size.saturating_sub(1));

    match split_by_character {
        Some(sep) if !sep.is_empty() => chunk_by_character(text, sep, size, overlap),
        _ => chunk_by_tokens(text, size, overlap),
    }
}

fn chunk_by_tokens(text: &str, size: usize, overlap: usize) -> Vec<TextChunk> {
    let tokens = tokenize(text);
    let step = size - overlap;

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < tokens.len() {
        let end = (start + size).min(tokens.len());
        let window = &tokens[start..end];
        chunks.push(TextChunk {
            content: detokenize(window),
            chunk_index: start as u64,
            token_count: window.len(),
        });
        start += step;
    }
    chunks
}

fn chunk_by_character(text: &str, sep: &str, size: usize, overlap: usize) -> Vec<TextChunk> {
    let mut pieces: Vec<(String, usize)> = Vec::new();

    for raw in text.split(sep) {
        if raw.is_empty() {
            continue;
        }
        let tokens = tokenize(raw);
        if tokens.len() <= size {
            pieces.push((raw.to_string(), tokens.len()));
            continue;
        }

        // Oversized piece: fall back to token windows within it.
        let step = size - overlap;
        let mut start = 0;
        while start < tokens.len() {
            let end = (start + size).min(tokens.len());
            let window = &tokens[start..end];
            pieces.push((detokenize(window), window.len()));
            start += step;
        }
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(i, (content, token_count))| TextChunk {
            content,
            chunk_index: i as u64,
            token_count,
        })
        .collect()
}
