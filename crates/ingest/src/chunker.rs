use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

use crate::chunk::{tokens_for_words, Chunk};
use extract::KeywordExtractor;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerConfig {
    pub target_tokens_max: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_tokens_max: 900,
            overlap_tokens: 100,
        }
    }
}

/// A contiguous byte range of the document that is never split further.
#[derive(Debug, Clone, Copy)]
struct Piece {
    start: usize,
    end: usize,
    words: usize,
    heading: bool,
}

pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn chunk_text(
        &self,
        doc_id: &str,
        text: &str,
        source: &str,
        extractor: &KeywordExtractor,
    ) -> Vec<Chunk> {
        self.spans(text)
            .into_iter()
            .enumerate()
            .map(|(ordinal, (start, end))| {
                let span = &text[start..end];
                Chunk::new(
                    doc_id.to_string(),
                    ordinal,
                    span.to_string(),
                    source.to_string(),
                    (start, end),
                    extractor.extract(span),
                )
            })
            .collect()
    }

    /// Byte ranges of the chunks, in document order.
    ///
    /// Headings start a new chunk. Paragraphs are packed up to
    /// `target_tokens_max`; an over-long paragraph is split by sentences and an
    /// over-long sentence by words. Consecutive chunks in the same section
    /// share up to `overlap_tokens` of trailing pieces.
    pub fn spans(&self, text: &str) -> Vec<(usize, usize)> {
        let pieces = self.pieces(text);
        let max = self.config.target_tokens_max.max(1);

        let mut spans = Vec::new();
        let mut buffer: Vec<Piece> = Vec::new();
        let mut buffer_words = 0;

        for piece in pieces {
            if !buffer.is_empty()
                && (piece.heading || tokens_for_words(buffer_words + piece.words) > max)
            {
                spans.push((buffer[0].start, buffer[buffer.len() - 1].end));

                let carry = if piece.heading {
                    Vec::new()
                } else {
                    self.overlap_tail(&buffer, piece.words, max)
                };
                buffer_words = carry.iter().map(|p| p.words).sum();
                buffer = carry;
            }
            buffer_words += piece.words;
            buffer.push(piece);
        }

        if let (Some(first), Some(last)) = (buffer.first(), buffer.last()) {
            spans.push((first.start, last.end));
        }

        spans
    }

    /// Trailing pieces of a flushed buffer to repeat at the start of the next chunk.
    fn overlap_tail(&self, buffer: &[Piece], next_words: usize, max: usize) -> Vec<Piece> {
        let mut taken = 0;
        let mut words = 0;
        for piece in buffer.iter().rev() {
            if taken + 1 >= buffer.len()
                || tokens_for_words(words + piece.words) > self.config.overlap_tokens
            {
                break;
            }
            taken += 1;
            words += piece.words;
        }

        let mut carry: Vec<Piece> = buffer[buffer.len() - taken..].to_vec();
        while !carry.is_empty() && tokens_for_words(words + next_words) > max {
            words -= carry.remove(0).words;
        }
        carry
    }

    fn pieces(&self, text: &str) -> Vec<Piece> {
        let max = self.config.target_tokens_max.max(1);
        let mut pieces = Vec::new();

        for (start, end, heading) in split_paragraphs(text) {
            let paragraph = &text[start..end];
            let words = word_count(paragraph);
            if tokens_for_words(words) <= max {
                pieces.push(Piece { start, end, words, heading });
                continue;
            }

            let mut first = heading;
            for (offset, sentence) in paragraph.split_sentence_bound_indices() {
                let Some((s, e)) = trimmed(sentence, start + offset) else {
                    continue;
                };
                let sentence_words = word_count(&text[s..e]);
                if tokens_for_words(sentence_words) <= max {
                    pieces.push(Piece { start: s, end: e, words: sentence_words, heading: first });
                    first = false;
                    continue;
                }
                for (ws, we) in word_windows(text, s, e, max) {
                    pieces.push(Piece {
                        start: ws,
                        end: we,
                        words: word_count(&text[ws..we]),
                        heading: first,
                    });
                    first = false;
                }
            }
        }

        pieces
    }
}

/// Paragraph byte ranges (trimmed) and whether each one opens with a markdown heading.
fn split_paragraphs(text: &str) -> Vec<(usize, usize, bool)> {
    let mut paragraphs = Vec::new();
    let mut current: Option<(usize, usize, bool)> = None;
    let mut line_start = 0;

    for line in text.split_inclusive('\n') {
        let content = line.trim_end_matches(['\n', '\r']);
        let line_end = line_start + content.len();

        if content.trim().is_empty() {
            paragraphs.extend(current.take());
        } else if content.trim_start().starts_with('#') {
            paragraphs.extend(current.take());
            current = Some((line_start, line_end, true));
        } else {
            match current.as_mut() {
                Some(paragraph) => paragraph.1 = line_end,
                None => current = Some((line_start, line_end, false)),
            }
        }

        line_start += line.len();
    }
    paragraphs.extend(current);

    paragraphs
        .into_iter()
        .filter_map(|(start, end, heading)| {
            trimmed(&text[start..end], start).map(|(s, e)| (s, e, heading))
        })
        .collect()
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Byte range of `slice` (located at `base`) without surrounding whitespace.
fn trimmed(slice: &str, base: usize) -> Option<(usize, usize)> {
    let leading = slice.len() - slice.trim_start().len();
    let body = slice.trim();
    if body.is_empty() {
        None
    } else {
        Some((base + leading, base + leading + body.len()))
    }
}

/// Splits `text[start..end]` into runs of whole words that fit in `max_tokens`.
fn word_windows(text: &str, start: usize, end: usize, max_tokens: usize) -> Vec<(usize, usize)> {
    let max_words = (max_tokens * 10 / 13).max(1);
    let slice = &text[start..end];

    let mut words: Vec<(usize, usize)> = Vec::new();
    let mut word_start: Option<usize> = None;
    for (idx, ch) in slice.char_indices() {
        if ch.is_whitespace() {
            if let Some(ws) = word_start.take() {
                words.push((start + ws, start + idx));
            }
        } else if word_start.is_none() {
            word_start = Some(idx);
        }
    }
    if let Some(ws) = word_start {
        words.push((start + ws, end));
    }

    words
        .chunks(max_words)
        .map(|window| (window[0].0, window[window.len() - 1].1))
        .collect()
}
