//! Markdown-aware chunking for index rebuilds.
//!
//! Splits on ATX headers (up to `####`), tracks the most recent header as
//! section context, and accumulates blank-line paragraphs into chunks capped
//! at `max_chunk_size` characters with a character-tail overlap between
//! consecutive chunks of the same section.

use regex::Regex;
use std::sync::LazyLock;

pub const MAX_CHUNK_SIZE: usize = 1500;
pub const OVERLAP_SIZE: usize = 200;

const MIN_PARAGRAPH_CHARS: usize = 20;
const MIN_CHUNK_CHARS: usize = 30;

static HEADER_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(#{1,4}\s+.+)$").unwrap());
static HEADER_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#{1,4}\s+").unwrap());
static PARAGRAPH_SPLIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n").unwrap());

/// One chunk: the text (with its section header prepended) and its source,
/// suffixed `:chunk_<index>`.
pub fn chunk_markdown(
    content: &str,
    source_name: &str,
    max_chunk_size: usize,
    overlap_size: usize,
) -> Vec<(String, String)> {
    let mut chunks: Vec<(String, String)> = Vec::new();
    let mut current_header = String::new();
    let mut buffer = String::new();
    let mut chunk_idx = 0usize;

    let mut flush =
        |buffer: &str, header: &str, chunks: &mut Vec<(String, String)>, idx: &mut usize| {
            let trimmed = buffer.trim();
            if trimmed.len() <= MIN_CHUNK_CHARS {
                return;
            }
            let chunk_text = if header.is_empty() {
                trimmed.to_string()
            } else {
                format!("{header}\n\n{trimmed}")
            };
            chunks.push((chunk_text, format!("{source_name}:chunk_{idx}")));
            *idx += 1;
        };

    for part in split_keeping_headers(content) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if HEADER_LINE.is_match(part) {
            flush(&buffer, &current_header, &mut chunks, &mut chunk_idx);
            buffer.clear();
            current_header = part.to_string();
            continue;
        }

        for paragraph in PARAGRAPH_SPLIT.split(part) {
            let paragraph = paragraph.trim();
            if paragraph.len() < MIN_PARAGRAPH_CHARS {
                continue;
            }

            let candidate = if buffer.is_empty() {
                paragraph.to_string()
            } else {
                format!("{buffer}\n\n{paragraph}")
            };
            if candidate.len() > max_chunk_size && !buffer.is_empty() {
                flush(&buffer, &current_header, &mut chunks, &mut chunk_idx);
                // Carry the tail of the flushed buffer into the next chunk.
                buffer = if buffer.len() > overlap_size {
                    let tail = tail_chars(&buffer, overlap_size);
                    format!("{tail}\n\n{paragraph}")
                } else {
                    paragraph.to_string()
                };
            } else {
                buffer = candidate;
            }
        }
    }

    flush(&buffer, &current_header, &mut chunks, &mut chunk_idx);
    chunks
}

/// Split content so header lines become standalone parts, mirroring a
/// capture-group split.
fn split_keeping_headers(content: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut last = 0usize;
    for m in HEADER_SPLIT.find_iter(content) {
        if m.start() > last {
            parts.push(&content[last..m.start()]);
        }
        parts.push(m.as_str());
        last = m.end();
    }
    if last < content.len() {
        parts.push(&content[last..]);
    }
    parts
}

/// Last `count` characters, respecting UTF-8 boundaries.
fn tail_chars(text: &str, count: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let start = chars.len().saturating_sub(count);
    chars[start..].iter().collect()
}
