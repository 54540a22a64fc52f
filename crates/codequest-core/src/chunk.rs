//! Boundary-aware source code chunker.
//!
//! Splits a [`SourceFile`] into bounded, overlapping [`Chunk`]s. The
//! chunker is lazy: [`Chunker::chunks`] returns an iterator that computes
//! one chunk per `next()` call, and calling it again restarts from the
//! beginning of the file.
//!
//! # Algorithm
//!
//! 1. Reject binary content (NUL bytes or a high share of control
//!    characters) and whitespace-only content: zero chunks.
//! 2. If the remaining text fits in `max_chars`, emit it and stop.
//! 3. Otherwise look for a split point inside the boundary window
//!    (the last `boundary_window` fraction before `max_chars`), preferring
//!    in order: a blank line, the end of a line that closes a statement
//!    (`;`, `}`, `{`, `)`, `:`), any line end, any whitespace. Without one,
//!    hard-split at `max_chars`.
//! 4. Start the next chunk `overlap_ratio * max_chars` bytes before the
//!    split, snapped forward to the first line start in that region.
//!
//! Identical input always yields identical boundaries and chunk ids.
//!
//! # Example
//!
//! ```rust
//! use codequest_core::chunk::{Chunker, ChunkerConfig};
//! use codequest_core::models::SourceFile;
//!
//! let file = SourceFile::new("src/lib.rs", "fn main() {}\n");
//! let chunker = Chunker::new(ChunkerConfig::default()).unwrap();
//! let chunks: Vec<_> = chunker.chunks("acme/widgets", &file).collect();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].metadata.symbols, vec!["main".to_string()]);
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Chunk, ChunkMetadata, SourceFile};

/// Chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Upper bound on chunk length in bytes.
    pub max_chars: usize,
    /// Fraction of `max_chars` repeated at the start of the next chunk.
    pub overlap_ratio: f32,
    /// Fraction of `max_chars`, counted back from the bound, searched for
    /// a natural split point.
    pub boundary_window: f32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chars: 1500,
            overlap_ratio: 0.15,
            boundary_window: 0.2,
        }
    }
}

impl ChunkerConfig {
    fn overlap_chars(&self) -> usize {
        (self.max_chars as f32 * self.overlap_ratio) as usize
    }

    fn min_split(&self) -> usize {
        (self.max_chars as f32 * (1.0 - self.boundary_window)) as usize
    }

    /// Check that the parameters guarantee forward progress.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_chars < 32 {
            anyhow::bail!("chunking.max_chars must be at least 32");
        }
        if !(0.0..0.5).contains(&self.overlap_ratio) {
            anyhow::bail!("chunking.overlap_ratio must be in [0.0, 0.5)");
        }
        if !(self.boundary_window > 0.0 && self.boundary_window <= 0.5) {
            anyhow::bail!("chunking.boundary_window must be in (0.0, 0.5]");
        }
        if self.overlap_chars() >= self.min_split() {
            anyhow::bail!("chunking.overlap_ratio must be smaller than 1 - boundary_window");
        }
        Ok(())
    }
}

/// Produces chunks for source files.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Lazily chunk `file`. Each call returns a fresh iterator.
    pub fn chunks<'a>(&'a self, repo_id: &'a str, file: &'a SourceFile) -> ChunkIter<'a> {
        let text = file.content.as_str();
        let done = is_binary(text) || text.trim().is_empty();
        ChunkIter {
            config: &self.config,
            repo_id,
            file,
            pos: 0,
            index: 0,
            line_offset: 0,
            line_number: 1,
            done,
        }
    }
}

/// Iterator over the chunks of one file. See [`Chunker::chunks`].
pub struct ChunkIter<'a> {
    config: &'a ChunkerConfig,
    repo_id: &'a str,
    file: &'a SourceFile,
    pos: usize,
    index: usize,
    line_offset: usize,
    line_number: usize,
    done: bool,
}

impl ChunkIter<'_> {
    /// 1-based line number of byte offset `offset`. Offsets must not
    /// decrease between calls.
    fn line_at(&mut self, offset: usize) -> usize {
        let text = &self.file.content;
        self.line_number += text[self.line_offset..offset].matches('\n').count();
        self.line_offset = offset;
        self.line_number
    }

    fn split_point(&self) -> usize {
        let text = &self.file.content;
        let limit = floor_char_boundary(text, self.pos + self.config.max_chars);
        let window_start =
            floor_char_boundary(text, self.pos + self.config.min_split()).max(self.pos);
        let window = &text[window_start..limit];

        let end = if let Some(i) = window.rfind("\n\n") {
            window_start + i + 1
        } else if let Some(i) = rfind_statement_end(window) {
            window_start + i + 1
        } else if let Some(i) = window.rfind('\n') {
            window_start + i + 1
        } else if let Some((i, c)) = window.char_indices().rev().find(|(_, c)| c.is_whitespace()) {
            window_start + i + c.len_utf8()
        } else {
            limit
        };

        if end > self.pos {
            end
        } else {
            // A single char wider than the bound; take it whole.
            next_char_boundary(text, self.pos)
        }
    }

    fn next_start(&self, end: usize) -> usize {
        let text = &self.file.content;
        let overlap = self.config.overlap_chars();
        if overlap == 0 {
            return end;
        }
        let candidate = floor_char_boundary(text, end.saturating_sub(overlap)).max(self.pos);
        let start = match text[candidate..end].find('\n') {
            Some(i) if candidate + i + 1 < end => candidate + i + 1,
            _ => candidate,
        };
        if start > self.pos {
            start
        } else {
            end
        }
    }
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let file: &'a SourceFile = self.file;
        let text = file.content.as_str();
        while !self.done {
            let start = self.pos;
            let end = if text.len() - start <= self.config.max_chars {
                text.len()
            } else {
                self.split_point()
            };

            if end >= text.len() {
                self.done = true;
            } else {
                self.pos = self.next_start(end);
            }

            let piece = &text[start..end];
            if piece.trim().is_empty() {
                continue;
            }

            let start_line = self.line_at(start);
            let body = piece.trim_end();
            let end_line = start_line + body.matches('\n').count();
            let chunk = make_chunk(
                self.repo_id,
                file,
                self.index,
                piece,
                ChunkMetadata {
                    start_line,
                    end_line,
                    symbols: extract_symbols(piece),
                },
            );
            self.index += 1;
            return Some(chunk);
        }
        None
    }
}

/// Collect every chunk of `file`.
pub fn chunk_file(repo_id: &str, file: &SourceFile, chunker: &Chunker) -> Vec<Chunk> {
    chunker.chunks(repo_id, file).collect()
}

/// Deterministic chunk id for a file path and sequence index.
pub fn chunk_id_for(file_path: &str, index: usize) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{file_path}#{index}").as_bytes()).to_string()
}

/// SHA-256 of `text`, hex encoded.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(
    repo_id: &str,
    file: &SourceFile,
    index: usize,
    text: &str,
    metadata: ChunkMetadata,
) -> Chunk {
    Chunk {
        repo_id: repo_id.to_string(),
        file_path: file.path.clone(),
        chunk_id: chunk_id_for(&file.path, index),
        chunk_index: index,
        content: text.to_string(),
        language: file.language.clone(),
        content_hash: content_hash(text),
        metadata,
    }
}

/// Binary files either contain NUL bytes or are dominated by control
/// characters. Only the head of the file is sampled.
fn is_binary(text: &str) -> bool {
    let mut total = 0usize;
    let mut control = 0usize;
    for c in text.chars().take(8192) {
        if c == '\0' {
            return true;
        }
        total += 1;
        if c.is_control() && !matches!(c, '\n' | '\r' | '\t' | '\u{c}') {
            control += 1;
        }
    }
    total > 0 && control * 10 > total
}

/// Byte offset of the last newline whose line ends a statement or block.
fn rfind_statement_end(window: &str) -> Option<usize> {
    window
        .match_indices('\n')
        .rev()
        .map(|(i, _)| i)
        .find(|&i| {
            let line = window[..i].rsplit('\n').next().unwrap_or("");
            matches!(
                line.trim_end().chars().last(),
                Some(';' | '}' | '{' | ')' | ':')
            )
        })
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

fn next_char_boundary(s: &str, index: usize) -> usize {
    s[index..]
        .chars()
        .next()
        .map(|c| index + c.len_utf8())
        .unwrap_or(s.len())
}

const MODIFIERS: &[&str] = &[
    "pub", "pub(crate)", "pub(super)", "async", "export", "default", "static", "public",
    "private", "protected", "abstract", "final", "unsafe", "const",
];

const DECLARATIONS: &[&str] = &[
    "fn", "def", "class", "struct", "enum", "trait", "function", "interface", "func", "mod",
];

/// Names declared in `text` by a light line scan (no parsing).
pub fn extract_symbols(text: &str) -> Vec<String> {
    let mut symbols: Vec<String> = Vec::new();
    for line in text.lines() {
        let mut words = line.split_whitespace().peekable();
        while let Some(w) = words.peek() {
            if MODIFIERS.contains(w) {
                words.next();
            } else {
                break;
            }
        }
        let Some(keyword) = words.next() else {
            continue;
        };
        if !DECLARATIONS.contains(&keyword) {
            continue;
        }
        let Some(rest) = words.next() else {
            continue;
        };
        let name: String = rest
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if !name.is_empty() && !symbols.contains(&name) {
            symbols.push(name);
        }
    }
    symbols
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(max_chars: usize) -> Chunker {
        Chunker::new(ChunkerConfig {
            max_chars,
            ..ChunkerConfig::default()
        })
        .unwrap()
    }

    fn rust_source(functions: usize) -> String {
        (0..functions)
            .map(|i| format!("fn handler_{i}(x: u32) -> u32 {{\n    let y = x + {i};\n    y * 2\n}}\n\n"))
            .collect()
    }

    #[test]
    fn test_small_file_single_chunk() {
        let file = SourceFile::new("src/main.rs", "fn main() {\n    println!(\"hi\");\n}\n");
        let chunks = chunk_file("acme/app", &file, &chunker(1500));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].metadata.start_line, 1);
        assert_eq!(chunks[0].metadata.end_line, 3);
        assert_eq!(chunks[0].language, "rust");
    }

    #[test]
    fn test_empty_and_whitespace_yield_nothing() {
        let c = chunker(1500);
        assert_eq!(c.chunks("r", &SourceFile::new("a.py", "")).count(), 0);
        assert_eq!(c.chunks("r", &SourceFile::new("a.py", "  \n\n\t ")).count(), 0);
    }

    #[test]
    fn test_binary_yields_nothing() {
        let file = SourceFile::new("logo.png", "\u{89}PNG\r\n\u{1a}\n\0\0\0\rIHDR");
        assert_eq!(chunker(1500).chunks("r", &file).count(), 0);
    }

    #[test]
    fn test_chunks_respect_bound() {
        let file = SourceFile::new("src/lib.rs", rust_source(60));
        let chunks = chunk_file("r", &file, &chunker(400));
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.content.len() <= 400, "chunk too large: {}", c.content.len());
        }
    }

    #[test]
    fn test_prefers_blank_line_boundary() {
        let file = SourceFile::new("src/lib.rs", rust_source(60));
        let chunks = chunk_file("r", &file, &chunker(400));
        for c in &chunks[..chunks.len() - 1] {
            assert!(c.content.ends_with("}\n\n") || c.content.ends_with("}\n"));
        }
    }

    #[test]
    fn test_indices_contiguous_and_ids_unique() {
        let file = SourceFile::new("src/lib.rs", rust_source(40));
        let chunks = chunk_file("r", &file, &chunker(300));
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i);
            assert_eq!(c.chunk_id, chunk_id_for("src/lib.rs", i));
        }
        let mut ids: Vec<_> = chunks.iter().map(|c| c.chunk_id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), chunks.len());
    }

    #[test]
    fn test_deterministic_and_restartable() {
        let file = SourceFile::new("src/lib.rs", rust_source(30));
        let c = chunker(300);
        let first: Vec<Chunk> = c.chunks("r", &file).collect();
        let second: Vec<Chunk> = c.chunks("r", &file).collect();
        assert_eq!(first, second);

        let other = chunker(300);
        let third = chunk_file("r", &file, &other);
        assert_eq!(first, third);
    }

    #[test]
    fn test_consecutive_chunks_overlap() {
        let file = SourceFile::new("src/lib.rs", rust_source(30));
        let chunks = chunk_file("r", &file, &chunker(300));
        assert!(chunks.len() > 2);
        for pair in chunks.windows(2) {
            let first_line = pair[1].content.lines().next().unwrap();
            assert!(
                pair[0].content.contains(first_line),
                "next chunk should start inside the previous one"
            );
            assert!(pair[1].metadata.start_line <= pair[0].metadata.end_line);
            assert!(pair[1].metadata.start_line > pair[0].metadata.start_line);
        }
    }

    #[test]
    fn test_hard_split_without_whitespace() {
        let file = SourceFile::new("data.txt", "x".repeat(1000));
        let chunks = chunk_file("r", &file, &chunker(256));
        assert!(chunks.len() >= 4);
        assert!(chunks.iter().all(|c| c.content.len() <= 256));
        assert!(chunks.last().unwrap().content.ends_with('x'));
    }

    #[test]
    fn test_multibyte_text_does_not_panic() {
        let file = SourceFile::new("notes.md", "héllo wörld ünïcode ".repeat(200));
        let chunks = chunk_file("r", &file, &chunker(100));
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.content.len() <= 100));
    }

    #[test]
    fn test_extract_symbols() {
        let src = "pub async fn fetch_all() {}\nclass UserService:\n    def login(self):\n\
                   export default function App() {}\nstruct Point { x: i32 }\nlet fn_like = 3;";
        assert_eq!(
            extract_symbols(src),
            vec!["fetch_all", "UserService", "login", "App", "Point"]
        );
    }

    #[test]
    fn test_content_hash_matches_content() {
        let file = SourceFile::new("a.py", "def f():\n    return 1\n");
        let chunks = chunk_file("r", &file, &chunker(1500));
        assert_eq!(chunks[0].content_hash, content_hash(&chunks[0].content));
        assert_eq!(chunks[0].content_hash.len(), 64);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(Chunker::new(ChunkerConfig {
            max_chars: 10,
            ..ChunkerConfig::default()
        })
        .is_err());
        assert!(Chunker::new(ChunkerConfig {
            overlap_ratio: 0.6,
            ..ChunkerConfig::default()
        })
        .is_err());
    }
}
