//! Markdown and plain-text documents: ingestion into segments and rendering
//! of a finished store

use pulldown_cmark::{Event, HeadingLevel, Options, Parser, Tag, TagEnd};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::core::config::TranslatorConfig;
use crate::core::errors::{Result, TranslationError};
use crate::core::models::{NewSegment, SegmentStatus, SourceDocument};
use crate::pipeline::store::SegmentStore;

/// Sentence terminators used when an oversize block has to be split
const SENTENCE_TERMINATORS: &[char] = &['.', '!', '?', '。', '！', '？', '；', ';'];

/// SHA-256 of the document bytes, hex encoded
pub fn document_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// One top-level Markdown block
#[derive(Debug)]
struct Block {
    text: String,
    line: usize,
    trail: String,
    is_heading: bool,
}

/// Turns a document into ordered segments of at most `max_chunk_chars`
#[derive(Debug, Clone)]
pub struct MarkdownIngestor {
    max_chunk_chars: usize,
}

impl MarkdownIngestor {
    pub fn new(max_chunk_chars: usize) -> Self {
        Self {
            max_chunk_chars: max_chunk_chars.max(1),
        }
    }

    pub fn from_config(config: &TranslatorConfig) -> Self {
        Self::new(config.max_chunk_chars)
    }

    /// Check if the file can be ingested
    pub fn is_supported(path: &Path) -> bool {
        path.extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                ext == "md" || ext == "markdown" || ext == "txt"
            })
            .unwrap_or(false)
    }

    /// Find supported files in a directory, sorted by path
    pub fn find_files(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Err(TranslationError::FileError {
                path: dir.display().to_string(),
                message: "Not a directory".to_string(),
            });
        }

        let walker = walkdir::WalkDir::new(dir).max_depth(if recursive { usize::MAX } else { 1 });
        let mut files: Vec<PathBuf> = walker
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|path| path.is_file() && Self::is_supported(path))
            .collect();
        files.sort();

        Ok(files)
    }

    /// Read and segment one file
    pub async fn ingest_file(&self, path: &Path) -> Result<SourceDocument> {
        debug!("Ingesting: {}", path.display());

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| TranslationError::FileError {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        let hash = document_hash(&bytes);
        let content = String::from_utf8(bytes).map_err(|e| TranslationError::InvalidFormat {
            format: format!("{} is not UTF-8: {}", path.display(), e),
        })?;

        let is_text = path
            .extension()
            .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("txt"))
            .unwrap_or(false);

        let segments = if is_text {
            self.parse_text(&content)
        } else {
            self.parse_markdown(&content)
        };

        if segments.is_empty() {
            return Err(TranslationError::InvalidDocument {
                message: format!("{} contains no translatable text", path.display()),
            });
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        info!("Segmented {} into {} segments", name, segments.len());
        Ok(SourceDocument {
            name,
            hash,
            segments,
        })
    }

    /// Segment Markdown by top-level blocks, packing small blocks together
    pub fn parse_markdown(&self, content: &str) -> Vec<NewSegment> {
        let options = Options::ENABLE_TABLES
            | Options::ENABLE_FOOTNOTES
            | Options::ENABLE_STRIKETHROUGH
            | Options::ENABLE_YAML_STYLE_METADATA_BLOCKS;

        let mut blocks = Vec::new();
        let mut headings: Vec<(HeadingLevel, String)> = Vec::new();
        let mut heading_text: Option<(HeadingLevel, String)> = None;
        let mut depth = 0usize;
        let mut line = 1usize;
        let mut line_offset = 0usize;

        for (event, range) in Parser::new_ext(content, options).into_offset_iter() {
            match event {
                Event::Start(tag) => {
                    if depth == 0 {
                        line += content[line_offset..range.start].matches('\n').count();
                        line_offset = range.start;

                        let text = content[range.clone()].trim_end().to_string();
                        match tag {
                            Tag::MetadataBlock(_) => {}
                            Tag::Heading { level, .. } => {
                                heading_text = Some((level, String::new()));
                                blocks.push(Block {
                                    text,
                                    line,
                                    trail: String::new(),
                                    is_heading: true,
                                });
                            }
                            _ => blocks.push(Block {
                                text,
                                line,
                                trail: heading_trail(&headings),
                                is_heading: false,
                            }),
                        }
                    }
                    depth += 1;
                }
                Event::End(TagEnd::Heading(_)) if depth == 1 => {
                    depth = 0;
                    if let Some((level, text)) = heading_text.take() {
                        headings.retain(|(l, _)| *l < level);
                        headings.push((level, text.trim().to_string()));
                        if let Some(block) = blocks.last_mut() {
                            block.trail = heading_trail(&headings);
                        }
                    }
                }
                Event::End(_) => depth = depth.saturating_sub(1),
                Event::Text(text) | Event::Code(text) => {
                    if let Some((_, heading)) = heading_text.as_mut() {
                        heading.push_str(&text);
                    }
                }
                Event::Rule if depth == 0 => {
                    line += content[line_offset..range.start].matches('\n').count();
                    line_offset = range.start;
                    blocks.push(Block {
                        text: content[range].trim_end().to_string(),
                        line,
                        trail: heading_trail(&headings),
                        is_heading: false,
                    });
                }
                _ => {}
            }
        }

        self.pack(blocks)
    }

    /// Segment plain text by paragraphs (blank-line separated)
    pub fn parse_text(&self, content: &str) -> Vec<NewSegment> {
        let mut blocks = Vec::new();
        let mut paragraph = String::new();
        let mut start_line = 1;

        for (i, raw) in content.lines().enumerate() {
            if raw.trim().is_empty() {
                if !paragraph.is_empty() {
                    blocks.push(Block {
                        text: std::mem::take(&mut paragraph),
                        line: start_line,
                        trail: String::new(),
                        is_heading: false,
                    });
                }
                continue;
            }
            if paragraph.is_empty() {
                start_line = i + 1;
            } else {
                paragraph.push('\n');
            }
            paragraph.push_str(raw.trim_end());
        }

        if !paragraph.is_empty() {
            blocks.push(Block {
                text: paragraph,
                line: start_line,
                trail: String::new(),
                is_heading: false,
            });
        }

        self.pack(blocks)
    }

    /// Pack blocks into segments under the chunk limit; headings start a
    /// new segment and oversize blocks are split at sentence boundaries
    fn pack(&self, blocks: Vec<Block>) -> Vec<NewSegment> {
        let mut segments = Vec::new();
        let mut buffer = String::new();
        let mut buffer_chars = 0usize;
        let mut location = String::new();

        let mut flush = |buffer: &mut String, buffer_chars: &mut usize, location: &str| {
            if !buffer.trim().is_empty() {
                segments.push(NewSegment {
                    source_text: std::mem::take(buffer),
                    page_or_location: location.to_string(),
                });
            }
            buffer.clear();
            *buffer_chars = 0;
        };

        for block in blocks {
            if block.is_heading {
                flush(&mut buffer, &mut buffer_chars, &location);
            }

            for piece in split_sentences(&block.text, self.max_chunk_chars) {
                let piece_chars = piece.chars().count();
                if !buffer.is_empty() && buffer_chars + 2 + piece_chars > self.max_chunk_chars {
                    flush(&mut buffer, &mut buffer_chars, &location);
                }

                if buffer.is_empty() {
                    location = format_location(block.line, &block.trail);
                } else {
                    buffer.push_str("\n\n");
                    buffer_chars += 2;
                }
                buffer.push_str(&piece);
                buffer_chars += piece_chars;
            }
        }

        flush(&mut buffer, &mut buffer_chars, &location);
        segments
    }
}

fn heading_trail(headings: &[(HeadingLevel, String)]) -> String {
    headings
        .iter()
        .map(|(_, text)| text.as_str())
        .collect::<Vec<_>>()
        .join(" > ")
}

fn format_location(line: usize, trail: &str) -> String {
    if trail.is_empty() {
        format!("line {}", line)
    } else {
        format!("line {} ({})", line, trail)
    }
}

/// Split `text` into pieces of at most `max_chars`, preferring sentence ends
fn split_sentences(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut sentences = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if SENTENCE_TERMINATORS.contains(&c) {
            sentences.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        sentences.push(current);
    }

    let mut pieces = Vec::new();
    let mut piece = String::new();
    let mut piece_chars = 0usize;

    for sentence in sentences {
        let sentence_chars = sentence.chars().count();

        if piece_chars + sentence_chars > max_chars && !piece.trim().is_empty() {
            pieces.push(std::mem::take(&mut piece).trim().to_string());
            piece_chars = 0;
        }

        if sentence_chars > max_chars {
            // No terminator to split on: cut by characters
            let chars: Vec<char> = sentence.chars().collect();
            for chunk in chars.chunks(max_chars) {
                let chunk: String = chunk.iter().collect();
                if !chunk.trim().is_empty() {
                    pieces.push(chunk.trim().to_string());
                }
            }
            continue;
        }

        piece.push_str(&sentence);
        piece_chars += sentence_chars;
    }

    if !piece.trim().is_empty() {
        pieces.push(piece.trim().to_string());
    }
    pieces
}

/// Writes a store back out as Markdown, in `order_index` order
#[derive(Debug, Clone, Default)]
pub struct MarkdownRenderer {
    retain_original: bool,
    show_locations: bool,
}

impl MarkdownRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit the source text before each translation
    pub fn with_retain_original(mut self, retain_original: bool) -> Self {
        self.retain_original = retain_original;
        self
    }

    /// Emit `<!-- location -->` markers before each segment
    pub fn with_locations(mut self, show_locations: bool) -> Self {
        self.show_locations = show_locations;
        self
    }

    /// Render the store; untranslated segments keep their source text
    pub fn render(&self, store: &SegmentStore) -> String {
        let mut parts = Vec::with_capacity(store.len());

        for segment in store.segments() {
            let mut part = String::new();
            if self.show_locations && !segment.page_or_location.is_empty() {
                part.push_str(&format!("<!-- {} -->\n", segment.page_or_location));
            }

            match (segment.status, segment.translation.as_deref()) {
                (SegmentStatus::Translated, Some(translation)) => {
                    if self.retain_original {
                        part.push_str(&segment.source_text);
                        part.push_str("\n\n");
                    }
                    part.push_str(translation);
                }
                (status, _) => {
                    part.push_str(&format!(
                        "<!-- untranslated: id {} ({}) -->\n",
                        segment.id, status
                    ));
                    part.push_str(&segment.source_text);
                }
            }
            parts.push(part);
        }

        let mut output = parts.join("\n\n");
        output.push('\n');
        output
    }

    /// Render to a file, creating parent directories
    pub async fn write(&self, store: &SegmentStore, output: &Path) -> Result<()> {
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| TranslationError::FileError {
                        path: parent.display().to_string(),
                        message: e.to_string(),
                    })?;
            }
        }

        tokio::fs::write(output, self.render(store))
            .await
            .map_err(|e| TranslationError::FileError {
                path: output.display().to_string(),
                message: e.to_string(),
            })?;

        info!("Rendered {} segments to {}", store.len(), output.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOOK: &str = r#"---
title: "Test"
---

# Chapter One

The big Other does not exist. This is a claim.

```rust
fn main() {}
```

## Section A

Another paragraph here.
"#;

    #[test]
    fn test_headings_start_segments_and_set_trail() {
        let segments = MarkdownIngestor::new(2000).parse_markdown(BOOK);
        assert_eq!(segments.len(), 2);

        assert!(segments[0].source_text.starts_with("# Chapter One"));
        assert!(segments[0].source_text.contains("fn main() {}"));
        assert_eq!(segments[0].page_or_location, "line 5 (Chapter One)");

        assert!(segments[1].source_text.starts_with("## Section A"));
        assert_eq!(
            segments[1].page_or_location,
            "line 13 (Chapter One > Section A)"
        );
        assert!(!segments.iter().any(|s| s.source_text.contains("title:")));
    }

    #[test]
    fn test_small_chunk_limit_splits_blocks() {
        let segments = MarkdownIngestor::new(40).parse_markdown(BOOK);
        assert!(segments.iter().all(|s| s.source_text.chars().count() <= 40));
        assert!(segments
            .iter()
            .any(|s| s.source_text == "The big Other does not exist."));
    }

    #[test]
    fn test_split_sentences() {
        let pieces = split_sentences("One. Two. Three.", 10);
        assert_eq!(pieces, vec!["One. Two.", "Three."]);

        let pieces = split_sentences("abcdefghij", 4);
        assert_eq!(pieces, vec!["abcd", "efgh", "ij"]);

        let pieces = split_sentences("大他者不存在。主体被划分。", 7);
        assert_eq!(pieces, vec!["大他者不存在。", "主体被划分。"]);
    }

    #[test]
    fn test_plain_text_paragraphs() {
        let segments = MarkdownIngestor::new(10).parse_text("First para.\n\n\nSecond para.\n");
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].source_text, "Second para.");
        assert_eq!(segments[1].page_or_location, "line 4");
    }

    #[test]
    fn test_document_hash_is_stable() {
        assert_eq!(document_hash(b"abc"), document_hash(b"abc"));
        assert_ne!(document_hash(b"abc"), document_hash(b"abd"));
        assert_eq!(document_hash(b"").len(), 64);
    }

    #[test]
    fn test_is_supported() {
        assert!(MarkdownIngestor::is_supported(Path::new("test.md")));
        assert!(MarkdownIngestor::is_supported(Path::new("test.MD")));
        assert!(MarkdownIngestor::is_supported(Path::new("test.markdown")));
        assert!(MarkdownIngestor::is_supported(Path::new("notes.txt")));
        assert!(!MarkdownIngestor::is_supported(Path::new("book.epub")));
    }

    #[test]
    fn test_find_files() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.md"), "# A").unwrap();
        std::fs::write(dir.path().join("b.pdf"), "").unwrap();
        std::fs::write(dir.path().join("nested/c.md"), "# C").unwrap();

        assert_eq!(MarkdownIngestor::find_files(dir.path(), false).unwrap().len(), 1);
        assert_eq!(MarkdownIngestor::find_files(dir.path(), true).unwrap().len(), 2);
    }

    fn rendered_store() -> SegmentStore {
        let parsed = ["Hello.", "World.", "Again."]
            .iter()
            .enumerate()
            .map(|(i, s)| NewSegment {
                source_text: s.to_string(),
                page_or_location: format!("line {}", i + 1),
            })
            .collect();
        let mut store = SegmentStore::ingest(parsed, "scholar").unwrap();
        store.mark_in_flight(&[1, 2, 3]).unwrap();
        // Commit out of order; output still follows order_index
        store.commit_translation(2, "世界。").unwrap();
        store.commit_translation(1, "你好。").unwrap();
        store.mark_failed(3, "retries exhausted").unwrap();
        store
    }

    #[test]
    fn test_render_in_order_with_markers() {
        let output = MarkdownRenderer::new().render(&rendered_store());
        assert_eq!(
            output,
            "你好。\n\n世界。\n\n<!-- untranslated: id 3 (FAILED) -->\nAgain.\n"
        );
    }

    #[test]
    fn test_render_retain_original_and_locations() {
        let output = MarkdownRenderer::new()
            .with_retain_original(true)
            .with_locations(true)
            .render(&rendered_store());
        assert!(output.starts_with("<!-- line 1 -->\nHello.\n\n你好。"));
    }

    #[tokio::test]
    async fn test_ingest_and_write() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("book.md");
        std::fs::write(&input, BOOK).unwrap();

        let document = MarkdownIngestor::new(2000).ingest_file(&input).await.unwrap();
        assert_eq!(document.name, "book.md");
        assert_eq!(document.hash, document_hash(BOOK.as_bytes()));

        let output = dir.path().join("out/book.zh.md");
        MarkdownRenderer::new()
            .write(&rendered_store(), &output)
            .await
            .unwrap();
        assert!(std::fs::read_to_string(&output).unwrap().contains("世界。"));
    }
}
