use crate::error::IngestError;
use crate::models::{Chunk, IngestionOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Window length, in characters.
    pub chunk_size: usize,
    /// Characters shared by consecutive windows.
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            overlap: 100,
        }
    }
}

impl From<&IngestionOptions> for ChunkingConfig {
    fn from(value: &IngestionOptions) -> Self {
        Self {
            chunk_size: value.chunk_size,
            overlap: value.overlap,
        }
    }
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self, IngestError> {
        let config = Self {
            chunk_size,
            overlap,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidArgument(
                "chunk_size must be positive".to_string(),
            ));
        }
        if self.overlap >= self.chunk_size {
            return Err(IngestError::InvalidArgument(format!(
                "overlap {} must be smaller than chunk_size {}",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    fn stride(&self) -> usize {
        self.chunk_size - self.overlap
    }
}

/// Splits `text` into overlapping character windows.
///
/// Windows start at 0 and advance by `chunk_size - overlap` while the start is
/// inside the text. Each window is trimmed and whitespace-only windows are
/// skipped, so chunk indices count non-empty chunks only.
pub fn split<'a>(
    source_path: &'a str,
    text: &'a str,
    config: ChunkingConfig,
) -> Result<ChunkWindows<'a>, IngestError> {
    config.validate()?;
    Ok(ChunkWindows {
        source_path,
        text,
        chunk_size: config.chunk_size,
        stride: config.stride(),
        start_byte: 0,
        start_char: 0,
        next_index: 0,
    })
}

/// Lazy window sequence returned by [`split`]. Cloning restarts from the
/// clone's current position.
#[derive(Debug, Clone)]
pub struct ChunkWindows<'a> {
    source_path: &'a str,
    text: &'a str,
    chunk_size: usize,
    stride: usize,
    start_byte: usize,
    start_char: usize,
    next_index: usize,
}

impl Iterator for ChunkWindows<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        while self.start_byte < self.text.len() {
            let rest = &self.text[self.start_byte..];
            let window = &rest[..byte_offset_after(rest, self.chunk_size)];
            let window_start = self.start_char;

            self.start_byte += byte_offset_after(rest, self.stride);
            self.start_char += self.stride;

            let trimmed = window.trim();
            if trimmed.is_empty() {
                continue;
            }

            let leading = window.len() - window.trim_start().len();
            let start_offset = window_start + window[..leading].chars().count();
            let end_offset = start_offset + trimmed.chars().count();
            let index = self.next_index;
            self.next_index += 1;

            return Some(Chunk {
                source_path: self.source_path.to_string(),
                index,
                text: trimmed.to_string(),
                start_offset,
                end_offset,
            });
        }
        None
    }
}

fn byte_offset_after(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map_or(text.len(), |(offset, _)| offset)
}
