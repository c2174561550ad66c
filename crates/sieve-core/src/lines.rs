//! Lossy line-at-a-time reading for large text inputs.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::error::AppError;

const READ_BUFFER_BYTES: usize = 1 << 20;

/// Streams lines from any buffered async reader.
///
/// Line terminators (`\n`, `\r\n`) are stripped. Invalid UTF-8 is replaced
/// instead of aborting the read, since record dumps are rarely clean.
pub struct LineReader<R> {
    reader: R,
    buf: Vec<u8>,
    origin: PathBuf,
}

impl LineReader<BufReader<File>> {
    /// Open a file for streaming.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let file = File::open(path).await.map_err(|e| AppError::io(path, e))?;
        Ok(Self::new(
            BufReader::with_capacity(READ_BUFFER_BYTES, file),
            path,
        ))
    }
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    /// Wrap a reader. `origin` is only used in error messages.
    pub fn new(reader: R, origin: impl Into<PathBuf>) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(256),
            origin: origin.into(),
        }
    }

    /// Next line, or `None` at end of input.
    pub async fn next_line(&mut self) -> Result<Option<String>, AppError> {
        self.buf.clear();
        let n = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .await
            .map_err(|e| AppError::io(&self.origin, e))?;
        if n == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
        }
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}
