//! Byte sources backing the cached reader

use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Abstract byte source. Demuxers never touch a source directly; all access
/// goes through [`Reader`](crate::io::Reader).
#[async_trait]
pub trait Source: Send + Sync {
  /// Total size in bytes
  async fn size(&self) -> Result<u64>;

  /// Read the half-open byte range `[start, end)`. Implementations may
  /// return fewer bytes only when the range extends past the end.
  async fn read(&self, start: u64, end: u64) -> Result<Bytes>;
}

/// In-memory source over a byte buffer
pub struct BufferSource {
  data: Bytes,
}

impl BufferSource {
  pub fn new(data: impl Into<Bytes>) -> Self {
    Self { data: data.into() }
  }
}

#[async_trait]
impl Source for BufferSource {
  async fn size(&self) -> Result<u64> {
    Ok(self.data.len() as u64)
  }

  async fn read(&self, start: u64, end: u64) -> Result<Bytes> {
    let len = self.data.len() as u64;
    if start > len {
      return Err(Error::invalid(format!(
        "read at {start} past end of {len}-byte source"
      )));
    }
    let end = end.min(len);
    Ok(self.data.slice(start as usize..end as usize))
  }
}

/// File-backed source using tokio's async file I/O.
///
/// The file handle is behind a mutex because reads seek; the reader layer
/// serializes and caches, so contention stays low.
pub struct FileSource {
  file: Mutex<tokio::fs::File>,
  size: u64,
  path: PathBuf,
}

impl FileSource {
  pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
    let path = path.into();
    let file = tokio::fs::File::open(&path).await?;
    let size = file.metadata().await?.len();
    Ok(Self {
      file: Mutex::new(file),
      size,
      path,
    })
  }

  pub fn path(&self) -> &std::path::Path {
    &self.path
  }
}

#[async_trait]
impl Source for FileSource {
  async fn size(&self) -> Result<u64> {
    Ok(self.size)
  }

  async fn read(&self, start: u64, end: u64) -> Result<Bytes> {
    let end = end.min(self.size);
    if start >= end {
      return Ok(Bytes::new());
    }
    let mut file = self.file.lock().await;
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = vec![0u8; (end - start) as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_buffer_source_slicing() {
    let source = BufferSource::new(vec![0u8, 1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(source.size().await.unwrap(), 8);
    assert_eq!(source.read(2, 5).await.unwrap().as_ref(), &[2, 3, 4]);
    // Reads past the end are clamped
    assert_eq!(source.read(6, 100).await.unwrap().as_ref(), &[6, 7]);
  }

  #[tokio::test]
  async fn test_buffer_source_read_past_end() {
    let source = BufferSource::new(vec![1u8, 2]);
    assert!(source.read(3, 4).await.is_err());
  }
}
