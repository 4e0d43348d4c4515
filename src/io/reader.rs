//! Cached, range-addressable reader
//!
//! Keeps loaded byte segments sorted by start offset under a byte budget,
//! evicting least-recently-used whole segments on overflow. Concurrent loads
//! of overlapping ranges are coalesced: a request fully contained in a
//! pending load awaits that load instead of issuing its own.

use bytes::{Bytes, BytesMut};
use tokio::sync::{watch, Mutex, OnceCell};

use crate::error::{Error, Result};
use crate::io::source::Source;

/// Reader tuning knobs
#[derive(Debug, Clone)]
pub struct ReaderOptions {
  /// Maximum bytes kept in the segment cache before LRU eviction
  pub max_cache_bytes: u64,
}

impl Default for ReaderOptions {
  fn default() -> Self {
    Self {
      max_cache_bytes: 16 * 1024 * 1024,
    }
  }
}

struct Segment {
  start: u64,
  end: u64,
  data: Bytes,
  last_used: u64,
}

struct PendingLoad {
  start: u64,
  end: u64,
  done: watch::Receiver<bool>,
}

#[derive(Default)]
struct CacheState {
  /// Sorted by `start`; non-overlapping after merge-on-insert
  segments: Vec<Segment>,
  pending: Vec<PendingLoad>,
  access_counter: u64,
  stored_bytes: u64,
}

impl CacheState {
  fn covering_segment_index(&self, start: u64, end: u64) -> Option<usize> {
    // Segments are sorted and disjoint; binary search by start
    let idx = self
      .segments
      .partition_point(|seg| seg.start <= start)
      .checked_sub(1)?;
    let seg = &self.segments[idx];
    (seg.start <= start && seg.end >= end).then_some(idx)
  }

  fn touch(&mut self, idx: usize) {
    self.access_counter += 1;
    self.segments[idx].last_used = self.access_counter;
  }

  fn insert_segment(&mut self, start: u64, end: u64, data: Bytes) {
    debug_assert_eq!((end - start) as usize, data.len());

    // Collect everything the new segment overlaps or touches
    let mut merged_start = start;
    let mut merged_end = end;
    let mut absorbed: Vec<Segment> = Vec::new();
    let mut i = 0;
    while i < self.segments.len() {
      let seg = &self.segments[i];
      if seg.start <= end && seg.end >= start {
        merged_start = merged_start.min(seg.start);
        merged_end = merged_end.max(seg.end);
        let seg = self.segments.remove(i);
        self.stored_bytes -= seg.data.len() as u64;
        absorbed.push(seg);
      } else {
        i += 1;
      }
    }

    let data = if absorbed.is_empty() && merged_start == start && merged_end == end {
      data
    } else {
      let mut merged = BytesMut::zeroed((merged_end - merged_start) as usize);
      for seg in &absorbed {
        let off = (seg.start - merged_start) as usize;
        merged[off..off + seg.data.len()].copy_from_slice(&seg.data);
      }
      // Fresh bytes win over stale cache content
      let off = (start - merged_start) as usize;
      merged[off..off + data.len()].copy_from_slice(&data);
      merged.freeze()
    };

    self.access_counter += 1;
    self.stored_bytes += data.len() as u64;
    let seg = Segment {
      start: merged_start,
      end: merged_end,
      data,
      last_used: self.access_counter,
    };
    let pos = self.segments.partition_point(|s| s.start < seg.start);
    self.segments.insert(pos, seg);
  }

  /// Evict least-recently-used whole segments until the budget holds.
  /// The protected range (the segment just inserted) is never evicted.
  fn evict(&mut self, budget: u64, protect_start: u64, protect_end: u64) {
    while self.stored_bytes > budget {
      let victim = self
        .segments
        .iter()
        .enumerate()
        .filter(|(_, seg)| seg.end <= protect_start || seg.start >= protect_end)
        .min_by_key(|(_, seg)| seg.last_used)
        .map(|(i, _)| i);
      match victim {
        Some(i) => {
          let seg = self.segments.remove(i);
          self.stored_bytes -= seg.data.len() as u64;
          tracing::trace!(
            target: "mediamux::io",
            start = seg.start,
            end = seg.end,
            "evicted cached segment"
          );
        }
        None => break,
      }
    }
  }
}

/// Caching reader over an abstract [`Source`]
pub struct Reader {
  source: Box<dyn Source>,
  options: ReaderOptions,
  state: Mutex<CacheState>,
  size: OnceCell<u64>,
}

impl Reader {
  pub fn new(source: Box<dyn Source>) -> Self {
    Self::with_options(source, ReaderOptions::default())
  }

  pub fn with_options(source: Box<dyn Source>, options: ReaderOptions) -> Self {
    Self {
      source,
      options,
      state: Mutex::new(CacheState::default()),
      size: OnceCell::new(),
    }
  }

  /// Total source size, fetched once
  pub async fn size(&self) -> Result<u64> {
    self
      .size
      .get_or_try_init(|| self.source.size())
      .await
      .copied()
  }

  /// Ensure `[start, end)` is cached, issuing at most one source read.
  ///
  /// Read errors from the source surface to the caller; other tasks waiting
  /// on the same pending load re-check and re-issue.
  pub async fn load_range(&self, start: u64, mut end: u64) -> Result<()> {
    let size = self.size().await?;
    end = end.min(size);
    if start >= end {
      return Ok(());
    }

    loop {
      enum Action {
        Done,
        Wait(watch::Receiver<bool>),
        Load(watch::Sender<bool>),
      }

      let action = {
        let mut state = self.state.lock().await;
        if let Some(idx) = state.covering_segment_index(start, end) {
          state.touch(idx);
          Action::Done
        } else if let Some(pending) = state
          .pending
          .iter()
          .find(|p| p.start <= start && p.end >= end)
        {
          Action::Wait(pending.done.clone())
        } else {
          let (tx, rx) = watch::channel(false);
          state.pending.push(PendingLoad {
            start,
            end,
            done: rx,
          });
          Action::Load(tx)
        }
      };

      match action {
        Action::Done => return Ok(()),
        Action::Wait(mut rx) => {
          // A send or a dropped sender both wake us; re-check either way
          let _ = rx.changed().await;
        }
        Action::Load(tx) => {
          let result = self.source.read(start, end).await;
          let mut state = self.state.lock().await;
          state.pending.retain(|p| !(p.start == start && p.end == end));
          let _ = tx.send(true);
          let data = result?;
          state.insert_segment(start, start + data.len() as u64, data);
          state.evict(self.options.max_cache_bytes, start, end);
          return Ok(());
        }
      }
    }
  }

  /// Whether `[start, end)` is fully covered by one cached segment
  pub async fn range_is_loaded(&self, start: u64, end: u64) -> bool {
    if start >= end {
      return true;
    }
    let state = self.state.lock().await;
    state.covering_segment_index(start, end).is_some()
  }

  /// Borrow the cached bytes for `[start, end)`. Fails with
  /// [`Error::NotLoaded`] when the range was never loaded.
  pub async fn view(&self, start: u64, end: u64) -> Result<Bytes> {
    if start >= end {
      return Ok(Bytes::new());
    }
    let mut state = self.state.lock().await;
    match state.covering_segment_index(start, end) {
      Some(idx) => {
        state.touch(idx);
        let seg = &state.segments[idx];
        let off = (start - seg.start) as usize;
        Ok(seg.data.slice(off..off + (end - start) as usize))
      }
      None => Err(Error::NotLoaded { start, end }),
    }
  }

  /// Load then view in one step
  pub async fn read_range(&self, start: u64, end: u64) -> Result<Bytes> {
    self.load_range(start, end).await?;
    let size = self.size().await?;
    self.view(start, end.min(size)).await
  }

  /// Drop cached segments fully contained in `[start, end)`. Segments are
  /// never split.
  pub async fn forget_range(&self, start: u64, end: u64) {
    let mut state = self.state.lock().await;
    let mut i = 0;
    while i < state.segments.len() {
      let seg = &state.segments[i];
      if seg.start >= start && seg.end <= end {
        let seg = state.segments.remove(i);
        state.stored_bytes -= seg.data.len() as u64;
      } else {
        i += 1;
      }
    }
  }

  /// Bytes currently held in the cache
  pub async fn cached_bytes(&self) -> u64 {
    self.state.lock().await.stored_bytes
  }
}

// Helpers demuxers use constantly on top of read_range

impl Reader {
  pub async fn read_u8_at(&self, pos: u64) -> Result<u8> {
    let b = self.read_range(pos, pos + 1).await?;
    b.first()
      .copied()
      .ok_or_else(|| Error::invalid("read past end of source"))
  }

  pub async fn read_u32_be_at(&self, pos: u64) -> Result<u32> {
    let b = self.read_range(pos, pos + 4).await?;
    if b.len() < 4 {
      return Err(Error::invalid("read past end of source"));
    }
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
  }

  pub async fn read_u64_be_at(&self, pos: u64) -> Result<u64> {
    let b = self.read_range(pos, pos + 8).await?;
    if b.len() < 8 {
      return Err(Error::invalid("read past end of source"));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b);
    Ok(u64::from_be_bytes(buf))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::io::source::BufferSource;

  fn reader_over(data: Vec<u8>, budget: u64) -> Reader {
    Reader::with_options(
      Box::new(BufferSource::new(data)),
      ReaderOptions {
        max_cache_bytes: budget,
      },
    )
  }

  #[tokio::test]
  async fn test_load_then_view() {
    let reader = reader_over((0u8..=255).collect(), 1024);
    reader.load_range(10, 20).await.unwrap();
    assert!(reader.range_is_loaded(10, 20).await);
    assert!(reader.range_is_loaded(12, 15).await);
    assert!(!reader.range_is_loaded(5, 12).await);
    let view = reader.view(12, 16).await.unwrap();
    assert_eq!(view.as_ref(), &[12, 13, 14, 15]);
  }

  #[tokio::test]
  async fn test_view_unloaded_fails() {
    let reader = reader_over(vec![0; 64], 1024);
    match reader.view(0, 8).await {
      Err(Error::NotLoaded { start: 0, end: 8 }) => {}
      other => panic!("expected NotLoaded, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_overlapping_segments_merge() {
    let reader = reader_over((0u8..=255).collect(), 1024);
    reader.load_range(0, 10).await.unwrap();
    reader.load_range(8, 20).await.unwrap();
    // Merged into one segment covering the union
    assert!(reader.range_is_loaded(0, 20).await);
    let view = reader.view(6, 12).await.unwrap();
    assert_eq!(view.as_ref(), &[6, 7, 8, 9, 10, 11]);
  }

  #[tokio::test]
  async fn test_lru_eviction_respects_budget() {
    let reader = reader_over(vec![7u8; 4096], 64);
    reader.load_range(0, 32).await.unwrap();
    reader.load_range(100, 132).await.unwrap();
    // Touch the first segment so the second becomes the LRU victim
    reader.view(0, 32).await.unwrap();
    reader.load_range(200, 232).await.unwrap();
    assert!(reader.cached_bytes().await <= 64);
    assert!(reader.range_is_loaded(0, 32).await);
    assert!(!reader.range_is_loaded(100, 132).await);
  }

  #[tokio::test]
  async fn test_forget_range_drops_whole_segments() {
    let reader = reader_over(vec![0u8; 256], 1024);
    reader.load_range(0, 16).await.unwrap();
    reader.load_range(32, 48).await.unwrap();
    reader.forget_range(0, 20).await;
    assert!(!reader.range_is_loaded(0, 16).await);
    assert!(reader.range_is_loaded(32, 48).await);
  }

  #[tokio::test]
  async fn test_load_clamped_to_size() {
    let reader = reader_over(vec![1u8; 16], 1024);
    reader.load_range(8, 64).await.unwrap();
    assert!(reader.range_is_loaded(8, 16).await);
    assert_eq!(reader.read_range(8, 64).await.unwrap().len(), 8);
  }

  #[tokio::test]
  async fn test_concurrent_contained_load_coalesces() {
    let reader = std::sync::Arc::new(reader_over((0u8..=255).collect(), 4096));
    let a = {
      let r = reader.clone();
      tokio::spawn(async move { r.load_range(0, 128).await })
    };
    let b = {
      let r = reader.clone();
      tokio::spawn(async move { r.load_range(16, 64).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();
    assert!(reader.range_is_loaded(16, 64).await);
  }

  #[tokio::test]
  async fn test_integer_helpers() {
    let reader = reader_over(vec![0, 0, 0, 5, 1, 2, 3, 4, 5, 6, 7, 8], 1024);
    assert_eq!(reader.read_u32_be_at(0).await.unwrap(), 5);
    assert_eq!(reader.read_u8_at(4).await.unwrap(), 1);
    assert_eq!(
      reader.read_u64_be_at(4).await.unwrap(),
      u64::from_be_bytes([1, 2, 3, 4, 5, 6, 7, 8])
    );
  }
}
