//! Writer variants behind one seekable contract
//!
//! All writes land at the current position; `seek` is used to backpatch
//! previously reserved headers. Three variants: in-memory, streaming
//! (forward-only consumer fed sorted coalesced sections), and chunked
//! streaming (fixed-size chunks emitted once fully written).

use bytes::Bytes;

use crate::error::{Error, Result};

/// Callback receiving `(bytes, file_offset)` pairs from streaming writers
pub type DataCallback = Box<dyn FnMut(Bytes, u64) + Send>;

/// Common writer contract shared by all variants
pub trait Writer: Send {
  /// Write `data` at the current position and advance
  fn write(&mut self, data: &[u8]) -> Result<()>;

  /// Move the write position (backpatching previously reserved space)
  fn seek(&mut self, pos: u64);

  /// Current write position
  fn pos(&self) -> u64;

  /// Push buffered sections to the consumer (streaming variants)
  fn flush(&mut self) -> Result<()>;

  /// Flush remaining data and seal the writer. Further writes fail.
  fn finalize(&mut self) -> Result<()>;
}

// ============================================================================
// BufferWriter - in-memory
// ============================================================================

/// Grow-on-demand in-memory writer. `finalize` truncates to the high-water
/// mark so backpatch seeks never leave trailing garbage.
#[derive(Default, Debug)]
pub struct BufferWriter {
  buf: Vec<u8>,
  pos: u64,
  high_water: u64,
  finalized: bool,
}

impl BufferWriter {
  pub fn new() -> Self {
    Self::default()
  }

  /// Take the finished bytes out of the writer
  pub fn into_bytes(self) -> Bytes {
    Bytes::from(self.buf)
  }

  pub fn as_slice(&self) -> &[u8] {
    &self.buf
  }
}

impl Writer for BufferWriter {
  fn write(&mut self, data: &[u8]) -> Result<()> {
    if self.finalized {
      return Err(Error::StateViolation("write after finalize"));
    }
    let end = self.pos as usize + data.len();
    if end > self.buf.len() {
      self.buf.resize(end, 0);
    }
    self.buf[self.pos as usize..end].copy_from_slice(data);
    self.pos = end as u64;
    self.high_water = self.high_water.max(self.pos);
    Ok(())
  }

  fn seek(&mut self, pos: u64) {
    self.pos = pos;
  }

  fn pos(&self) -> u64 {
    self.pos
  }

  fn flush(&mut self) -> Result<()> {
    Ok(())
  }

  fn finalize(&mut self) -> Result<()> {
    if self.finalized {
      return Err(Error::StateViolation("finalize called twice"));
    }
    self.buf.truncate(self.high_water as usize);
    self.finalized = true;
    Ok(())
  }
}

// ============================================================================
// StreamWriter - forward-only consumer
// ============================================================================

struct Section {
  offset: u64,
  data: Vec<u8>,
}

/// Accumulates write sections; `flush` coalesces overlapping or contiguous
/// sections and emits `(bytes, offset)` callbacks in sorted order. Seeking
/// only backpatches sections not yet flushed.
pub struct StreamWriter {
  sections: Vec<Section>,
  pos: u64,
  on_data: DataCallback,
  finalized: bool,
}

impl StreamWriter {
  pub fn new(on_data: DataCallback) -> Self {
    Self {
      sections: Vec::new(),
      pos: 0,
      on_data,
      finalized: false,
    }
  }
}

impl Writer for StreamWriter {
  fn write(&mut self, data: &[u8]) -> Result<()> {
    if self.finalized {
      return Err(Error::StateViolation("write after finalize"));
    }
    if !data.is_empty() {
      // Extend the previous section when the write continues it
      if let Some(last) = self.sections.last_mut() {
        if last.offset + last.data.len() as u64 == self.pos {
          last.data.extend_from_slice(data);
          self.pos += data.len() as u64;
          return Ok(());
        }
      }
      self.sections.push(Section {
        offset: self.pos,
        data: data.to_vec(),
      });
    }
    self.pos += data.len() as u64;
    Ok(())
  }

  fn seek(&mut self, pos: u64) {
    self.pos = pos;
  }

  fn pos(&self) -> u64 {
    self.pos
  }

  fn flush(&mut self) -> Result<()> {
    if self.sections.is_empty() {
      return Ok(());
    }

    // Group sections into coalesced coverage ranges, sorted by start
    let mut order: Vec<usize> = (0..self.sections.len()).collect();
    order.sort_by_key(|&i| self.sections[i].offset);

    struct Group {
      start: u64,
      end: u64,
      members: Vec<usize>,
    }
    let mut groups: Vec<Group> = Vec::new();
    for i in order {
      let s = &self.sections[i];
      let s_end = s.offset + s.data.len() as u64;
      match groups.last_mut() {
        Some(g) if s.offset <= g.end => {
          g.end = g.end.max(s_end);
          g.members.push(i);
        }
        _ => groups.push(Group {
          start: s.offset,
          end: s_end,
          members: vec![i],
        }),
      }
    }

    for g in &mut groups {
      let mut out = vec![0u8; (g.end - g.start) as usize];
      // Apply in original write order so later writes win on overlap
      g.members.sort_unstable();
      for &i in &g.members {
        let s = &self.sections[i];
        let off = (s.offset - g.start) as usize;
        out[off..off + s.data.len()].copy_from_slice(&s.data);
      }
      (self.on_data)(Bytes::from(out), g.start);
    }

    self.sections.clear();
    Ok(())
  }

  fn finalize(&mut self) -> Result<()> {
    if self.finalized {
      return Err(Error::StateViolation("finalize called twice"));
    }
    self.flush()?;
    self.finalized = true;
    Ok(())
  }
}

// ============================================================================
// ChunkedStreamWriter - fixed-size chunk emission
// ============================================================================

/// Options for [`ChunkedStreamWriter`]
#[derive(Debug, Clone)]
pub struct ChunkedWriterOptions {
  /// Size of each emitted chunk
  pub chunk_size: usize,
  /// Maximum chunks kept in flight before the oldest is force-flushed
  pub max_in_flight: usize,
}

impl Default for ChunkedWriterOptions {
  fn default() -> Self {
    Self {
      chunk_size: 16 * 1024 * 1024,
      max_in_flight: 4,
    }
  }
}

struct ChunkBuf {
  start: u64,
  data: Vec<u8>,
  /// Sorted, merged written ranges relative to the chunk start
  written: Vec<(usize, usize)>,
}

impl ChunkBuf {
  fn mark_written(&mut self, start: usize, end: usize) {
    let pos = self.written.partition_point(|&(s, _)| s < start);
    self.written.insert(pos, (start, end));
    // Merge neighbors
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(self.written.len());
    for &(s, e) in self.written.iter() {
      match merged.last_mut() {
        Some(last) if s <= last.1 => last.1 = last.1.max(e),
        _ => merged.push((s, e)),
      }
    }
    self.written = merged;
  }

  fn fully_written(&self, chunk_size: usize) -> bool {
    self.written.len() == 1 && self.written[0] == (0, chunk_size)
  }

  fn high_water(&self) -> usize {
    self.written.last().map(|&(_, e)| e).unwrap_or(0)
  }
}

/// Partitions writes into fixed-size chunks; a chunk is emitted once every
/// byte in it has been written at least once, or when forced out by the
/// in-flight limit or by `finalize`.
pub struct ChunkedStreamWriter {
  options: ChunkedWriterOptions,
  /// In creation order, which doubles as age order for the in-flight cap
  chunks: Vec<ChunkBuf>,
  pos: u64,
  on_data: DataCallback,
  finalized: bool,
}

impl ChunkedStreamWriter {
  pub fn new(on_data: DataCallback) -> Self {
    Self::with_options(on_data, ChunkedWriterOptions::default())
  }

  pub fn with_options(on_data: DataCallback, options: ChunkedWriterOptions) -> Self {
    Self {
      options,
      chunks: Vec::new(),
      pos: 0,
      on_data,
      finalized: false,
    }
  }

  fn chunk_index_for(&mut self, chunk_start: u64) -> usize {
    if let Some(i) = self.chunks.iter().position(|c| c.start == chunk_start) {
      return i;
    }
    self.chunks.push(ChunkBuf {
      start: chunk_start,
      data: vec![0u8; self.options.chunk_size],
      written: Vec::new(),
    });
    self.chunks.len() - 1
  }

  fn emit(&mut self, i: usize) {
    let chunk = self.chunks.remove(i);
    let end = chunk.high_water();
    if end > 0 {
      let mut data = chunk.data;
      data.truncate(end);
      (self.on_data)(Bytes::from(data), chunk.start);
    }
  }
}

impl Writer for ChunkedStreamWriter {
  fn write(&mut self, data: &[u8]) -> Result<()> {
    if self.finalized {
      return Err(Error::StateViolation("write after finalize"));
    }
    let chunk_size = self.options.chunk_size as u64;
    let mut written = 0usize;
    while written < data.len() {
      let pos = self.pos + written as u64;
      let chunk_start = pos / chunk_size * chunk_size;
      let within = (pos - chunk_start) as usize;
      let take = (data.len() - written).min(self.options.chunk_size - within);

      let i = self.chunk_index_for(chunk_start);
      self.chunks[i].data[within..within + take].copy_from_slice(&data[written..written + take]);
      self.chunks[i].mark_written(within, within + take);
      written += take;

      if self.chunks[i].fully_written(self.options.chunk_size) {
        self.emit(i);
      }
    }
    self.pos += data.len() as u64;

    // Oldest chunks are force-flushed past the in-flight limit
    while self.chunks.len() > self.options.max_in_flight {
      self.emit(0);
    }
    Ok(())
  }

  fn seek(&mut self, pos: u64) {
    self.pos = pos;
  }

  fn pos(&self) -> u64 {
    self.pos
  }

  fn flush(&mut self) -> Result<()> {
    Ok(())
  }

  fn finalize(&mut self) -> Result<()> {
    if self.finalized {
      return Err(Error::StateViolation("finalize called twice"));
    }
    // Emit stragglers in file order
    self.chunks.sort_by_key(|c| c.start);
    while !self.chunks.is_empty() {
      self.emit(0);
    }
    self.finalized = true;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{Arc, Mutex};

  fn collecting_callback() -> (DataCallback, Arc<Mutex<Vec<(u64, Vec<u8>)>>>) {
    let emitted: Arc<Mutex<Vec<(u64, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = emitted.clone();
    let cb: DataCallback = Box::new(move |bytes, offset| {
      sink.lock().unwrap().push((offset, bytes.to_vec()));
    });
    (cb, emitted)
  }

  #[test]
  fn test_buffer_writer_backpatch_and_truncate() {
    let mut w = BufferWriter::new();
    w.write(&[0; 8]).unwrap();
    w.write(b"payload").unwrap();
    let end = w.pos();
    w.seek(0);
    w.write(&end.to_be_bytes()).unwrap();
    w.seek(end);
    w.finalize().unwrap();
    let bytes = w.into_bytes();
    assert_eq!(bytes.len(), 15);
    assert_eq!(&bytes[..8], &15u64.to_be_bytes());
    assert_eq!(&bytes[8..], b"payload");
  }

  #[test]
  fn test_buffer_writer_double_finalize_fails() {
    let mut w = BufferWriter::new();
    w.write(&[1]).unwrap();
    w.finalize().unwrap();
    assert!(matches!(
      w.finalize(),
      Err(Error::StateViolation("finalize called twice"))
    ));
  }

  #[test]
  fn test_stream_writer_coalesces_sorted() {
    let (cb, emitted) = collecting_callback();
    let mut w = StreamWriter::new(cb);
    w.write(b"abcd").unwrap();
    w.seek(100);
    w.write(b"zz").unwrap();
    w.seek(4);
    w.write(b"efgh").unwrap();
    w.flush().unwrap();

    let emitted = emitted.lock().unwrap();
    assert_eq!(emitted.len(), 2);
    assert_eq!(emitted[0], (0, b"abcdefgh".to_vec()));
    assert_eq!(emitted[1], (100, b"zz".to_vec()));
  }

  #[test]
  fn test_stream_writer_later_write_wins_on_overlap() {
    let (cb, emitted) = collecting_callback();
    let mut w = StreamWriter::new(cb);
    w.write(b"xxxxxxxx").unwrap();
    w.seek(2);
    w.write(b"MID").unwrap();
    w.flush().unwrap();

    let emitted = emitted.lock().unwrap();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0], (0, b"xxMIDxxx".to_vec()));
  }

  #[test]
  fn test_chunked_writer_emits_full_chunks() {
    let (cb, emitted) = collecting_callback();
    let mut w = ChunkedStreamWriter::with_options(
      cb,
      ChunkedWriterOptions {
        chunk_size: 4,
        max_in_flight: 8,
      },
    );
    w.write(&[1, 2, 3, 4, 5, 6]).unwrap();
    {
      let emitted = emitted.lock().unwrap();
      assert_eq!(emitted.as_slice(), &[(0, vec![1, 2, 3, 4])]);
    }
    w.finalize().unwrap();
    let emitted = emitted.lock().unwrap();
    assert_eq!(emitted.as_slice(), &[(0, vec![1, 2, 3, 4]), (4, vec![5, 6])]);
  }

  #[test]
  fn test_chunked_writer_backpatch_completes_chunk() {
    let (cb, emitted) = collecting_callback();
    let mut w = ChunkedStreamWriter::with_options(
      cb,
      ChunkedWriterOptions {
        chunk_size: 4,
        max_in_flight: 8,
      },
    );
    // Leave a hole at bytes 0..2, fill it later
    w.seek(2);
    w.write(&[3, 4]).unwrap();
    assert!(emitted.lock().unwrap().is_empty());
    w.seek(0);
    w.write(&[1, 2]).unwrap();
    let emitted = emitted.lock().unwrap();
    assert_eq!(emitted.as_slice(), &[(0, vec![1, 2, 3, 4])]);
  }

  #[test]
  fn test_chunked_writer_in_flight_limit() {
    let (cb, emitted) = collecting_callback();
    let mut w = ChunkedStreamWriter::with_options(
      cb,
      ChunkedWriterOptions {
        chunk_size: 4,
        max_in_flight: 1,
      },
    );
    // Two partial chunks; the older one is forced out
    w.write(&[1]).unwrap();
    w.seek(4);
    w.write(&[5]).unwrap();
    let snapshot = emitted.lock().unwrap().clone();
    assert_eq!(snapshot, vec![(0, vec![1])]);
  }
}
