//! Sample sinks: decoder-driven iteration over decoded media
//!
//! `samples_in_range` starts at the latest key packet at or before the
//! range start, decodes forward, and stops at the first key packet past the
//! range end (key packets are never reordered, so nothing decoded beyond it
//! can belong to the range). Samples before the range start are held back,
//! with the last one re-emitted as the first sample so the consumer sees
//! one frame covering the start.
//!
//! `samples_at_timestamps` reuses the packet batch between requests landing
//! on the same key packet, flushes the decoder on key jumps, and serves
//! repeated timestamps as clones of the last emitted sample.

use crate::codecs::decoder::{AudioDecoderWrapper, VideoDecoderWrapper};
use crate::demux::PacketRetrievalOptions;
use crate::error::Result;
use crate::packet::EncodedPacket;
use crate::sample::{AudioSample, VideoSample};
use crate::sink::SharedDemuxer;

/// Decoded-sample queue bound while no sample has been consumed yet
const QUEUE_LIMIT_EMPTY: usize = 40;
/// Decoded-sample queue bound once output is flowing
const QUEUE_LIMIT_BUFFERED: usize = 8;

/// Unifies the two decoder wrappers for generic sink plumbing
pub trait SampleDecoder: Send {
  type Sample: Clone + Send;

  fn decode(&mut self, packet: &EncodedPacket) -> Result<Vec<Self::Sample>>;
  fn flush(&mut self) -> Result<Vec<Self::Sample>>;
  fn close(&mut self);
  fn timestamp(sample: &Self::Sample) -> f64;
}

impl SampleDecoder for VideoDecoderWrapper {
  type Sample = VideoSample;

  fn decode(&mut self, packet: &EncodedPacket) -> Result<Vec<VideoSample>> {
    VideoDecoderWrapper::decode(self, packet)
  }

  fn flush(&mut self) -> Result<Vec<VideoSample>> {
    VideoDecoderWrapper::flush(self)
  }

  fn close(&mut self) {
    VideoDecoderWrapper::close(self)
  }

  fn timestamp(sample: &VideoSample) -> f64 {
    sample.timestamp
  }
}

impl SampleDecoder for AudioDecoderWrapper {
  type Sample = AudioSample;

  fn decode(&mut self, packet: &EncodedPacket) -> Result<Vec<AudioSample>> {
    AudioDecoderWrapper::decode(self, packet)
  }

  fn flush(&mut self) -> Result<Vec<AudioSample>> {
    AudioDecoderWrapper::flush(self)
  }

  fn close(&mut self) {
    AudioDecoderWrapper::close(self)
  }

  fn timestamp(sample: &AudioSample) -> f64 {
    sample.timestamp
  }
}

/// Decoder-driven sample source for one track
pub struct MediaSampleSink<D: SampleDecoder> {
  demuxer: SharedDemuxer,
  track_id: u32,
  decoder: D,
}

/// Video flavor of [`MediaSampleSink`]
pub type VideoSampleSink = MediaSampleSink<VideoDecoderWrapper>;
/// Audio flavor of [`MediaSampleSink`]
pub type AudioSampleSink = MediaSampleSink<AudioDecoderWrapper>;

impl<D: SampleDecoder> MediaSampleSink<D> {
  pub fn new(demuxer: SharedDemuxer, track_id: u32, decoder: D) -> Self {
    Self {
      demuxer,
      track_id,
      decoder,
    }
  }

  pub fn track_id(&self) -> u32 {
    self.track_id
  }

  /// Iterate decoded samples covering `[start, end)` in presentation order
  pub fn samples_in_range(&mut self, start: f64, end: f64) -> SampleRangeIter<'_, D> {
    SampleRangeIter {
      sink: self,
      start,
      end,
      queue: Vec::new(),
      pending_first: None,
      current_packet: None,
      initialized: false,
      input_done: false,
      done: false,
      emitted_any: false,
    }
  }

  /// Iterate decoded samples for an explicit timestamp list
  pub fn samples_at_timestamps(&mut self, timestamps: Vec<f64>) -> SampleTimestampIter<'_, D> {
    SampleTimestampIter {
      sink: self,
      timestamps,
      cursor: 0,
      current_key_sequence: None,
      current_packet: None,
      decoded: Vec::new(),
      last_emitted: None,
      input_flushed: false,
    }
  }
}

// ============================================================================
// Range iteration
// ============================================================================

/// Iterator returned by [`MediaSampleSink::samples_in_range`]
pub struct SampleRangeIter<'a, D: SampleDecoder> {
  sink: &'a mut MediaSampleSink<D>,
  start: f64,
  end: f64,
  queue: Vec<D::Sample>,
  /// The most recent sample before the range start; re-emitted as the first
  /// sample so the range start is covered
  pending_first: Option<D::Sample>,
  current_packet: Option<EncodedPacket>,
  initialized: bool,
  input_done: bool,
  done: bool,
  emitted_any: bool,
}

impl<D: SampleDecoder> SampleRangeIter<'_, D> {
  /// Next sample in presentation order, or `None` past the range end
  pub async fn next(&mut self) -> Result<Option<D::Sample>> {
    if self.done {
      return Ok(None);
    }
    if !self.initialized {
      self.initialized = true;
      let options = PacketRetrievalOptions::default();
      let mut demuxer = self.sink.demuxer.lock().await;
      self.current_packet =
        match demuxer.key_packet_at(self.sink.track_id, self.start, options).await? {
          Some(packet) => Some(packet),
          None => demuxer.first_packet(self.sink.track_id, options).await?,
        };
    }

    loop {
      // Drain the queue first
      while !self.queue.is_empty() {
        let sample = self.queue.remove(0);
        let ts = D::timestamp(&sample);
        if ts < self.start {
          // Held back; only the last pre-start sample survives
          self.pending_first = Some(sample);
          continue;
        }
        if ts >= self.end {
          self.done = true;
          // The range start may still only be covered by a held sample
          if !self.emitted_any {
            if let Some(first) = self.pending_first.take() {
              self.emitted_any = true;
              return Ok(Some(first));
            }
          }
          return Ok(None);
        }
        if let Some(first) = self.pending_first.take() {
          self.queue.insert(0, sample);
          self.emitted_any = true;
          return Ok(Some(first));
        }
        self.emitted_any = true;
        return Ok(Some(sample));
      }

      if self.input_done {
        self.done = true;
        // All samples landed before the range start
        if !self.emitted_any {
          if let Some(first) = self.pending_first.take() {
            self.emitted_any = true;
            return Ok(Some(first));
          }
        }
        return Ok(None);
      }

      // Feed more packets, bounded by the decoded-sample queue
      let limit = if self.emitted_any {
        QUEUE_LIMIT_BUFFERED
      } else {
        QUEUE_LIMIT_EMPTY
      };
      while self.queue.len() < limit {
        let Some(packet) = self.current_packet.take() else {
          self.queue.extend(self.sink.decoder.flush()?);
          self.input_done = true;
          break;
        };
        // First key packet past the end bounds the feed; key packets are
        // never reordered, so nothing beyond it belongs to the range
        if packet.is_key() && packet.timestamp >= self.end {
          self.queue.extend(self.sink.decoder.flush()?);
          self.input_done = true;
          break;
        }
        self.queue.extend(self.sink.decoder.decode(&packet)?);
        let mut demuxer = self.sink.demuxer.lock().await;
        self.current_packet = demuxer
          .next_packet(self.sink.track_id, &packet, PacketRetrievalOptions::default())
          .await?;
        if !self.queue.is_empty() {
          break;
        }
      }
    }
  }

  /// Cancel the iteration, closing held samples
  pub fn close(&mut self) {
    self.queue.clear();
    self.pending_first = None;
    self.done = true;
  }
}

// ============================================================================
// Timestamp-list iteration
// ============================================================================

/// Iterator returned by [`MediaSampleSink::samples_at_timestamps`]
pub struct SampleTimestampIter<'a, D: SampleDecoder> {
  sink: &'a mut MediaSampleSink<D>,
  timestamps: Vec<f64>,
  cursor: usize,
  /// Key-packet batch identity; a request on the same key packet reuses the
  /// packets already fed
  current_key_sequence: Option<i64>,
  current_packet: Option<EncodedPacket>,
  /// Presentation-ordered samples decoded in the current batch
  decoded: Vec<D::Sample>,
  last_emitted: Option<D::Sample>,
  input_flushed: bool,
}

impl<D: SampleDecoder> SampleTimestampIter<'_, D> {
  /// Decode the sample for the next requested timestamp. Yields one result
  /// per input timestamp; `None` when the timestamp precedes the track.
  pub async fn next(&mut self) -> Result<Option<Option<D::Sample>>> {
    if self.cursor >= self.timestamps.len() {
      return Ok(None);
    }
    let target_ts = self.timestamps[self.cursor];
    self.cursor += 1;

    let options = PacketRetrievalOptions {
      metadata_only: true,
      verify_key_packets: false,
    };
    let (target, key) = {
      let mut demuxer = self.sink.demuxer.lock().await;
      let target = demuxer.packet_at(self.sink.track_id, target_ts, options).await?;
      let key = demuxer
        .key_packet_at(self.sink.track_id, target_ts, options)
        .await?;
      (target, key)
    };
    let (Some(target), Some(key)) = (target, key) else {
      return Ok(Some(None));
    };

    // Repeat timestamps that resolve to an already-emitted sample clone it
    // instead of re-decoding
    if let Some(last) = &self.last_emitted {
      if D::timestamp(last) == target.timestamp {
        return Ok(Some(Some(last.clone())));
      }
    }

    // A jump to a different key packet resets the decoder batch
    if self.current_key_sequence != Some(key.sequence_number) {
      let _ = self.sink.decoder.flush()?;
      self.decoded.clear();
      self.current_key_sequence = Some(key.sequence_number);
      self.input_flushed = false;
      let mut demuxer = self.sink.demuxer.lock().await;
      self.current_packet = demuxer
        .key_packet_at(
          self.sink.track_id,
          target_ts,
          PacketRetrievalOptions::default(),
        )
        .await?;
    }

    // Feed forward until the floor sample for the target is decoded
    loop {
      if let Some(found) = floor_sample::<D>(&self.decoded, target_ts) {
        self.last_emitted = Some(found.clone());
        return Ok(Some(Some(found)));
      }
      if self.input_flushed {
        let found = floor_sample::<D>(&self.decoded, target_ts)
          .or_else(|| self.decoded.last().cloned());
        self.last_emitted = found.clone();
        return Ok(Some(found));
      }
      let Some(packet) = self.current_packet.take() else {
        self.decoded.extend(self.sink.decoder.flush()?);
        self.input_flushed = true;
        continue;
      };
      self.decoded.extend(self.sink.decoder.decode(&packet)?);
      let mut demuxer = self.sink.demuxer.lock().await;
      self.current_packet = demuxer
        .next_packet(self.sink.track_id, &packet, PacketRetrievalOptions::default())
        .await?;
      if self.current_packet.is_none() {
        self.decoded.extend(self.sink.decoder.flush()?);
        self.input_flushed = true;
      }
    }
  }
}

/// The decoded sample with the largest timestamp ≤ `target`, only accepted
/// once a later sample proves it is final
fn floor_sample<D: SampleDecoder>(decoded: &[D::Sample], target: f64) -> Option<D::Sample> {
  let mut best: Option<&D::Sample> = None;
  let mut has_later = false;
  for sample in decoded {
    let ts = D::timestamp(sample);
    if ts <= target {
      match best {
        Some(b) if D::timestamp(b) >= ts => {}
        _ => best = Some(sample),
      }
    } else {
      has_later = true;
    }
  }
  if has_later {
    best.cloned()
  } else {
    None
  }
}
