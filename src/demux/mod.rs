//! Container demuxers
//!
//! Parsers that read container files through the caching
//! [`Reader`](crate::io::Reader), build per-track indexes, and expose packet
//! retrieval by timestamp, by sequence, or by key-packet boundary.

pub mod isobmff;
pub mod matroska;
pub mod riff;

pub use isobmff::IsobmffDemuxer;
pub use matroska::MatroskaDemuxer;
pub use riff::RiffDemuxer;

use bytes::Bytes;

use crate::codecs::VideoCodec;
use crate::error::{Error, Result};
use crate::io::{Reader, Source};
use crate::packet::{EncodedPacket, PacketType};
use crate::track::TrackInfo;

/// Options for packet retrieval
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketRetrievalOptions {
  /// Do not read payload bytes; the returned packet carries its real size
  /// but an empty `data`
  pub metadata_only: bool,
  /// Inspect the bitstream to verify key-packet flags; a mis-labeled key
  /// falls back to the previous key packet
  pub verify_key_packets: bool,
}

// ============================================================================
// Track index
// ============================================================================

/// One locatable packet in the file
#[derive(Debug, Clone)]
pub(crate) struct IndexedSample {
  pub offset: u64,
  pub size: u32,
  pub is_key: bool,
  pub pts: f64,
  pub dts: f64,
  pub duration: f64,
  /// Decode-order index; strictly increasing, not necessarily dense
  pub sequence: i64,
}

/// Per-track packet index, ordered by decode sequence
#[derive(Debug, Default)]
pub(crate) struct TrackIndex {
  samples: Vec<IndexedSample>,
  pts_sorted: Vec<usize>,
  dirty: bool,
}

impl TrackIndex {
  pub fn insert(&mut self, batch: impl IntoIterator<Item = IndexedSample>) {
    let before = self.samples.len();
    self.samples.extend(batch);
    if self.samples.len() != before {
      // Keep decode order even when batches arrive out of file order
      // (cue-driven cluster jumps)
      self.samples.sort_by_key(|s| s.sequence);
      self.samples.dedup_by_key(|s| s.sequence);
      self.dirty = true;
    }
  }

  pub fn len(&self) -> usize {
    self.samples.len()
  }

  pub fn is_empty(&self) -> bool {
    self.samples.is_empty()
  }

  fn pts_order(&mut self) -> &[usize] {
    if self.dirty {
      let mut order: Vec<usize> = (0..self.samples.len()).collect();
      order.sort_by(|&a, &b| {
        self.samples[a]
          .pts
          .partial_cmp(&self.samples[b].pts)
          .unwrap_or(std::cmp::Ordering::Equal)
      });
      self.pts_sorted = order;
      self.dirty = false;
    }
    &self.pts_sorted
  }

  pub fn first(&self) -> Option<&IndexedSample> {
    self.samples.first()
  }

  pub fn last_sequence(&self) -> Option<i64> {
    self.samples.last().map(|s| s.sequence)
  }

  pub fn max_pts_end(&self) -> f64 {
    self
      .samples
      .iter()
      .map(|s| s.pts + s.duration)
      .fold(0.0, f64::max)
  }

  pub fn by_sequence(&self, sequence: i64) -> Option<&IndexedSample> {
    self
      .samples
      .binary_search_by_key(&sequence, |s| s.sequence)
      .ok()
      .map(|i| &self.samples[i])
  }

  /// Decode-order successor
  pub fn next_after(&self, sequence: i64) -> Option<&IndexedSample> {
    let pos = self.samples.partition_point(|s| s.sequence <= sequence);
    self.samples.get(pos)
  }

  /// The sample with the largest presentation timestamp ≤ `t`
  pub fn pts_floor(&mut self, t: f64) -> Option<&IndexedSample> {
    let order = self.pts_order().to_vec();
    let pos = order.partition_point(|&i| self.samples[i].pts <= t);
    let idx = *order.get(pos.checked_sub(1)?)?;
    Some(&self.samples[idx])
  }

  /// The last key sample with presentation timestamp ≤ `t`
  pub fn key_floor(&mut self, t: f64) -> Option<&IndexedSample> {
    let order = self.pts_order().to_vec();
    let pos = order.partition_point(|&i| self.samples[i].pts <= t);
    order[..pos]
      .iter()
      .rev()
      .map(|&i| &self.samples[i])
      .find(|s| s.is_key)
  }

  /// Next key sample in decode order after `sequence`
  pub fn next_key_after(&self, sequence: i64) -> Option<&IndexedSample> {
    let pos = self.samples.partition_point(|s| s.sequence <= sequence);
    self.samples[pos..].iter().find(|s| s.is_key)
  }

  /// Previous key sample in decode order strictly before `sequence`
  pub fn prev_key_before(&self, sequence: i64) -> Option<&IndexedSample> {
    let pos = self.samples.partition_point(|s| s.sequence < sequence);
    self.samples[..pos].iter().rev().find(|s| s.is_key)
  }
}

// ============================================================================
// Packet materialization
// ============================================================================

/// Build an [`EncodedPacket`] from an index entry, loading payload bytes
/// through the reader unless the retrieval is metadata-only.
pub(crate) async fn materialize_packet(
  reader: &Reader,
  sample: &IndexedSample,
  metadata_only: bool,
) -> Result<EncodedPacket> {
  let packet_type = if sample.is_key {
    PacketType::Key
  } else {
    PacketType::Delta
  };
  if metadata_only {
    return Ok(EncodedPacket::metadata_only(
      sample.size as usize,
      packet_type,
      sample.pts,
      sample.duration,
      sample.sequence,
    ));
  }
  let data = reader
    .read_range(sample.offset, sample.offset + u64::from(sample.size))
    .await?;
  if data.len() < sample.size as usize {
    return Err(Error::invalid(format!(
      "packet at {} truncated: {} of {} bytes",
      sample.offset,
      data.len(),
      sample.size
    )));
  }
  Ok(EncodedPacket::new(
    data,
    packet_type,
    sample.pts,
    sample.duration,
    sample.sequence,
  ))
}

/// Inspect a packet bitstream to confirm the key-frame flag. Returns `None`
/// when the codec cannot be cheaply probed.
pub(crate) fn probe_key_frame(codec: VideoCodec, data: &Bytes) -> Option<bool> {
  match codec {
    VideoCodec::Avc => {
      // Length-prefixed NAL units; IDR slices are type 5
      let mut pos = 0usize;
      let mut saw_idr = false;
      while pos + 4 <= data.len() {
        let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
          as usize;
        if len == 0 || pos + 4 + len > data.len() {
          break;
        }
        let nal_type = data[pos + 4] & 0x1F;
        if nal_type == 5 {
          saw_idr = true;
        }
        if nal_type == 1 {
          return Some(false);
        }
        pos += 4 + len;
      }
      Some(saw_idr)
    }
    VideoCodec::Hevc => {
      let mut pos = 0usize;
      while pos + 4 <= data.len() {
        let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
          as usize;
        if len == 0 || pos + 4 + len > data.len() {
          break;
        }
        let nal_type = (data[pos + 4] >> 1) & 0x3F;
        // IRAP NAL unit types
        if (16..=23).contains(&nal_type) {
          return Some(true);
        }
        if nal_type < 16 {
          return Some(false);
        }
        pos += 4 + len;
      }
      None
    }
    VideoCodec::Vp8 => {
      // Bit 0 of the first byte: 0 = key frame
      data.first().map(|b| b & 0x01 == 0)
    }
    VideoCodec::Vp9 => {
      let first = *data.first()?;
      // frame_marker(2) profile(2) show_existing(1) frame_type(1)
      if first >> 6 != 0b10 {
        return None;
      }
      let profile = (first >> 4) & 0x03;
      if profile >= 3 {
        return None;
      }
      Some((first >> 2) & 0x01 == 0)
    }
    VideoCodec::Av1 => None,
  }
}

// ============================================================================
// Format detection and dispatch
// ============================================================================

/// Detected container family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
  IsoBmff,
  Matroska,
  Riff,
}

/// Sniff the container family from the first bytes of the file
pub async fn detect_format(reader: &Reader) -> Result<InputFormat> {
  let head = reader.read_range(0, 12).await?;
  if head.len() < 12 {
    return Err(Error::invalid("file too short to identify"));
  }
  if &head[4..8] == b"ftyp" || &head[4..8] == b"moov" || &head[4..8] == b"mdat" {
    return Ok(InputFormat::IsoBmff);
  }
  if head[..4] == [0x1A, 0x45, 0xDF, 0xA3] {
    return Ok(InputFormat::Matroska);
  }
  if (&head[..4] == b"RIFF" || &head[..4] == b"RIFX") && &head[8..12] == b"AVI " {
    return Ok(InputFormat::Riff);
  }
  Err(Error::invalid("unrecognized container format"))
}

/// Any supported demuxer, one uniform retrieval surface
pub enum Demuxer {
  IsoBmff(IsobmffDemuxer),
  Matroska(MatroskaDemuxer),
  Riff(RiffDemuxer),
}

impl Demuxer {
  /// Open a source, sniff its format, and parse the container metadata
  pub async fn open(source: Box<dyn Source>) -> Result<Self> {
    let reader = Reader::new(source);
    match detect_format(&reader).await? {
      InputFormat::IsoBmff => Ok(Demuxer::IsoBmff(IsobmffDemuxer::open(reader).await?)),
      InputFormat::Matroska => Ok(Demuxer::Matroska(MatroskaDemuxer::open(reader).await?)),
      InputFormat::Riff => Ok(Demuxer::Riff(RiffDemuxer::open(reader).await?)),
    }
  }

  pub fn format(&self) -> InputFormat {
    match self {
      Demuxer::IsoBmff(_) => InputFormat::IsoBmff,
      Demuxer::Matroska(_) => InputFormat::Matroska,
      Demuxer::Riff(_) => InputFormat::Riff,
    }
  }

  pub fn tracks(&self) -> Vec<TrackInfo> {
    match self {
      Demuxer::IsoBmff(d) => d.tracks(),
      Demuxer::Matroska(d) => d.tracks(),
      Demuxer::Riff(d) => d.tracks(),
    }
  }

  /// Maximum end timestamp across all tracks, in seconds
  pub async fn compute_duration(&mut self) -> Result<f64> {
    match self {
      Demuxer::IsoBmff(d) => d.compute_duration().await,
      Demuxer::Matroska(d) => d.compute_duration().await,
      Demuxer::Riff(d) => d.compute_duration(),
    }
  }

  pub async fn first_packet(
    &mut self,
    track_id: u32,
    options: PacketRetrievalOptions,
  ) -> Result<Option<EncodedPacket>> {
    match self {
      Demuxer::IsoBmff(d) => d.first_packet(track_id, options).await,
      Demuxer::Matroska(d) => d.first_packet(track_id, options).await,
      Demuxer::Riff(d) => d.first_packet(track_id, options).await,
    }
  }

  pub async fn packet_at(
    &mut self,
    track_id: u32,
    timestamp: f64,
    options: PacketRetrievalOptions,
  ) -> Result<Option<EncodedPacket>> {
    match self {
      Demuxer::IsoBmff(d) => d.packet_at(track_id, timestamp, options).await,
      Demuxer::Matroska(d) => d.packet_at(track_id, timestamp, options).await,
      Demuxer::Riff(d) => d.packet_at(track_id, timestamp, options).await,
    }
  }

  pub async fn next_packet(
    &mut self,
    track_id: u32,
    packet: &EncodedPacket,
    options: PacketRetrievalOptions,
  ) -> Result<Option<EncodedPacket>> {
    match self {
      Demuxer::IsoBmff(d) => d.next_packet(track_id, packet, options).await,
      Demuxer::Matroska(d) => d.next_packet(track_id, packet, options).await,
      Demuxer::Riff(d) => d.next_packet(track_id, packet, options).await,
    }
  }

  pub async fn key_packet_at(
    &mut self,
    track_id: u32,
    timestamp: f64,
    options: PacketRetrievalOptions,
  ) -> Result<Option<EncodedPacket>> {
    match self {
      Demuxer::IsoBmff(d) => d.key_packet_at(track_id, timestamp, options).await,
      Demuxer::Matroska(d) => d.key_packet_at(track_id, timestamp, options).await,
      Demuxer::Riff(d) => d.key_packet_at(track_id, timestamp, options).await,
    }
  }

  pub async fn next_key_packet(
    &mut self,
    track_id: u32,
    packet: &EncodedPacket,
    options: PacketRetrievalOptions,
  ) -> Result<Option<EncodedPacket>> {
    match self {
      Demuxer::IsoBmff(d) => d.next_key_packet(track_id, packet, options).await,
      Demuxer::Matroska(d) => d.next_key_packet(track_id, packet, options).await,
      Demuxer::Riff(d) => d.next_key_packet(track_id, packet, options).await,
    }
  }
}
