//! Matroska demuxer
//!
//! Incrementally walks Segment children. Cluster blocks are indexed lazily
//! as retrieval reaches into unscanned ranges; a Cues element, when present,
//! lets seeks jump straight to the right cluster, with linear scanning from
//! the last cluster boundary as the fallback.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::codecs::{audio_codec_from_matroska_id, video_codec_from_matroska_id};
use crate::demux::{
  materialize_packet, probe_key_frame, IndexedSample, PacketRetrievalOptions, TrackIndex,
};
use crate::error::{Error, Result};
use crate::io::Reader;
use crate::mux::matroska::ebml::ids;
use crate::packet::EncodedPacket;
use crate::track::{AudioTrackInfo, Rotation, TrackInfo, VideoTrackInfo};

struct MkvDemuxTrack {
  info: TrackInfo,
  index: TrackIndex,
  /// Cue entries for this track: `(time seconds, absolute cluster position)`
  cues: Vec<(f64, u64)>,
}

/// Matroska demuxer over a cached reader
pub struct MatroskaDemuxer {
  reader: Reader,
  tracks: Vec<MkvDemuxTrack>,
  /// Nanoseconds per timestamp tick
  timestamp_scale: u64,
  segment_data_start: u64,
  segment_end: u64,
  header_duration: Option<f64>,
  /// Scanned clusters: position → end position
  scanned: BTreeMap<u64, u64>,
  /// Contiguously-scanned-from-start frontier for linear scanning
  frontier: u64,
  fully_indexed: bool,
}

impl MatroskaDemuxer {
  /// Parse the EBML header, Info, Tracks, and Cues
  pub async fn open(reader: Reader) -> Result<Self> {
    let file_size = reader.size().await?;

    // EBML header
    let (id, size, content_start, _) = read_element_header(&reader, 0).await?;
    if id != ids::EBML {
      return Err(Error::invalid("missing EBML header"));
    }
    let header = reader.read_range(content_start, content_start + size).await?;
    let doc_type = find_string(&header, ids::DOC_TYPE).unwrap_or_default();
    if doc_type != "matroska" && doc_type != "webm" {
      return Err(Error::invalid(format!("unsupported DocType {doc_type}")));
    }

    // Segment
    let segment_pos = content_start + size;
    let (id, seg_size, seg_content, unknown) = read_element_header(&reader, segment_pos).await?;
    if id != ids::SEGMENT {
      return Err(Error::invalid("missing Segment element"));
    }
    let segment_end = if unknown {
      file_size
    } else {
      (seg_content + seg_size).min(file_size)
    };

    let mut demuxer = Self {
      reader,
      tracks: Vec::new(),
      timestamp_scale: 1_000_000,
      segment_data_start: seg_content,
      segment_end,
      header_duration: None,
      scanned: BTreeMap::new(),
      frontier: seg_content,
      fully_indexed: false,
    };
    demuxer.parse_segment_metadata().await?;
    if demuxer.tracks.is_empty() {
      return Err(Error::invalid("Segment has no usable tracks"));
    }
    Ok(demuxer)
  }

  /// Walk top-level Segment children, parsing everything except Cluster
  /// content. Stops early at an unknown-size Cluster (live streams).
  async fn parse_segment_metadata(&mut self) -> Result<()> {
    let mut pos = self.segment_data_start;
    let mut first_cluster = None;
    while pos + 2 <= self.segment_end {
      let (id, size, content_start, unknown) = read_element_header(&self.reader, pos).await?;
      match id {
        ids::INFO => {
          let info = self
            .reader
            .read_range(content_start, content_start + size)
            .await?;
          if let Some(scale) = find_uint(&info, ids::TIMESTAMP_SCALE) {
            if scale > 0 {
              self.timestamp_scale = scale;
            }
          }
          if let Some(raw) = find_element(&info, ids::DURATION) {
            let ticks = parse_float(raw);
            self.header_duration =
              Some(ticks * self.timestamp_scale as f64 / 1_000_000_000.0);
          }
        }
        ids::TRACKS => {
          let tracks = self
            .reader
            .read_range(content_start, content_start + size)
            .await?;
          self.parse_tracks(&tracks)?;
        }
        ids::CUES => {
          let cues = self
            .reader
            .read_range(content_start, content_start + size)
            .await?;
          self.parse_cues(&cues);
        }
        ids::CLUSTER => {
          if first_cluster.is_none() {
            first_cluster = Some(pos);
          }
          if unknown {
            // Cannot skip an unbounded cluster without scanning it
            break;
          }
        }
        _ => {}
      }
      if unknown && id != ids::SEGMENT {
        break;
      }
      pos = content_start + size;
    }
    self.frontier = first_cluster.unwrap_or(self.segment_end);
    Ok(())
  }

  fn parse_tracks(&mut self, tracks: &[u8]) -> Result<()> {
    for (id, entry) in iter_elements(tracks) {
      if id != ids::TRACK_ENTRY {
        continue;
      }
      let number = find_uint(entry, ids::TRACK_NUMBER).unwrap_or(0) as u32;
      let track_type = find_uint(entry, ids::TRACK_TYPE).unwrap_or(0);
      let codec_id = find_string(entry, ids::CODEC_ID).unwrap_or_default();
      let decoder_config = find_element(entry, ids::CODEC_PRIVATE).map(Bytes::copy_from_slice);

      let info = match track_type {
        1 => {
          let video = find_element(entry, ids::VIDEO).unwrap_or(&[]);
          let Some(codec) = video_codec_from_matroska_id(&codec_id) else {
            tracing::debug!(target: "mediamux::demux", codec_id, "skipping unsupported video codec");
            continue;
          };
          TrackInfo::Video(VideoTrackInfo {
            id: number,
            codec,
            coded_width: find_uint(video, ids::PIXEL_WIDTH).unwrap_or(0) as u32,
            coded_height: find_uint(video, ids::PIXEL_HEIGHT).unwrap_or(0) as u32,
            rotation: Rotation::None,
            time_resolution: (1_000_000_000 / self.timestamp_scale) as u32,
            decoder_config,
          })
        }
        2 => {
          let audio = find_element(entry, ids::AUDIO).unwrap_or(&[]);
          let bit_depth = find_uint(audio, ids::BIT_DEPTH).map(|b| b as u32);
          let Some(codec) = audio_codec_from_matroska_id(&codec_id, bit_depth) else {
            tracing::debug!(target: "mediamux::demux", codec_id, "skipping unsupported audio codec");
            continue;
          };
          let sample_rate = find_element(audio, ids::SAMPLING_FREQUENCY)
            .map(parse_float)
            .unwrap_or(0.0) as u32;
          TrackInfo::Audio(AudioTrackInfo {
            id: number,
            codec,
            sample_rate,
            number_of_channels: find_uint(audio, ids::CHANNELS).unwrap_or(1) as u32,
            time_resolution: (1_000_000_000 / self.timestamp_scale) as u32,
            decoder_config,
          })
        }
        _ => continue,
      };
      self.tracks.push(MkvDemuxTrack {
        info,
        index: TrackIndex::default(),
        cues: Vec::new(),
      });
    }
    Ok(())
  }

  fn parse_cues(&mut self, cues: &[u8]) {
    for (id, point) in iter_elements(cues) {
      if id != ids::CUE_POINT {
        continue;
      }
      let Some(time) = find_uint(point, ids::CUE_TIME) else {
        continue;
      };
      let seconds = time as f64 * self.timestamp_scale as f64 / 1_000_000_000.0;
      for (inner, positions) in iter_elements(point) {
        if inner != ids::CUE_TRACK_POSITIONS {
          continue;
        }
        let track = find_uint(positions, ids::CUE_TRACK).unwrap_or(0) as u32;
        let Some(cluster) = find_uint(positions, ids::CUE_CLUSTER_POSITION) else {
          continue;
        };
        let absolute = self.segment_data_start + cluster;
        if let Some(t) = self.tracks.iter_mut().find(|t| t.info.id() == track) {
          t.cues.push((seconds, absolute));
        }
      }
    }
    for track in &mut self.tracks {
      track
        .cues
        .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    }
  }

  pub fn tracks(&self) -> Vec<TrackInfo> {
    self.tracks.iter().map(|t| t.info.clone()).collect()
  }

  pub fn reader(&self) -> &Reader {
    &self.reader
  }

  pub async fn compute_duration(&mut self) -> Result<f64> {
    if let Some(duration) = self.header_duration {
      return Ok(duration);
    }
    while !self.fully_indexed {
      self.advance_scan().await?;
    }
    Ok(
      self
        .tracks
        .iter()
        .map(|t| t.index.max_pts_end())
        .fold(0.0, f64::max),
    )
  }

  // ==========================================================================
  // Packet retrieval
  // ==========================================================================

  pub async fn first_packet(
    &mut self,
    track_id: u32,
    options: PacketRetrievalOptions,
  ) -> Result<Option<EncodedPacket>> {
    while self.track(track_id)?.index.is_empty() && !self.fully_indexed {
      self.advance_scan().await?;
    }
    let Some(sample) = self.track(track_id)?.index.first().cloned() else {
      return Ok(None);
    };
    Ok(Some(materialize_packet(&self.reader, &sample, options.metadata_only).await?))
  }

  pub async fn packet_at(
    &mut self,
    track_id: u32,
    timestamp: f64,
    options: PacketRetrievalOptions,
  ) -> Result<Option<EncodedPacket>> {
    self.ensure_indexed_for_time(track_id, timestamp).await?;
    let Some(sample) = self.track_mut(track_id)?.index.pts_floor(timestamp).cloned() else {
      return Ok(None);
    };
    Ok(Some(materialize_packet(&self.reader, &sample, options.metadata_only).await?))
  }

  pub async fn next_packet(
    &mut self,
    track_id: u32,
    packet: &EncodedPacket,
    options: PacketRetrievalOptions,
  ) -> Result<Option<EncodedPacket>> {
    let Some(sample) = self.next_sample_after(track_id, packet.sequence_number).await? else {
      return Ok(None);
    };
    Ok(Some(materialize_packet(&self.reader, &sample, options.metadata_only).await?))
  }

  pub async fn key_packet_at(
    &mut self,
    track_id: u32,
    timestamp: f64,
    options: PacketRetrievalOptions,
  ) -> Result<Option<EncodedPacket>> {
    self.ensure_indexed_for_time(track_id, timestamp).await?;
    let Some(mut sample) = self.track_mut(track_id)?.index.key_floor(timestamp).cloned() else {
      return Ok(None);
    };
    if options.verify_key_packets {
      sample = self.verify_key_sample(track_id, sample).await?;
    }
    Ok(Some(materialize_packet(&self.reader, &sample, options.metadata_only).await?))
  }

  pub async fn next_key_packet(
    &mut self,
    track_id: u32,
    packet: &EncodedPacket,
    options: PacketRetrievalOptions,
  ) -> Result<Option<EncodedPacket>> {
    let mut sequence = packet.sequence_number;
    loop {
      let Some(sample) = self.next_sample_after(track_id, sequence).await? else {
        return Ok(None);
      };
      if sample.is_key {
        let sample = if options.verify_key_packets {
          self.verify_key_sample(track_id, sample).await?
        } else {
          sample
        };
        return Ok(Some(
          materialize_packet(&self.reader, &sample, options.metadata_only).await?,
        ));
      }
      sequence = sample.sequence;
    }
  }

  async fn verify_key_sample(
    &mut self,
    track_id: u32,
    mut sample: IndexedSample,
  ) -> Result<IndexedSample> {
    let codec = match &self.track(track_id)?.info {
      TrackInfo::Video(v) => v.codec,
      TrackInfo::Audio(_) => return Ok(sample),
    };
    loop {
      let packet = materialize_packet(&self.reader, &sample, false).await?;
      match probe_key_frame(codec, &packet.data) {
        Some(false) => {
          tracing::warn!(
            target: "mediamux::demux",
            track_id,
            sequence = sample.sequence,
            "block flagged as key fails bitstream probe, stepping back"
          );
          match self.track(track_id)?.index.prev_key_before(sample.sequence) {
            Some(prev) => sample = prev.clone(),
            None => return Ok(sample),
          }
        }
        _ => return Ok(sample),
      }
    }
  }

  // ==========================================================================
  // Lazy cluster scanning
  // ==========================================================================

  fn track(&self, track_id: u32) -> Result<&MkvDemuxTrack> {
    self
      .tracks
      .iter()
      .find(|t| t.info.id() == track_id)
      .ok_or_else(|| Error::invalid(format!("unknown track id {track_id}")))
  }

  fn track_mut(&mut self, track_id: u32) -> Result<&mut MkvDemuxTrack> {
    self
      .tracks
      .iter_mut()
      .find(|t| t.info.id() == track_id)
      .ok_or_else(|| Error::invalid(format!("unknown track id {track_id}")))
  }

  /// Advance the linear scan frontier across one cluster
  async fn advance_scan(&mut self) -> Result<()> {
    loop {
      if self.frontier + 2 > self.segment_end {
        self.fully_indexed = true;
        return Ok(());
      }
      if let Some((&pos, &end)) = self.scanned.range(..=self.frontier).next_back() {
        if pos <= self.frontier && end > self.frontier {
          self.frontier = end;
          continue;
        }
      }
      let (id, size, content_start, unknown) =
        read_element_header(&self.reader, self.frontier).await?;
      if id == ids::CLUSTER {
        let end = self.scan_cluster_at(self.frontier).await?;
        self.frontier = end;
        return Ok(());
      }
      if unknown {
        self.fully_indexed = true;
        return Ok(());
      }
      self.frontier = content_start + size;
    }
  }

  /// Find the next cluster element at or after `pos` without scanning it
  async fn next_cluster_pos_from(&self, mut pos: u64) -> Result<Option<(u64, bool)>> {
    while pos + 2 <= self.segment_end {
      let (id, size, content_start, unknown) = read_element_header(&self.reader, pos).await?;
      if id == ids::CLUSTER {
        return Ok(Some((pos, unknown)));
      }
      if unknown {
        return Ok(None);
      }
      pos = content_start + size;
    }
    Ok(None)
  }

  /// Parse one cluster's blocks into the track indexes; returns its end
  async fn scan_cluster_at(&mut self, pos: u64) -> Result<u64> {
    if let Some(&end) = self.scanned.get(&pos) {
      return Ok(end);
    }
    let (id, size, content_start, unknown) = read_element_header(&self.reader, pos).await?;
    if id != ids::CLUSTER {
      return Err(Error::invalid("expected a Cluster element"));
    }
    let end = if unknown {
      // Unbounded cluster: runs until the next cluster id or EOF. Scan a
      // window and stop at the next top-level id.
      self.segment_end
    } else {
      content_start + size
    };
    let content = self.reader.read_range(content_start, end).await?;
    let scale = self.timestamp_scale as f64 / 1_000_000_000.0;

    let mut cluster_ts: i64 = 0;
    let mut ordinal: i64 = 0;
    let mut batches: Vec<(u32, IndexedSample)> = Vec::new();
    let mut content_end = content.len();

    let mut cursor = 0usize;
    while cursor < content_end {
      let Some((element_id, element, header_len)) = parse_element(&content[cursor..]) else {
        break;
      };
      if unknown && (element_id == ids::CLUSTER || element_id == ids::CUES) {
        content_end = cursor;
        break;
      }
      let element_start = cursor + header_len;
      match element_id {
        ids::CLUSTER_TIMESTAMP => {
          cluster_ts = parse_uint(element) as i64;
        }
        ids::SIMPLE_BLOCK => {
          if let Some((track, sample)) = parse_block(
            element,
            content_start + element_start as u64,
            pos,
            &mut ordinal,
            cluster_ts,
            scale,
            None,
            None,
          ) {
            batches.push((track, sample));
          }
        }
        ids::BLOCK_GROUP => {
          let block = find_element(element, ids::BLOCK);
          let duration = find_uint(element, ids::BLOCK_DURATION);
          let is_delta = find_element(element, ids::REFERENCE_BLOCK).is_some();
          if let Some(block) = block {
            // Offset of the Block payload within the cluster content
            let within = block.as_ptr() as usize - content.as_ptr() as usize;
            if let Some((track, sample)) = parse_block(
              block,
              content_start + within as u64,
              pos,
              &mut ordinal,
              cluster_ts,
              scale,
              duration,
              Some(!is_delta),
            ) {
              batches.push((track, sample));
            }
          }
        }
        _ => {}
      }
      cursor = element_start + element.len();
    }

    let real_end = if unknown {
      content_start + content_end as u64
    } else {
      end
    };
    for track in self.tracks.iter_mut() {
      let track_id = track.info.id();
      track.index.insert(
        batches
          .iter()
          .filter(|(id, _)| *id == track_id)
          .map(|(_, s)| s.clone()),
      );
    }
    self.scanned.insert(pos, real_end);
    Ok(real_end)
  }

  /// Decode-order successor with cluster-contiguity guaranteed
  async fn next_sample_after(
    &mut self,
    track_id: u32,
    sequence: i64,
  ) -> Result<Option<IndexedSample>> {
    let mut cluster_pos = (sequence >> 16) as u64;
    loop {
      // A successor inside an already-scanned contiguous region is safe
      if let Some(sample) = self.track(track_id)?.index.next_after(sequence) {
        let sample_cluster = (sample.sequence >> 16) as u64;
        if sample_cluster == cluster_pos {
          return Ok(Some(sample.clone()));
        }
      }
      let Some(&end) = self.scanned.get(&cluster_pos) else {
        return Err(Error::invalid("packet references an unscanned cluster"));
      };
      match self.next_cluster_pos_from(end).await? {
        Some((next_pos, _)) => {
          self.scan_cluster_at(next_pos).await?;
          if let Some(sample) = self.track(track_id)?.index.next_after(sequence) {
            let sample_cluster = (sample.sequence >> 16) as u64;
            if sample_cluster <= next_pos {
              return Ok(Some(sample.clone()));
            }
          }
          cluster_pos = next_pos;
        }
        None => {
          return Ok(self.track(track_id)?.index.next_after(sequence).cloned());
        }
      }
    }
  }

  /// Make sure every cluster that can contain the floor sample for
  /// `timestamp` is indexed, jumping through cues when possible
  async fn ensure_indexed_for_time(&mut self, track_id: u32, timestamp: f64) -> Result<()> {
    let covered = |track: &MkvDemuxTrack| {
      !track.index.is_empty() && track.index.max_pts_end() > timestamp
    };

    // Cue-driven entry point; linear cluster scan is the fallback
    let jump = self
      .track(track_id)?
      .cues
      .iter()
      .rev()
      .find(|&&(time, _)| time <= timestamp)
      .map(|&(_, pos)| pos);

    match jump {
      Some(pos) => {
        let mut cursor = self.scan_cluster_at(pos).await?;
        loop {
          if covered(self.track(track_id)?) {
            return Ok(());
          }
          match self.next_cluster_pos_from(cursor).await? {
            Some((pos, _)) => cursor = self.scan_cluster_at(pos).await?,
            None => return Ok(()),
          }
        }
      }
      None => loop {
        if covered(self.track(track_id)?) || self.fully_indexed {
          return Ok(());
        }
        self.advance_scan().await?;
      },
    }
  }
}

// ============================================================================
// EBML parsing helpers
// ============================================================================

/// Read an element id + size from the reader.
/// Returns `(id, size, content_start, unknown_size)`.
async fn read_element_header(reader: &Reader, pos: u64) -> Result<(u32, u64, u64, bool)> {
  let head = reader.read_range(pos, pos + 12).await?;
  parse_element_header(&head)
    .map(|(id, size, header_len, unknown)| (id, size, pos + header_len as u64, unknown))
    .ok_or_else(|| Error::invalid(format!("malformed EBML element at {pos}")))
}

/// Parse an element header from a byte slice.
/// Returns `(id, size, header_len, unknown_size)`.
fn parse_element_header(data: &[u8]) -> Option<(u32, u64, usize, bool)> {
  let first = *data.first()?;
  let id_width = first.leading_zeros() as usize + 1;
  if id_width > 4 || data.len() < id_width {
    return None;
  }
  let mut id = 0u32;
  for &b in &data[..id_width] {
    id = id << 8 | u32::from(b);
  }

  let size_first = *data.get(id_width)?;
  let size_width = size_first.leading_zeros() as usize + 1;
  if size_width > 8 || data.len() < id_width + size_width {
    return None;
  }
  let first_mask: u8 = if size_width == 8 { 0 } else { 0xFF >> size_width };
  let mut size = u64::from(size_first & first_mask);
  let mut all_ones = size == u64::from(first_mask);
  for &b in &data[id_width + 1..id_width + size_width] {
    size = size << 8 | u64::from(b);
    if b != 0xFF {
      all_ones = false;
    }
  }
  Some((id, size, id_width + size_width, all_ones))
}

/// Parse one element from a slice; returns `(id, content, header_len)`
fn parse_element(data: &[u8]) -> Option<(u32, &[u8], usize)> {
  let (id, size, header_len, unknown) = parse_element_header(data)?;
  if unknown {
    // Unknown-size elements at this level are handled by the caller
    return Some((id, &data[header_len..], header_len));
  }
  let end = header_len + size as usize;
  if end > data.len() {
    return None;
  }
  Some((id, &data[header_len..end], header_len))
}

/// Iterate sibling elements in a parent's content
fn iter_elements(data: &[u8]) -> impl Iterator<Item = (u32, &[u8])> + '_ {
  let mut pos = 0usize;
  std::iter::from_fn(move || {
    if pos >= data.len() {
      return None;
    }
    let (id, content, header_len) = parse_element(&data[pos..])?;
    pos += header_len + content.len();
    Some((id, content))
  })
}

fn find_element(data: &[u8], id: u32) -> Option<&[u8]> {
  iter_elements(data).find(|&(e, _)| e == id).map(|(_, c)| c)
}

fn parse_uint(data: &[u8]) -> u64 {
  data.iter().fold(0u64, |acc, &b| acc << 8 | u64::from(b))
}

fn find_uint(data: &[u8], id: u32) -> Option<u64> {
  find_element(data, id).map(parse_uint)
}

fn parse_float(data: &[u8]) -> f64 {
  match data.len() {
    4 => f64::from(f32::from_be_bytes(data.try_into().expect("sized slice"))),
    8 => f64::from_be_bytes(data.try_into().expect("sized slice")),
    _ => 0.0,
  }
}

fn find_string(data: &[u8], id: u32) -> Option<String> {
  find_element(data, id).map(|c| String::from_utf8_lossy(c).trim_end_matches('\0').to_string())
}

/// Parse a Block/SimpleBlock payload into an index entry.
///
/// `payload_pos` is the absolute file offset of the block payload;
/// `cluster_pos` seeds the sequence number so decode order follows file
/// order across cue-jumped scans.
#[allow(clippy::too_many_arguments)]
fn parse_block(
  block: &[u8],
  payload_pos: u64,
  cluster_pos: u64,
  ordinal: &mut i64,
  cluster_ts: i64,
  scale: f64,
  duration_ticks: Option<u64>,
  key_override: Option<bool>,
) -> Option<(u32, IndexedSample)> {
  // Track number vint
  let first = *block.first()?;
  let width = first.leading_zeros() as usize + 1;
  if width > 8 || block.len() < width + 3 {
    return None;
  }
  let first_mask: u8 = if width == 8 { 0 } else { 0xFF >> width };
  let mut track = u64::from(first & first_mask);
  for &b in &block[1..width] {
    track = track << 8 | u64::from(b);
  }

  let rel = i16::from_be_bytes([block[width], block[width + 1]]);
  let flags = block[width + 2];
  if flags & 0x06 != 0 {
    tracing::warn!(target: "mediamux::demux", "laced block skipped");
    return None;
  }
  let is_key = key_override.unwrap_or(flags & 0x80 != 0);

  let prelude = width + 3;
  let data_len = block.len() - prelude;
  let ts = (cluster_ts + i64::from(rel)) as f64 * scale;
  let sequence = (cluster_pos as i64) << 16 | *ordinal;
  *ordinal += 1;

  Some((
    track as u32,
    IndexedSample {
      offset: payload_pos + prelude as u64,
      size: data_len as u32,
      is_key,
      pts: ts,
      dts: ts,
      duration: duration_ticks.map(|d| d as f64 * scale).unwrap_or(0.0),
      sequence,
    },
  ))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::codecs::{AudioCodec, VideoCodec};
  use crate::io::{BufferSource, BufferWriter};
  use crate::mux::{MatroskaMuxer, MatroskaMuxerOptions, MatroskaVariant};
  use crate::packet::PacketType;
  use crate::track::{AudioTrackConfig, VideoTrackConfig};

  fn packet(timestamp: f64, duration: f64, key: bool, payload: Vec<u8>) -> EncodedPacket {
    EncodedPacket::new(
      Bytes::from(payload),
      if key { PacketType::Key } else { PacketType::Delta },
      timestamp,
      duration,
      0,
    )
  }

  fn mux_webm() -> Vec<u8> {
    let mut muxer = MatroskaMuxer::new(
      BufferWriter::new(),
      MatroskaMuxerOptions {
        variant: MatroskaVariant::Webm,
        streaming: false,
      },
    );
    let video = muxer
      .add_video_track(VideoTrackConfig::new(VideoCodec::Vp9, 1280, 720))
      .unwrap();
    let audio = muxer
      .add_audio_track(AudioTrackConfig::new(AudioCodec::Opus, 48_000, 2))
      .unwrap();
    for i in 0..90u8 {
      let t = f64::from(i) / 30.0;
      muxer
        .add_packet(video, &packet(t, 1.0 / 30.0, i % 30 == 0, vec![i; 40]))
        .unwrap();
      muxer
        .add_packet(audio, &packet(t, 1.0 / 30.0, true, vec![0xA0 | (i & 0xF); 12]))
        .unwrap();
    }
    muxer.finalize().unwrap();
    muxer.into_writer().into_bytes().to_vec()
  }

  async fn open(bytes: Vec<u8>) -> MatroskaDemuxer {
    MatroskaDemuxer::open(Reader::new(Box::new(BufferSource::new(bytes))))
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn test_track_metadata() {
    let demuxer = open(mux_webm()).await;
    let tracks = demuxer.tracks();
    assert_eq!(tracks.len(), 2);
    let video = tracks[0].as_video().unwrap();
    assert_eq!(video.codec, VideoCodec::Vp9);
    assert_eq!((video.coded_width, video.coded_height), (1280, 720));
    let audio = tracks[1].as_audio().unwrap();
    assert_eq!(audio.codec, AudioCodec::Opus);
    assert_eq!(audio.sample_rate, 48_000);
    assert_eq!(audio.number_of_channels, 2);
  }

  #[tokio::test]
  async fn test_sequential_iteration() {
    let mut demuxer = open(mux_webm()).await;
    let options = PacketRetrievalOptions::default();
    let mut packet = demuxer.first_packet(1, options).await.unwrap().unwrap();
    assert_eq!(packet.data.as_ref(), &[0u8; 40][..]);
    assert!(packet.is_key());
    let mut count = 1;
    while let Some(next) = demuxer.next_packet(1, &packet, options).await.unwrap() {
      assert!(next.sequence_number > packet.sequence_number);
      packet = next;
      count += 1;
    }
    assert_eq!(count, 90);
  }

  #[tokio::test]
  async fn test_timestamps_recovered_in_ms() {
    let mut demuxer = open(mux_webm()).await;
    let options = PacketRetrievalOptions::default();
    let packet = demuxer.packet_at(1, 1.5, options).await.unwrap().unwrap();
    // Millisecond resolution: 1.466... rounds to 1.467 or 1.466
    assert!((packet.timestamp - 1.4666).abs() < 2e-3);
  }

  #[tokio::test]
  async fn test_cue_driven_key_seek() {
    let mut demuxer = open(mux_webm()).await;
    let options = PacketRetrievalOptions::default();
    // Jump straight to the 2 s cluster without scanning everything
    let key = demuxer.key_packet_at(1, 2.5, options).await.unwrap().unwrap();
    assert!((key.timestamp - 2.0).abs() < 2e-3);
    assert!(key.is_key());
    assert_eq!(key.data.as_ref(), &[60u8; 40][..]);
  }

  #[tokio::test]
  async fn test_next_key_packet_walks_clusters() {
    let mut demuxer = open(mux_webm()).await;
    let options = PacketRetrievalOptions::default();
    let first = demuxer.first_packet(1, options).await.unwrap().unwrap();
    let key = demuxer
      .next_key_packet(1, &first, options)
      .await
      .unwrap()
      .unwrap();
    assert!((key.timestamp - 1.0).abs() < 2e-3);
  }

  #[tokio::test]
  async fn test_duration_from_info() {
    let mut demuxer = open(mux_webm()).await;
    let duration = demuxer.compute_duration().await.unwrap();
    assert!((duration - 3.0).abs() < 0.05, "duration {duration}");
  }

  #[tokio::test]
  async fn test_block_group_durations() {
    // The muxer writes BlockGroups for packets with durations; audio packets
    // should come back flagged key with their durations
    let mut demuxer = open(mux_webm()).await;
    let options = PacketRetrievalOptions::default();
    let packet = demuxer.first_packet(2, options).await.unwrap().unwrap();
    assert!(packet.is_key());
    assert!((packet.duration - 1.0 / 30.0).abs() < 2e-3);
  }
}
