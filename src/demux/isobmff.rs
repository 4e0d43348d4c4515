//! ISO-BMFF demuxer
//!
//! Parses the box tree through the cached reader. Regular files get their
//! sample tables (stts/ctts/stsz/stsc/stco/stss) expanded into a per-track
//! index at open; fragmented files scan `moof` boxes lazily, populating the
//! index incrementally as retrieval reaches into unindexed time ranges.

use bytes::Bytes;

use crate::codecs::{strings, AudioCodec, VideoCodec};
use crate::demux::{
  materialize_packet, probe_key_frame, IndexedSample, PacketRetrievalOptions, TrackIndex,
};
use crate::error::{Error, Result};
use crate::io::Reader;
use crate::packet::EncodedPacket;
use crate::track::{AudioTrackInfo, Rotation, TrackInfo, VideoTrackInfo};

// tfhd flag bits
const TFHD_BASE_DATA_OFFSET: u32 = 0x000001;
const TFHD_SAMPLE_DESCRIPTION: u32 = 0x000002;
const TFHD_DEFAULT_DURATION: u32 = 0x000008;
const TFHD_DEFAULT_SIZE: u32 = 0x000010;
const TFHD_DEFAULT_FLAGS: u32 = 0x000020;
const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x020000;

// trun flag bits
const TRUN_DATA_OFFSET: u32 = 0x000001;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x000004;
const TRUN_SAMPLE_DURATION: u32 = 0x000100;
const TRUN_SAMPLE_SIZE: u32 = 0x000200;
const TRUN_SAMPLE_FLAGS: u32 = 0x000400;
const TRUN_SAMPLE_CTS: u32 = 0x000800;

const SAMPLE_IS_NON_SYNC: u32 = 0x0001_0000;

struct DemuxTrack {
  info: TrackInfo,
  timescale: u32,
  index: TrackIndex,
  next_sequence: i64,
  // trex defaults, overridable per fragment
  trex_duration: u32,
  trex_size: u32,
  trex_flags: u32,
}

/// ISO-BMFF demuxer over a cached reader
pub struct IsobmffDemuxer {
  reader: Reader,
  tracks: Vec<DemuxTrack>,
  fragmented: bool,
  scan_pos: u64,
  file_size: u64,
  fully_indexed: bool,
}

impl IsobmffDemuxer {
  /// Parse `ftyp`/`moov` and build the initial index
  pub async fn open(reader: Reader) -> Result<Self> {
    let file_size = reader.size().await?;
    let mut demuxer = Self {
      reader,
      tracks: Vec::new(),
      fragmented: false,
      scan_pos: 0,
      file_size,
      fully_indexed: false,
    };

    let mut pos = 0u64;
    let mut moov: Option<(u64, u64, Bytes)> = None;
    while pos + 8 <= file_size {
      let (fourcc, content_start, total) = demuxer.read_box_header(pos).await?;
      if &fourcc == b"moov" {
        let content = demuxer.reader.read_range(content_start, pos + total).await?;
        moov = Some((pos, total, content));
        break;
      }
      pos += total;
    }
    let (moov_pos, moov_total, moov) = moov.ok_or_else(|| Error::invalid("no moov box found"))?;
    demuxer.parse_moov(&moov)?;
    demuxer.fully_indexed = !demuxer.fragmented;
    demuxer.scan_pos = moov_pos + moov_total;
    if demuxer.tracks.is_empty() {
      return Err(Error::invalid("container has no usable tracks"));
    }
    Ok(demuxer)
  }

  pub fn tracks(&self) -> Vec<TrackInfo> {
    self.tracks.iter().map(|t| t.info.clone()).collect()
  }

  pub fn reader(&self) -> &Reader {
    &self.reader
  }

  /// Derived codec string for a track (MSE/DASH clients)
  pub fn codec_string(&self, track_id: u32) -> Option<String> {
    let track = self.tracks.iter().find(|t| t.info.id() == track_id)?;
    Some(match &track.info {
      TrackInfo::Video(v) => strings::video_codec_string(v.codec, v.coded_width, v.coded_height),
      TrackInfo::Audio(a) => {
        strings::audio_codec_string(a.codec, a.sample_rate, a.number_of_channels)
      }
    })
  }

  pub async fn compute_duration(&mut self) -> Result<f64> {
    self.index_everything().await?;
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
    self.ensure_any_indexed(track_id).await?;
    let track = self.track_mut(track_id)?;
    let Some(sample) = track.index.first().cloned() else {
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
    let track = self.track_mut(track_id)?;
    let Some(sample) = track.index.pts_floor(timestamp).cloned() else {
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
    self
      .ensure_indexed_past_sequence(track_id, packet.sequence_number)
      .await?;
    let track = self.track_mut(track_id)?;
    let Some(sample) = track.index.next_after(packet.sequence_number).cloned() else {
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
    let track = self.track_mut(track_id)?;
    let Some(mut sample) = track.index.key_floor(timestamp).cloned() else {
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
    self
      .ensure_indexed_past_sequence(track_id, packet.sequence_number)
      .await?;
    loop {
      let track = self.track_mut(track_id)?;
      match track.index.next_key_after(packet.sequence_number).cloned() {
        Some(mut sample) => {
          if options.verify_key_packets {
            sample = self.verify_key_sample(track_id, sample).await?;
          }
          return Ok(Some(
            materialize_packet(&self.reader, &sample, options.metadata_only).await?,
          ));
        }
        None if !self.fully_indexed => self.scan_next_fragment().await?,
        None => return Ok(None),
      }
    }
  }

  /// Walk backwards over mis-labeled key packets, bounded at the track's
  /// first packet
  async fn verify_key_sample(
    &mut self,
    track_id: u32,
    mut sample: IndexedSample,
  ) -> Result<IndexedSample> {
    let codec = match &self.track_mut(track_id)?.info {
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
            "sample flagged as key fails bitstream probe, stepping back"
          );
          let track = self.track_mut(track_id)?;
          match track.index.prev_key_before(sample.sequence) {
            Some(prev) => sample = prev.clone(),
            None => return Ok(sample),
          }
        }
        _ => return Ok(sample),
      }
    }
  }

  // ==========================================================================
  // Lazy fragment indexing
  // ==========================================================================

  fn track_mut(&mut self, track_id: u32) -> Result<&mut DemuxTrack> {
    self
      .tracks
      .iter_mut()
      .find(|t| t.info.id() == track_id)
      .ok_or_else(|| Error::invalid(format!("unknown track id {track_id}")))
  }

  async fn ensure_any_indexed(&mut self, track_id: u32) -> Result<()> {
    while !self.fully_indexed && self.track_mut(track_id)?.index.is_empty() {
      self.scan_next_fragment().await?;
    }
    Ok(())
  }

  async fn ensure_indexed_for_time(&mut self, track_id: u32, timestamp: f64) -> Result<()> {
    loop {
      if self.fully_indexed {
        return Ok(());
      }
      let track = self.track_mut(track_id)?;
      if !track.index.is_empty() && track.index.max_pts_end() > timestamp {
        return Ok(());
      }
      self.scan_next_fragment().await?;
    }
  }

  async fn ensure_indexed_past_sequence(&mut self, track_id: u32, sequence: i64) -> Result<()> {
    loop {
      if self.fully_indexed {
        return Ok(());
      }
      let track = self.track_mut(track_id)?;
      if track.index.last_sequence().is_some_and(|s| s > sequence) {
        return Ok(());
      }
      self.scan_next_fragment().await?;
    }
  }

  async fn index_everything(&mut self) -> Result<()> {
    while !self.fully_indexed {
      self.scan_next_fragment().await?;
    }
    Ok(())
  }

  async fn read_box_header(&self, pos: u64) -> Result<([u8; 4], u64, u64)> {
    let head = self.reader.read_range(pos, pos + 16).await?;
    if head.len() < 8 {
      return Err(Error::invalid("truncated box header"));
    }
    let size32 = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    let mut fourcc = [0u8; 4];
    fourcc.copy_from_slice(&head[4..8]);
    let (content_start, total) = if size32 == 1 {
      if head.len() < 16 {
        return Err(Error::invalid("truncated large-size box header"));
      }
      let large = u64::from_be_bytes(head[8..16].try_into().expect("sized slice"));
      (pos + 16, large)
    } else if size32 == 0 {
      // Box extends to end of file
      (pos + 8, self.file_size - pos)
    } else {
      (pos + 8, u64::from(size32))
    };
    if total < 8 {
      return Err(Error::invalid("impossible box size"));
    }
    Ok((fourcc, content_start, total))
  }

  /// Scan forward to the next `moof` and index its samples
  async fn scan_next_fragment(&mut self) -> Result<()> {
    while self.scan_pos + 8 <= self.file_size {
      let pos = self.scan_pos;
      let (fourcc, content_start, total) = self.read_box_header(pos).await?;
      self.scan_pos = pos + total;
      if &fourcc == b"moof" {
        let moof = self.reader.read_range(content_start, pos + total).await?;
        self.parse_moof(pos, &moof)?;
        return Ok(());
      }
    }
    self.fully_indexed = true;
    Ok(())
  }

  fn parse_moof(&mut self, moof_pos: u64, moof: &[u8]) -> Result<()> {
    for (fourcc, content) in iter_boxes(moof) {
      if &fourcc != b"traf" {
        continue;
      }
      self.parse_traf(moof_pos, content)?;
    }
    Ok(())
  }

  fn parse_traf(&mut self, moof_pos: u64, traf: &[u8]) -> Result<()> {
    let mut track_id = 0u32;
    let mut tfhd_flags = 0u32;
    let mut base_data_offset = moof_pos;
    let mut default_duration = 0u32;
    let mut default_size = 0u32;
    let mut default_flags = 0u32;
    let mut base_decode_time = 0u64;
    let mut truns: Vec<&[u8]> = Vec::new();

    for (fourcc, content) in iter_boxes(traf) {
      match &fourcc {
        b"tfhd" => {
          if content.len() < 8 {
            return Err(Error::invalid("truncated tfhd"));
          }
          tfhd_flags = u32::from_be_bytes([content[0], content[1], content[2], content[3]])
            & 0x00FF_FFFF;
          track_id = u32::from_be_bytes([content[4], content[5], content[6], content[7]]);
          let mut pos = 8usize;
          if tfhd_flags & TFHD_BASE_DATA_OFFSET != 0 {
            base_data_offset = u64::from_be_bytes(
              content[pos..pos + 8]
                .try_into()
                .map_err(|_| Error::invalid("truncated tfhd"))?,
            );
            pos += 8;
          }
          if tfhd_flags & TFHD_SAMPLE_DESCRIPTION != 0 {
            pos += 4;
          }
          if tfhd_flags & TFHD_DEFAULT_DURATION != 0 {
            default_duration = read_u32(content, pos)?;
            pos += 4;
          }
          if tfhd_flags & TFHD_DEFAULT_SIZE != 0 {
            default_size = read_u32(content, pos)?;
            pos += 4;
          }
          if tfhd_flags & TFHD_DEFAULT_FLAGS != 0 {
            default_flags = read_u32(content, pos)?;
          }
        }
        b"tfdt" => {
          if content.len() < 8 {
            return Err(Error::invalid("truncated tfdt"));
          }
          let version = content[0];
          base_decode_time = if version == 1 {
            u64::from_be_bytes(
              content[4..12]
                .try_into()
                .map_err(|_| Error::invalid("truncated tfdt"))?,
            )
          } else {
            u64::from(read_u32(content, 4)?)
          };
        }
        b"trun" => truns.push(content),
        _ => {}
      }
    }

    if tfhd_flags & TFHD_DEFAULT_BASE_IS_MOOF != 0 {
      base_data_offset = moof_pos;
    }

    let Some(track) = self.tracks.iter_mut().find(|t| t.info.id() == track_id) else {
      tracing::warn!(target: "mediamux::demux", track_id, "traf for unknown track");
      return Ok(());
    };
    let timescale = f64::from(track.timescale);
    let trex_duration = track.trex_duration;
    let trex_size = track.trex_size;
    let trex_flags = track.trex_flags;
    if tfhd_flags & TFHD_DEFAULT_DURATION == 0 {
      default_duration = trex_duration;
    }
    if tfhd_flags & TFHD_DEFAULT_SIZE == 0 {
      default_size = trex_size;
    }
    if tfhd_flags & TFHD_DEFAULT_FLAGS == 0 {
      default_flags = trex_flags;
    }

    let mut dts_ticks = base_decode_time;
    let mut batch = Vec::new();
    for trun in truns {
      if trun.len() < 8 {
        return Err(Error::invalid("truncated trun"));
      }
      let version = trun[0];
      let flags = u32::from_be_bytes([trun[0], trun[1], trun[2], trun[3]]) & 0x00FF_FFFF;
      let sample_count = read_u32(trun, 4)? as usize;
      let mut pos = 8usize;
      let mut data_pos = base_data_offset;
      if flags & TRUN_DATA_OFFSET != 0 {
        let offset = i32::from_be_bytes(
          trun[pos..pos + 4]
            .try_into()
            .map_err(|_| Error::invalid("truncated trun"))?,
        );
        data_pos = (base_data_offset as i64 + i64::from(offset)) as u64;
        pos += 4;
      }
      let mut first_sample_flags = None;
      if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
        first_sample_flags = Some(read_u32(trun, pos)?);
        pos += 4;
      }

      for i in 0..sample_count {
        let duration = if flags & TRUN_SAMPLE_DURATION != 0 {
          let v = read_u32(trun, pos)?;
          pos += 4;
          v
        } else {
          default_duration
        };
        let size = if flags & TRUN_SAMPLE_SIZE != 0 {
          let v = read_u32(trun, pos)?;
          pos += 4;
          v
        } else {
          default_size
        };
        let sample_flags = if flags & TRUN_SAMPLE_FLAGS != 0 {
          let v = read_u32(trun, pos)?;
          pos += 4;
          v
        } else if i == 0 {
          first_sample_flags.unwrap_or(default_flags)
        } else {
          default_flags
        };
        let cts = if flags & TRUN_SAMPLE_CTS != 0 {
          let raw = read_u32(trun, pos)?;
          pos += 4;
          if version == 0 {
            i64::from(raw)
          } else {
            i64::from(raw as i32)
          }
        } else {
          0
        };

        let dts = dts_ticks as f64 / timescale;
        let pts = (dts_ticks as i64 + cts) as f64 / timescale;
        batch.push(IndexedSample {
          offset: data_pos,
          size,
          is_key: sample_flags & SAMPLE_IS_NON_SYNC == 0,
          pts,
          dts,
          duration: f64::from(duration) / timescale,
          sequence: track.next_sequence,
        });
        track.next_sequence += 1;
        dts_ticks += u64::from(duration);
        data_pos += u64::from(size);
      }
    }
    track.index.insert(batch);
    Ok(())
  }

  // ==========================================================================
  // moov parsing
  // ==========================================================================

  fn parse_moov(&mut self, moov: &[u8]) -> Result<()> {
    let mut trex_defaults: Vec<(u32, u32, u32, u32)> = Vec::new();
    for (fourcc, content) in iter_boxes(moov) {
      match &fourcc {
        b"trak" => self.parse_trak(content)?,
        b"mvex" => {
          self.fragmented = true;
          for (inner, trex) in iter_boxes(content) {
            if &inner == b"trex" && trex.len() >= 24 {
              let track_id = read_u32(trex, 4)?;
              let duration = read_u32(trex, 12)?;
              let size = read_u32(trex, 16)?;
              let flags = read_u32(trex, 20)?;
              trex_defaults.push((track_id, duration, size, flags));
            }
          }
        }
        _ => {}
      }
    }
    for (track_id, duration, size, flags) in trex_defaults {
      if let Some(track) = self.tracks.iter_mut().find(|t| t.info.id() == track_id) {
        track.trex_duration = duration;
        track.trex_size = size;
        track.trex_flags = flags;
      }
    }
    Ok(())
  }

  fn parse_trak(&mut self, trak: &[u8]) -> Result<()> {
    let mut track_id = 0u32;
    let mut rotation = Rotation::None;
    let mut timescale = 0u32;
    let mut handler = [0u8; 4];
    let mut stbl: Option<&[u8]> = None;

    for (fourcc, content) in iter_boxes(trak) {
      match &fourcc {
        b"tkhd" => {
          let version = content.first().copied().unwrap_or(0);
          // id sits after creation/modification times
          let id_pos = if version == 1 { 4 + 16 } else { 4 + 8 };
          track_id = read_u32(content, id_pos)?;
          let matrix_pos = id_pos + 4 + 4 + if version == 1 { 8 } else { 4 } + 8 + 2 + 2 + 2 + 2;
          if content.len() >= matrix_pos + 36 {
            let a = i32::from_be_bytes(content[matrix_pos..matrix_pos + 4].try_into().unwrap());
            let b =
              i32::from_be_bytes(content[matrix_pos + 4..matrix_pos + 8].try_into().unwrap());
            rotation = match (a.signum(), b.signum()) {
              (1, 0) => Rotation::None,
              (0, 1) => Rotation::Clockwise90,
              (-1, 0) => Rotation::Clockwise180,
              (0, -1) => Rotation::Clockwise270,
              _ => Rotation::None,
            };
          }
        }
        b"mdia" => {
          for (inner, inner_content) in iter_boxes(content) {
            match &inner {
              b"mdhd" => {
                let version = inner_content.first().copied().unwrap_or(0);
                let ts_pos = if version == 1 { 4 + 16 } else { 4 + 8 };
                timescale = read_u32(inner_content, ts_pos)?;
              }
              b"hdlr" => {
                if inner_content.len() >= 12 {
                  handler.copy_from_slice(&inner_content[8..12]);
                }
              }
              b"minf" => {
                for (minf_child, minf_content) in iter_boxes(inner_content) {
                  if &minf_child == b"stbl" {
                    stbl = Some(minf_content);
                  }
                }
              }
              _ => {}
            }
          }
        }
        _ => {}
      }
    }

    let Some(stbl) = stbl else {
      return Ok(());
    };
    if timescale == 0 {
      return Err(Error::invalid("mdhd timescale is zero"));
    }
    let Some(info) = parse_stsd(stbl, track_id, timescale, rotation, &handler)? else {
      tracing::debug!(target: "mediamux::demux", track_id, "skipping unsupported track");
      return Ok(());
    };

    let mut track = DemuxTrack {
      info,
      timescale,
      index: TrackIndex::default(),
      next_sequence: 0,
      trex_duration: 0,
      trex_size: 0,
      trex_flags: SAMPLE_IS_NON_SYNC,
    };
    let samples = expand_sample_tables(stbl, timescale)?;
    track.next_sequence = samples.len() as i64;
    track.index.insert(samples);
    self.tracks.push(track);
    Ok(())
  }
}

// ============================================================================
// Box slice helpers
// ============================================================================

/// Iterate sibling boxes inside a parent's content slice
fn iter_boxes(data: &[u8]) -> impl Iterator<Item = ([u8; 4], &[u8])> + '_ {
  let mut pos = 0usize;
  std::iter::from_fn(move || {
    if pos + 8 > data.len() {
      return None;
    }
    let size32 =
      u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
    let mut fourcc = [0u8; 4];
    fourcc.copy_from_slice(&data[pos + 4..pos + 8]);
    let (header, total) = if size32 == 1 {
      if pos + 16 > data.len() {
        return None;
      }
      let large =
        u64::from_be_bytes(data[pos + 8..pos + 16].try_into().expect("sized slice")) as usize;
      (16, large)
    } else if size32 == 0 {
      (8, data.len() - pos)
    } else {
      (8, size32)
    };
    if total < header || pos + total > data.len() {
      return None;
    }
    let content = &data[pos + header..pos + total];
    pos += total;
    Some((fourcc, content))
  })
}

fn read_u32(data: &[u8], pos: usize) -> Result<u32> {
  data
    .get(pos..pos + 4)
    .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    .ok_or_else(|| Error::invalid("truncated box content"))
}

fn read_u16(data: &[u8], pos: usize) -> Result<u16> {
  data
    .get(pos..pos + 2)
    .map(|b| u16::from_be_bytes([b[0], b[1]]))
    .ok_or_else(|| Error::invalid("truncated box content"))
}

/// Parse the first sample description into track metadata
fn parse_stsd(
  stbl: &[u8],
  track_id: u32,
  timescale: u32,
  rotation: Rotation,
  handler: &[u8; 4],
) -> Result<Option<TrackInfo>> {
  let stsd = iter_boxes(stbl)
    .find(|(fourcc, _)| fourcc == b"stsd")
    .map(|(_, c)| c)
    .ok_or_else(|| Error::invalid("stbl without stsd"))?;
  // Skip version/flags + entry count
  let entries = stsd.get(8..).unwrap_or(&[]);
  let Some((entry_fourcc, entry)) = iter_boxes(entries).next() else {
    return Err(Error::invalid("empty stsd"));
  };

  let video_codec = match &entry_fourcc {
    b"avc1" | b"avc3" => Some(VideoCodec::Avc),
    b"hvc1" | b"hev1" => Some(VideoCodec::Hevc),
    b"vp08" => Some(VideoCodec::Vp8),
    b"vp09" => Some(VideoCodec::Vp9),
    b"av01" => Some(VideoCodec::Av1),
    _ => None,
  };

  if let Some(codec) = video_codec {
    if handler != b"vide" {
      tracing::warn!(target: "mediamux::demux", track_id, "video sample entry on non-video handler");
    }
    let width = u32::from(read_u16(entry, 24)?);
    let height = u32::from(read_u16(entry, 26)?);
    let mut decoder_config = None;
    if entry.len() > 78 {
      for (child, content) in iter_boxes(&entry[78..]) {
        match &child {
          b"avcC" | b"hvcC" | b"av1C" => {
            decoder_config = Some(Bytes::copy_from_slice(content));
          }
          b"vpcC" => {
            // Full box; strip version/flags
            decoder_config = content.get(4..).map(Bytes::copy_from_slice);
          }
          _ => {}
        }
      }
    }
    return Ok(Some(TrackInfo::Video(VideoTrackInfo {
      id: track_id,
      codec,
      coded_width: width,
      coded_height: height,
      rotation,
      time_resolution: timescale,
      decoder_config,
    })));
  }

  let audio = match &entry_fourcc {
    b"mp4a" | b"Opus" => {
      let channels = u32::from(read_u16(entry, 16)?);
      let sample_rate = read_u32(entry, 24)? >> 16;
      let mut codec = None;
      let mut decoder_config = None;
      if entry.len() > 28 {
        for (child, content) in iter_boxes(&entry[28..]) {
          match &child {
            b"esds" => {
              let (object_type, dsi) = parse_esds(content.get(4..).unwrap_or(&[]));
              codec = match object_type {
                0x40 => Some(AudioCodec::Aac),
                0x69 | 0x6B => Some(AudioCodec::Mp3),
                _ => None,
              };
              decoder_config = dsi;
            }
            b"dOps" => {
              codec = Some(AudioCodec::Opus);
              decoder_config = Some(Bytes::copy_from_slice(content));
            }
            _ => {}
          }
        }
      }
      if &entry_fourcc == b"Opus" {
        codec = Some(AudioCodec::Opus);
      }
      codec.map(|codec| {
        TrackInfo::Audio(AudioTrackInfo {
          id: track_id,
          codec,
          sample_rate,
          number_of_channels: channels,
          time_resolution: timescale,
          decoder_config,
        })
      })
    }
    _ => None,
  };
  Ok(audio)
}

/// Walk the MPEG-4 descriptor tree inside `esds` content
fn parse_esds(data: &[u8]) -> (u8, Option<Bytes>) {
  fn read_descriptor(data: &[u8], pos: usize) -> Option<(u8, usize, usize)> {
    let tag = *data.get(pos)?;
    let mut size = 0usize;
    let mut cursor = pos + 1;
    for _ in 0..4 {
      let byte = *data.get(cursor)?;
      cursor += 1;
      size = size << 7 | usize::from(byte & 0x7F);
      if byte & 0x80 == 0 {
        break;
      }
    }
    Some((tag, cursor, size))
  }

  let mut object_type = 0u8;
  let mut dsi = None;
  if let Some((0x03, body, _)) = read_descriptor(data, 0) {
    // ES_ID(2) + flags(1)
    if let Some((0x04, dcd_body, dcd_size)) = read_descriptor(data, body + 3) {
      object_type = data.get(dcd_body).copied().unwrap_or(0);
      // objectType(1) streamType(1) bufferSize(3) maxBitrate(4) avgBitrate(4)
      let mut pos = dcd_body + 13;
      let dcd_end = dcd_body + dcd_size;
      while pos < dcd_end {
        match read_descriptor(data, pos) {
          Some((0x05, dsi_body, dsi_size)) => {
            dsi = data
              .get(dsi_body..dsi_body + dsi_size)
              .map(Bytes::copy_from_slice);
            break;
          }
          Some((_, next_body, next_size)) => pos = next_body + next_size,
          None => break,
        }
      }
    }
  }
  (object_type, dsi)
}

/// Expand compact sample tables into a flat decode-order index
fn expand_sample_tables(stbl: &[u8], timescale: u32) -> Result<Vec<IndexedSample>> {
  let mut stts: Vec<(u32, u32)> = Vec::new();
  let mut ctts: Vec<(u32, i64)> = Vec::new();
  let mut sizes: Vec<u32> = Vec::new();
  let mut stsc: Vec<(u32, u32)> = Vec::new();
  let mut chunk_offsets: Vec<u64> = Vec::new();
  let mut sync_samples: Option<Vec<u32>> = None;

  for (fourcc, content) in iter_boxes(stbl) {
    match &fourcc {
      b"stts" => {
        let count = read_u32(content, 4)? as usize;
        for i in 0..count {
          stts.push((read_u32(content, 8 + i * 8)?, read_u32(content, 12 + i * 8)?));
        }
      }
      b"ctts" => {
        let version = content.first().copied().unwrap_or(0);
        let count = read_u32(content, 4)? as usize;
        for i in 0..count {
          let sample_count = read_u32(content, 8 + i * 8)?;
          let raw = read_u32(content, 12 + i * 8)?;
          let offset = if version == 1 {
            i64::from(raw as i32)
          } else {
            i64::from(raw)
          };
          ctts.push((sample_count, offset));
        }
      }
      b"stsz" => {
        let fixed = read_u32(content, 4)?;
        let count = read_u32(content, 8)? as usize;
        if fixed != 0 {
          sizes = vec![fixed; count];
        } else {
          for i in 0..count {
            sizes.push(read_u32(content, 12 + i * 4)?);
          }
        }
      }
      b"stz2" => {
        let field_size = content
          .get(7)
          .copied()
          .map(u32::from)
          .ok_or_else(|| Error::invalid("truncated stz2"))?;
        let count = read_u32(content, 8)? as usize;
        for i in 0..count {
          let size = match field_size {
            4 => {
              let byte = content
                .get(12 + i / 2)
                .copied()
                .ok_or_else(|| Error::invalid("truncated stz2"))?;
              if i % 2 == 0 {
                u32::from(byte >> 4)
              } else {
                u32::from(byte & 0x0F)
              }
            }
            8 => u32::from(
              *content
                .get(12 + i)
                .ok_or_else(|| Error::invalid("truncated stz2"))?,
            ),
            16 => u32::from(read_u16(content, 12 + i * 2)?),
            _ => return Err(Error::invalid("invalid stz2 field size")),
          };
          sizes.push(size);
        }
      }
      b"stsc" => {
        let count = read_u32(content, 4)? as usize;
        for i in 0..count {
          stsc.push((read_u32(content, 8 + i * 12)?, read_u32(content, 12 + i * 12)?));
        }
      }
      b"stco" => {
        let count = read_u32(content, 4)? as usize;
        for i in 0..count {
          chunk_offsets.push(u64::from(read_u32(content, 8 + i * 4)?));
        }
      }
      b"co64" => {
        let count = read_u32(content, 4)? as usize;
        for i in 0..count {
          let bytes = content
            .get(8 + i * 8..16 + i * 8)
            .ok_or_else(|| Error::invalid("truncated co64"))?;
          chunk_offsets.push(u64::from_be_bytes(bytes.try_into().expect("sized slice")));
        }
      }
      b"stss" => {
        let count = read_u32(content, 4)? as usize;
        let mut keys = Vec::with_capacity(count);
        for i in 0..count {
          keys.push(read_u32(content, 8 + i * 4)?);
        }
        sync_samples = Some(keys);
      }
      _ => {}
    }
  }

  let sample_count = sizes.len();
  let timescale = f64::from(timescale);

  // Decode timestamps and durations from stts runs
  let mut dts_and_duration = Vec::with_capacity(sample_count);
  let mut dts_ticks: i64 = 0;
  for &(count, delta) in &stts {
    for _ in 0..count {
      dts_and_duration.push((dts_ticks, delta));
      dts_ticks += i64::from(delta);
    }
  }
  if dts_and_duration.len() < sample_count {
    return Err(Error::invalid("stts covers fewer samples than stsz"));
  }

  // Composition offsets
  let mut cts_offsets = vec![0i64; sample_count];
  let mut cursor = 0usize;
  for &(count, offset) in &ctts {
    for _ in 0..count {
      if cursor >= sample_count {
        break;
      }
      cts_offsets[cursor] = offset;
      cursor += 1;
    }
  }

  // Per-sample file offsets from the chunk map
  let mut samples = Vec::with_capacity(sample_count);
  let mut sample_index = 0usize;
  for (chunk_index, &chunk_offset) in chunk_offsets.iter().enumerate() {
    let chunk_number = chunk_index as u32 + 1;
    let samples_per_chunk = stsc
      .iter()
      .rev()
      .find(|&&(first_chunk, _)| first_chunk <= chunk_number)
      .map(|&(_, spc)| spc)
      .unwrap_or(0);
    let mut offset = chunk_offset;
    for _ in 0..samples_per_chunk {
      if sample_index >= sample_count {
        break;
      }
      let (dts, duration) = dts_and_duration[sample_index];
      let pts = dts + cts_offsets[sample_index];
      let is_key = sync_samples
        .as_ref()
        .map_or(true, |keys| keys.binary_search(&(sample_index as u32 + 1)).is_ok());
      samples.push(IndexedSample {
        offset,
        size: sizes[sample_index],
        is_key,
        pts: pts as f64 / timescale,
        dts: dts as f64 / timescale,
        duration: f64::from(duration) / timescale,
        sequence: sample_index as i64,
      });
      offset += u64::from(sizes[sample_index]);
      sample_index += 1;
    }
  }
  if sample_index < sample_count {
    tracing::warn!(
      target: "mediamux::demux",
      indexed = sample_index,
      declared = sample_count,
      "chunk map covers fewer samples than stsz declares"
    );
  }
  Ok(samples)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::codecs::VideoCodec;
  use crate::io::{BufferSource, BufferWriter};
  use crate::mux::{Mp4LayoutMode, Mp4Muxer, Mp4MuxerOptions};
  use crate::packet::PacketType;
  use crate::track::VideoTrackConfig;

  fn mux_sample_file(layout: Mp4LayoutMode) -> Vec<u8> {
    let mut muxer = Mp4Muxer::new(
      BufferWriter::new(),
      Mp4MuxerOptions {
        layout,
        creation_time: Some(0),
      },
    );
    let track = muxer
      .add_video_track(VideoTrackConfig::new(VideoCodec::Avc, 1920, 1080))
      .unwrap();
    for i in 0u8..4 {
      let packet = EncodedPacket::new(
        Bytes::from(vec![i; 100]),
        if i == 0 { PacketType::Key } else { PacketType::Delta },
        f64::from(i) / 30.0,
        1.0 / 30.0,
        i64::from(i),
      );
      muxer.add_packet(track, &packet).unwrap();
    }
    muxer.finalize().unwrap();
    muxer.into_writer().into_bytes().to_vec()
  }

  async fn open_demuxer(bytes: Vec<u8>) -> IsobmffDemuxer {
    IsobmffDemuxer::open(Reader::new(Box::new(BufferSource::new(bytes))))
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn test_round_trip_progressive() {
    let bytes = mux_sample_file(Mp4LayoutMode::Progressive);
    let mut demuxer = open_demuxer(bytes).await;

    let tracks = demuxer.tracks();
    assert_eq!(tracks.len(), 1);
    let video = tracks[0].as_video().unwrap();
    assert_eq!(video.codec, VideoCodec::Avc);
    assert_eq!((video.coded_width, video.coded_height), (1920, 1080));

    let options = PacketRetrievalOptions::default();
    let mut packet = demuxer.first_packet(1, options).await.unwrap().unwrap();
    let mut count = 0;
    loop {
      assert_eq!(packet.data.as_ref(), &vec![count as u8; 100][..]);
      let expected_ts = f64::from(count) / 30.0;
      assert!((packet.timestamp - expected_ts).abs() < 1.0 / 57_600.0);
      assert!((packet.duration - 1.0 / 30.0).abs() < 1.0 / 57_600.0);
      assert_eq!(packet.packet_type.is_key(), count == 0);
      count += 1;
      match demuxer.next_packet(1, &packet, options).await.unwrap() {
        Some(next) => packet = next,
        None => break,
      }
    }
    assert_eq!(count, 4);

    let duration = demuxer.compute_duration().await.unwrap();
    assert!((duration - 4.0 / 30.0).abs() < 1e-3);
  }

  #[tokio::test]
  async fn test_round_trip_faststart() {
    let bytes = mux_sample_file(Mp4LayoutMode::FastStartInMemory);
    let mut demuxer = open_demuxer(bytes).await;
    let options = PacketRetrievalOptions::default();
    let packet = demuxer
      .packet_at(1, 2.5 / 30.0, options)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(packet.data.as_ref(), &[2u8; 100][..]);
  }

  #[tokio::test]
  async fn test_metadata_only_skips_payload() {
    let bytes = mux_sample_file(Mp4LayoutMode::Progressive);
    let mut demuxer = open_demuxer(bytes).await;
    let packet = demuxer
      .first_packet(
        1,
        PacketRetrievalOptions {
          metadata_only: true,
          verify_key_packets: false,
        },
      )
      .await
      .unwrap()
      .unwrap();
    assert!(packet.data.is_empty());
    assert_eq!(packet.byte_length, 100);
  }

  #[tokio::test]
  async fn test_key_packet_navigation() {
    let bytes = mux_sample_file(Mp4LayoutMode::Progressive);
    let mut demuxer = open_demuxer(bytes).await;
    let options = PacketRetrievalOptions::default();
    let key = demuxer
      .key_packet_at(1, 3.0 / 30.0, options)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(key.sequence_number, 0);
    assert!(demuxer
      .next_key_packet(1, &key, options)
      .await
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_fragmented_round_trip() {
    let mut muxer = Mp4Muxer::new(
      BufferWriter::new(),
      Mp4MuxerOptions {
        layout: Mp4LayoutMode::Fragmented,
        creation_time: Some(0),
      },
    );
    let track = muxer
      .add_video_track(VideoTrackConfig::new(VideoCodec::Avc, 1280, 720))
      .unwrap();
    for i in 0u8..60 {
      let packet = EncodedPacket::new(
        Bytes::from(vec![i; 64]),
        if i % 30 == 0 { PacketType::Key } else { PacketType::Delta },
        f64::from(i) / 30.0,
        1.0 / 30.0,
        i64::from(i),
      );
      muxer.add_packet(track, &packet).unwrap();
    }
    muxer.finalize().unwrap();
    let bytes = muxer.into_writer().into_bytes().to_vec();

    let mut demuxer = open_demuxer(bytes).await;
    let options = PacketRetrievalOptions::default();
    let mut packet = demuxer.first_packet(1, options).await.unwrap().unwrap();
    let mut count = 1;
    while let Some(next) = demuxer.next_packet(1, &packet, options).await.unwrap() {
      assert!(next.sequence_number > packet.sequence_number);
      packet = next;
      count += 1;
    }
    assert_eq!(count, 60);

    // Key packet lookup crosses the fragment boundary
    let key = demuxer.key_packet_at(1, 1.5, options).await.unwrap().unwrap();
    assert!((key.timestamp - 1.0).abs() < 1e-6);
    assert_eq!(key.data.as_ref(), &[30u8; 64][..]);
  }
}
