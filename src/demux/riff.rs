//! RIFF/AVI demuxer
//!
//! Reads the `RIFF`/`RIFX` header, walks `hdrl` (`avih` + per-stream
//! `strl`/`strh`/`strf`), locates `movi`, and expands the flat `idx1` index
//! into per-stream packet lists. Video timestamps derive from
//! `(index × scale) / rate`; compressed audio uses the
//! `(index × 1152) / samples_per_sec` heuristic when `sample_size ∈ {0, 1}`.

use crate::codecs::{AudioCodec, VideoCodec};
use crate::demux::{materialize_packet, IndexedSample, PacketRetrievalOptions, TrackIndex};
use crate::error::{Error, Result};
use crate::io::Reader;
use crate::packet::EncodedPacket;
use crate::track::{AudioTrackInfo, Rotation, TrackInfo, VideoTrackInfo};

const AVIIF_KEYFRAME: u32 = 0x10;

struct StreamHeader {
  is_video: bool,
  handler: [u8; 4],
  scale: u32,
  rate: u32,
  sample_size: u32,
  // strf fields
  width: u32,
  height: u32,
  compression: [u8; 4],
  format_tag: u16,
  channels: u16,
  samples_per_sec: u32,
  bits_per_sample: u16,
}

struct AviTrack {
  info: TrackInfo,
  index: TrackIndex,
}

/// RIFF/AVI demuxer over a cached reader
pub struct RiffDemuxer {
  reader: Reader,
  tracks: Vec<AviTrack>,
}

impl RiffDemuxer {
  /// Parse the header lists and the idx1 index
  pub async fn open(reader: Reader) -> Result<Self> {
    let file_size = reader.size().await?;
    let head = reader.read_range(0, 12).await?;
    if head.len() < 12 {
      return Err(Error::invalid("file too short for a RIFF header"));
    }
    let big_endian = match &head[..4] {
      b"RIFF" => false,
      b"RIFX" => true,
      _ => return Err(Error::invalid("not a RIFF file")),
    };
    if &head[8..12] != b"AVI " {
      return Err(Error::invalid("RIFF form is not AVI"));
    }

    let read_u32 = |b: &[u8], pos: usize| -> u32 {
      let bytes = [b[pos], b[pos + 1], b[pos + 2], b[pos + 3]];
      if big_endian {
        u32::from_be_bytes(bytes)
      } else {
        u32::from_le_bytes(bytes)
      }
    };

    // Walk top-level chunks
    let mut streams: Vec<StreamHeader> = Vec::new();
    let mut movi_start: Option<u64> = None;
    let mut idx1: Option<bytes::Bytes> = None;
    let mut pos = 12u64;
    while pos + 8 <= file_size {
      let header = reader.read_range(pos, pos + 12).await?;
      if header.len() < 8 {
        break;
      }
      let size = u64::from(read_u32(&header, 4));
      let chunk_end = pos + 8 + size + (size & 1);
      match &header[..4] {
        b"LIST" if header.len() >= 12 => match &header[8..12] {
          b"hdrl" => {
            let content = reader.read_range(pos + 12, pos + 8 + size).await?;
            parse_hdrl(&content, big_endian, &mut streams)?;
          }
          b"movi" => {
            movi_start = Some(pos + 8);
          }
          _ => {}
        },
        b"idx1" => {
          idx1 = Some(reader.read_range(pos + 8, pos + 8 + size).await?);
        }
        _ => {}
      }
      pos = chunk_end;
    }

    let movi_start = movi_start.ok_or_else(|| Error::invalid("AVI without movi list"))?;
    let idx1 = idx1.ok_or_else(|| Error::invalid("AVI without idx1 index"))?;

    let mut tracks: Vec<AviTrack> = Vec::new();
    for (stream_number, header) in streams.iter().enumerate() {
      if let Some(info) = stream_track_info(header, stream_number as u32 + 1) {
        tracks.push(AviTrack {
          info,
          index: TrackIndex::default(),
        });
      }
    }
    if tracks.is_empty() {
      return Err(Error::invalid("AVI has no usable streams"));
    }

    // idx1 offsets are usually relative to the movi fourcc; absolute files
    // are detected from the first entry pointing past movi
    let mut absolute = false;
    if idx1.len() >= 16 {
      let first_offset = u64::from(read_u32(&idx1, 8));
      if first_offset >= movi_start {
        absolute = true;
      }
    }

    let mut per_stream_counts: Vec<i64> = vec![0; streams.len()];
    let mut batches: Vec<Vec<IndexedSample>> = vec![Vec::new(); streams.len()];
    let entry_count = idx1.len() / 16;
    for i in 0..entry_count {
      let base = i * 16;
      let ckid = &idx1[base..base + 4];
      let flags = read_u32(&idx1, base + 4);
      let offset = u64::from(read_u32(&idx1, base + 8));
      let size = read_u32(&idx1, base + 12);

      let Some(stream_number) = parse_ckid_stream(ckid) else {
        continue;
      };
      let code = &ckid[2..4];
      if code != b"dc" && code != b"db" && code != b"wb" {
        continue;
      }
      let Some(header) = streams.get(stream_number) else {
        continue;
      };

      let packet_index = per_stream_counts[stream_number];
      per_stream_counts[stream_number] += 1;

      let timestamp = stream_timestamp(header, packet_index);
      let chunk_pos = if absolute { offset } else { movi_start + offset };
      batches[stream_number].push(IndexedSample {
        offset: chunk_pos + 8,
        size,
        is_key: flags & AVIIF_KEYFRAME != 0,
        pts: timestamp,
        dts: timestamp,
        duration: 0.0,
        sequence: packet_index,
      });
    }

    // Durations from successive timestamps
    for batch in &mut batches {
      for i in 0..batch.len() {
        let next_ts = batch.get(i + 1).map(|s| s.pts);
        let duration = match next_ts {
          Some(next) => (next - batch[i].pts).max(0.0),
          None if i > 0 => batch[i].pts - batch[i - 1].pts,
          None => 0.0,
        };
        batch[i].duration = duration;
      }
    }

    let mut batch_iter = batches.into_iter();
    let mut track_cursor = 0usize;
    for (stream_number, header) in streams.iter().enumerate() {
      let batch = batch_iter.next().expect("one batch per stream");
      if stream_track_info(header, stream_number as u32 + 1).is_some() {
        tracks[track_cursor].index.insert(batch);
        track_cursor += 1;
      }
    }

    Ok(Self { reader, tracks })
  }

  pub fn tracks(&self) -> Vec<TrackInfo> {
    self.tracks.iter().map(|t| t.info.clone()).collect()
  }

  pub fn reader(&self) -> &Reader {
    &self.reader
  }

  pub fn compute_duration(&self) -> Result<f64> {
    Ok(
      self
        .tracks
        .iter()
        .map(|t| t.index.max_pts_end())
        .fold(0.0, f64::max),
    )
  }

  fn track_mut(&mut self, track_id: u32) -> Result<&mut AviTrack> {
    self
      .tracks
      .iter_mut()
      .find(|t| t.info.id() == track_id)
      .ok_or_else(|| Error::invalid(format!("unknown track id {track_id}")))
  }

  pub async fn first_packet(
    &mut self,
    track_id: u32,
    options: PacketRetrievalOptions,
  ) -> Result<Option<EncodedPacket>> {
    let Some(sample) = self.track_mut(track_id)?.index.first().cloned() else {
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
    let Some(sample) = self
      .track_mut(track_id)?
      .index
      .next_after(packet.sequence_number)
      .cloned()
    else {
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
    let Some(sample) = self.track_mut(track_id)?.index.key_floor(timestamp).cloned() else {
      return Ok(None);
    };
    Ok(Some(materialize_packet(&self.reader, &sample, options.metadata_only).await?))
  }

  pub async fn next_key_packet(
    &mut self,
    track_id: u32,
    packet: &EncodedPacket,
    options: PacketRetrievalOptions,
  ) -> Result<Option<EncodedPacket>> {
    let Some(sample) = self
      .track_mut(track_id)?
      .index
      .next_key_after(packet.sequence_number)
      .cloned()
    else {
      return Ok(None);
    };
    Ok(Some(materialize_packet(&self.reader, &sample, options.metadata_only).await?))
  }
}

/// `"01wb"` → stream 1
fn parse_ckid_stream(ckid: &[u8]) -> Option<usize> {
  let d0 = (ckid[0] as char).to_digit(10)?;
  let d1 = (ckid[1] as char).to_digit(10)?;
  Some((d0 * 10 + d1) as usize)
}

fn stream_timestamp(header: &StreamHeader, packet_index: i64) -> f64 {
  if !header.is_video && (header.sample_size == 0 || header.sample_size == 1) {
    // Compressed audio heuristic: MPEG-style 1152-sample frames
    return packet_index as f64 * 1152.0 / f64::from(header.samples_per_sec.max(1));
  }
  if header.rate == 0 {
    return 0.0;
  }
  packet_index as f64 * f64::from(header.scale) / f64::from(header.rate)
}

fn stream_track_info(header: &StreamHeader, track_id: u32) -> Option<TrackInfo> {
  if header.is_video {
    let codec = match &header.compression {
      b"H264" | b"h264" | b"avc1" | b"AVC1" | b"X264" | b"x264" => VideoCodec::Avc,
      b"HEVC" | b"hevc" | b"hvc1" | b"H265" => VideoCodec::Hevc,
      b"VP80" => VideoCodec::Vp8,
      b"VP90" => VideoCodec::Vp9,
      b"AV01" => VideoCodec::Av1,
      other => {
        tracing::debug!(
          target: "mediamux::demux",
          compression = %String::from_utf8_lossy(other),
          "skipping unsupported AVI video stream"
        );
        return None;
      }
    };
    return Some(TrackInfo::Video(VideoTrackInfo {
      id: track_id,
      codec,
      coded_width: header.width,
      coded_height: header.height,
      rotation: Rotation::None,
      time_resolution: header.rate.max(1),
      decoder_config: None,
    }));
  }

  let codec = match header.format_tag {
    0x0001 => match header.bits_per_sample {
      8 => AudioCodec::PcmU8,
      24 => AudioCodec::PcmS24,
      32 => AudioCodec::PcmS32,
      _ => AudioCodec::PcmS16,
    },
    0x0003 => AudioCodec::PcmF32,
    0x0006 => AudioCodec::PcmAlaw,
    0x0007 => AudioCodec::PcmMulaw,
    0x0055 => AudioCodec::Mp3,
    0x00FF => AudioCodec::Aac,
    other => {
      tracing::debug!(
        target: "mediamux::demux",
        format_tag = other,
        "skipping unsupported AVI audio stream"
      );
      return None;
    }
  };
  Some(TrackInfo::Audio(AudioTrackInfo {
    id: track_id,
    codec,
    sample_rate: header.samples_per_sec,
    number_of_channels: u32::from(header.channels),
    time_resolution: header.samples_per_sec.max(1),
    decoder_config: None,
  }))
}

fn parse_hdrl(content: &[u8], big_endian: bool, streams: &mut Vec<StreamHeader>) -> Result<()> {
  let read_u32 = |b: &[u8], pos: usize| -> Option<u32> {
    let bytes = b.get(pos..pos + 4)?;
    let bytes = [bytes[0], bytes[1], bytes[2], bytes[3]];
    Some(if big_endian {
      u32::from_be_bytes(bytes)
    } else {
      u32::from_le_bytes(bytes)
    })
  };
  let read_u16 = |b: &[u8], pos: usize| -> Option<u16> {
    let bytes = b.get(pos..pos + 2)?;
    let bytes = [bytes[0], bytes[1]];
    Some(if big_endian {
      u16::from_be_bytes(bytes)
    } else {
      u16::from_le_bytes(bytes)
    })
  };

  let mut pos = 0usize;
  while pos + 8 <= content.len() {
    let size = read_u32(content, pos + 4).unwrap_or(0) as usize;
    let chunk_end = pos + 8 + size + (size & 1);
    if &content[pos..pos + 4] == b"LIST" && content.get(pos + 8..pos + 12) == Some(b"strl") {
      let strl = content
        .get(pos + 12..pos + 8 + size)
        .ok_or_else(|| Error::invalid("truncated strl list"))?;

      let mut header = StreamHeader {
        is_video: false,
        handler: [0; 4],
        scale: 0,
        rate: 0,
        sample_size: 0,
        width: 0,
        height: 0,
        compression: [0; 4],
        format_tag: 0,
        channels: 0,
        samples_per_sec: 0,
        bits_per_sample: 0,
      };

      let mut inner = 0usize;
      while inner + 8 <= strl.len() {
        let inner_size = read_u32(strl, inner + 4).unwrap_or(0) as usize;
        let inner_end = inner + 8 + inner_size + (inner_size & 1);
        let body = strl.get(inner + 8..inner + 8 + inner_size).unwrap_or(&[]);
        match &strl[inner..inner + 4] {
          b"strh" if body.len() >= 48 => {
            header.is_video = &body[..4] == b"vids";
            header.handler.copy_from_slice(&body[4..8]);
            header.scale = read_u32(body, 20).unwrap_or(0);
            header.rate = read_u32(body, 24).unwrap_or(0);
            header.sample_size = read_u32(body, 44).unwrap_or(0);
          }
          b"strf" => {
            if header.is_video && body.len() >= 20 {
              header.width = read_u32(body, 4).unwrap_or(0);
              header.height = read_u32(body, 8).unwrap_or(0);
              header.compression.copy_from_slice(&body[16..20]);
              // Some encoders leave compression blank and put the codec in
              // the stream handler
              if header.compression == [0; 4] {
                header.compression = header.handler;
              }
            } else if !header.is_video && body.len() >= 16 {
              header.format_tag = read_u16(body, 0).unwrap_or(0);
              header.channels = read_u16(body, 2).unwrap_or(0);
              header.samples_per_sec = read_u32(body, 4).unwrap_or(0);
              header.bits_per_sample = read_u16(body, 14).unwrap_or(0);
            }
          }
          _ => {}
        }
        inner = inner_end;
      }
      streams.push(header);
    }
    pos = chunk_end;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::io::BufferSource;

  /// Hand-built little-endian AVI with one MP3 audio stream
  fn build_mp3_avi(packet_count: u32) -> Vec<u8> {
    fn chunk(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
      let mut out = Vec::new();
      out.extend_from_slice(fourcc);
      out.extend_from_slice(&(body.len() as u32).to_le_bytes());
      out.extend_from_slice(body);
      if body.len() % 2 == 1 {
        out.push(0);
      }
      out
    }
    fn list(list_type: &[u8; 4], body: &[u8]) -> Vec<u8> {
      let mut inner = Vec::new();
      inner.extend_from_slice(list_type);
      inner.extend_from_slice(body);
      chunk(b"LIST", &inner)
    }

    // strh for an auds stream: mp3-style, sample_size 1
    let mut strh = Vec::new();
    strh.extend_from_slice(b"auds");
    strh.extend_from_slice(&[0; 16]); // handler, flags, priority, language, initial frames
    strh.extend_from_slice(&1u32.to_le_bytes()); // scale
    strh.extend_from_slice(&44_100u32.to_le_bytes()); // rate
    strh.extend_from_slice(&0u32.to_le_bytes()); // start
    strh.extend_from_slice(&packet_count.to_le_bytes()); // length
    strh.extend_from_slice(&0u32.to_le_bytes()); // buffer size
    strh.extend_from_slice(&0u32.to_le_bytes()); // quality
    strh.extend_from_slice(&1u32.to_le_bytes()); // sample_size
    strh.extend_from_slice(&[0; 8]); // frame rect

    // WAVEFORMATEX with MP3 tag
    let mut strf = Vec::new();
    strf.extend_from_slice(&0x0055u16.to_le_bytes());
    strf.extend_from_slice(&2u16.to_le_bytes());
    strf.extend_from_slice(&44_100u32.to_le_bytes());
    strf.extend_from_slice(&16_000u32.to_le_bytes());
    strf.extend_from_slice(&1u16.to_le_bytes());
    strf.extend_from_slice(&0u16.to_le_bytes());

    let mut avih = vec![0u8; 56];
    avih[24..28].copy_from_slice(&1u32.to_le_bytes()); // one stream

    let strl = list(b"strl", &[chunk(b"strh", &strh), chunk(b"strf", &strf)].concat());
    let hdrl = list(b"hdrl", &[chunk(b"avih", &avih), strl].concat());

    // movi with N mp3 packets
    let mut movi_body = Vec::new();
    movi_body.extend_from_slice(b"movi");
    let mut offsets = Vec::new();
    for i in 0..packet_count {
      // ckid position relative to the movi fourcc
      offsets.push(movi_body.len() as u32);
      let payload = vec![i as u8; 104];
      movi_body.extend_from_slice(&chunk(b"01wb", &payload));
    }
    let movi = chunk(b"LIST", &movi_body);

    // idx1: offsets relative to the movi fourcc
    let mut idx1_body = Vec::new();
    for &offset in &offsets {
      idx1_body.extend_from_slice(b"01wb");
      idx1_body.extend_from_slice(&AVIIF_KEYFRAME.to_le_bytes());
      idx1_body.extend_from_slice(&offset.to_le_bytes());
      idx1_body.extend_from_slice(&104u32.to_le_bytes());
    }
    let idx1 = chunk(b"idx1", &idx1_body);

    let mut riff_body = Vec::new();
    riff_body.extend_from_slice(b"AVI ");
    riff_body.extend_from_slice(&hdrl);
    riff_body.extend_from_slice(&movi);
    riff_body.extend_from_slice(&idx1);

    let mut out = Vec::new();
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(riff_body.len() as u32).to_le_bytes());
    out.extend_from_slice(&riff_body);
    out
  }

  #[tokio::test]
  async fn test_mp3_stream_index() {
    let bytes = build_mp3_avi(100);
    let mut demuxer = RiffDemuxer::open(Reader::new(Box::new(BufferSource::new(bytes))))
      .await
      .unwrap();

    let tracks = demuxer.tracks();
    assert_eq!(tracks.len(), 1);
    let audio = tracks[0].as_audio().unwrap();
    assert_eq!(audio.codec, AudioCodec::Mp3);
    assert_eq!(audio.sample_rate, 44_100);

    let options = PacketRetrievalOptions::default();
    let mut packet = demuxer.first_packet(1, options).await.unwrap().unwrap();
    let mut i = 0u32;
    loop {
      // timestamp[i] = i * 1152 / 44100, every packet flagged key
      let expected = f64::from(i) * 1152.0 / 44_100.0;
      assert!((packet.timestamp - expected).abs() < 1e-9, "packet {i}");
      assert!(packet.is_key());
      assert_eq!(packet.data.as_ref(), &vec![i as u8; 104][..]);
      i += 1;
      match demuxer.next_packet(1, &packet, options).await.unwrap() {
        Some(next) => packet = next,
        None => break,
      }
    }
    assert_eq!(i, 100);
  }

  #[tokio::test]
  async fn test_index_offsets_strictly_increase() {
    let bytes = build_mp3_avi(10);
    let demuxer = RiffDemuxer::open(Reader::new(Box::new(BufferSource::new(bytes))))
      .await
      .unwrap();
    let index = &demuxer.tracks[0].index;
    let samples: Vec<u64> = (0..10)
      .filter_map(|i| index.by_sequence(i).map(|s| s.offset))
      .collect();
    assert_eq!(samples.len(), 10);
    assert!(samples.windows(2).all(|w| w[0] < w[1]));
  }

  #[tokio::test]
  async fn test_packet_at_floor_semantics() {
    let bytes = build_mp3_avi(100);
    let mut demuxer = RiffDemuxer::open(Reader::new(Box::new(BufferSource::new(bytes))))
      .await
      .unwrap();
    let t = 50.0 * 1152.0 / 44_100.0;
    let packet = demuxer
      .packet_at(1, t + 0.001, PacketRetrievalOptions::default())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(packet.sequence_number, 50);
  }
}
