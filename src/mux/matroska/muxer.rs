//! Matroska/WebM muxer
//!
//! EBML document with a Segment whose size is backpatched (finite mode) or
//! unknown (streaming mode). SeekHead placeholders are reserved up front and
//! backpatched at finalize; Clusters are cut on key-frame boundaries at
//! least one second apart; a Cues block indexes every cluster.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::codecs::{
  matroska_codec_id_audio, matroska_codec_id_video, AudioCodec, VideoCodec,
};
use crate::error::{Error, Result};
use crate::io::Writer;
use crate::mux::matroska::ebml::{
  ids, patch_vp9_color_space, vint_8, write_id, write_vint, EbmlBuilder, UNKNOWN_SIZE,
};
use crate::mux::{MuxerState, SampleEntry, TimestampAdmitter, FRAGMENT_DURATION};
use crate::packet::EncodedPacket;
use crate::track::{AudioTrackConfig, VideoTrackConfig};

/// A Matroska block's relative timestamp is a signed 16-bit integer
const MAX_CLUSTER_SPAN_MS: i64 = 1 << 15;

/// Reserved byte count for the SeekHead written at finalize
const SEEK_HEAD_RESERVE: usize = 96;

/// Container flavor: full Matroska or the WebM codec subset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatroskaVariant {
  #[default]
  Matroska,
  /// DocType "webm"; restricts codecs to VP8/VP9/AV1 + Opus/Vorbis
  Webm,
}

/// Matroska muxer options
#[derive(Debug, Clone, Default)]
pub struct MatroskaMuxerOptions {
  pub variant: MatroskaVariant,
  /// Unknown-size Segment and Clusters, no SeekHead/Duration/Cues patching.
  /// For non-seekable live consumers.
  pub streaming: bool,
}

enum TrackKind {
  Video(VideoTrackConfig),
  Audio(AudioTrackConfig),
}

struct MkvTrack {
  id: u32,
  kind: TrackKind,
  admitter: TimestampAdmitter,
  queue: VecDeque<QueuedSample>,
  /// Relative timestamp of the last block written, for ReferenceBlock
  last_block_ms: Option<i64>,
}

struct QueuedSample {
  sample: SampleEntry,
  additions: Option<Bytes>,
}

struct CurrentCluster {
  timestamp_ms: i64,
  blocks: EbmlBuilder,
  contributing_tracks: Vec<u32>,
}

struct CuePointRecord {
  time_ms: i64,
  /// `(track id, cluster position relative to segment data start)`
  positions: Vec<(u32, u64)>,
}

/// Matroska/WebM muxer over any [`Writer`]
pub struct MatroskaMuxer<W: Writer> {
  writer: W,
  options: MatroskaMuxerOptions,
  state: MuxerState,
  tracks: Vec<MkvTrack>,

  started: bool,
  segment_size_pos: u64,
  segment_data_start: u64,
  seek_head_pos: u64,
  info_offset: u64,
  tracks_offset: u64,
  duration_pos: u64,

  current_cluster: Option<CurrentCluster>,
  cues: Vec<CuePointRecord>,
  end_timestamp: f64,
}

impl<W: Writer> MatroskaMuxer<W> {
  pub fn new(writer: W, options: MatroskaMuxerOptions) -> Self {
    Self {
      writer,
      options,
      state: MuxerState::ConfiguringTracks,
      tracks: Vec::new(),
      started: false,
      segment_size_pos: 0,
      segment_data_start: 0,
      seek_head_pos: 0,
      info_offset: 0,
      tracks_offset: 0,
      duration_pos: 0,
      current_cluster: None,
      cues: Vec::new(),
      end_timestamp: 0.0,
    }
  }

  pub fn state(&self) -> MuxerState {
    self.state
  }

  pub fn into_writer(self) -> W {
    self.writer
  }

  /// Add a video track. Must happen before the first packet.
  pub fn add_video_track(&mut self, config: VideoTrackConfig) -> Result<u32> {
    if self.state != MuxerState::ConfiguringTracks {
      return Err(Error::StateViolation("cannot add track after muxing started"));
    }
    if self.options.variant == MatroskaVariant::Webm
      && !matches!(config.codec, VideoCodec::Vp8 | VideoCodec::Vp9 | VideoCodec::Av1)
    {
      return Err(Error::unsupported(format!(
        "video codec {} is not allowed in WebM",
        config.codec
      )));
    }
    let id = self.tracks.len() as u32 + 1;
    self.tracks.push(MkvTrack {
      id,
      kind: TrackKind::Video(config),
      admitter: TimestampAdmitter::default(),
      queue: VecDeque::new(),
      last_block_ms: None,
    });
    Ok(id)
  }

  /// Add an audio track. Must happen before the first packet.
  pub fn add_audio_track(&mut self, config: AudioTrackConfig) -> Result<u32> {
    if self.state != MuxerState::ConfiguringTracks {
      return Err(Error::StateViolation("cannot add track after muxing started"));
    }
    if self.options.variant == MatroskaVariant::Webm
      && !matches!(config.codec, AudioCodec::Opus | AudioCodec::Vorbis)
    {
      return Err(Error::unsupported(format!(
        "audio codec {} is not allowed in WebM",
        config.codec
      )));
    }
    if matroska_codec_id_audio(config.codec).is_none() {
      return Err(Error::unsupported(format!(
        "audio codec {} has no Matroska codec id",
        config.codec
      )));
    }
    let id = self.tracks.len() as u32 + 1;
    self.tracks.push(MkvTrack {
      id,
      kind: TrackKind::Audio(config),
      admitter: TimestampAdmitter::default(),
      queue: VecDeque::new(),
      last_block_ms: None,
    });
    Ok(id)
  }

  /// Add an encoded packet to a track
  pub fn add_packet(&mut self, track_id: u32, packet: &EncodedPacket) -> Result<()> {
    self.add_packet_with_additions(track_id, packet, None)
  }

  /// Add an encoded packet carrying block-additional side data (VP9 alpha)
  pub fn add_packet_with_additions(
    &mut self,
    track_id: u32,
    packet: &EncodedPacket,
    additions: Option<&Bytes>,
  ) -> Result<()> {
    if self.state == MuxerState::Finalized {
      return Err(Error::StateViolation("packet after finalize"));
    }
    let track_index = self
      .tracks
      .iter()
      .position(|t| t.id == track_id)
      .ok_or_else(|| Error::invalid(format!("unknown track id {track_id}")))?;

    self.ensure_started()?;
    self.state = MuxerState::Muxing;

    let (pts, dts) = self.tracks[track_index].admitter.admit(
      track_id,
      packet.timestamp,
      packet.duration,
      packet.packet_type,
    )?;

    // VP9 key packets missing color-space bits get them patched in from the
    // decoder configuration before the bytes are committed
    let data = match &self.tracks[track_index].kind {
      TrackKind::Video(c)
        if c.codec == VideoCodec::Vp9
          && packet.packet_type.is_key()
          && c.description.is_some() =>
      {
        let mut owned = packet.data.to_vec();
        if let Some(config) = &c.description {
          patch_vp9_color_space(&mut owned, config);
        }
        Bytes::from(owned)
      }
      _ => packet.data.clone(),
    };

    let sample = SampleEntry {
      presentation_timestamp: pts,
      decode_timestamp: dts,
      duration: packet.duration,
      size: data.len(),
      data: Some(data),
      packet_type: packet.packet_type,
      timescale_units_to_next_sample: None,
    };
    self.tracks[track_index].queue.push_back(QueuedSample {
      sample,
      additions: additions.cloned(),
    });
    self.interleave_clusters(false)
  }

  pub fn flush(&mut self) -> Result<()> {
    self.writer.flush()
  }

  /// Flush the trailing cluster, write Cues, backpatch SeekHead, Duration,
  /// and the Segment size. A second call fails with `StateViolation`.
  pub fn finalize(&mut self) -> Result<()> {
    if self.state == MuxerState::Finalized {
      return Err(Error::StateViolation("finalize called twice"));
    }
    self.ensure_started()?;
    self.state = MuxerState::Finalized;

    self.interleave_clusters(true)?;
    self.flush_cluster()?;

    if !self.options.streaming {
      let cues_offset = self.writer.pos() - self.segment_data_start;
      self.write_cues()?;
      let end = self.writer.pos();

      // SeekHead now that Cues landed
      self.writer.seek(self.seek_head_pos);
      self.write_seek_head(cues_offset)?;

      // Duration in timestamp-scale ticks (milliseconds)
      self.writer.seek(self.duration_pos);
      let mut duration = EbmlBuilder::new();
      duration.float(ids::DURATION, (self.end_timestamp * 1000.0).max(0.0));
      self.writer.write(&duration.into_bytes())?;

      // Segment size
      self.writer.seek(self.segment_size_pos);
      self.writer.write(&vint_8(end - self.segment_data_start))?;

      self.writer.seek(end);
    }

    self.writer.finalize()
  }

  // ==========================================================================
  // Header
  // ==========================================================================

  fn ensure_started(&mut self) -> Result<()> {
    if self.started {
      return Ok(());
    }
    if self.tracks.is_empty() {
      return Err(Error::StateViolation("no tracks added"));
    }
    self.started = true;

    let doc_type = match self.options.variant {
      MatroskaVariant::Matroska => "matroska",
      MatroskaVariant::Webm => "webm",
    };
    let mut header = EbmlBuilder::new();
    header.master(ids::EBML, |b| {
      b.uint(ids::EBML_VERSION, 1);
      b.uint(ids::EBML_READ_VERSION, 1);
      b.uint(ids::EBML_MAX_ID_LENGTH, 4);
      b.uint(ids::EBML_MAX_SIZE_LENGTH, 8);
      b.string(ids::DOC_TYPE, doc_type);
      b.uint(ids::DOC_TYPE_VERSION, 4);
      b.uint(ids::DOC_TYPE_READ_VERSION, 2);
    });
    self.writer.write(&header.into_bytes())?;

    // Segment header with an 8-byte size: backpatched at finalize, or the
    // unknown-size marker in streaming mode
    let mut segment = Vec::new();
    write_id(&mut segment, ids::SEGMENT);
    self.writer.write(&segment)?;
    self.segment_size_pos = self.writer.pos();
    self.writer.write(&UNKNOWN_SIZE)?;
    self.segment_data_start = self.writer.pos();

    if !self.options.streaming {
      self.seek_head_pos = self.writer.pos();
      let mut reserve = EbmlBuilder::new();
      reserve.void(SEEK_HEAD_RESERVE);
      self.writer.write(&reserve.into_bytes())?;
    }

    // Info; the trailing Duration element is a placeholder patched at
    // finalize, omitted entirely in streaming mode
    self.info_offset = self.writer.pos() - self.segment_data_start;
    let streaming = self.options.streaming;
    let mut info = EbmlBuilder::new();
    info.master(ids::INFO, |b| {
      b.uint(ids::TIMESTAMP_SCALE, 1_000_000);
      b.string(ids::MUXING_APP, "mediamux");
      b.string(ids::WRITING_APP, "mediamux");
      if !streaming {
        b.float(ids::DURATION, 0.0);
      }
    });
    let info_bytes = info.into_bytes();
    if !streaming {
      // Duration sits at the end of Info: id(2) + size(1) + f64(8)
      self.duration_pos = self.writer.pos() + info_bytes.len() as u64 - 11;
    }
    self.writer.write(&info_bytes)?;

    // Tracks
    self.tracks_offset = self.writer.pos() - self.segment_data_start;
    let tracks_bytes = self.build_tracks_element();
    self.writer.write(&tracks_bytes)?;
    Ok(())
  }

  fn build_tracks_element(&self) -> Vec<u8> {
    let mut b = EbmlBuilder::new();
    b.master(ids::TRACKS, |tracks| {
      for track in &self.tracks {
        tracks.master(ids::TRACK_ENTRY, |entry| {
          entry.uint(ids::TRACK_NUMBER, u64::from(track.id));
          entry.uint(ids::TRACK_UID, u64::from(track.id));
          match &track.kind {
            TrackKind::Video(c) => {
              entry.uint(ids::TRACK_TYPE, 1);
              entry.uint(ids::FLAG_LACING, 0);
              entry.string(ids::CODEC_ID, matroska_codec_id_video(c.codec));
              if let Some(desc) = &c.description {
                entry.binary(ids::CODEC_PRIVATE, desc);
              }
              entry.master(ids::VIDEO, |video| {
                video.uint(ids::PIXEL_WIDTH, u64::from(c.width));
                video.uint(ids::PIXEL_HEIGHT, u64::from(c.height));
              });
            }
            TrackKind::Audio(c) => {
              entry.uint(ids::TRACK_TYPE, 2);
              entry.uint(ids::FLAG_LACING, 0);
              let codec_id =
                matroska_codec_id_audio(c.codec).expect("validated at add_audio_track");
              entry.string(ids::CODEC_ID, codec_id);
              if let Some(desc) = &c.description {
                entry.binary(ids::CODEC_PRIVATE, desc);
              }
              entry.master(ids::AUDIO, |audio| {
                audio.float(ids::SAMPLING_FREQUENCY, f64::from(c.sample_rate));
                audio.uint(ids::CHANNELS, u64::from(c.number_of_channels));
                if let Some(size) = c.codec.pcm_sample_size() {
                  audio.uint(ids::BIT_DEPTH, size as u64 * 8);
                }
              });
            }
          }
        });
      }
    });
    b.into_bytes()
  }

  fn write_seek_head(&mut self, cues_offset: u64) -> Result<()> {
    let mut b = EbmlBuilder::new();
    b.master(ids::SEEK_HEAD, |head| {
      let mut entry = |id: u32, position: u64| {
        head.master(ids::SEEK, |seek| {
          let mut id_bytes = Vec::new();
          write_id(&mut id_bytes, id);
          seek.binary(ids::SEEK_ID, &id_bytes);
          seek.uint(ids::SEEK_POSITION, position);
        });
      };
      entry(ids::INFO, self.info_offset);
      entry(ids::TRACKS, self.tracks_offset);
      entry(ids::CUES, cues_offset);
    });
    let mut bytes = b.into_bytes();
    debug_assert!(bytes.len() <= SEEK_HEAD_RESERVE - 2);
    let fill = SEEK_HEAD_RESERVE - bytes.len();
    let mut filler = EbmlBuilder::new();
    filler.void(fill);
    bytes.extend_from_slice(&filler.into_bytes());
    self.writer.write(&bytes)
  }

  // ==========================================================================
  // Clusters
  // ==========================================================================

  /// Drain queued samples in cross-track decode order, cutting clusters on
  /// all-tracks-keyed boundaries at least one second apart
  fn interleave_clusters(&mut self, force: bool) -> Result<()> {
    loop {
      let all_have = self.tracks.iter().all(|t| !t.queue.is_empty());

      if all_have {
        if let Some(cluster) = &self.current_cluster {
          let all_keys = self
            .tracks
            .iter()
            .all(|t| t.queue.front().is_some_and(|q| q.sample.packet_type.is_key()));
          let min_next_ms = self
            .tracks
            .iter()
            .filter_map(|t| t.queue.front().map(|q| (q.sample.presentation_timestamp * 1000.0) as i64))
            .min()
            .unwrap_or(0);
          if all_keys
            && min_next_ms - cluster.timestamp_ms >= (FRAGMENT_DURATION * 1000.0) as i64
          {
            self.flush_cluster()?;
          }
        }
      }

      let candidate = if all_have || force {
        self
          .tracks
          .iter()
          .enumerate()
          .filter(|(_, t)| !t.queue.is_empty())
          .min_by(|(_, a), (_, b)| {
            let a = a.queue.front().map(|q| q.sample.decode_timestamp).unwrap_or(0.0);
            let b = b.queue.front().map(|q| q.sample.decode_timestamp).unwrap_or(0.0);
            a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
          })
          .map(|(i, _)| i)
      } else {
        None
      };

      let Some(track_index) = candidate else {
        return Ok(());
      };
      let queued = self.tracks[track_index]
        .queue
        .pop_front()
        .expect("candidate track has a queued sample");
      self.write_block(track_index, queued)?;
    }
  }

  fn write_block(&mut self, track_index: usize, queued: QueuedSample) -> Result<()> {
    let sample = queued.sample;
    let block_ms = (sample.presentation_timestamp * 1000.0).round() as i64;

    if self.current_cluster.is_none() {
      self.current_cluster = Some(CurrentCluster {
        timestamp_ms: block_ms,
        blocks: EbmlBuilder::new(),
        contributing_tracks: Vec::new(),
      });
      for track in &mut self.tracks {
        track.last_block_ms = None;
      }
    }

    let cluster_ms = self.current_cluster.as_ref().map(|c| c.timestamp_ms).unwrap_or(0);
    let mut relative = block_ms - cluster_ms;
    if relative >= MAX_CLUSTER_SPAN_MS {
      return Err(Error::ClusterTooLong {
        cluster_timestamp: cluster_ms,
        block_timestamp: block_ms,
      });
    }
    if relative < 0 {
      tracing::warn!(
        target: "mediamux::mux",
        block_ms,
        cluster_ms,
        "block timestamp precedes its cluster, clamping"
      );
      relative = 0;
    }

    let track_id = self.tracks[track_index].id;
    let duration_ms = (sample.duration * 1000.0).round() as i64;
    let is_key = sample.packet_type.is_key();
    let data = sample.data.unwrap_or_default();

    // Block prelude: track vint, s16be relative timestamp, flags
    let mut payload = Vec::with_capacity(data.len() + 4);
    write_vint(&mut payload, u64::from(track_id));
    payload.extend_from_slice(&(relative as i16).to_be_bytes());

    let reference = self.tracks[track_index].last_block_ms;
    let cluster = self.current_cluster.as_mut().expect("cluster just ensured");

    if duration_ms == 0 && queued.additions.is_none() {
      payload.push(if is_key { 0x80 } else { 0x00 });
      payload.extend_from_slice(&data);
      cluster.blocks.binary(ids::SIMPLE_BLOCK, &payload);
    } else {
      payload.push(0x00);
      payload.extend_from_slice(&data);
      cluster.blocks.master(ids::BLOCK_GROUP, |group| {
        group.binary(ids::BLOCK, &payload);
        if duration_ms > 0 {
          group.uint(ids::BLOCK_DURATION, duration_ms as u64);
        }
        if !is_key {
          // Reference the previous block of this track within the cluster
          let reference = reference.map(|last| last - relative).unwrap_or(-1);
          group.sint(ids::REFERENCE_BLOCK, reference);
        }
        if let Some(additions) = &queued.additions {
          group.master(ids::BLOCK_ADDITIONS, |adds| {
            adds.master(ids::BLOCK_MORE, |more| {
              more.uint(ids::BLOCK_ADD_ID, 1);
              more.binary(ids::BLOCK_ADDITIONAL, additions);
            });
          });
        }
      });
    }

    if !cluster.contributing_tracks.contains(&track_id) {
      cluster.contributing_tracks.push(track_id);
    }
    self.tracks[track_index].last_block_ms = Some(relative);
    self.end_timestamp = self
      .end_timestamp
      .max(sample.presentation_timestamp + sample.duration);
    Ok(())
  }

  fn flush_cluster(&mut self) -> Result<()> {
    let Some(cluster) = self.current_cluster.take() else {
      return Ok(());
    };
    let cluster_pos = self.writer.pos() - self.segment_data_start;

    let mut content = EbmlBuilder::new();
    content.uint(ids::CLUSTER_TIMESTAMP, cluster.timestamp_ms.max(0) as u64);
    content.raw(&cluster.blocks.into_bytes());
    let content = content.into_bytes();

    let mut header = Vec::new();
    write_id(&mut header, ids::CLUSTER);
    if self.options.streaming {
      header.extend_from_slice(&UNKNOWN_SIZE);
    } else {
      write_vint(&mut header, content.len() as u64);
    }
    self.writer.write(&header)?;
    self.writer.write(&content)?;

    if !self.options.streaming {
      self.cues.push(CuePointRecord {
        time_ms: cluster.timestamp_ms,
        positions: cluster
          .contributing_tracks
          .iter()
          .map(|&id| (id, cluster_pos))
          .collect(),
      });
    }
    Ok(())
  }

  fn write_cues(&mut self) -> Result<()> {
    let mut b = EbmlBuilder::new();
    b.master(ids::CUES, |cues| {
      for point in &self.cues {
        cues.master(ids::CUE_POINT, |cue| {
          cue.uint(ids::CUE_TIME, point.time_ms.max(0) as u64);
          for &(track_id, position) in &point.positions {
            cue.master(ids::CUE_TRACK_POSITIONS, |pos| {
              pos.uint(ids::CUE_TRACK, u64::from(track_id));
              pos.uint(ids::CUE_CLUSTER_POSITION, position);
            });
          }
        });
      }
    });
    self.writer.write(&b.into_bytes())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::io::BufferWriter;
  use crate::packet::PacketType;

  fn packet(timestamp: f64, duration: f64, key: bool, payload: &[u8]) -> EncodedPacket {
    EncodedPacket::new(
      Bytes::copy_from_slice(payload),
      if key { PacketType::Key } else { PacketType::Delta },
      timestamp,
      duration,
      0,
    )
  }

  /// Scan for an EBML id pattern, returning byte positions
  fn find_all(haystack: &[u8], id: u32) -> Vec<usize> {
    let mut pattern = Vec::new();
    write_id(&mut pattern, id);
    haystack
      .windows(pattern.len())
      .enumerate()
      .filter(|(_, w)| *w == pattern.as_slice())
      .map(|(i, _)| i)
      .collect()
  }

  fn mux_webm_3s() -> Vec<u8> {
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
    for i in 0..90 {
      let t = i as f64 / 30.0;
      muxer
        .add_packet(video, &packet(t, 1.0 / 30.0, i % 30 == 0, &[0x11; 40]))
        .unwrap();
      muxer
        .add_packet(audio, &packet(t, 1.0 / 30.0, true, &[0x22; 12]))
        .unwrap();
    }
    muxer.finalize().unwrap();
    muxer.into_writer().into_bytes().to_vec()
  }

  #[test]
  fn test_webm_doc_type_and_structure() {
    let bytes = mux_webm_3s();
    assert!(bytes.windows(4).any(|w| w == b"webm"));
    assert!(!find_all(&bytes, ids::SEEK_HEAD).is_empty());
    assert!(!find_all(&bytes, ids::INFO).is_empty());
    assert!(!find_all(&bytes, ids::TRACKS).is_empty());
    assert!(!find_all(&bytes, ids::CUES).is_empty());
  }

  #[test]
  fn test_clusters_cut_on_second_boundaries() {
    let bytes = mux_webm_3s();
    let clusters = find_all(&bytes, ids::CLUSTER);
    // 3 s of content with keys at 0/1/2 s: three clusters
    assert_eq!(clusters.len(), 3);
  }

  #[test]
  fn test_duration_backpatched() {
    let bytes = mux_webm_3s();
    // Find the Duration element and decode its float payload
    let duration_positions = find_all(&bytes, ids::DURATION);
    let pos = duration_positions[0];
    assert_eq!(bytes[pos + 2], 0x88); // 8-byte float
    let value = f64::from_be_bytes(bytes[pos + 3..pos + 11].try_into().unwrap());
    assert!((value - 3000.0).abs() < 40.0, "duration {value} ms");
  }

  #[test]
  fn test_cue_points_reference_both_tracks() {
    let bytes = mux_webm_3s();
    let cue_points = find_all(&bytes, ids::CUE_POINT);
    assert_eq!(cue_points.len(), 3);
    // Each CuePoint carries CueTrackPositions for both tracks
    let positions = find_all(&bytes, ids::CUE_TRACK_POSITIONS);
    assert_eq!(positions.len(), 6);
  }

  #[test]
  fn test_segment_size_is_patched() {
    let bytes = mux_webm_3s();
    let segment_pos = find_all(&bytes, ids::SEGMENT)[0];
    let size_pos = segment_pos + 4;
    // 8-byte vint, not the unknown-size marker
    assert_eq!(bytes[size_pos], 0x01);
    assert_ne!(&bytes[size_pos..size_pos + 8], &UNKNOWN_SIZE);
    let mut size = 0u64;
    for &b in &bytes[size_pos + 1..size_pos + 8] {
      size = size << 8 | u64::from(b);
    }
    assert_eq!(size_pos as u64 + 8 + size, bytes.len() as u64);
  }

  #[test]
  fn test_streaming_mode_keeps_unknown_sizes() {
    let mut muxer = MatroskaMuxer::new(
      BufferWriter::new(),
      MatroskaMuxerOptions {
        variant: MatroskaVariant::Matroska,
        streaming: true,
      },
    );
    let video = muxer
      .add_video_track(VideoTrackConfig::new(VideoCodec::Avc, 640, 480))
      .unwrap();
    muxer.add_packet(video, &packet(0.0, 0.0, true, &[1, 2, 3])).unwrap();
    muxer.finalize().unwrap();
    let bytes = muxer.into_writer().into_bytes().to_vec();

    let segment_pos = find_all(&bytes, ids::SEGMENT)[0];
    assert_eq!(&bytes[segment_pos + 4..segment_pos + 12], &UNKNOWN_SIZE);
    assert!(find_all(&bytes, ids::CUES).is_empty());
    assert!(find_all(&bytes, ids::SEEK_HEAD).is_empty());
  }

  #[test]
  fn test_zero_duration_packet_uses_simple_block() {
    let mut muxer = MatroskaMuxer::new(BufferWriter::new(), MatroskaMuxerOptions::default());
    let video = muxer
      .add_video_track(VideoTrackConfig::new(VideoCodec::Avc, 640, 480))
      .unwrap();
    muxer.add_packet(video, &packet(0.0, 0.0, true, &[9, 9])).unwrap();
    muxer.finalize().unwrap();
    let bytes = muxer.into_writer().into_bytes().to_vec();
    // SimpleBlock prelude: track 1 vint, relative 0, keyframe flag
    assert!(bytes
      .windows(6)
      .any(|w| w == [0xA3, 0x86, 0x81, 0x00, 0x00, 0x80]));
  }

  #[test]
  fn test_cluster_too_long_without_keys() {
    let mut muxer = MatroskaMuxer::new(BufferWriter::new(), MatroskaMuxerOptions::default());
    let video = muxer
      .add_video_track(VideoTrackConfig::new(VideoCodec::Avc, 640, 480))
      .unwrap();
    // One key then delta packets spanning past 2^15 ms
    muxer.add_packet(video, &packet(0.0, 1.0, true, &[1])).unwrap();
    for i in 1..35 {
      let result = muxer.add_packet(video, &packet(i as f64, 1.0, false, &[1]));
      if i >= 33 {
        assert!(matches!(result, Err(Error::ClusterTooLong { .. })), "at {i}");
        return;
      }
      result.unwrap();
    }
    panic!("expected ClusterTooLong");
  }

  #[test]
  fn test_webm_rejects_foreign_codecs() {
    let mut muxer = MatroskaMuxer::new(
      BufferWriter::new(),
      MatroskaMuxerOptions {
        variant: MatroskaVariant::Webm,
        streaming: false,
      },
    );
    assert!(matches!(
      muxer.add_video_track(VideoTrackConfig::new(VideoCodec::Avc, 640, 480)),
      Err(Error::UnsupportedFeature(_))
    ));
    assert!(matches!(
      muxer.add_audio_track(AudioTrackConfig::new(AudioCodec::Aac, 48_000, 2)),
      Err(Error::UnsupportedFeature(_))
    ));
  }

  #[test]
  fn test_double_finalize_fails() {
    let mut muxer = MatroskaMuxer::new(BufferWriter::new(), MatroskaMuxerOptions::default());
    muxer
      .add_video_track(VideoTrackConfig::new(VideoCodec::Avc, 640, 480))
      .unwrap();
    muxer.finalize().unwrap();
    assert!(matches!(
      muxer.finalize(),
      Err(Error::StateViolation("finalize called twice"))
    ));
  }
}
