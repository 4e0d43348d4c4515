//! ISO-BMFF muxer
//!
//! Four layout modes: progressive (`mdat` first, `moov` last), in-memory
//! faststart (`moov` before `mdat`, everything buffered), reserved faststart
//! (an upper-bound `moov` hole after `ftyp`, backpatched at finalize), and
//! fragmented (`moov`+`mvex`, then `moof`/`mdat` pairs, `mfra` trailer).
//!
//! Timestamps are stored internally in seconds; conversion to the track
//! timescale happens only at write time.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::codecs::AudioCodec;
use crate::error::{Error, Result};
use crate::io::Writer;
use crate::mux::isobmff::boxes::{
  audio_sample_description, box_header, free_atom, ftyp, video_sample_description, write_matrix,
  BoxBuilder, GLOBAL_TIMESCALE, MP4_EPOCH_OFFSET,
};
use crate::mux::{
  to_timescale, MuxerState, SampleEntry, TimestampAdmitter, CHUNK_DURATION, FRAGMENT_DURATION,
};
use crate::packet::EncodedPacket;
use crate::track::{AudioTrackConfig, Rotation, VideoTrackConfig};

/// Timescale used for video tracks; divisible by all common frame rates
const VIDEO_TIMESCALE: u32 = 57_600;

/// Sample flag words used in `trex`/`tfhd`/`trun`
const SAMPLE_FLAGS_KEY: u32 = 0x0200_0000;
const SAMPLE_FLAGS_DELTA: u32 = 0x0101_0000;

/// File layout mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mp4LayoutMode {
  /// `ftyp`, a single growing `mdat`, then `moov` at the end
  Progressive,
  /// Buffer all samples, then write `ftyp`, `moov`, `mdat` in that order
  FastStartInMemory,
  /// Reserve an upper-bound hole for `moov` after `ftyp`, write `mdat`
  /// inline, backpatch `moov` and pad the unused hole with `free`
  FastStartReserved {
    expected_video_chunks: u32,
    expected_audio_chunks: u32,
  },
  /// `ftyp`, initial `moov` with `mvex`, repeated `moof`+`mdat`, `mfra`
  Fragmented,
}

/// MP4 muxer options
#[derive(Debug, Clone)]
pub struct Mp4MuxerOptions {
  pub layout: Mp4LayoutMode,
  /// Creation time in seconds since the 1904 epoch. Seed for byte-identical
  /// output; defaults to the current wall clock.
  pub creation_time: Option<u64>,
}

impl Default for Mp4MuxerOptions {
  fn default() -> Self {
    Self {
      layout: Mp4LayoutMode::Progressive,
      creation_time: None,
    }
  }
}

enum TrackKind {
  Video(VideoTrackConfig),
  Audio(AudioTrackConfig),
}

struct CurrentChunk {
  start_timestamp: f64,
  samples: Vec<SampleEntry>,
}

struct Mp4Track {
  id: u32,
  kind: TrackKind,
  timescale: u32,
  admitter: TimestampAdmitter,

  // Compact timing tables, updated as samples are admitted
  stts: Vec<(u32, u32)>,
  ctts: Vec<(u32, i32)>,
  stss: Vec<u32>,
  stsc: Vec<(u32, u32)>,
  stsz: Vec<u32>,
  sample_count: u32,
  all_samples_are_key: bool,
  has_composition_offsets: bool,

  // The most recent sample's decode tick and duration, pending its delta fix
  last_timing: Option<(i64, u32)>,

  current_chunk: Option<CurrentChunk>,
  chunk_offsets: Vec<u64>,
  end_timestamp: f64,

  // Fragmented mode
  queue: VecDeque<SampleEntry>,
  fragment_samples: Vec<SampleEntry>,
  tfra: Vec<(u64, u64)>,
}

impl Mp4Track {
  fn new(id: u32, kind: TrackKind, timescale: u32) -> Self {
    Self {
      id,
      kind,
      timescale,
      admitter: TimestampAdmitter::default(),
      stts: Vec::new(),
      ctts: Vec::new(),
      stss: Vec::new(),
      stsc: Vec::new(),
      stsz: Vec::new(),
      sample_count: 0,
      all_samples_are_key: true,
      has_composition_offsets: false,
      last_timing: None,
      current_chunk: None,
      chunk_offsets: Vec::new(),
      end_timestamp: 0.0,
      queue: VecDeque::new(),
      fragment_samples: Vec::new(),
      tfra: Vec::new(),
    }
  }

  fn is_video(&self) -> bool {
    matches!(self.kind, TrackKind::Video(_))
  }

  fn push_stts_delta(&mut self, delta: u32) {
    match self.stts.last_mut() {
      Some((count, d)) if *d == delta => *count += 1,
      _ => self.stts.push((1, delta)),
    }
  }

  fn push_ctts_offset(&mut self, offset: i32) {
    if offset != 0 {
      self.has_composition_offsets = true;
    }
    match self.ctts.last_mut() {
      Some((count, o)) if *o == offset => *count += 1,
      _ => self.ctts.push((1, offset)),
    }
  }

  /// Record a newly admitted sample in the timing tables. The previous
  /// sample's delta becomes known now; the new sample's own duration serves
  /// as the fallback delta until its successor arrives.
  fn record_sample_timing(&mut self, sample: &SampleEntry) {
    let dts_ticks = to_timescale(sample.decode_timestamp, self.timescale);
    let pts_ticks = to_timescale(sample.presentation_timestamp, self.timescale);
    let duration_ticks = to_timescale(sample.duration, self.timescale).max(0) as u32;

    if let Some((prev_dts, _)) = self.last_timing.take() {
      let delta = (dts_ticks - prev_dts).max(0) as u32;
      self.push_stts_delta(delta);
    }
    self.last_timing = Some((dts_ticks, duration_ticks));

    self.sample_count += 1;
    self.stsz.push(sample.size as u32);
    self.push_ctts_offset((pts_ticks - dts_ticks) as i32);
    if sample.packet_type.is_key() {
      self.stss.push(self.sample_count);
    } else {
      self.all_samples_are_key = false;
    }
    self.end_timestamp = self
      .end_timestamp
      .max(sample.presentation_timestamp + sample.duration);
  }

  /// Close the timing tables with the final sample's own duration
  fn finish_timing(&mut self) {
    if let Some((_, duration)) = self.last_timing.take() {
      self.push_stts_delta(duration);
    }
  }

  fn record_chunk(&mut self, offset: u64, samples_in_chunk: u32) {
    self.chunk_offsets.push(offset);
    let chunk_index = self.chunk_offsets.len() as u32;
    match self.stsc.last() {
      Some((_, spc)) if *spc == samples_in_chunk => {}
      _ => self.stsc.push((chunk_index, samples_in_chunk)),
    }
  }

  /// Whether `ctts` is emitted: any non-zero offset, or more than one
  /// distinct run
  fn needs_ctts(&self) -> bool {
    self.has_composition_offsets || self.ctts.len() > 1
  }

  fn duration_ticks(&self, timescale: u32) -> u64 {
    to_timescale(self.end_timestamp, timescale).max(0) as u64
  }
}

/// ISO-BMFF muxer over any [`Writer`]
pub struct Mp4Muxer<W: Writer> {
  writer: W,
  options: Mp4MuxerOptions,
  state: MuxerState,
  tracks: Vec<Mp4Track>,
  creation_time: u64,

  started: bool,
  mdat_header_pos: u64,
  mdat_data_start: u64,
  moov_hole: Option<(u64, u64)>,
  /// In-memory mode: chunk payloads in finalize order, `(track_index, data)`
  buffered_chunks: Vec<(usize, Vec<Bytes>)>,
  fragment_sequence: u32,
  fragment_start: Option<f64>,
}

impl<W: Writer> Mp4Muxer<W> {
  pub fn new(writer: W, options: Mp4MuxerOptions) -> Self {
    let creation_time = options.creation_time.unwrap_or_else(|| {
      std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() + MP4_EPOCH_OFFSET)
        .unwrap_or(MP4_EPOCH_OFFSET)
    });
    Self {
      writer,
      options,
      state: MuxerState::ConfiguringTracks,
      tracks: Vec::new(),
      creation_time,
      started: false,
      mdat_header_pos: 0,
      mdat_data_start: 0,
      moov_hole: None,
      buffered_chunks: Vec::new(),
      fragment_sequence: 1,
      fragment_start: None,
    }
  }

  pub fn state(&self) -> MuxerState {
    self.state
  }

  /// Consume the muxer and hand back the writer (to retrieve buffered bytes)
  pub fn into_writer(self) -> W {
    self.writer
  }

  /// Add a video track. Must happen before the first packet.
  pub fn add_video_track(&mut self, config: VideoTrackConfig) -> Result<u32> {
    if self.state != MuxerState::ConfiguringTracks {
      return Err(Error::StateViolation("cannot add track after muxing started"));
    }
    let id = self.tracks.len() as u32 + 1;
    self
      .tracks
      .push(Mp4Track::new(id, TrackKind::Video(config), VIDEO_TIMESCALE));
    Ok(id)
  }

  /// Add an audio track. Must happen before the first packet.
  pub fn add_audio_track(&mut self, config: AudioTrackConfig) -> Result<u32> {
    if self.state != MuxerState::ConfiguringTracks {
      return Err(Error::StateViolation("cannot add track after muxing started"));
    }
    match config.codec {
      AudioCodec::Aac | AudioCodec::Opus | AudioCodec::Mp3 => {}
      other => {
        return Err(Error::unsupported(format!(
          "audio codec {other} is not supported in ISO-BMFF output"
        )))
      }
    }
    let id = self.tracks.len() as u32 + 1;
    let timescale = config.sample_rate;
    self
      .tracks
      .push(Mp4Track::new(id, TrackKind::Audio(config), timescale));
    Ok(id)
  }

  /// Add an encoded packet to a track. Packets arrive in decode order per
  /// track; decode-timestamp regressions fail with
  /// [`Error::UnorderedTimestamp`].
  pub fn add_packet(&mut self, track_id: u32, packet: &EncodedPacket) -> Result<()> {
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

    let sample = SampleEntry {
      presentation_timestamp: pts,
      decode_timestamp: dts,
      duration: packet.duration,
      data: Some(packet.data.clone()),
      size: packet.data.len(),
      packet_type: packet.packet_type,
      timescale_units_to_next_sample: None,
    };

    if self.options.layout == Mp4LayoutMode::Fragmented {
      self.tracks[track_index].queue.push_back(sample);
      self.interleave_fragments(false)?;
    } else {
      self.tracks[track_index].record_sample_timing(&sample);
      self.add_sample_to_chunk(track_index, sample)?;
    }
    Ok(())
  }

  /// Pass a flush down to the writer (streaming targets)
  pub fn flush(&mut self) -> Result<()> {
    self.writer.flush()
  }

  /// Write the index, seal the container, finalize the writer.
  /// A second call fails with [`Error::StateViolation`].
  pub fn finalize(&mut self) -> Result<()> {
    if self.state == MuxerState::Finalized {
      return Err(Error::StateViolation("finalize called twice"));
    }
    self.ensure_started()?;
    self.state = MuxerState::Finalized;

    if self.options.layout == Mp4LayoutMode::Fragmented {
      self.interleave_fragments(true)?;
      self.flush_fragment()?;
      self.write_mfra()?;
      self.writer.finalize()?;
      return Ok(());
    }

    // Flush per-track trailing chunks
    for i in 0..self.tracks.len() {
      self.finalize_current_chunk(i)?;
    }
    for track in &mut self.tracks {
      track.finish_timing();
    }

    match self.options.layout {
      Mp4LayoutMode::Progressive => {
        self.patch_mdat_header()?;
        let moov = self.build_moov();
        self.writer.write(&moov)?;
      }
      Mp4LayoutMode::FastStartInMemory => {
        self.write_in_memory_layout()?;
      }
      Mp4LayoutMode::FastStartReserved { .. } => {
        self.patch_mdat_header()?;
        let end = self.writer.pos();
        let moov = self.build_moov();
        let (hole_pos, hole_size) = self.moov_hole.expect("reserved layout without hole");
        let moov_len = moov.len() as u64;
        if moov_len == hole_size || moov_len + 8 <= hole_size {
          self.writer.seek(hole_pos);
          self.writer.write(&moov)?;
          if moov_len < hole_size {
            self.writer.write(&free_atom(hole_size - moov_len))?;
          }
          self.writer.seek(end);
        } else {
          tracing::warn!(
            target: "mediamux::mux",
            reserved = hole_size,
            needed = moov_len,
            "reserved moov hole too small, falling back to trailing moov"
          );
          self.writer.seek(end);
          self.writer.write(&moov)?;
        }
      }
      Mp4LayoutMode::Fragmented => unreachable!(),
    }

    self.writer.finalize()
  }

  // ==========================================================================
  // Layout plumbing
  // ==========================================================================

  fn ensure_started(&mut self) -> Result<()> {
    if self.started {
      return Ok(());
    }
    if self.tracks.is_empty() {
      return Err(Error::StateViolation("no tracks added"));
    }
    self.started = true;

    match self.options.layout {
      Mp4LayoutMode::FastStartInMemory => {}
      Mp4LayoutMode::Progressive => {
        self.writer.write(&ftyp(false))?;
        self.reserve_mdat_header()?;
      }
      Mp4LayoutMode::FastStartReserved {
        expected_video_chunks,
        expected_audio_chunks,
      } => {
        self.writer.write(&ftyp(false))?;
        let hole = self.estimate_moov_size(expected_video_chunks, expected_audio_chunks);
        let pos = self.writer.pos();
        self.writer.write(&free_atom(hole))?;
        self.moov_hole = Some((pos, hole));
        self.reserve_mdat_header()?;
      }
      Mp4LayoutMode::Fragmented => {
        self.writer.write(&ftyp(true))?;
        let moov = self.build_moov();
        self.writer.write(&moov)?;
      }
    }
    Ok(())
  }

  fn reserve_mdat_header(&mut self) -> Result<()> {
    self.mdat_header_pos = self.writer.pos();
    // 16 bytes: either free(8) + mdat(8), or one large-size mdat header
    self.writer.write(&[0u8; 16])?;
    self.mdat_data_start = self.writer.pos();
    Ok(())
  }

  fn patch_mdat_header(&mut self) -> Result<()> {
    let end = self.writer.pos();
    let content = end - self.mdat_data_start;
    self.writer.seek(self.mdat_header_pos);
    if content + 8 <= u64::from(u32::MAX) {
      self.writer.write(&free_atom(8))?;
      self.writer.write(&box_header(b"mdat", content))?;
    } else {
      // box_header promotes to the 16-byte large-size form here
      self.writer.write(&box_header(b"mdat", content))?;
    }
    self.writer.seek(end);
    Ok(())
  }

  /// Upper bound for the reserved `moov` hole given declared chunk counts
  fn estimate_moov_size(&self, expected_video_chunks: u32, expected_audio_chunks: u32) -> u64 {
    let mut size: u64 = 1024;
    for track in &self.tracks {
      let expected = u64::from(if track.is_video() {
        expected_video_chunks
      } else {
        expected_audio_chunks
      });
      let config_len = match &track.kind {
        TrackKind::Video(c) => c.description.as_ref().map_or(16, |d| d.len()) as u64,
        TrackKind::Audio(c) => c.description.as_ref().map_or(16, |d| d.len()) as u64,
      };
      // Per chunk: stts run, ctts run, stsc entry, co64 entry, stss entry,
      // plus generous per-sample stsz at up to 256 samples per chunk
      size += 1024 + config_len + expected * (16 + 16 + 12 + 8 + 8 + 256 * 4);
    }
    size
  }

  // ==========================================================================
  // Chunking (progressive / faststart)
  // ==========================================================================

  fn add_sample_to_chunk(&mut self, track_index: usize, sample: SampleEntry) -> Result<()> {
    let start_new = match &self.tracks[track_index].current_chunk {
      None => true,
      Some(chunk) => sample.presentation_timestamp - chunk.start_timestamp >= CHUNK_DURATION,
    };
    if start_new {
      self.finalize_current_chunk(track_index)?;
      self.tracks[track_index].current_chunk = Some(CurrentChunk {
        start_timestamp: sample.presentation_timestamp,
        samples: Vec::new(),
      });
    }
    self.tracks[track_index]
      .current_chunk
      .as_mut()
      .expect("chunk just ensured")
      .samples
      .push(sample);
    Ok(())
  }

  fn finalize_current_chunk(&mut self, track_index: usize) -> Result<()> {
    let Some(mut chunk) = self.tracks[track_index].current_chunk.take() else {
      return Ok(());
    };
    let samples_in_chunk = chunk.samples.len() as u32;

    if let Mp4LayoutMode::FastStartReserved {
      expected_video_chunks,
      expected_audio_chunks,
    } = self.options.layout
    {
      let track = &self.tracks[track_index];
      let expected = if track.is_video() {
        expected_video_chunks
      } else {
        expected_audio_chunks
      };
      if track.chunk_offsets.len() as u32 >= expected {
        return Err(Error::TrackLimitExceeded {
          track_id: track.id,
          expected,
        });
      }
    }

    if self.options.layout == Mp4LayoutMode::FastStartInMemory {
      // Defer writing; offset is computed during final layout
      let data: Vec<Bytes> = chunk
        .samples
        .iter_mut()
        .filter_map(|s| s.data.take())
        .collect();
      self.tracks[track_index].record_chunk(0, samples_in_chunk);
      self.buffered_chunks.push((track_index, data));
    } else {
      let offset = self.writer.pos();
      for sample in &mut chunk.samples {
        if let Some(data) = sample.data.take() {
          self.writer.write(&data)?;
        }
      }
      self.tracks[track_index].record_chunk(offset, samples_in_chunk);
    }
    Ok(())
  }

  fn write_in_memory_layout(&mut self) -> Result<()> {
    let ftyp_bytes = ftyp(false);
    let mdat_content: u64 = self
      .buffered_chunks
      .iter()
      .flat_map(|(_, data)| data.iter())
      .map(|d| d.len() as u64)
      .sum();
    let mdat_header_len = box_header(b"mdat", mdat_content).len() as u64;

    // moov size depends on stco vs co64, which depends on offsets, which
    // depend on moov size; iterate until stable
    for _ in 0..3 {
      let moov = self.build_moov();
      let base = ftyp_bytes.len() as u64 + moov.len() as u64 + mdat_header_len;
      let mut running = base;
      let mut offsets_per_track: Vec<Vec<u64>> = vec![Vec::new(); self.tracks.len()];
      for (track_index, data) in &self.buffered_chunks {
        offsets_per_track[*track_index].push(running);
        running += data.iter().map(|d| d.len() as u64).sum::<u64>();
      }
      let mut stable = true;
      for (track, offsets) in self.tracks.iter_mut().zip(offsets_per_track) {
        if track.chunk_offsets != offsets {
          stable = false;
          track.chunk_offsets = offsets;
        }
      }
      if stable {
        break;
      }
    }

    let moov = self.build_moov();
    self.writer.write(&ftyp_bytes)?;
    self.writer.write(&moov)?;
    self.writer.write(&box_header(b"mdat", mdat_content))?;
    for (_, data) in &self.buffered_chunks {
      for piece in data {
        self.writer.write(piece)?;
      }
    }
    self.buffered_chunks.clear();
    Ok(())
  }

  // ==========================================================================
  // Fragmented mode
  // ==========================================================================

  /// Drain queued samples in cross-track decode order. Tracks queue until
  /// every track has a sample; the track with the smallest decode timestamp
  /// is drained one sample at a time until a queue empties.
  fn interleave_fragments(&mut self, force: bool) -> Result<()> {
    loop {
      let all_have = self.tracks.iter().all(|t| !t.queue.is_empty());

      // A fragment is cut when its duration passed the threshold and every
      // track has a key packet queued
      if all_have && self.fragment_start.is_some() {
        let all_keys = self
          .tracks
          .iter()
          .all(|t| t.queue.front().is_some_and(|s| s.packet_type.is_key()));
        let min_next = self
          .tracks
          .iter()
          .filter_map(|t| t.queue.front().map(|s| s.decode_timestamp))
          .fold(f64::INFINITY, f64::min);
        if all_keys && min_next - self.fragment_start.unwrap_or(0.0) >= FRAGMENT_DURATION {
          self.flush_fragment()?;
        }
      }

      let candidate = if all_have || force {
        self
          .tracks
          .iter()
          .enumerate()
          .filter(|(_, t)| !t.queue.is_empty())
          .min_by(|(_, a), (_, b)| {
            let a = a.queue.front().map(|s| s.decode_timestamp).unwrap_or(0.0);
            let b = b.queue.front().map(|s| s.decode_timestamp).unwrap_or(0.0);
            a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
          })
          .map(|(i, _)| i)
      } else {
        None
      };

      let Some(track_index) = candidate else {
        return Ok(());
      };
      let sample = self.tracks[track_index]
        .queue
        .pop_front()
        .expect("candidate track has a queued sample");
      if self.fragment_start.is_none() {
        self.fragment_start = Some(sample.decode_timestamp);
      }
      self.tracks[track_index].fragment_samples.push(sample);
    }
  }

  /// Write the accumulated fragment as `moof` + `mdat`
  fn flush_fragment(&mut self) -> Result<()> {
    if self.tracks.iter().all(|t| t.fragment_samples.is_empty()) {
      self.fragment_start = None;
      return Ok(());
    }

    let moof_offset = self.writer.pos();

    // Fix the retroactive delta-to-next on every fragment sample; the last
    // sample of a run falls back to its own duration at write time
    for track in &mut self.tracks {
      let timescale = track.timescale;
      for i in 0..track.fragment_samples.len() {
        let next_dts = track
          .fragment_samples
          .get(i + 1)
          .map(|next| to_timescale(next.decode_timestamp, timescale));
        let sample = &mut track.fragment_samples[i];
        if let Some(next_dts) = next_dts {
          let dts = to_timescale(sample.decode_timestamp, timescale);
          sample.timescale_units_to_next_sample = Some((next_dts - dts).max(0) as u32);
        }
      }
    }

    // First pass with zero data offsets measures the moof size
    let probe = self.build_moof_with_offsets(&vec![0i32; self.tracks.len()]);
    let moof_len = probe.len() as u64;

    // Per-track data runs land back to back inside mdat, in track order
    let mut run_offset = moof_len + 8;
    let mut data_offsets: Vec<i32> = Vec::with_capacity(self.tracks.len());
    let mut mdat_content: u64 = 0;
    for track in &self.tracks {
      data_offsets.push(run_offset as i32);
      let run: u64 = track.fragment_samples.iter().map(|s| s.size as u64).sum();
      run_offset += run;
      mdat_content += run;
    }

    let moof = self.build_moof_with_offsets(&data_offsets);
    debug_assert_eq!(moof.len() as u64, moof_len);
    self.writer.write(&moof)?;
    self.writer.write(&box_header(b"mdat", mdat_content))?;
    for track in &mut self.tracks {
      for sample in &mut track.fragment_samples {
        if let Some(data) = sample.data.take() {
          self.writer.write(&data)?;
        }
      }
    }

    // Book-keeping: mfra entries, duration, table-free sample accounting
    for track in &mut self.tracks {
      if let Some(first) = track.fragment_samples.first() {
        let time = to_timescale(first.presentation_timestamp, track.timescale).max(0) as u64;
        track.tfra.push((time, moof_offset));
      }
      for sample in &track.fragment_samples {
        track.sample_count += 1;
        track.end_timestamp = track
          .end_timestamp
          .max(sample.presentation_timestamp + sample.duration);
      }
      track.fragment_samples.clear();
    }

    self.fragment_sequence += 1;
    self.fragment_start = None;
    Ok(())
  }

  fn build_moof_with_offsets(&self, data_offsets: &[i32]) -> Vec<u8> {
    let mut b = BoxBuilder::new();
    b.begin(b"moof");

    b.begin_full(b"mfhd", 0, 0);
    b.u32(self.fragment_sequence);
    b.end();

    for (track, &data_offset) in self.tracks.iter().zip(data_offsets) {
      if track.fragment_samples.is_empty() {
        continue;
      }
      let first = &track.fragment_samples[0];
      let default_flags = if first.packet_type.is_key() {
        SAMPLE_FLAGS_KEY
      } else {
        SAMPLE_FLAGS_DELTA
      };

      b.begin(b"traf");

      // default-base-is-moof + default duration/size/flags
      b.begin_full(b"tfhd", 0, 0x020038);
      b.u32(track.id);
      b.u32(to_timescale(first.duration, track.timescale).max(0) as u32);
      b.u32(first.size as u32);
      b.u32(default_flags);
      b.end();

      b.begin_full(b"tfdt", 1, 0);
      b.u64(to_timescale(first.decode_timestamp, track.timescale).max(0) as u64);
      b.end();

      let any_cts = track
        .fragment_samples
        .iter()
        .any(|s| s.presentation_timestamp != s.decode_timestamp);
      let trun_flags = 0x000001 | 0x000100 | 0x000200 | 0x000400 | if any_cts { 0x000800 } else { 0 };
      b.begin_full(b"trun", 1, trun_flags);
      b.u32(track.fragment_samples.len() as u32);
      b.i32(data_offset);
      for sample in &track.fragment_samples {
        let dts = to_timescale(sample.decode_timestamp, track.timescale);
        let duration = sample
          .timescale_units_to_next_sample
          .unwrap_or_else(|| to_timescale(sample.duration, track.timescale).max(0) as u32);
        b.u32(duration);
        b.u32(sample.size as u32);
        b.u32(if sample.packet_type.is_key() {
          SAMPLE_FLAGS_KEY
        } else {
          SAMPLE_FLAGS_DELTA
        });
        if any_cts {
          let pts = to_timescale(sample.presentation_timestamp, track.timescale);
          b.i32((pts - dts) as i32);
        }
      }
      b.end();

      b.end();
    }

    b.end();
    b.into_bytes()
  }

  fn write_mfra(&mut self) -> Result<()> {
    let mut b = BoxBuilder::new();
    b.begin(b"mfra");
    for track in &self.tracks {
      b.begin_full(b"tfra", 1, 0);
      b.u32(track.id);
      b.u32(0); // 1-byte traf/trun/sample number fields
      b.u32(track.tfra.len() as u32);
      for &(time, moof_offset) in &track.tfra {
        b.u64(time);
        b.u64(moof_offset);
        b.u8(1);
        b.u8(1);
        b.u8(1);
      }
      b.end();
    }
    // mfro closes the file; its size field equals the whole mfra box
    let mfra_size = (b.len() + 16) as u32;
    b.begin_full(b"mfro", 0, 0);
    b.u32(mfra_size);
    b.end();
    b.end();
    let bytes = b.into_bytes();
    debug_assert_eq!(bytes.len() as u32, mfra_size);
    self.writer.write(&bytes)
  }

  // ==========================================================================
  // moov
  // ==========================================================================

  fn build_moov(&self) -> Vec<u8> {
    let fragmented = self.options.layout == Mp4LayoutMode::Fragmented;
    let movie_duration: u64 = if fragmented {
      0
    } else {
      self
        .tracks
        .iter()
        .map(|t| t.duration_ticks(GLOBAL_TIMESCALE))
        .max()
        .unwrap_or(0)
    };

    let mut b = BoxBuilder::new();
    b.begin(b"moov");

    b.begin_full(b"mvhd", 0, 0);
    b.u32(self.creation_time as u32);
    b.u32(self.creation_time as u32);
    b.u32(GLOBAL_TIMESCALE);
    b.u32(movie_duration as u32);
    b.fixed_16_16(1.0); // rate
    b.fixed_8_8(1.0); // volume
    b.zeros(10);
    write_matrix(&mut b, Rotation::None, 0, 0);
    b.zeros(24); // pre_defined
    b.u32(self.tracks.len() as u32 + 1); // next_track_ID
    b.end();

    for track in &self.tracks {
      self.build_trak(&mut b, track, fragmented, movie_duration);
    }

    if fragmented {
      b.begin(b"mvex");
      for track in &self.tracks {
        b.begin_full(b"trex", 0, 0);
        b.u32(track.id);
        b.u32(1); // default_sample_description_index
        b.u32(0); // default_sample_duration
        b.u32(0); // default_sample_size
        b.u32(0); // default_sample_flags
        b.end();
      }
      b.end();
    }

    b.end();
    b.into_bytes()
  }

  fn build_trak(&self, b: &mut BoxBuilder, track: &Mp4Track, fragmented: bool, movie_duration: u64) {
    b.begin(b"trak");

    // tkhd: enabled + in movie
    b.begin_full(b"tkhd", 0, 3);
    b.u32(self.creation_time as u32);
    b.u32(self.creation_time as u32);
    b.u32(track.id);
    b.u32(0); // reserved
    b.u32(if fragmented { 0 } else { movie_duration as u32 });
    b.zeros(8);
    b.u16(0); // layer
    b.u16(0); // alternate_group
    match &track.kind {
      TrackKind::Audio(_) => b.fixed_8_8(1.0),
      TrackKind::Video(_) => b.u16(0),
    }
    b.u16(0); // reserved
    match &track.kind {
      TrackKind::Video(c) => {
        write_matrix(b, c.rotation, c.width, c.height);
        b.fixed_16_16(f64::from(c.width));
        b.fixed_16_16(f64::from(c.height));
      }
      TrackKind::Audio(_) => {
        write_matrix(b, Rotation::None, 0, 0);
        b.u32(0);
        b.u32(0);
      }
    }
    b.end();

    b.begin(b"mdia");

    b.begin_full(b"mdhd", 0, 0);
    b.u32(self.creation_time as u32);
    b.u32(self.creation_time as u32);
    b.u32(track.timescale);
    b.u32(if fragmented {
      0
    } else {
      track.duration_ticks(track.timescale) as u32
    });
    b.u16(0x55C4); // language: und
    b.u16(0);
    b.end();

    b.begin_full(b"hdlr", 0, 0);
    b.u32(0); // pre_defined
    b.bytes(if track.is_video() { b"vide" } else { b"soun" });
    b.zeros(12);
    b.bytes(b"mediamux\0");
    b.end();

    b.begin(b"minf");
    match &track.kind {
      TrackKind::Video(_) => {
        b.begin_full(b"vmhd", 0, 1);
        b.zeros(8); // graphics mode + opcolor
        b.end();
      }
      TrackKind::Audio(_) => {
        b.begin_full(b"smhd", 0, 0);
        b.u32(0); // balance + reserved
        b.end();
      }
    }

    b.begin(b"dinf");
    b.begin_full(b"dref", 0, 0);
    b.u32(1);
    b.begin_full(b"url ", 0, 1); // data in same file
    b.end();
    b.end();
    b.end();

    self.build_stbl(b, track, fragmented);

    b.end(); // minf
    b.end(); // mdia
    b.end(); // trak
  }

  fn build_stbl(&self, b: &mut BoxBuilder, track: &Mp4Track, fragmented: bool) {
    b.begin(b"stbl");

    b.begin_full(b"stsd", 0, 0);
    b.u32(1);
    match &track.kind {
      TrackKind::Video(c) => b.bytes(&video_sample_description(
        c.codec,
        c.width,
        c.height,
        c.description.as_ref(),
      )),
      TrackKind::Audio(c) => b.bytes(&audio_sample_description(
        c.codec,
        c.number_of_channels,
        c.sample_rate,
        c.description.as_ref(),
      )),
    }
    b.end();

    if fragmented {
      // Empty tables; real samples live in fragments
      for fourcc in [b"stts", b"stsc"] {
        b.begin_full(fourcc, 0, 0);
        b.u32(0);
        b.end();
      }
      b.begin_full(b"stsz", 0, 0);
      b.u32(0);
      b.u32(0);
      b.end();
      b.begin_full(b"stco", 0, 0);
      b.u32(0);
      b.end();
      b.end();
      return;
    }

    b.begin_full(b"stts", 0, 0);
    b.u32(track.stts.len() as u32);
    for &(count, delta) in &track.stts {
      b.u32(count);
      b.u32(delta);
    }
    b.end();

    if !track.all_samples_are_key {
      b.begin_full(b"stss", 0, 0);
      b.u32(track.stss.len() as u32);
      for &sample in &track.stss {
        b.u32(sample);
      }
      b.end();
    }

    if track.needs_ctts() {
      b.begin_full(b"ctts", 1, 0);
      b.u32(track.ctts.len() as u32);
      for &(count, offset) in &track.ctts {
        b.u32(count);
        b.i32(offset);
      }
      b.end();
    }

    b.begin_full(b"stsc", 0, 0);
    b.u32(track.stsc.len() as u32);
    for &(first_chunk, spc) in &track.stsc {
      b.u32(first_chunk);
      b.u32(spc);
      b.u32(1); // sample_description_index
    }
    b.end();

    b.begin_full(b"stsz", 0, 0);
    b.u32(0); // per-sample sizes follow
    b.u32(track.stsz.len() as u32);
    for &size in &track.stsz {
      b.u32(size);
    }
    b.end();

    // stco upgrades to co64 exactly when the last chunk offset needs 64 bits
    let needs_co64 = track
      .chunk_offsets
      .last()
      .is_some_and(|&o| o >= u64::from(u32::MAX));
    if needs_co64 {
      b.begin_full(b"co64", 0, 0);
      b.u32(track.chunk_offsets.len() as u32);
      for &offset in &track.chunk_offsets {
        b.u64(offset);
      }
      b.end();
    } else {
      b.begin_full(b"stco", 0, 0);
      b.u32(track.chunk_offsets.len() as u32);
      for &offset in &track.chunk_offsets {
        b.u32(offset as u32);
      }
      b.end();
    }

    b.end(); // stbl
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::codecs::VideoCodec;
  use crate::io::BufferWriter;
  use crate::packet::PacketType;

  /// Walk a flat box sequence and return the content of the first box with
  /// the given fourcc
  fn find_box<'a>(mut data: &'a [u8], fourcc: &[u8; 4]) -> Option<&'a [u8]> {
    while data.len() >= 8 {
      let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
      let name = &data[4..8];
      let (header, total) = if size == 1 {
        let large = u64::from_be_bytes(data[8..16].try_into().unwrap()) as usize;
        (16, large)
      } else {
        (8, size)
      };
      if name == fourcc {
        return Some(&data[header..total]);
      }
      if total == 0 || total > data.len() {
        return None;
      }
      data = &data[total..];
    }
    None
  }

  fn find_box_path<'a>(data: &'a [u8], path: &[&[u8; 4]]) -> Option<&'a [u8]> {
    let mut current = data;
    for fourcc in path {
      current = find_box(current, fourcc)?;
    }
    Some(current)
  }

  fn video_packet(timestamp: f64, key: bool, payload: &[u8]) -> EncodedPacket {
    EncodedPacket::new(
      Bytes::copy_from_slice(payload),
      if key { PacketType::Key } else { PacketType::Delta },
      timestamp,
      1.0 / 30.0,
      0,
    )
  }

  fn mux_four_frames(layout: Mp4LayoutMode) -> Vec<u8> {
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
    for i in 0..4 {
      muxer
        .add_packet(track, &video_packet(i as f64 / 30.0, i == 0, &[i as u8; 100]))
        .unwrap();
    }
    muxer.finalize().unwrap();
    muxer.into_writer().into_bytes().to_vec()
  }

  #[test]
  fn test_progressive_single_track_tables() {
    let bytes = mux_four_frames(Mp4LayoutMode::Progressive);
    let moov = find_box(&bytes, b"moov").expect("moov present");
    let stbl = find_box_path(
      moov,
      &[b"trak", b"mdia", b"minf", b"stbl"],
    )
    .expect("stbl present");

    // stts: one run of 4 samples at timescale/30
    let stts = &find_box(stbl, b"stts").unwrap()[4..];
    assert_eq!(u32::from_be_bytes(stts[0..4].try_into().unwrap()), 1);
    assert_eq!(u32::from_be_bytes(stts[4..8].try_into().unwrap()), 4);
    assert_eq!(
      u32::from_be_bytes(stts[8..12].try_into().unwrap()),
      VIDEO_TIMESCALE / 30
    );

    // stss: exactly the first sample
    let stss = &find_box(stbl, b"stss").unwrap()[4..];
    assert_eq!(u32::from_be_bytes(stss[0..4].try_into().unwrap()), 1);
    assert_eq!(u32::from_be_bytes(stss[4..8].try_into().unwrap()), 1);

    // stsc: one entry, 4 samples per chunk
    let stsc = &find_box(stbl, b"stsc").unwrap()[4..];
    assert_eq!(u32::from_be_bytes(stsc[0..4].try_into().unwrap()), 1);
    assert_eq!(u32::from_be_bytes(stsc[4..8].try_into().unwrap()), 1);
    assert_eq!(u32::from_be_bytes(stsc[8..12].try_into().unwrap()), 4);

    // stco: one chunk
    let stco = &find_box(stbl, b"stco").unwrap()[4..];
    assert_eq!(u32::from_be_bytes(stco[0..4].try_into().unwrap()), 1);

    // No composition offsets for monotone timestamps
    assert!(find_box(stbl, b"ctts").is_none());

    // mdat content = payload bytes
    let mdat = find_box(&bytes, b"mdat").unwrap();
    assert_eq!(mdat.len(), 400);
  }

  #[test]
  fn test_in_memory_faststart_layout() {
    let bytes = mux_four_frames(Mp4LayoutMode::FastStartInMemory);
    // moov precedes mdat, and no free atom is produced
    let moov_pos = bytes.windows(4).position(|w| w == b"moov").unwrap();
    let mdat_pos = bytes.windows(4).position(|w| w == b"mdat").unwrap();
    assert!(moov_pos < mdat_pos);
    assert!(!bytes.windows(4).any(|w| w == b"free"));

    // Chunk offset points into mdat
    let moov = find_box(&bytes, b"moov").unwrap();
    let stbl = find_box_path(moov, &[b"trak", b"mdia", b"minf", b"stbl"]).unwrap();
    let stco = &find_box(stbl, b"stco").unwrap()[4..];
    let offset = u32::from_be_bytes(stco[4..8].try_into().unwrap()) as usize;
    assert_eq!(offset, mdat_pos + 4);
    assert_eq!(bytes[offset], 0); // first payload byte of frame 0
  }

  #[test]
  fn test_reserved_faststart_backpatches_hole() {
    let bytes = mux_four_frames(Mp4LayoutMode::FastStartReserved {
      expected_video_chunks: 4,
      expected_audio_chunks: 0,
    });
    let moov_pos = bytes.windows(4).position(|w| w == b"moov").unwrap();
    let mdat_pos = bytes.windows(4).position(|w| w == b"mdat").unwrap();
    assert!(moov_pos < mdat_pos);
    // The unused hole is padded with a free atom
    assert!(bytes.windows(4).any(|w| w == b"free"));
  }

  #[test]
  fn test_reserved_faststart_chunk_budget() {
    let mut muxer = Mp4Muxer::new(
      BufferWriter::new(),
      Mp4MuxerOptions {
        layout: Mp4LayoutMode::FastStartReserved {
          expected_video_chunks: 1,
          expected_audio_chunks: 0,
        },
        creation_time: Some(0),
      },
    );
    let track = muxer
      .add_video_track(VideoTrackConfig::new(VideoCodec::Avc, 640, 480))
      .unwrap();
    // Two chunks needed (timestamps 0 and 0.6), only one declared
    muxer.add_packet(track, &video_packet(0.0, true, &[1])).unwrap();
    muxer.add_packet(track, &video_packet(0.6, false, &[2])).unwrap();
    assert!(matches!(
      muxer.finalize(),
      Err(Error::TrackLimitExceeded {
        track_id: 1,
        expected: 1
      })
    ));
  }

  #[test]
  fn test_fragmented_layout() {
    let mut muxer = Mp4Muxer::new(
      BufferWriter::new(),
      Mp4MuxerOptions {
        layout: Mp4LayoutMode::Fragmented,
        creation_time: Some(0),
      },
    );
    let video = muxer
      .add_video_track(VideoTrackConfig::new(VideoCodec::Avc, 1280, 720))
      .unwrap();
    let audio = muxer
      .add_audio_track(AudioTrackConfig::new(AudioCodec::Opus, 48_000, 2))
      .unwrap();

    // 2 seconds: video keys at 0 s and 1 s, Opus packets are all keys
    for i in 0..60 {
      let t = i as f64 / 30.0;
      muxer
        .add_packet(video, &video_packet(t, i % 30 == 0, &[0xAB; 50]))
        .unwrap();
      let audio_packet = EncodedPacket::new(
        Bytes::from_static(&[0xCD; 20]),
        PacketType::Key,
        t,
        1.0 / 30.0,
        0,
      );
      muxer.add_packet(audio, &audio_packet).unwrap();
    }
    muxer.finalize().unwrap();
    let bytes = muxer.into_writer().into_bytes().to_vec();

    // ftyp carries the iso5 brand
    let ftyp = find_box(&bytes, b"ftyp").unwrap();
    assert_eq!(&ftyp[..4], b"iso5");

    // moov with mvex containing one trex per track
    let moov = find_box(&bytes, b"moov").unwrap();
    let mvex = find_box(moov, b"mvex").unwrap();
    let first_trex = find_box(mvex, b"trex").unwrap();
    let second_trex = find_box(&mvex[8 + first_trex.len()..], b"trex").unwrap();
    assert_eq!(u32::from_be_bytes(first_trex[4..8].try_into().unwrap()), 1);
    assert_eq!(u32::from_be_bytes(second_trex[4..8].try_into().unwrap()), 2);

    // Exactly two fragments
    let moof_count = bytes.windows(4).filter(|w| w == b"moof").count();
    assert_eq!(moof_count, 2);

    // moov precedes the first moof
    let moov_pos = bytes.windows(4).position(|w| w == b"moov").unwrap();
    let moof_pos = bytes.windows(4).position(|w| w == b"moof").unwrap();
    assert!(moov_pos < moof_pos);

    // mfra at EOF; final 4 bytes equal the mfra size
    let mfra_pos = bytes.windows(4).position(|w| w == b"mfra").unwrap() - 4;
    let mfra_size = bytes.len() - mfra_pos;
    let tail = u32::from_be_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
    assert_eq!(tail as usize, mfra_size);
    // Two tfra entries, one per track
    let mfra = find_box(&bytes[mfra_pos..], b"mfra").unwrap();
    assert_eq!(mfra.windows(4).filter(|w| w == b"tfra").count(), 2);
  }

  #[test]
  fn test_fragmented_trun_data_offset_points_into_mdat() {
    let mut muxer = Mp4Muxer::new(
      BufferWriter::new(),
      Mp4MuxerOptions {
        layout: Mp4LayoutMode::Fragmented,
        creation_time: Some(0),
      },
    );
    let video = muxer
      .add_video_track(VideoTrackConfig::new(VideoCodec::Avc, 1280, 720))
      .unwrap();
    muxer
      .add_packet(video, &video_packet(0.0, true, &[0xEE; 10]))
      .unwrap();
    muxer.finalize().unwrap();
    let bytes = muxer.into_writer().into_bytes().to_vec();

    let moof_pos = bytes.windows(4).position(|w| w == b"moof").unwrap() - 4;
    let moof = find_box(&bytes[moof_pos..], b"moof").unwrap();
    let traf = find_box(moof, b"traf").unwrap();
    let trun = find_box(traf, b"trun").unwrap();
    // version+flags(4) sample_count(4) then data_offset
    let data_offset = i32::from_be_bytes(trun[8..12].try_into().unwrap());
    let first_sample_abs = moof_pos + data_offset as usize;
    assert_eq!(bytes[first_sample_abs], 0xEE);
  }

  #[test]
  fn test_state_violations() {
    let mut muxer = Mp4Muxer::new(BufferWriter::new(), Mp4MuxerOptions::default());
    let track = muxer
      .add_video_track(VideoTrackConfig::new(VideoCodec::Avc, 640, 480))
      .unwrap();
    muxer.add_packet(track, &video_packet(0.0, true, &[1])).unwrap();
    // Track additions are rejected once muxing started
    assert!(matches!(
      muxer.add_video_track(VideoTrackConfig::new(VideoCodec::Avc, 640, 480)),
      Err(Error::StateViolation(_))
    ));
    muxer.finalize().unwrap();
    assert!(matches!(
      muxer.finalize(),
      Err(Error::StateViolation("finalize called twice"))
    ));
    assert!(matches!(
      muxer.add_packet(track, &video_packet(1.0, true, &[1])),
      Err(Error::StateViolation(_))
    ));
  }

  #[test]
  fn test_unsupported_audio_codec_rejected() {
    let mut muxer = Mp4Muxer::new(BufferWriter::new(), Mp4MuxerOptions::default());
    assert!(matches!(
      muxer.add_audio_track(AudioTrackConfig::new(AudioCodec::Vorbis, 48_000, 2)),
      Err(Error::UnsupportedFeature(_))
    ));
  }

  #[test]
  fn test_deterministic_output_with_seeded_creation_time() {
    let a = mux_four_frames(Mp4LayoutMode::Progressive);
    let b = mux_four_frames(Mp4LayoutMode::Progressive);
    assert_eq!(a, b);
  }

  #[test]
  fn test_b_frame_composition_offsets_emit_ctts() {
    let mut muxer = Mp4Muxer::new(
      BufferWriter::new(),
      Mp4MuxerOptions {
        layout: Mp4LayoutMode::Progressive,
        creation_time: Some(0),
      },
    );
    let track = muxer
      .add_video_track(VideoTrackConfig::new(VideoCodec::Avc, 1280, 720))
      .unwrap();
    let d = 1.0 / 30.0;
    // Decode order I P B B: presentation 0, 3d, 1d, 2d
    for (t, key) in [(0.0, true), (3.0 * d, false), (d, false), (2.0 * d, false)] {
      muxer.add_packet(track, &video_packet(t, key, &[9; 10])).unwrap();
    }
    muxer.finalize().unwrap();
    let bytes = muxer.into_writer().into_bytes().to_vec();
    let moov = find_box(&bytes, b"moov").unwrap();
    let stbl = find_box_path(moov, &[b"trak", b"mdia", b"minf", b"stbl"]).unwrap();
    assert!(find_box(stbl, b"ctts").is_some());
  }
}
