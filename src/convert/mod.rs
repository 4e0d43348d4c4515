//! Conversion pipeline
//!
//! Reads packets from a demuxer, routes each track through a copy fast path
//! or a decode → resample/render → encode slow path, keeps tracks within
//! five seconds of each other through the [`TrackSynchronizer`], and writes
//! into a muxer. Cancellation is checked at every await point; the first
//! per-track error cancels the rest and surfaces after cleanup.

pub mod render;
pub mod sync;

pub use render::{rotate_rgba, Fit, FrameRenderer};
pub use sync::TrackSynchronizer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use crate::codecs::decoder::{AudioDecoderConfig, DecoderRegistry, VideoDecoderConfig};
use crate::codecs::encoder::{
  AudioEncoder, AudioEncoderConfig, EncoderRegistry, VideoEncoder, VideoEncoderConfig,
};
use crate::codecs::{AudioCodec, VideoCodec};
use crate::demux::{Demuxer, PacketRetrievalOptions};
use crate::error::{Error, Result};
use crate::io::Writer;
use crate::mux::{
  MatroskaMuxer, MatroskaMuxerOptions, MatroskaVariant, Mp4Muxer, Mp4MuxerOptions,
};
use crate::packet::EncodedPacket;
use crate::resample::AudioResampler;
use crate::sink::{share_demuxer, MediaSampleSink, PacketSink, SharedDemuxer};
use crate::track::{
  AudioTrackConfig, AudioTrackInfo, Rotation, TrackInfo, VideoTrackConfig, VideoTrackInfo,
};

/// Fallback audio parameters when nothing is encodable at the source layout
const AUDIO_FALLBACK_CHANNELS: u32 = 2;
const AUDIO_FALLBACK_RATE: u32 = 48_000;

/// Output container choice
#[derive(Debug, Clone)]
pub enum OutputFormat {
  Mp4(Mp4MuxerOptions),
  Matroska(MatroskaMuxerOptions),
}

impl OutputFormat {
  fn supports_video(&self, codec: VideoCodec) -> bool {
    match self {
      OutputFormat::Mp4(_) => true,
      OutputFormat::Matroska(options) => match options.variant {
        MatroskaVariant::Matroska => true,
        MatroskaVariant::Webm => {
          matches!(codec, VideoCodec::Vp8 | VideoCodec::Vp9 | VideoCodec::Av1)
        }
      },
    }
  }

  fn supports_audio(&self, codec: AudioCodec) -> bool {
    match self {
      OutputFormat::Mp4(_) => {
        matches!(codec, AudioCodec::Aac | AudioCodec::Opus | AudioCodec::Mp3)
      }
      OutputFormat::Matroska(options) => match options.variant {
        MatroskaVariant::Matroska => crate::codecs::matroska_codec_id_audio(codec).is_some(),
        MatroskaVariant::Webm => matches!(codec, AudioCodec::Opus | AudioCodec::Vorbis),
      },
    }
  }

  /// Encodable-codec candidates in preference order
  fn video_candidates(&self) -> &'static [VideoCodec] {
    match self {
      OutputFormat::Mp4(_) => &[
        VideoCodec::Avc,
        VideoCodec::Hevc,
        VideoCodec::Vp9,
        VideoCodec::Av1,
        VideoCodec::Vp8,
      ],
      OutputFormat::Matroska(options) => match options.variant {
        MatroskaVariant::Matroska => &[
          VideoCodec::Avc,
          VideoCodec::Hevc,
          VideoCodec::Vp9,
          VideoCodec::Av1,
          VideoCodec::Vp8,
        ],
        MatroskaVariant::Webm => &[VideoCodec::Vp9, VideoCodec::Vp8, VideoCodec::Av1],
      },
    }
  }

  fn audio_candidates(&self) -> &'static [AudioCodec] {
    match self {
      OutputFormat::Mp4(_) => &[AudioCodec::Aac, AudioCodec::Opus, AudioCodec::Mp3],
      OutputFormat::Matroska(options) => match options.variant {
        MatroskaVariant::Matroska => &[
          AudioCodec::Opus,
          AudioCodec::Aac,
          AudioCodec::Vorbis,
          AudioCodec::Mp3,
          AudioCodec::Flac,
        ],
        MatroskaVariant::Webm => &[AudioCodec::Opus, AudioCodec::Vorbis],
      },
    }
  }
}

/// Per-type video options
#[derive(Default)]
pub struct VideoConversionOptions {
  pub discard: bool,
  pub force_transcode: bool,
  /// Force a specific output codec
  pub codec: Option<VideoCodec>,
  pub bitrate: Option<u64>,
  pub width: Option<u32>,
  pub height: Option<u32>,
  pub fit: Fit,
  /// Extra rotation baked into the output on top of the source rotation
  pub rotation: Option<Rotation>,
}

/// Per-type audio options
#[derive(Default)]
pub struct AudioConversionOptions {
  pub discard: bool,
  pub force_transcode: bool,
  pub codec: Option<AudioCodec>,
  pub bitrate: Option<u64>,
  pub sample_rate: Option<u32>,
  pub number_of_channels: Option<u32>,
}

/// Conversion options
#[derive(Default)]
pub struct ConversionOptions {
  /// Keep only `[start, end)` of the input; output timestamps re-base to 0
  pub trim: Option<(f64, f64)>,
  pub video: VideoConversionOptions,
  pub audio: AudioConversionOptions,
}

/// Why a source track did not reach the output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
  UserDiscarded,
  /// The output already carries a track of this type
  TrackLimitReached,
  /// No registered decoder can decode the source codec
  UndecodableSourceCodec,
  /// No codec is both accepted by the output format and encodable
  NoEncodableTargetCodec,
}

/// A source track that was left out, and why
#[derive(Debug, Clone, Copy)]
pub struct DiscardedTrack {
  pub track_id: u32,
  pub reason: DiscardReason,
}

/// Completed conversion: the writer plus the track report
#[derive(Debug)]
pub struct ConversionResult<W> {
  pub writer: W,
  pub utilized_tracks: Vec<u32>,
  pub discarded_tracks: Vec<DiscardedTrack>,
}

struct CancelState {
  flag: AtomicBool,
  sync: TrackSynchronizer,
}

/// Handle for canceling a running conversion
#[derive(Clone)]
pub struct CancelHandle(Arc<CancelState>);

impl CancelHandle {
  /// Terminate the conversion; `execute` returns [`Error::Canceled`]
  pub fn cancel(&self) {
    self.0.flag.store(true, Ordering::SeqCst);
    self.0.sync.cancel();
  }
}

type ProgressCallback = Box<dyn FnMut(f64) + Send>;

enum TrackPlan {
  CopyVideo {
    source: VideoTrackInfo,
  },
  CopyAudio {
    source: AudioTrackInfo,
  },
  TranscodeVideo {
    source: VideoTrackInfo,
    encoder: Box<dyn VideoEncoder>,
    encoder_config: VideoEncoderConfig,
    rotation: Rotation,
    fit: Fit,
  },
  TranscodeAudio {
    source: AudioTrackInfo,
    encoder: Box<dyn AudioEncoder>,
    encoder_config: AudioEncoderConfig,
    /// Source-side `(rate, channels)` → encoder-side conversion needed
    resample: bool,
  },
}

enum OutputMuxer<W: Writer> {
  Mp4(Mp4Muxer<W>),
  Matroska(MatroskaMuxer<W>),
}

impl<W: Writer> OutputMuxer<W> {
  fn add_video_track(&mut self, config: VideoTrackConfig) -> Result<u32> {
    match self {
      OutputMuxer::Mp4(m) => m.add_video_track(config),
      OutputMuxer::Matroska(m) => m.add_video_track(config),
    }
  }

  fn add_audio_track(&mut self, config: AudioTrackConfig) -> Result<u32> {
    match self {
      OutputMuxer::Mp4(m) => m.add_audio_track(config),
      OutputMuxer::Matroska(m) => m.add_audio_track(config),
    }
  }

  fn add_packet(&mut self, track_id: u32, packet: &EncodedPacket) -> Result<()> {
    match self {
      OutputMuxer::Mp4(m) => m.add_packet(track_id, packet),
      OutputMuxer::Matroska(m) => m.add_packet(track_id, packet),
    }
  }

  fn finalize(&mut self) -> Result<()> {
    match self {
      OutputMuxer::Mp4(m) => m.finalize(),
      OutputMuxer::Matroska(m) => m.finalize(),
    }
  }

  fn into_writer(self) -> W {
    match self {
      OutputMuxer::Mp4(m) => m.into_writer(),
      OutputMuxer::Matroska(m) => m.into_writer(),
    }
  }
}

/// One input, one output, a routing decision per track
pub struct Conversion<W: Writer + 'static> {
  input: SharedDemuxer,
  format: OutputFormat,
  writer: Option<W>,
  options: ConversionOptions,
  decoders: Arc<DecoderRegistry>,
  encoders: Arc<EncoderRegistry>,
  cancel: Arc<CancelState>,
  progress: Option<ProgressCallback>,
}

impl<W: Writer + 'static> Conversion<W> {
  pub fn new(
    input: Demuxer,
    writer: W,
    format: OutputFormat,
    options: ConversionOptions,
    decoders: Arc<DecoderRegistry>,
    encoders: Arc<EncoderRegistry>,
  ) -> Self {
    Self {
      input: share_demuxer(input),
      format,
      writer: Some(writer),
      options,
      decoders,
      encoders,
      cancel: Arc::new(CancelState {
        flag: AtomicBool::new(false),
        sync: TrackSynchronizer::new(),
      }),
      progress: None,
    }
  }

  /// Register a progress callback receiving values in `[0, 1]`
  pub fn on_progress(&mut self, callback: impl FnMut(f64) + Send + 'static) {
    self.progress = Some(Box::new(callback));
  }

  /// Handle to cancel the conversion from another task
  pub fn cancel_handle(&self) -> CancelHandle {
    CancelHandle(self.cancel.clone())
  }

  /// Run the conversion to completion
  pub async fn execute(mut self) -> Result<ConversionResult<W>> {
    let duration = self.input.lock().await.compute_duration().await?;
    let (trim_start, trim_end) = self.options.trim.unwrap_or((0.0, f64::INFINITY));
    if trim_start < 0.0 || trim_end <= trim_start {
      return Err(Error::invalid("trim range is empty or negative"));
    }

    // Route every input track
    let source_tracks = self.input.lock().await.tracks();
    let mut discarded: Vec<DiscardedTrack> = Vec::new();
    let mut plans: Vec<TrackPlan> = Vec::new();
    let mut have_video = false;
    let mut have_audio = false;

    for track in source_tracks {
      match track {
        TrackInfo::Video(video) => {
          if self.options.video.discard {
            discarded.push(DiscardedTrack {
              track_id: video.id,
              reason: DiscardReason::UserDiscarded,
            });
            continue;
          }
          if have_video {
            discarded.push(DiscardedTrack {
              track_id: video.id,
              reason: DiscardReason::TrackLimitReached,
            });
            continue;
          }
          match self.plan_video(&video, trim_start).await? {
            Ok(plan) => {
              have_video = true;
              plans.push(plan);
            }
            Err(reason) => discarded.push(DiscardedTrack {
              track_id: video.id,
              reason,
            }),
          }
        }
        TrackInfo::Audio(audio) => {
          if self.options.audio.discard {
            discarded.push(DiscardedTrack {
              track_id: audio.id,
              reason: DiscardReason::UserDiscarded,
            });
            continue;
          }
          if have_audio {
            discarded.push(DiscardedTrack {
              track_id: audio.id,
              reason: DiscardReason::TrackLimitReached,
            });
            continue;
          }
          match self.plan_audio(&audio) {
            Ok(plan) => {
              have_audio = true;
              plans.push(plan);
            }
            Err(reason) => discarded.push(DiscardedTrack {
              track_id: audio.id,
              reason,
            }),
          }
        }
      }
    }

    if plans.is_empty() {
      return Err(Error::unsupported("no input track is usable for this output"));
    }

    // Build the output muxer and its tracks
    let writer = self.writer.take().expect("writer present until execute");
    let mut muxer = match &self.format {
      OutputFormat::Mp4(options) => OutputMuxer::Mp4(Mp4Muxer::new(writer, options.clone())),
      OutputFormat::Matroska(options) => {
        OutputMuxer::Matroska(MatroskaMuxer::new(writer, options.clone()))
      }
    };

    let mut utilized: Vec<u32> = Vec::new();
    let mut launches: Vec<(TrackPlan, u32, u32)> = Vec::new(); // plan, source id, output id
    for plan in plans {
      let (source_id, output_id) = match &plan {
        TrackPlan::CopyVideo { source } => {
          let mut config =
            VideoTrackConfig::new(source.codec, source.coded_width, source.coded_height)
              .with_rotation(source.rotation);
          config.description = source.decoder_config.clone();
          (source.id, muxer.add_video_track(config)?)
        }
        TrackPlan::CopyAudio { source } => {
          let mut config =
            AudioTrackConfig::new(source.codec, source.sample_rate, source.number_of_channels);
          config.description = source.decoder_config.clone();
          (source.id, muxer.add_audio_track(config)?)
        }
        TrackPlan::TranscodeVideo {
          source,
          encoder,
          encoder_config,
          ..
        } => {
          let mut config = VideoTrackConfig::new(
            encoder_config.codec,
            encoder_config.width,
            encoder_config.height,
          );
          config.description = encoder.decoder_config();
          (source.id, muxer.add_video_track(config)?)
        }
        TrackPlan::TranscodeAudio {
          source,
          encoder,
          encoder_config,
          ..
        } => {
          let mut config = AudioTrackConfig::new(
            encoder_config.codec,
            encoder_config.sample_rate,
            encoder_config.number_of_channels,
          );
          config.description = encoder.decoder_config();
          (source.id, muxer.add_audio_track(config)?)
        }
      };
      utilized.push(source_id);
      self.cancel.sync.register(source_id);
      launches.push((plan, source_id, output_id));
    }

    // Per-track coroutines share the muxer behind a lock; no await happens
    // while it is held
    let muxer = Arc::new(StdMutex::new(Some(muxer)));
    let progress = Arc::new(StdMutex::new(self.progress.take()));
    let mut handles = Vec::new();
    for (plan, source_id, output_id) in launches {
      let ctx = TrackContext {
        input: self.input.clone(),
        muxer: muxer.clone(),
        decoders: self.decoders.clone(),
        cancel: self.cancel.clone(),
        progress: progress.clone(),
        duration,
        trim_start,
        trim_end,
        source_id,
        output_id,
      };
      handles.push(tokio::spawn(run_track(plan, ctx)));
    }

    let mut first_error: Option<Error> = None;
    for handle in futures::future::join_all(handles).await {
      match handle {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
          if first_error.is_none() && !err.is_canceled() {
            first_error = Some(err);
          }
          // First failure cancels the remaining tracks
          self.cancel.flag.store(true, Ordering::SeqCst);
          self.cancel.sync.cancel();
        }
        Err(join_err) => {
          if first_error.is_none() {
            first_error = Some(Error::invalid(format!("track task failed: {join_err}")));
          }
        }
      }
    }

    let mut muxer = muxer
      .lock()
      .expect("muxer lock")
      .take()
      .expect("muxer retained until tasks finish");

    if let Some(err) = first_error {
      // Output finalize is suppressed on failure
      return Err(err);
    }
    if self.cancel.flag.load(Ordering::SeqCst) {
      return Err(Error::Canceled);
    }

    muxer.finalize()?;
    Ok(ConversionResult {
      writer: muxer.into_writer(),
      utilized_tracks: utilized,
      discarded_tracks: discarded,
    })
  }

  // ==========================================================================
  // Routing
  // ==========================================================================

  async fn plan_video(
    &self,
    source: &VideoTrackInfo,
    trim_start: f64,
  ) -> Result<std::result::Result<TrackPlan, DiscardReason>> {
    let options = &self.options.video;
    let resize_requested = options.width.is_some_and(|w| w != source.coded_width)
      || options.height.is_some_and(|h| h != source.coded_height);
    let forced_codec_differs = options.codec.is_some_and(|c| c != source.codec);

    let fast_path_possible = !options.force_transcode
      && options.bitrate.is_none()
      && !resize_requested
      && options.rotation.is_none()
      && !forced_codec_differs
      && self.format.supports_video(source.codec)
      && self.trim_aligns_with_key(source.id, trim_start).await?;

    if fast_path_possible {
      return Ok(Ok(TrackPlan::CopyVideo {
        source: source.clone(),
      }));
    }

    // Slow path: the source must decode
    let decoder_config = VideoDecoderConfig {
      codec: source.codec,
      coded_width: source.coded_width,
      coded_height: source.coded_height,
      description: source.decoder_config.clone(),
    };
    if !self.decoders.supports_video(source.codec, &decoder_config) {
      return Ok(Err(DiscardReason::UndecodableSourceCodec));
    }

    // Output geometry: rotation baked in, then explicit size overrides
    let rotation = options.rotation.unwrap_or(source.rotation);
    let (natural_w, natural_h) = if rotation.swaps_dimensions() {
      (source.coded_height, source.coded_width)
    } else {
      (source.coded_width, source.coded_height)
    };
    let width = options.width.unwrap_or(natural_w);
    let height = options.height.unwrap_or(natural_h);

    // First codec accepted by the format and backed by an encoder; the
    // source codec (or the forced one) gets first refusal
    let mut candidates: Vec<VideoCodec> = Vec::new();
    if let Some(forced) = options.codec {
      candidates.push(forced);
    } else {
      candidates.push(source.codec);
      candidates.extend_from_slice(self.format.video_candidates());
    }
    for codec in candidates {
      if !self.format.supports_video(codec) {
        continue;
      }
      let encoder_config = VideoEncoderConfig {
        codec,
        width,
        height,
        bitrate: options.bitrate,
      };
      if self.encoders.supports_video(codec, &encoder_config) {
        let encoder = self.encoders.create_video(&encoder_config)?;
        return Ok(Ok(TrackPlan::TranscodeVideo {
          source: source.clone(),
          encoder,
          encoder_config,
          rotation,
          fit: options.fit,
        }));
      }
    }
    Ok(Err(DiscardReason::NoEncodableTargetCodec))
  }

  fn plan_audio(
    &self,
    source: &AudioTrackInfo,
  ) -> std::result::Result<TrackPlan, DiscardReason> {
    let options = &self.options.audio;
    let layout_change = options.sample_rate.is_some_and(|r| r != source.sample_rate)
      || options
        .number_of_channels
        .is_some_and(|c| c != source.number_of_channels);
    let forced_codec_differs = options.codec.is_some_and(|c| c != source.codec);

    let fast_path_possible = !options.force_transcode
      && options.bitrate.is_none()
      && !layout_change
      && !forced_codec_differs
      && self.format.supports_audio(source.codec);

    if fast_path_possible {
      return Ok(TrackPlan::CopyAudio {
        source: source.clone(),
      });
    }

    let decoder_config = AudioDecoderConfig {
      codec: source.codec,
      sample_rate: source.sample_rate,
      number_of_channels: source.number_of_channels,
      description: source.decoder_config.clone(),
    };
    if !self.decoders.supports_audio(source.codec, &decoder_config) {
      return Err(DiscardReason::UndecodableSourceCodec);
    }

    let target_rate = options.sample_rate.unwrap_or(source.sample_rate);
    let target_channels = options.number_of_channels.unwrap_or(source.number_of_channels);

    let mut candidates: Vec<AudioCodec> = Vec::new();
    if let Some(forced) = options.codec {
      candidates.push(forced);
    } else {
      candidates.push(source.codec);
      candidates.extend_from_slice(self.format.audio_candidates());
    }

    // Requested layout first, then the 2 ch / 48 kHz fallback with a
    // resample stage
    for (rate, channels, resample_forced) in [
      (target_rate, target_channels, false),
      (AUDIO_FALLBACK_RATE, AUDIO_FALLBACK_CHANNELS, true),
    ] {
      for &codec in &candidates {
        if codec.is_pcm() || !self.format.supports_audio(codec) {
          continue;
        }
        let encoder_config = AudioEncoderConfig {
          codec,
          sample_rate: rate,
          number_of_channels: channels,
          bitrate: options.bitrate,
        };
        if self.encoders.supports_audio(codec, &encoder_config) {
          let encoder = self
            .encoders
            .create_audio(&encoder_config)
            .map_err(|_| DiscardReason::NoEncodableTargetCodec)?;
          let resample = resample_forced
            || rate != source.sample_rate
            || channels != source.number_of_channels;
          return Ok(TrackPlan::TranscodeAudio {
            source: source.clone(),
            encoder,
            encoder_config,
            resample,
          });
        }
      }
    }
    Err(DiscardReason::NoEncodableTargetCodec)
  }

  /// A trimmed fast path must start exactly on a key packet, otherwise the
  /// re-based timestamps would dip below zero
  async fn trim_aligns_with_key(&self, track_id: u32, trim_start: f64) -> Result<bool> {
    if trim_start == 0.0 {
      return Ok(true);
    }
    let mut input = self.input.lock().await;
    let options = PacketRetrievalOptions {
      metadata_only: true,
      verify_key_packets: false,
    };
    match input.key_packet_at(track_id, trim_start, options).await? {
      Some(key) => Ok((key.timestamp - trim_start).abs() < 1e-9),
      None => Ok(false),
    }
  }
}

// ============================================================================
// Per-track coroutines
// ============================================================================

struct TrackContext<W: Writer + 'static> {
  input: SharedDemuxer,
  muxer: Arc<StdMutex<Option<OutputMuxer<W>>>>,
  decoders: Arc<DecoderRegistry>,
  cancel: Arc<CancelState>,
  progress: Arc<StdMutex<Option<ProgressCallback>>>,
  duration: f64,
  trim_start: f64,
  trim_end: f64,
  source_id: u32,
  output_id: u32,
}

impl<W: Writer + 'static> TrackContext<W> {
  fn check_cancel(&self) -> Result<()> {
    if self.cancel.flag.load(Ordering::SeqCst) {
      Err(Error::Canceled)
    } else {
      Ok(())
    }
  }

  fn write_packet(&self, packet: &EncodedPacket) -> Result<()> {
    let mut guard = self.muxer.lock().expect("muxer lock");
    let muxer = guard.as_mut().ok_or(Error::Canceled)?;
    muxer.add_packet(self.output_id, packet)
  }

  async fn report(&self, timestamp: f64) -> Result<()> {
    self.check_cancel()?;
    self.cancel.sync.report(self.source_id, timestamp).await?;
    let value = self.cancel.sync.progress(self.duration_for_progress());
    if let Some(callback) = self.progress.lock().expect("progress lock").as_mut() {
      callback(value);
    }
    Ok(())
  }

  fn duration_for_progress(&self) -> f64 {
    if self.trim_end.is_finite() {
      (self.trim_end - self.trim_start).max(0.0)
    } else {
      (self.duration - self.trim_start).max(0.0)
    }
  }
}

async fn run_track<W: Writer + 'static>(plan: TrackPlan, ctx: TrackContext<W>) -> Result<()> {
  let cancel = ctx.cancel.clone();
  let result = match plan {
    TrackPlan::CopyVideo { .. } | TrackPlan::CopyAudio { .. } => run_copy_track(ctx).await,
    TrackPlan::TranscodeVideo {
      source,
      encoder,
      encoder_config,
      rotation,
      fit,
    } => run_video_transcode(ctx, source, encoder, encoder_config, rotation, fit).await,
    TrackPlan::TranscodeAudio {
      source,
      encoder,
      encoder_config,
      resample,
    } => run_audio_transcode(ctx, source, encoder, encoder_config, resample).await,
  };
  if result.is_err() {
    // A failed track must not leave siblings blocked on the synchronizer
    cancel.flag.store(true, Ordering::SeqCst);
    cancel.sync.cancel();
  }
  result
}

/// Fast path: stream encoded packets straight into the muxer
async fn run_copy_track<W: Writer + 'static>(ctx: TrackContext<W>) -> Result<()> {
  let sink = PacketSink::new(ctx.input.clone(), ctx.source_id);
  let end = ctx.trim_end.is_finite().then_some(ctx.trim_end);
  let start = (ctx.trim_start > 0.0).then_some(ctx.trim_start);
  let mut packets = sink.packets(start, end, PacketRetrievalOptions::default());

  while let Some(packet) = packets.next().await? {
    ctx.check_cancel()?;
    let mut shifted = packet.clone();
    shifted.timestamp = (packet.timestamp - ctx.trim_start).max(0.0);
    ctx.write_packet(&shifted)?;
    ctx.report(shifted.timestamp).await?;
  }
  ctx.cancel.sync.finish(ctx.source_id);
  Ok(())
}

/// Slow path: decode → render → encode
async fn run_video_transcode<W: Writer + 'static>(
  ctx: TrackContext<W>,
  source: VideoTrackInfo,
  mut encoder: Box<dyn VideoEncoder>,
  encoder_config: VideoEncoderConfig,
  rotation: Rotation,
  fit: Fit,
) -> Result<()> {
  let decoder = ctx.decoders.create_video(&VideoDecoderConfig {
    codec: source.codec,
    coded_width: source.coded_width,
    coded_height: source.coded_height,
    description: source.decoder_config.clone(),
  })?;
  let mut sink = MediaSampleSink::new(ctx.input.clone(), ctx.source_id, decoder);
  let mut renderer = FrameRenderer::new(encoder_config.width, encoder_config.height, fit, rotation);

  let mut first_frame = true;
  {
    let mut samples = sink.samples_in_range(ctx.trim_start, ctx.trim_end);
    while let Some(sample) = samples.next().await? {
      ctx.check_cancel()?;
      let mut frame = renderer.render(&sample)?;
      frame.timestamp = (frame.timestamp - ctx.trim_start).max(0.0);
      let packets = encoder.encode(&frame, first_frame)?;
      first_frame = false;
      for packet in &packets {
        ctx.write_packet(packet)?;
      }
      ctx.report(frame.timestamp).await?;
    }
  }
  for packet in encoder.flush()? {
    ctx.check_cancel()?;
    ctx.write_packet(&packet)?;
  }
  encoder.close();
  ctx.cancel.sync.finish(ctx.source_id);
  Ok(())
}

/// Slow path: decode → resample → encode
async fn run_audio_transcode<W: Writer + 'static>(
  ctx: TrackContext<W>,
  source: AudioTrackInfo,
  mut encoder: Box<dyn AudioEncoder>,
  encoder_config: AudioEncoderConfig,
  resample: bool,
) -> Result<()> {
  let decoder = ctx.decoders.create_audio(&AudioDecoderConfig {
    codec: source.codec,
    sample_rate: source.sample_rate,
    number_of_channels: source.number_of_channels,
    description: source.decoder_config.clone(),
  })?;
  let mut sink = MediaSampleSink::new(ctx.input.clone(), ctx.source_id, decoder);
  let mut resampler = if resample {
    Some(AudioResampler::new(
      source.sample_rate,
      source.number_of_channels,
      encoder_config.sample_rate,
      encoder_config.number_of_channels,
    )?)
  } else {
    None
  };

  {
    let mut samples = sink.samples_in_range(ctx.trim_start, ctx.trim_end);
    while let Some(mut sample) = samples.next().await? {
      ctx.check_cancel()?;
      sample.timestamp = (sample.timestamp - ctx.trim_start).max(0.0);
      let input_timestamp = sample.timestamp;
      let outputs = match &mut resampler {
        Some(resampler) => resampler.add(&sample)?,
        None => vec![sample],
      };
      for output in &outputs {
        for packet in encoder.encode(output)? {
          ctx.write_packet(&packet)?;
        }
      }
      ctx.report(input_timestamp).await?;
    }
  }
  if let Some(mut resampler) = resampler.take() {
    if let Some(rest) = resampler.finalize()? {
      for packet in encoder.encode(&rest)? {
        ctx.write_packet(&packet)?;
      }
    }
  }
  for packet in encoder.flush()? {
    ctx.check_cancel()?;
    ctx.write_packet(&packet)?;
  }
  encoder.close();
  ctx.cancel.sync.finish(ctx.source_id);
  Ok(())
}
