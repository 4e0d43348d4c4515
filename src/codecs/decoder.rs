//! Decoder interfaces and the ordering wrappers around them
//!
//! Decoder engines are external: anything implementing [`VideoDecoder`] /
//! [`AudioDecoder`] plugs in through a [`DecoderRegistry`] with a
//! `supports` predicate per registration, enabling codec-by-codec dispatch.
//! The wrappers enforce the ordering contracts engines do not guarantee:
//! presentation-order emission for video, empty-pre-roll skipping and
//! timestamp quantization for audio.

use bytes::Bytes;

use crate::codecs::{AudioCodec, VideoCodec};
use crate::error::{Error, Result};
use crate::packet::EncodedPacket;
use crate::sample::{AudioSample, VideoSample};

/// Configuration handed to a video decoder engine
#[derive(Debug, Clone)]
pub struct VideoDecoderConfig {
  pub codec: VideoCodec,
  pub coded_width: u32,
  pub coded_height: u32,
  /// Codec-specific description bytes (avcC/hvcC/vpcC/av1C)
  pub description: Option<Bytes>,
}

/// Configuration handed to an audio decoder engine
#[derive(Debug, Clone)]
pub struct AudioDecoderConfig {
  pub codec: AudioCodec,
  pub sample_rate: u32,
  pub number_of_channels: u32,
  /// Codec-specific description bytes (AudioSpecificConfig, dOps, ...)
  pub description: Option<Bytes>,
}

/// Video decoder engine interface
pub trait VideoDecoder: Send {
  fn configure(&mut self, config: &VideoDecoderConfig) -> Result<()>;
  /// Feed one packet; returns any samples the engine produced. Engines may
  /// emit in decode order; the wrapper restores presentation order.
  fn decode(&mut self, packet: &EncodedPacket) -> Result<Vec<VideoSample>>;
  fn flush(&mut self) -> Result<Vec<VideoSample>>;
  fn close(&mut self);
}

/// Audio decoder engine interface
pub trait AudioDecoder: Send {
  fn configure(&mut self, config: &AudioDecoderConfig) -> Result<()>;
  fn decode(&mut self, packet: &EncodedPacket) -> Result<Vec<AudioSample>>;
  fn flush(&mut self) -> Result<Vec<AudioSample>>;
  fn close(&mut self);
}

// ============================================================================
// Registry
// ============================================================================

type VideoSupports = Box<dyn Fn(VideoCodec, &VideoDecoderConfig) -> bool + Send + Sync>;
type VideoFactory = Box<dyn Fn() -> Box<dyn VideoDecoder> + Send + Sync>;
type AudioSupports = Box<dyn Fn(AudioCodec, &AudioDecoderConfig) -> bool + Send + Sync>;
type AudioFactory = Box<dyn Fn() -> Box<dyn AudioDecoder> + Send + Sync>;

/// Registered decoder implementations, dispatched codec by codec.
///
/// PCM variants always decode: when no registered engine claims a PCM
/// codec, the built-in [`PcmDecoder`](crate::codecs::pcm::PcmDecoder)
/// handles it synchronously.
#[derive(Default)]
pub struct DecoderRegistry {
  video: Vec<(VideoSupports, VideoFactory)>,
  audio: Vec<(AudioSupports, AudioFactory)>,
}

impl DecoderRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register_video(
    &mut self,
    supports: impl Fn(VideoCodec, &VideoDecoderConfig) -> bool + Send + Sync + 'static,
    factory: impl Fn() -> Box<dyn VideoDecoder> + Send + Sync + 'static,
  ) {
    self.video.push((Box::new(supports), Box::new(factory)));
  }

  pub fn register_audio(
    &mut self,
    supports: impl Fn(AudioCodec, &AudioDecoderConfig) -> bool + Send + Sync + 'static,
    factory: impl Fn() -> Box<dyn AudioDecoder> + Send + Sync + 'static,
  ) {
    self.audio.push((Box::new(supports), Box::new(factory)));
  }

  pub fn supports_video(&self, codec: VideoCodec, config: &VideoDecoderConfig) -> bool {
    self.video.iter().any(|(supports, _)| supports(codec, config))
  }

  pub fn supports_audio(&self, codec: AudioCodec, config: &AudioDecoderConfig) -> bool {
    codec.is_pcm() || self.audio.iter().any(|(supports, _)| supports(codec, config))
  }

  /// Instantiate and configure a wrapped video decoder
  pub fn create_video(&self, config: &VideoDecoderConfig) -> Result<VideoDecoderWrapper> {
    let inner = self
      .video
      .iter()
      .find(|(supports, _)| supports(config.codec, config))
      .map(|(_, factory)| factory())
      .ok_or_else(|| Error::DecoderUnavailable(config.codec.to_string()))?;
    VideoDecoderWrapper::new(inner, config)
  }

  /// Instantiate and configure a wrapped audio decoder, falling back to the
  /// built-in PCM conversion for raw formats
  pub fn create_audio(&self, config: &AudioDecoderConfig) -> Result<AudioDecoderWrapper> {
    let registered = self
      .audio
      .iter()
      .find(|(supports, _)| supports(config.codec, config))
      .map(|(_, factory)| factory());
    let inner = match registered {
      Some(inner) => inner,
      None if config.codec.is_pcm() => Box::new(crate::codecs::pcm::PcmDecoder::new()),
      None => return Err(Error::DecoderUnavailable(config.codec.to_string())),
    };
    AudioDecoderWrapper::new(inner, config)
  }
}

// ============================================================================
// Video decoder wrapper: presentation-order emission
// ============================================================================

/// Wraps a video decoder engine, re-ordering decode-order output into
/// presentation order.
///
/// Emitted samples buffer in a timestamp-sorted list; whenever a sample with
/// a timestamp ≥ all previously seen arrives, the buffered prefix (samples
/// that can no longer be preceded) is released. The final flush drains the
/// rest.
pub struct VideoDecoderWrapper {
  inner: Box<dyn VideoDecoder>,
  pending: Vec<VideoSample>,
  max_seen: f64,
}

impl VideoDecoderWrapper {
  pub fn new(mut inner: Box<dyn VideoDecoder>, config: &VideoDecoderConfig) -> Result<Self> {
    inner.configure(config)?;
    Ok(Self {
      inner,
      pending: Vec::new(),
      max_seen: f64::NEG_INFINITY,
    })
  }

  pub fn decode(&mut self, packet: &EncodedPacket) -> Result<Vec<VideoSample>> {
    let produced = self.inner.decode(packet)?;
    Ok(self.reorder(produced))
  }

  pub fn flush(&mut self) -> Result<Vec<VideoSample>> {
    let produced = self.inner.flush()?;
    let mut out = self.reorder(produced);
    self
      .pending
      .sort_by(|a, b| a.timestamp.partial_cmp(&b.timestamp).unwrap_or(std::cmp::Ordering::Equal));
    out.append(&mut self.pending);
    self.max_seen = f64::NEG_INFINITY;
    Ok(out)
  }

  pub fn close(&mut self) {
    self.pending.clear();
    self.inner.close();
  }

  fn reorder(&mut self, produced: Vec<VideoSample>) -> Vec<VideoSample> {
    let mut out = Vec::new();
    for sample in produced {
      if sample.timestamp >= self.max_seen {
        // Nothing still buffered can be preceded by a later arrival
        self
          .pending
          .sort_by(|a, b| a.timestamp.partial_cmp(&b.timestamp).unwrap_or(std::cmp::Ordering::Equal));
        out.append(&mut self.pending);
      }
      self.max_seen = self.max_seen.max(sample.timestamp);
      self.pending.push(sample);
    }
    out
  }
}

// ============================================================================
// Audio decoder wrapper: pre-roll skipping + timestamp quantization
// ============================================================================

/// Wraps an audio decoder engine. No reordering is needed; zero-frame
/// pre-roll samples are skipped and timestamps are rounded to an integer
/// multiple of `1 / sample_rate`.
pub struct AudioDecoderWrapper {
  inner: Box<dyn AudioDecoder>,
  sample_rate: u32,
}

impl AudioDecoderWrapper {
  pub fn new(mut inner: Box<dyn AudioDecoder>, config: &AudioDecoderConfig) -> Result<Self> {
    inner.configure(config)?;
    Ok(Self {
      inner,
      sample_rate: config.sample_rate.max(1),
    })
  }

  pub fn decode(&mut self, packet: &EncodedPacket) -> Result<Vec<AudioSample>> {
    let produced = self.inner.decode(packet)?;
    Ok(self.normalize(produced))
  }

  pub fn flush(&mut self) -> Result<Vec<AudioSample>> {
    let produced = self.inner.flush()?;
    Ok(self.normalize(produced))
  }

  pub fn close(&mut self) {
    self.inner.close();
  }

  fn normalize(&self, produced: Vec<AudioSample>) -> Vec<AudioSample> {
    let rate = f64::from(self.sample_rate);
    produced
      .into_iter()
      .filter(|s| s.number_of_frames > 0)
      .map(|mut s| {
        s.timestamp = (s.timestamp * rate).round() / rate;
        s
      })
      .collect()
  }
}
