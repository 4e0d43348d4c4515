//! Encoder interfaces and registry
//!
//! Encoder engines are external; the conversion slow path asks the registry
//! for the first codec an output format accepts that also has a registered
//! encoder.

use bytes::Bytes;

use crate::codecs::{AudioCodec, VideoCodec};
use crate::error::{Error, Result};
use crate::packet::EncodedPacket;
use crate::sample::{AudioSample, VideoSample};

/// Configuration handed to a video encoder engine
#[derive(Debug, Clone)]
pub struct VideoEncoderConfig {
  pub codec: VideoCodec,
  pub width: u32,
  pub height: u32,
  /// Target bitrate in bits per second; engines pick a default when absent
  pub bitrate: Option<u64>,
}

/// Configuration handed to an audio encoder engine
#[derive(Debug, Clone)]
pub struct AudioEncoderConfig {
  pub codec: AudioCodec,
  pub sample_rate: u32,
  pub number_of_channels: u32,
  pub bitrate: Option<u64>,
}

/// Video encoder engine interface
pub trait VideoEncoder: Send {
  fn configure(&mut self, config: &VideoEncoderConfig) -> Result<()>;
  /// Encode one frame; `key_frame` forces a sync point
  fn encode(&mut self, sample: &VideoSample, key_frame: bool) -> Result<Vec<EncodedPacket>>;
  fn flush(&mut self) -> Result<Vec<EncodedPacket>>;
  fn close(&mut self);
  /// Decoder configuration bytes (avcC/hvcC/...) once known
  fn decoder_config(&self) -> Option<Bytes> {
    None
  }
}

/// Audio encoder engine interface
pub trait AudioEncoder: Send {
  fn configure(&mut self, config: &AudioEncoderConfig) -> Result<()>;
  fn encode(&mut self, sample: &AudioSample) -> Result<Vec<EncodedPacket>>;
  fn flush(&mut self) -> Result<Vec<EncodedPacket>>;
  fn close(&mut self);
  fn decoder_config(&self) -> Option<Bytes> {
    None
  }
}

type VideoSupports = Box<dyn Fn(VideoCodec, &VideoEncoderConfig) -> bool + Send + Sync>;
type VideoFactory = Box<dyn Fn() -> Box<dyn VideoEncoder> + Send + Sync>;
type AudioSupports = Box<dyn Fn(AudioCodec, &AudioEncoderConfig) -> bool + Send + Sync>;
type AudioFactory = Box<dyn Fn() -> Box<dyn AudioEncoder> + Send + Sync>;

/// Registered encoder implementations
#[derive(Default)]
pub struct EncoderRegistry {
  video: Vec<(VideoSupports, VideoFactory)>,
  audio: Vec<(AudioSupports, AudioFactory)>,
}

impl EncoderRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register_video(
    &mut self,
    supports: impl Fn(VideoCodec, &VideoEncoderConfig) -> bool + Send + Sync + 'static,
    factory: impl Fn() -> Box<dyn VideoEncoder> + Send + Sync + 'static,
  ) {
    self.video.push((Box::new(supports), Box::new(factory)));
  }

  pub fn register_audio(
    &mut self,
    supports: impl Fn(AudioCodec, &AudioEncoderConfig) -> bool + Send + Sync + 'static,
    factory: impl Fn() -> Box<dyn AudioEncoder> + Send + Sync + 'static,
  ) {
    self.audio.push((Box::new(supports), Box::new(factory)));
  }

  pub fn supports_video(&self, codec: VideoCodec, config: &VideoEncoderConfig) -> bool {
    self.video.iter().any(|(supports, _)| supports(codec, config))
  }

  pub fn supports_audio(&self, codec: AudioCodec, config: &AudioEncoderConfig) -> bool {
    self.audio.iter().any(|(supports, _)| supports(codec, config))
  }

  pub fn create_video(&self, config: &VideoEncoderConfig) -> Result<Box<dyn VideoEncoder>> {
    let mut encoder = self
      .video
      .iter()
      .find(|(supports, _)| supports(config.codec, config))
      .map(|(_, factory)| factory())
      .ok_or_else(|| Error::EncoderUnavailable(config.codec.to_string()))?;
    encoder.configure(config)?;
    Ok(encoder)
  }

  pub fn create_audio(&self, config: &AudioEncoderConfig) -> Result<Box<dyn AudioEncoder>> {
    let mut encoder = self
      .audio
      .iter()
      .find(|(supports, _)| supports(config.codec, config))
      .map(|(_, factory)| factory())
      .ok_or_else(|| Error::EncoderUnavailable(config.codec.to_string()))?;
    encoder.configure(config)?;
    Ok(encoder)
  }
}
