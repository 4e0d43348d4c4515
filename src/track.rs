//! Track model shared by muxers and demuxers
//!
//! A track carries a 1-based id unique within its container, a codec
//! identity, a time resolution, and the codec-specific decoder configuration
//! bytes (avcC/hvcC/vpcC/av1C/esds/dOps/CodecPrivate).

use bytes::Bytes;

use crate::codecs::{AudioCodec, VideoCodec};

/// Natural display rotation of a video track, clockwise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
  #[default]
  None,
  Clockwise90,
  Clockwise180,
  Clockwise270,
}

impl Rotation {
  /// Rotation in degrees, one of 0/90/180/270
  pub fn degrees(&self) -> u32 {
    match self {
      Rotation::None => 0,
      Rotation::Clockwise90 => 90,
      Rotation::Clockwise180 => 180,
      Rotation::Clockwise270 => 270,
    }
  }

  pub fn from_degrees(degrees: u32) -> Option<Self> {
    Some(match degrees % 360 {
      0 => Rotation::None,
      90 => Rotation::Clockwise90,
      180 => Rotation::Clockwise180,
      270 => Rotation::Clockwise270,
      _ => return None,
    })
  }

  /// Whether the rotation swaps display width and height
  pub fn swaps_dimensions(&self) -> bool {
    matches!(self, Rotation::Clockwise90 | Rotation::Clockwise270)
  }
}

/// Video track metadata
#[derive(Debug, Clone)]
pub struct VideoTrackInfo {
  /// 1-based id, unique within the container
  pub id: u32,
  pub codec: VideoCodec,
  pub coded_width: u32,
  pub coded_height: u32,
  pub rotation: Rotation,
  /// Ticks per second for this track's timestamps
  pub time_resolution: u32,
  /// Codec-specific decoder configuration bytes
  pub decoder_config: Option<Bytes>,
}

/// Audio track metadata
#[derive(Debug, Clone)]
pub struct AudioTrackInfo {
  /// 1-based id, unique within the container
  pub id: u32,
  pub codec: AudioCodec,
  pub sample_rate: u32,
  pub number_of_channels: u32,
  /// Ticks per second for this track's timestamps
  pub time_resolution: u32,
  /// Codec-specific decoder configuration bytes
  pub decoder_config: Option<Bytes>,
}

/// Either kind of track
#[derive(Debug, Clone)]
pub enum TrackInfo {
  Video(VideoTrackInfo),
  Audio(AudioTrackInfo),
}

impl TrackInfo {
  pub fn id(&self) -> u32 {
    match self {
      TrackInfo::Video(t) => t.id,
      TrackInfo::Audio(t) => t.id,
    }
  }

  pub fn time_resolution(&self) -> u32 {
    match self {
      TrackInfo::Video(t) => t.time_resolution,
      TrackInfo::Audio(t) => t.time_resolution,
    }
  }

  pub fn is_video(&self) -> bool {
    matches!(self, TrackInfo::Video(_))
  }

  pub fn is_audio(&self) -> bool {
    matches!(self, TrackInfo::Audio(_))
  }

  pub fn as_video(&self) -> Option<&VideoTrackInfo> {
    match self {
      TrackInfo::Video(t) => Some(t),
      TrackInfo::Audio(_) => None,
    }
  }

  pub fn as_audio(&self) -> Option<&AudioTrackInfo> {
    match self {
      TrackInfo::Audio(t) => Some(t),
      TrackInfo::Video(_) => None,
    }
  }

  pub fn decoder_config(&self) -> Option<&Bytes> {
    match self {
      TrackInfo::Video(t) => t.decoder_config.as_ref(),
      TrackInfo::Audio(t) => t.decoder_config.as_ref(),
    }
  }
}

/// Configuration supplied when adding a video track to a muxer
#[derive(Debug, Clone)]
pub struct VideoTrackConfig {
  pub codec: VideoCodec,
  pub width: u32,
  pub height: u32,
  pub rotation: Rotation,
  /// Decoder configuration from the encoder (avcC/hvcC/vpcC/av1C)
  pub description: Option<Bytes>,
}

impl VideoTrackConfig {
  pub fn new(codec: VideoCodec, width: u32, height: u32) -> Self {
    Self {
      codec,
      width,
      height,
      rotation: Rotation::None,
      description: None,
    }
  }

  pub fn with_rotation(mut self, rotation: Rotation) -> Self {
    self.rotation = rotation;
    self
  }

  pub fn with_description(mut self, description: Bytes) -> Self {
    self.description = Some(description);
    self
  }
}

/// Configuration supplied when adding an audio track to a muxer
#[derive(Debug, Clone)]
pub struct AudioTrackConfig {
  pub codec: AudioCodec,
  pub sample_rate: u32,
  pub number_of_channels: u32,
  /// Decoder configuration from the encoder (esds payload, Opus head, ...)
  pub description: Option<Bytes>,
}

impl AudioTrackConfig {
  pub fn new(codec: AudioCodec, sample_rate: u32, number_of_channels: u32) -> Self {
    Self {
      codec,
      sample_rate,
      number_of_channels,
      description: None,
    }
  }

  pub fn with_description(mut self, description: Bytes) -> Self {
    self.description = Some(description);
    self
  }
}
