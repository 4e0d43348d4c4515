//! Codec identifiers and codec-by-codec dispatch
//!
//! Containers accept codecs by identity, engines are registered per codec,
//! and codec strings (the WebCodecs/MSE form) are derived in
//! [`strings`](crate::codecs::strings).

pub mod decoder;
pub mod encoder;
pub mod pcm;
pub mod strings;

pub use decoder::{
  AudioDecoder, AudioDecoderWrapper, DecoderRegistry, VideoDecoder, VideoDecoderWrapper,
};
pub use encoder::{AudioEncoder, EncoderRegistry, VideoEncoder};
pub use pcm::PcmDecoder;

/// Video codec identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
  /// H.264 / AVC
  Avc,
  /// H.265 / HEVC
  Hevc,
  Vp8,
  Vp9,
  Av1,
}

impl VideoCodec {
  /// Short lowercase name used in error messages and registry lookups
  pub fn name(&self) -> &'static str {
    match self {
      VideoCodec::Avc => "avc",
      VideoCodec::Hevc => "hevc",
      VideoCodec::Vp8 => "vp8",
      VideoCodec::Vp9 => "vp9",
      VideoCodec::Av1 => "av1",
    }
  }
}

impl std::fmt::Display for VideoCodec {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.name())
  }
}

/// Audio codec identity, including the raw PCM variants containers carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioCodec {
  Aac,
  Opus,
  Vorbis,
  Mp3,
  Flac,
  /// Unsigned 8-bit PCM
  PcmU8,
  /// Signed 16-bit little-endian PCM
  PcmS16,
  /// Signed 16-bit big-endian PCM
  PcmS16Be,
  /// Signed 24-bit little-endian PCM
  PcmS24,
  /// Signed 24-bit big-endian PCM
  PcmS24Be,
  /// Signed 32-bit little-endian PCM
  PcmS32,
  /// Signed 32-bit big-endian PCM
  PcmS32Be,
  /// 32-bit float little-endian PCM
  PcmF32,
  /// 32-bit float big-endian PCM
  PcmF32Be,
  /// 8-bit µ-law companded PCM
  PcmMulaw,
  /// 8-bit A-law companded PCM
  PcmAlaw,
}

impl AudioCodec {
  pub fn name(&self) -> &'static str {
    match self {
      AudioCodec::Aac => "aac",
      AudioCodec::Opus => "opus",
      AudioCodec::Vorbis => "vorbis",
      AudioCodec::Mp3 => "mp3",
      AudioCodec::Flac => "flac",
      AudioCodec::PcmU8 => "pcm-u8",
      AudioCodec::PcmS16 => "pcm-s16",
      AudioCodec::PcmS16Be => "pcm-s16be",
      AudioCodec::PcmS24 => "pcm-s24",
      AudioCodec::PcmS24Be => "pcm-s24be",
      AudioCodec::PcmS32 => "pcm-s32",
      AudioCodec::PcmS32Be => "pcm-s32be",
      AudioCodec::PcmF32 => "pcm-f32",
      AudioCodec::PcmF32Be => "pcm-f32be",
      AudioCodec::PcmMulaw => "ulaw",
      AudioCodec::PcmAlaw => "alaw",
    }
  }

  /// Whether this codec is an uncompressed PCM variant
  pub fn is_pcm(&self) -> bool {
    !matches!(
      self,
      AudioCodec::Aac | AudioCodec::Opus | AudioCodec::Vorbis | AudioCodec::Mp3 | AudioCodec::Flac
    )
  }

  /// Bytes per PCM sample, `None` for compressed codecs
  pub fn pcm_sample_size(&self) -> Option<usize> {
    match self {
      AudioCodec::PcmU8 | AudioCodec::PcmMulaw | AudioCodec::PcmAlaw => Some(1),
      AudioCodec::PcmS16 | AudioCodec::PcmS16Be => Some(2),
      AudioCodec::PcmS24 | AudioCodec::PcmS24Be => Some(3),
      AudioCodec::PcmS32 | AudioCodec::PcmS32Be | AudioCodec::PcmF32 | AudioCodec::PcmF32Be => {
        Some(4)
      }
      _ => None,
    }
  }

  /// Whether the PCM variant is big-endian
  pub fn pcm_is_big_endian(&self) -> bool {
    matches!(
      self,
      AudioCodec::PcmS16Be | AudioCodec::PcmS24Be | AudioCodec::PcmS32Be | AudioCodec::PcmF32Be
    )
  }
}

impl std::fmt::Display for AudioCodec {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.name())
  }
}

/// Either half of the codec space, for error reporting and registries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaCodec {
  Video(VideoCodec),
  Audio(AudioCodec),
}

impl std::fmt::Display for MediaCodec {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      MediaCodec::Video(c) => c.fmt(f),
      MediaCodec::Audio(c) => c.fmt(f),
    }
  }
}

/// Matroska codec ids (`CODEC_STRING_MAP`)
pub fn matroska_codec_id_video(codec: VideoCodec) -> &'static str {
  match codec {
    VideoCodec::Avc => "V_MPEG4/ISO/AVC",
    VideoCodec::Hevc => "V_MPEGH/ISO/HEVC",
    VideoCodec::Vp8 => "V_VP8",
    VideoCodec::Vp9 => "V_VP9",
    VideoCodec::Av1 => "V_AV1",
  }
}

/// Matroska codec ids for audio; `None` when Matroska has no id for the codec
pub fn matroska_codec_id_audio(codec: AudioCodec) -> Option<&'static str> {
  Some(match codec {
    AudioCodec::Aac => "A_AAC",
    AudioCodec::Opus => "A_OPUS",
    AudioCodec::Vorbis => "A_VORBIS",
    AudioCodec::Mp3 => "A_MPEG/L3",
    AudioCodec::Flac => "A_FLAC",
    AudioCodec::PcmU8 | AudioCodec::PcmS16 | AudioCodec::PcmS24 | AudioCodec::PcmS32 => {
      "A_PCM/INT/LIT"
    }
    AudioCodec::PcmS16Be | AudioCodec::PcmS24Be | AudioCodec::PcmS32Be => "A_PCM/INT/BIG",
    AudioCodec::PcmF32 => "A_PCM/FLOAT/IEEE",
    AudioCodec::PcmF32Be | AudioCodec::PcmMulaw | AudioCodec::PcmAlaw => return None,
  })
}

/// Map a Matroska codec id back to a video codec
pub fn video_codec_from_matroska_id(id: &str) -> Option<VideoCodec> {
  Some(match id {
    "V_MPEG4/ISO/AVC" => VideoCodec::Avc,
    "V_MPEGH/ISO/HEVC" => VideoCodec::Hevc,
    "V_VP8" => VideoCodec::Vp8,
    "V_VP9" => VideoCodec::Vp9,
    "V_AV1" => VideoCodec::Av1,
    _ => return None,
  })
}

/// Map a Matroska codec id back to an audio codec. PCM ids need the track's
/// bit depth to pick the exact variant.
pub fn audio_codec_from_matroska_id(id: &str, bit_depth: Option<u32>) -> Option<AudioCodec> {
  Some(match id {
    "A_AAC" => AudioCodec::Aac,
    "A_OPUS" => AudioCodec::Opus,
    "A_VORBIS" => AudioCodec::Vorbis,
    "A_MPEG/L3" => AudioCodec::Mp3,
    "A_FLAC" => AudioCodec::Flac,
    "A_PCM/INT/LIT" => match bit_depth {
      Some(8) => AudioCodec::PcmU8,
      Some(24) => AudioCodec::PcmS24,
      Some(32) => AudioCodec::PcmS32,
      _ => AudioCodec::PcmS16,
    },
    "A_PCM/INT/BIG" => match bit_depth {
      Some(24) => AudioCodec::PcmS24Be,
      Some(32) => AudioCodec::PcmS32Be,
      _ => AudioCodec::PcmS16Be,
    },
    "A_PCM/FLOAT/IEEE" => AudioCodec::PcmF32,
    _ => return None,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_pcm_classification() {
    assert!(AudioCodec::PcmS16.is_pcm());
    assert!(AudioCodec::PcmMulaw.is_pcm());
    assert!(!AudioCodec::Aac.is_pcm());
    assert_eq!(AudioCodec::PcmS24Be.pcm_sample_size(), Some(3));
    assert!(AudioCodec::PcmS24Be.pcm_is_big_endian());
    assert_eq!(AudioCodec::Opus.pcm_sample_size(), None);
  }

  #[test]
  fn test_matroska_codec_id_round_trip() {
    for codec in [
      VideoCodec::Avc,
      VideoCodec::Hevc,
      VideoCodec::Vp8,
      VideoCodec::Vp9,
      VideoCodec::Av1,
    ] {
      let id = matroska_codec_id_video(codec);
      assert_eq!(video_codec_from_matroska_id(id), Some(codec));
    }
    assert_eq!(
      audio_codec_from_matroska_id("A_PCM/INT/LIT", Some(8)),
      Some(AudioCodec::PcmU8)
    );
    assert_eq!(
      audio_codec_from_matroska_id("A_PCM/INT/BIG", Some(16)),
      Some(AudioCodec::PcmS16Be)
    );
  }

  #[test]
  fn test_mulaw_has_no_matroska_id() {
    assert_eq!(matroska_codec_id_audio(AudioCodec::PcmMulaw), None);
  }
}
