//! Codec string derivation and parsing
//!
//! Derives fully qualified WebCodecs/MSE codec strings (the form DASH/MSE
//! clients consume) from track parameters, and parses such strings back into
//! codec identities. Derivation picks profile/level by resolution class when
//! the bitstream configuration is not available.

use crate::codecs::{AudioCodec, VideoCodec};

/// Parsed codec information extracted from a codec string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedVideoCodec {
  pub codec: VideoCodec,
  /// Profile number (codec-specific interpretation)
  pub profile: Option<u8>,
  /// Level value (codec-specific, often level_idc)
  pub level: Option<u8>,
  /// Bit depth (8, 10, or 12)
  pub bit_depth: Option<u8>,
}

impl ParsedVideoCodec {
  fn new(codec: VideoCodec) -> Self {
    Self {
      codec,
      profile: None,
      level: None,
      bit_depth: None,
    }
  }
}

// ============================================================================
// Outbound derivation
// ============================================================================

/// Derive a fully qualified video codec string from codec + coded size.
///
/// Profile and level are chosen by resolution class: AVC uses baseline/main/
/// high at 66/77/100 with level 41 up to 1080p and 50 above; HEVC uses Main
/// profile with tier `L` up to UHD and `H` above; VP9 and AV1 walk their
/// level ladders by pixel count.
pub fn video_codec_string(codec: VideoCodec, width: u32, height: u32) -> String {
  let pixels = u64::from(width) * u64::from(height);
  match codec {
    VideoCodec::Avc => {
      let profile: u8 = if pixels <= 720 * 576 {
        66 // Baseline
      } else if pixels <= 1280 * 720 {
        77 // Main
      } else {
        100 // High
      };
      let level: u8 = if pixels <= 1920 * 1080 { 41 } else { 50 };
      format!("avc1.{profile:02X}00{level:02X}")
    }
    VideoCodec::Hevc => {
      let level: u16 = if pixels <= 1920 * 1080 {
        123 // 4.1
      } else if pixels <= 3840 * 2160 {
        153 // 5.1
      } else {
        183 // 6.1
      };
      let tier = if pixels <= 3840 * 2160 { 'L' } else { 'H' };
      format!("hev1.1.6.{tier}{level}.B0")
    }
    VideoCodec::Vp8 => "vp8".to_string(),
    VideoCodec::Vp9 => {
      let level: u8 = if pixels <= 320 * 240 {
        10
      } else if pixels <= 640 * 480 {
        21
      } else if pixels <= 1280 * 720 {
        31
      } else if pixels <= 1920 * 1080 {
        40
      } else if pixels <= 2560 * 1440 {
        50
      } else if pixels <= 3840 * 2160 {
        51
      } else {
        62
      };
      format!("vp09.00.{level:02}.08")
    }
    VideoCodec::Av1 => {
      let level: u8 = if pixels <= 854 * 480 {
        4 // 3.0
      } else if pixels <= 1280 * 720 {
        5 // 3.1
      } else if pixels <= 1920 * 1080 {
        8 // 4.0
      } else if pixels <= 3840 * 2160 {
        12 // 5.0
      } else {
        16 // 6.0
      };
      format!("av01.0.{level:02}M.08")
    }
  }
}

/// Derive an audio codec string. AAC picks the SBR/PS object type for
/// low-sample-rate streams; everything else is a bare name.
pub fn audio_codec_string(codec: AudioCodec, sample_rate: u32, channels: u32) -> String {
  match codec {
    AudioCodec::Aac => {
      let object_type = if sample_rate <= 24_000 && channels == 2 {
        29 // HE-AAC v2 (PS)
      } else if sample_rate <= 24_000 {
        5 // HE-AAC (SBR)
      } else {
        2 // AAC-LC
      };
      format!("mp4a.40.{object_type}")
    }
    other => other.name().to_string(),
  }
}

// ============================================================================
// Inbound parsing
// ============================================================================

/// Parse a video codec string into structured information.
///
/// Supported forms: `avc1.PPCCLL` / `avc3.PPCCLL`, `hev1.P.T.Lxxx` /
/// `hvc1.P.T.Lxxx`, `vp09.PP.LL.DD`, `av01.P.LLT.DD`, and the bare names
/// `vp8` / `vp9` / `av1`. Returns `None` for unrecognized strings.
pub fn parse_video_codec_string(codec: &str) -> Option<ParsedVideoCodec> {
  let lower = codec.to_lowercase();

  if lower.starts_with("avc1") || lower.starts_with("avc3") {
    return Some(parse_avc(codec));
  }
  if lower.starts_with("hev1") || lower.starts_with("hvc1") {
    return Some(parse_hevc(codec));
  }
  if lower.starts_with("vp09") {
    return Some(parse_vp9(codec));
  }
  if lower == "vp9" {
    return Some(ParsedVideoCodec::new(VideoCodec::Vp9));
  }
  if lower.starts_with("av01") {
    return Some(parse_av1(codec));
  }
  if lower == "av1" {
    return Some(ParsedVideoCodec::new(VideoCodec::Av1));
  }
  if lower == "vp8" || lower.starts_with("vp08") {
    return Some(ParsedVideoCodec::new(VideoCodec::Vp8));
  }

  None
}

/// Parse an audio codec string into a codec identity
pub fn parse_audio_codec_string(codec: &str) -> Option<AudioCodec> {
  let lower = codec.to_lowercase();
  if lower.starts_with("mp4a.40") || lower == "aac" {
    return Some(AudioCodec::Aac);
  }
  // mp4a.6B / mp4a.69 are MPEG-1/2 audio object ids
  if lower == "mp3" || lower.starts_with("mp4a.6b") || lower.starts_with("mp4a.69") {
    return Some(AudioCodec::Mp3);
  }
  Some(match lower.as_str() {
    "opus" => AudioCodec::Opus,
    "vorbis" => AudioCodec::Vorbis,
    "flac" => AudioCodec::Flac,
    "pcm-u8" => AudioCodec::PcmU8,
    "pcm-s16" => AudioCodec::PcmS16,
    "pcm-s16be" => AudioCodec::PcmS16Be,
    "pcm-s24" => AudioCodec::PcmS24,
    "pcm-s24be" => AudioCodec::PcmS24Be,
    "pcm-s32" => AudioCodec::PcmS32,
    "pcm-s32be" => AudioCodec::PcmS32Be,
    "pcm-f32" => AudioCodec::PcmF32,
    "pcm-f32be" => AudioCodec::PcmF32Be,
    "ulaw" => AudioCodec::PcmMulaw,
    "alaw" => AudioCodec::PcmAlaw,
    _ => return None,
  })
}

/// Parse AVC codec string: avc1.PPCCLL (profile, constraint flags, level_idc)
fn parse_avc(codec: &str) -> ParsedVideoCodec {
  let mut parsed = ParsedVideoCodec::new(VideoCodec::Avc);
  let parts: Vec<&str> = codec.split('.').collect();

  if parts.len() >= 2 && parts[1].len() >= 6 {
    let hex = parts[1];
    if let Ok(profile) = u8::from_str_radix(&hex[0..2], 16) {
      parsed.profile = Some(profile);
    }
    if let Ok(level) = u8::from_str_radix(&hex[4..6], 16) {
      parsed.level = Some(level);
    }
  }
  parsed.bit_depth = Some(8);
  parsed
}

/// Parse HEVC codec string: hev1.P.T.Lxxx.Bx
fn parse_hevc(codec: &str) -> ParsedVideoCodec {
  let mut parsed = ParsedVideoCodec::new(VideoCodec::Hevc);
  let parts: Vec<&str> = codec.split('.').collect();

  if parts.len() >= 2 {
    if let Ok(profile) = parts[1].parse::<u8>() {
      parsed.profile = Some(profile);
      parsed.bit_depth = Some(if profile == 2 { 10 } else { 8 });
    }
  }
  if parts.len() >= 4 {
    let level_str = parts[3];
    if level_str.starts_with('L') || level_str.starts_with('H') {
      if let Ok(level) = level_str[1..].parse::<u8>() {
        parsed.level = Some(level);
      }
    }
  }
  parsed
}

/// Parse VP9 codec string: vp09.PP.LL.DD
fn parse_vp9(codec: &str) -> ParsedVideoCodec {
  let mut parsed = ParsedVideoCodec::new(VideoCodec::Vp9);
  let parts: Vec<&str> = codec.split('.').collect();

  if parts.len() >= 2 {
    parsed.profile = parts[1].parse().ok();
  }
  if parts.len() >= 3 {
    parsed.level = parts[2].parse().ok();
  }
  if parts.len() >= 4 {
    parsed.bit_depth = parts[3].parse().ok();
  }
  parsed
}

/// Parse AV1 codec string: av01.P.LLT.DD
fn parse_av1(codec: &str) -> ParsedVideoCodec {
  let mut parsed = ParsedVideoCodec::new(VideoCodec::Av1);
  let parts: Vec<&str> = codec.split('.').collect();

  if parts.len() >= 2 {
    parsed.profile = parts[1].parse().ok();
  }
  if parts.len() >= 3 {
    let level_str: String = parts[2]
      .chars()
      .take_while(|c| c.is_ascii_digit())
      .collect();
    parsed.level = level_str.parse().ok();
  }
  if parts.len() >= 4 {
    parsed.bit_depth = parts[3].parse().ok();
  }
  parsed
}
