//! Decoded sample types
//!
//! A "sample" on this side of the codec boundary is a decoded video frame or
//! a run of decoded audio frames. Samples are plain owned values; dropping
//! one releases its buffer, which is the closing contract sinks document.

use bytes::Bytes;

/// Canonical interleaved audio sample formats produced by decoders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSampleFormat {
  U8,
  S16,
  S32,
  F32,
}

impl AudioSampleFormat {
  pub fn bytes_per_sample(&self) -> usize {
    match self {
      AudioSampleFormat::U8 => 1,
      AudioSampleFormat::S16 => 2,
      AudioSampleFormat::S32 | AudioSampleFormat::F32 => 4,
    }
  }
}

/// A run of decoded, interleaved audio frames
#[derive(Debug, Clone)]
pub struct AudioSample {
  pub data: Bytes,
  pub format: AudioSampleFormat,
  pub sample_rate: u32,
  pub number_of_channels: u32,
  pub number_of_frames: u32,
  /// Presentation timestamp in seconds
  pub timestamp: f64,
}

impl AudioSample {
  pub fn duration(&self) -> f64 {
    f64::from(self.number_of_frames) / f64::from(self.sample_rate.max(1))
  }

  pub fn end_timestamp(&self) -> f64 {
    self.timestamp + self.duration()
  }

  /// Convert to interleaved f32 in [-1, 1]
  pub fn to_f32(&self) -> Vec<f32> {
    let count = self.number_of_frames as usize * self.number_of_channels as usize;
    let mut out = Vec::with_capacity(count);
    match self.format {
      AudioSampleFormat::U8 => {
        for &b in self.data.iter().take(count) {
          out.push((f32::from(b) - 128.0) / 128.0);
        }
      }
      AudioSampleFormat::S16 => {
        for chunk in self.data.chunks_exact(2).take(count) {
          out.push(f32::from(i16::from_le_bytes([chunk[0], chunk[1]])) / 32768.0);
        }
      }
      AudioSampleFormat::S32 => {
        for chunk in self.data.chunks_exact(4).take(count) {
          let v = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
          out.push(v as f32 / 2_147_483_648.0);
        }
      }
      AudioSampleFormat::F32 => {
        for chunk in self.data.chunks_exact(4).take(count) {
          out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
      }
    }
    out
  }

  /// Build a sample from interleaved f32 frames
  pub fn from_f32(
    frames: &[f32],
    sample_rate: u32,
    number_of_channels: u32,
    timestamp: f64,
  ) -> Self {
    let mut data = Vec::with_capacity(frames.len() * 4);
    for &v in frames {
      data.extend_from_slice(&v.to_le_bytes());
    }
    Self {
      data: Bytes::from(data),
      format: AudioSampleFormat::F32,
      sample_rate,
      number_of_channels: number_of_channels.max(1),
      number_of_frames: (frames.len() / number_of_channels.max(1) as usize) as u32,
      timestamp,
    }
  }
}

/// A decoded video frame, packed RGBA
#[derive(Debug, Clone)]
pub struct VideoSample {
  /// Packed RGBA8, `coded_width * coded_height * 4` bytes
  pub data: Bytes,
  pub coded_width: u32,
  pub coded_height: u32,
  /// Presentation timestamp in seconds
  pub timestamp: f64,
  pub duration: f64,
}

impl VideoSample {
  pub fn end_timestamp(&self) -> f64 {
    self.timestamp + self.duration
  }

  /// Expected byte length of the frame buffer
  pub fn expected_len(&self) -> usize {
    self.coded_width as usize * self.coded_height as usize * 4
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_audio_sample_duration() {
    let sample = AudioSample {
      data: Bytes::from(vec![0u8; 4800 * 2 * 4]),
      format: AudioSampleFormat::F32,
      sample_rate: 48_000,
      number_of_channels: 2,
      number_of_frames: 4800,
      timestamp: 1.0,
    };
    assert!((sample.duration() - 0.1).abs() < 1e-9);
    assert!((sample.end_timestamp() - 1.1).abs() < 1e-9);
  }

  #[test]
  fn test_f32_round_trip() {
    let frames = [0.0f32, 0.5, -0.5, 1.0];
    let sample = AudioSample::from_f32(&frames, 48_000, 2, 0.0);
    assert_eq!(sample.number_of_frames, 2);
    assert_eq!(sample.to_f32(), frames);
  }

  #[test]
  fn test_s16_to_f32() {
    let mut data = Vec::new();
    data.extend_from_slice(&0i16.to_le_bytes());
    data.extend_from_slice(&(-32768i16).to_le_bytes());
    let sample = AudioSample {
      data: Bytes::from(data),
      format: AudioSampleFormat::S16,
      sample_rate: 48_000,
      number_of_channels: 1,
      number_of_frames: 2,
      timestamp: 0.0,
    };
    assert_eq!(sample.to_f32(), vec![0.0, -1.0]);
  }
}
