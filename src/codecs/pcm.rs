//! Built-in PCM decoder
//!
//! Synchronously converts raw PCM packet bytes into one of the canonical
//! output formats (u8 / s16 / s32 / f32, chosen by sample size and type,
//! with µ-law and A-law expansion for 1-byte streams). Keeps its own precise
//! running timestamp so packets whose recorded timestamps drift off
//! integer-sample boundaries still produce contiguous output.

use bytes::Bytes;

use crate::codecs::decoder::{AudioDecoder, AudioDecoderConfig};
use crate::codecs::AudioCodec;
use crate::error::{Error, Result};
use crate::packet::EncodedPacket;
use crate::sample::{AudioSample, AudioSampleFormat};

/// Resync to the packet's recorded timestamp when it strays this far from
/// the running clock (a seek, not drift)
const RESYNC_THRESHOLD: f64 = 0.05;

/// G.711 µ-law expansion
fn mulaw_to_linear(value: u8) -> i16 {
  let u = !value;
  let mut t = i32::from(u & 0x0F) << 3 | 0x84;
  t <<= (u >> 4) & 0x07;
  if u & 0x80 != 0 {
    (0x84 - t) as i16
  } else {
    (t - 0x84) as i16
  }
}

/// G.711 A-law expansion
fn alaw_to_linear(value: u8) -> i16 {
  let a = value ^ 0x55;
  let mut t = i32::from(a & 0x0F) << 4;
  let seg = (a >> 4) & 0x07;
  match seg {
    0 => t += 8,
    1 => t += 0x108,
    _ => {
      t += 0x108;
      t <<= seg - 1;
    }
  }
  if a & 0x80 != 0 {
    t as i16
  } else {
    (-t) as i16
  }
}

/// Synchronous PCM-to-canonical-format decoder
pub struct PcmDecoder {
  codec: AudioCodec,
  sample_rate: u32,
  number_of_channels: u32,
  next_timestamp: Option<f64>,
}

impl PcmDecoder {
  pub fn new() -> Self {
    Self {
      codec: AudioCodec::PcmS16,
      sample_rate: 0,
      number_of_channels: 0,
      next_timestamp: None,
    }
  }

  /// Canonical output format for a PCM variant
  pub fn output_format(codec: AudioCodec) -> AudioSampleFormat {
    match codec {
      AudioCodec::PcmU8 => AudioSampleFormat::U8,
      AudioCodec::PcmS16 | AudioCodec::PcmS16Be | AudioCodec::PcmMulaw | AudioCodec::PcmAlaw => {
        AudioSampleFormat::S16
      }
      AudioCodec::PcmS24 | AudioCodec::PcmS24Be | AudioCodec::PcmS32 | AudioCodec::PcmS32Be => {
        AudioSampleFormat::S32
      }
      _ => AudioSampleFormat::F32,
    }
  }

  fn convert(&self, data: &Bytes) -> Result<(Bytes, u32)> {
    let sample_size = self
      .codec
      .pcm_sample_size()
      .ok_or_else(|| Error::invalid(format!("{} is not a PCM codec", self.codec)))?;
    let channels = self.number_of_channels.max(1) as usize;
    let sample_count = data.len() / sample_size;
    let frames = (sample_count / channels) as u32;
    let big = self.codec.pcm_is_big_endian();

    let out: Vec<u8> = match self.codec {
      AudioCodec::PcmU8 => data.to_vec(),
      AudioCodec::PcmMulaw => data
        .iter()
        .flat_map(|&b| mulaw_to_linear(b).to_le_bytes())
        .collect(),
      AudioCodec::PcmAlaw => data
        .iter()
        .flat_map(|&b| alaw_to_linear(b).to_le_bytes())
        .collect(),
      AudioCodec::PcmS16 | AudioCodec::PcmS16Be => data
        .chunks_exact(2)
        .flat_map(|c| {
          let v = if big {
            i16::from_be_bytes([c[0], c[1]])
          } else {
            i16::from_le_bytes([c[0], c[1]])
          };
          v.to_le_bytes()
        })
        .collect(),
      AudioCodec::PcmS24 | AudioCodec::PcmS24Be => data
        .chunks_exact(3)
        .flat_map(|c| {
          let v = if big {
            i32::from_be_bytes([c[0], c[1], c[2], 0]) // sign-extended below
          } else {
            i32::from_le_bytes([0, c[0], c[1], c[2]])
          };
          // 24-bit value sits in the top bytes; arithmetic shift restores sign
          (v >> 8 << 8).to_le_bytes()
        })
        .collect(),
      AudioCodec::PcmS32 | AudioCodec::PcmS32Be => data
        .chunks_exact(4)
        .flat_map(|c| {
          let v = if big {
            i32::from_be_bytes([c[0], c[1], c[2], c[3]])
          } else {
            i32::from_le_bytes([c[0], c[1], c[2], c[3]])
          };
          v.to_le_bytes()
        })
        .collect(),
      AudioCodec::PcmF32 | AudioCodec::PcmF32Be => data
        .chunks_exact(4)
        .flat_map(|c| {
          let v = if big {
            f32::from_be_bytes([c[0], c[1], c[2], c[3]])
          } else {
            f32::from_le_bytes([c[0], c[1], c[2], c[3]])
          };
          v.to_le_bytes()
        })
        .collect(),
      _ => return Err(Error::invalid(format!("{} is not a PCM codec", self.codec))),
    };
    Ok((Bytes::from(out), frames))
  }
}

impl Default for PcmDecoder {
  fn default() -> Self {
    Self::new()
  }
}

impl AudioDecoder for PcmDecoder {
  fn configure(&mut self, config: &AudioDecoderConfig) -> Result<()> {
    if !config.codec.is_pcm() {
      return Err(Error::unsupported(format!(
        "PcmDecoder cannot decode {}",
        config.codec
      )));
    }
    self.codec = config.codec;
    self.sample_rate = config.sample_rate.max(1);
    self.number_of_channels = config.number_of_channels.max(1);
    self.next_timestamp = None;
    Ok(())
  }

  fn decode(&mut self, packet: &EncodedPacket) -> Result<Vec<AudioSample>> {
    let (data, frames) = self.convert(&packet.data)?;
    if frames == 0 {
      return Ok(Vec::new());
    }

    let timestamp = match self.next_timestamp {
      Some(running) if (packet.timestamp - running).abs() < RESYNC_THRESHOLD => running,
      Some(running) => {
        tracing::debug!(
          target: "mediamux::codecs",
          running,
          recorded = packet.timestamp,
          "PCM timestamp discontinuity, resyncing"
        );
        packet.timestamp
      }
      None => packet.timestamp,
    };
    self.next_timestamp = Some(timestamp + f64::from(frames) / f64::from(self.sample_rate));

    Ok(vec![AudioSample {
      data,
      format: Self::output_format(self.codec),
      sample_rate: self.sample_rate,
      number_of_channels: self.number_of_channels,
      number_of_frames: frames,
      timestamp,
    }])
  }

  fn flush(&mut self) -> Result<Vec<AudioSample>> {
    self.next_timestamp = None;
    Ok(Vec::new())
  }

  fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::packet::PacketType;

  fn decoder(codec: AudioCodec, channels: u32) -> PcmDecoder {
    let mut d = PcmDecoder::new();
    d.configure(&AudioDecoderConfig {
      codec,
      sample_rate: 48_000,
      number_of_channels: channels,
      description: None,
    })
    .unwrap();
    d
  }

  fn packet(timestamp: f64, data: Vec<u8>) -> EncodedPacket {
    EncodedPacket::new(Bytes::from(data), PacketType::Key, timestamp, 0.0, 0)
  }

  #[test]
  fn test_s16be_swaps_to_native() {
    let mut d = decoder(AudioCodec::PcmS16Be, 1);
    let out = d
      .decode(&packet(0.0, vec![0x01, 0x02, 0xFF, 0xFE]))
      .unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].format, AudioSampleFormat::S16);
    assert_eq!(out[0].number_of_frames, 2);
    assert_eq!(out[0].data.as_ref(), &[0x02, 0x01, 0xFE, 0xFF]);
  }

  #[test]
  fn test_s24_widens_to_s32() {
    let mut d = decoder(AudioCodec::PcmS24, 1);
    // -1 in 24-bit little-endian
    let out = d.decode(&packet(0.0, vec![0xFF, 0xFF, 0xFF])).unwrap();
    let v = i32::from_le_bytes(out[0].data[..4].try_into().unwrap());
    assert_eq!(v >> 8, -1);
    assert_eq!(out[0].format, AudioSampleFormat::S32);
  }

  #[test]
  fn test_mulaw_silence() {
    let mut d = decoder(AudioCodec::PcmMulaw, 1);
    // 0xFF encodes zero in µ-law
    let out = d.decode(&packet(0.0, vec![0xFF])).unwrap();
    let v = i16::from_le_bytes(out[0].data[..2].try_into().unwrap());
    assert_eq!(v, 0);
  }

  #[test]
  fn test_alaw_known_value() {
    let mut d = decoder(AudioCodec::PcmAlaw, 1);
    // 0x55 (after XOR: 0x00) is the smallest-magnitude negative value
    let out = d.decode(&packet(0.0, vec![0x55])).unwrap();
    let v = i16::from_le_bytes(out[0].data[..2].try_into().unwrap());
    assert_eq!(v, -8);
  }

  #[test]
  fn test_running_timestamp_absorbs_drift() {
    let mut d = decoder(AudioCodec::PcmS16, 2);
    // 480 frames of stereo s16 per packet: 10 ms
    let body = vec![0u8; 480 * 2 * 2];
    let a = d.decode(&packet(0.0, body.clone())).unwrap();
    // Recorded timestamp drifts by 2 ms; running clock wins
    let b = d.decode(&packet(0.012, body.clone())).unwrap();
    assert_eq!(a[0].timestamp, 0.0);
    assert_eq!(b[0].timestamp, 0.01);

    // A seek-sized jump resyncs
    let c = d.decode(&packet(5.0, body)).unwrap();
    assert_eq!(c[0].timestamp, 5.0);
  }
}
