//! Audio resampler
//!
//! Converts decoded audio between sample rates and channel layouts with a
//! five-second sliding output buffer indexed by output frame number. Input
//! samples contribute linearly interpolated, channel-mixed values that
//! accumulate additively, so inputs overlapping at their boundaries sum
//! seamlessly instead of clicking.

use crate::error::{Error, Result};
use crate::sample::AudioSample;

/// Output window length in seconds
const WINDOW_SECONDS: u64 = 5;

/// Audio rate and channel-layout converter
pub struct AudioResampler {
  source_rate: u32,
  source_channels: u32,
  target_rate: u32,
  target_channels: u32,

  /// Interleaved f32 output window
  buffer: Vec<f32>,
  /// Output frame index of `buffer[0]`
  start_frame: i64,
  /// One past the highest output frame written
  end_frame: i64,
  started: bool,
}

impl AudioResampler {
  pub fn new(
    source_rate: u32,
    source_channels: u32,
    target_rate: u32,
    target_channels: u32,
  ) -> Result<Self> {
    if source_rate == 0 || target_rate == 0 || source_channels == 0 || target_channels == 0 {
      return Err(Error::invalid("resampler rates and channel counts must be non-zero"));
    }
    let capacity = (u64::from(target_rate) * WINDOW_SECONDS) as usize * target_channels as usize;
    Ok(Self {
      source_rate,
      source_channels,
      target_rate,
      target_channels,
      buffer: vec![0.0; capacity],
      start_frame: 0,
      end_frame: 0,
      started: false,
    })
  }

  fn window_frames(&self) -> i64 {
    (u64::from(self.target_rate) * WINDOW_SECONDS) as i64
  }

  /// Feed one decoded sample; returns any output samples the window slide
  /// produced
  pub fn add(&mut self, sample: &AudioSample) -> Result<Vec<AudioSample>> {
    if sample.sample_rate != self.source_rate
      || sample.number_of_channels != self.source_channels
    {
      return Err(Error::invalid(format!(
        "resampler fed {} Hz x{} but configured for {} Hz x{}",
        sample.sample_rate, sample.number_of_channels, self.source_rate, self.source_channels
      )));
    }
    let frames = sample.number_of_frames as usize;
    if frames == 0 {
      return Ok(Vec::new());
    }
    let source = sample.to_f32();
    let src_channels = self.source_channels as usize;
    let dst_channels = self.target_channels as usize;
    let target_rate = f64::from(self.target_rate);
    let source_rate = f64::from(self.source_rate);

    // Output frames this input contributes to
    let first_out = (sample.timestamp * target_rate).ceil() as i64;
    let last_out = (sample.end_timestamp() * target_rate).ceil() as i64; // exclusive

    let mut emitted = Vec::new();
    if !self.started {
      self.started = true;
      self.start_frame = first_out;
      self.end_frame = first_out;
    }

    for out_frame in first_out.max(self.start_frame)..last_out {
      if out_frame - self.start_frame >= self.window_frames() {
        if let Some(done) = self.finalize_window(out_frame) {
          emitted.push(done);
        }
      }

      // Fractional source position for this output frame
      let t = out_frame as f64 / target_rate;
      let src_pos = (t - sample.timestamp) * source_rate;
      let lower = src_pos.floor() as isize;
      let frac = (src_pos - src_pos.floor()) as f32;
      let lower = lower.clamp(0, frames as isize - 1) as usize;
      let upper = (lower + 1).min(frames - 1);

      let base = (out_frame - self.start_frame) as usize * dst_channels;
      for dst_ch in 0..dst_channels {
        let a = mix_channel(&source[lower * src_channels..], src_channels, dst_channels, dst_ch);
        let b = mix_channel(&source[upper * src_channels..], src_channels, dst_channels, dst_ch);
        self.buffer[base + dst_ch] += a + (b - a) * frac;
      }
      self.end_frame = self.end_frame.max(out_frame + 1);
    }
    Ok(emitted)
  }

  /// Flush any partially filled window
  pub fn finalize(&mut self) -> Result<Option<AudioSample>> {
    Ok(self.finalize_window(self.end_frame))
  }

  /// Emit the current window contents and slide the window to `next_start`
  fn finalize_window(&mut self, next_start: i64) -> Option<AudioSample> {
    let frames = (self.end_frame - self.start_frame).max(0) as usize;
    let channels = self.target_channels as usize;
    let out = if frames == 0 {
      None
    } else {
      let data = &self.buffer[..frames * channels];
      Some(AudioSample::from_f32(
        data,
        self.target_rate,
        self.target_channels,
        self.start_frame as f64 / f64::from(self.target_rate),
      ))
    };
    self.buffer.fill(0.0);
    self.start_frame = next_start;
    self.end_frame = next_start;
    out
  }
}

/// Mix one source frame into one destination channel using the fixed
/// up/down-mix tables for mono/stereo/quad/5.1; other layouts fall back to
/// positional copy with zero-fill.
fn mix_channel(frame: &[f32], src_channels: usize, dst_channels: usize, dst_ch: usize) -> f32 {
  const SQRT_HALF: f32 = std::f32::consts::FRAC_1_SQRT_2;
  let ch = |i: usize| frame.get(i).copied().unwrap_or(0.0);

  match (src_channels, dst_channels) {
    (a, b) if a == b => ch(dst_ch),

    (1, 2) | (1, 4) => match dst_ch {
      0 | 1 => ch(0),
      _ => 0.0,
    },
    (1, 6) => match dst_ch {
      2 => ch(0), // center
      _ => 0.0,
    },

    (2, 1) => 0.5 * (ch(0) + ch(1)),
    (2, 4) | (2, 6) => match dst_ch {
      0 => ch(0),
      1 => ch(1),
      _ => 0.0,
    },

    (4, 1) => 0.25 * (ch(0) + ch(1) + ch(2) + ch(3)),
    (4, 2) => match dst_ch {
      0 => 0.5 * (ch(0) + ch(2)),
      1 => 0.5 * (ch(1) + ch(3)),
      _ => 0.0,
    },
    (4, 6) => match dst_ch {
      0 => ch(0),
      1 => ch(1),
      4 => ch(2),
      5 => ch(3),
      _ => 0.0,
    },

    // 5.1 order: FL FR C LFE SL SR
    (6, 1) => SQRT_HALF * (ch(0) + ch(1)) + ch(2) + 0.5 * (ch(4) + ch(5)),
    (6, 2) => match dst_ch {
      0 => ch(0) + SQRT_HALF * (ch(2) + ch(4)),
      1 => ch(1) + SQRT_HALF * (ch(2) + ch(5)),
      _ => 0.0,
    },
    (6, 4) => match dst_ch {
      0 => ch(0) + SQRT_HALF * ch(2),
      1 => ch(1) + SQRT_HALF * ch(2),
      2 => ch(4),
      3 => ch(5),
      _ => 0.0,
    },

    // Discrete layouts: positional copy, zero-fill
    _ => {
      if dst_ch < src_channels {
        ch(dst_ch)
      } else {
        0.0
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn mono(timestamp: f64, rate: u32, values: &[f32]) -> AudioSample {
    AudioSample::from_f32(values, rate, 1, timestamp)
  }

  #[test]
  fn test_identity_rate_passthrough() {
    let mut r = AudioResampler::new(48_000, 1, 48_000, 1).unwrap();
    let values: Vec<f32> = (0..480).map(|i| i as f32 / 480.0).collect();
    assert!(r.add(&mono(0.0, 48_000, &values)).unwrap().is_empty());
    let out = r.finalize().unwrap().unwrap();
    assert_eq!(out.number_of_frames, 480);
    let got = out.to_f32();
    for (a, b) in got.iter().zip(&values) {
      assert!((a - b).abs() < 1e-4);
    }
  }

  #[test]
  fn test_rate_doubling_interpolates() {
    let mut r = AudioResampler::new(24_000, 1, 48_000, 1).unwrap();
    // Ramp 0..1 over 4 input frames
    r.add(&mono(0.0, 24_000, &[0.0, 0.25, 0.5, 0.75])).unwrap();
    let out = r.finalize().unwrap().unwrap();
    assert_eq!(out.number_of_frames, 8);
    let got = out.to_f32();
    // Every other output frame lands exactly on an input frame
    assert!((got[0] - 0.0).abs() < 1e-4);
    assert!((got[2] - 0.25).abs() < 1e-4);
    assert!((got[4] - 0.5).abs() < 1e-4);
    // Odd frames are midpoints
    assert!((got[1] - 0.125).abs() < 1e-4);
  }

  #[test]
  fn test_seamless_concatenation() {
    let mut r = AudioResampler::new(48_000, 1, 48_000, 1).unwrap();
    let a: Vec<f32> = vec![0.5; 480];
    let b: Vec<f32> = vec![0.5; 480];
    r.add(&mono(0.0, 48_000, &a)).unwrap();
    r.add(&mono(0.01, 48_000, &b)).unwrap();
    let out = r.finalize().unwrap().unwrap();
    assert_eq!(out.number_of_frames, 960);
    // No discontinuity at the boundary
    let got = out.to_f32();
    assert!(got.iter().all(|v| (v - 0.5).abs() < 1e-4));
  }

  #[test]
  fn test_stereo_downmix_to_mono() {
    let mut r = AudioResampler::new(48_000, 2, 48_000, 1).unwrap();
    let interleaved: Vec<f32> = [0.2f32, 0.6].repeat(480);
    let sample = AudioSample::from_f32(&interleaved, 48_000, 2, 0.0);
    r.add(&sample).unwrap();
    let out = r.finalize().unwrap().unwrap();
    let got = out.to_f32();
    assert!(got.iter().all(|v| (v - 0.4).abs() < 1e-4));
  }

  #[test]
  fn test_mono_upmix_to_5_1_centers() {
    let mut r = AudioResampler::new(48_000, 1, 48_000, 6).unwrap();
    r.add(&mono(0.0, 48_000, &vec![0.8; 48])).unwrap();
    let out = r.finalize().unwrap().unwrap();
    let got = out.to_f32();
    for frame in got.chunks(6) {
      assert!((frame[2] - 0.8).abs() < 1e-4); // center
      assert!(frame[0].abs() < 1e-6 && frame[1].abs() < 1e-6);
    }
  }

  #[test]
  fn test_window_slide_emits() {
    let mut r = AudioResampler::new(8_000, 1, 8_000, 1).unwrap();
    // 6 seconds of input in 1 s chunks: the window slides once
    let mut emitted = Vec::new();
    for i in 0..6 {
      let chunk = vec![0.1f32; 8_000];
      emitted.extend(r.add(&mono(i as f64, 8_000, &chunk)).unwrap());
    }
    emitted.extend(r.finalize().unwrap());
    assert_eq!(emitted.len(), 2);
    assert_eq!(emitted[0].number_of_frames, 40_000);
    assert!((emitted[0].timestamp - 0.0).abs() < 1e-9);
    assert_eq!(emitted[1].number_of_frames, 8_000);
    assert!((emitted[1].timestamp - 5.0).abs() < 1e-9);
  }

  #[test]
  fn test_rejects_mismatched_input() {
    let mut r = AudioResampler::new(48_000, 2, 44_100, 2).unwrap();
    let wrong = mono(0.0, 22_050, &[0.0; 10]);
    assert!(r.add(&wrong).is_err());
  }
}
