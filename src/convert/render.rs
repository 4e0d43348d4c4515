//! Frame rendering for the conversion slow path
//!
//! Bakes rotation and resize/fit into decoded RGBA frames before re-encode.
//! Scaling goes through `fast_image_resize`; rotation is a pixel remap.

use bytes::Bytes;
use fast_image_resize as fir;

use crate::error::{Error, Result};
use crate::sample::VideoSample;
use crate::track::Rotation;

/// How a source frame maps onto a differently-shaped target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fit {
  /// Stretch to the target, ignoring aspect ratio
  #[default]
  Fill,
  /// Scale to fit inside the target, padding with black
  Contain,
  /// Scale to cover the target, cropping the overflow
  Cover,
}

/// Renders decoded frames to the output geometry
pub struct FrameRenderer {
  target_width: u32,
  target_height: u32,
  fit: Fit,
  rotation: Rotation,
  resizer: fir::Resizer,
}

impl FrameRenderer {
  pub fn new(target_width: u32, target_height: u32, fit: Fit, rotation: Rotation) -> Self {
    Self {
      target_width,
      target_height,
      fit,
      rotation,
      resizer: fir::Resizer::new(),
    }
  }

  /// Render one frame: rotate, then scale per the fit policy
  pub fn render(&mut self, sample: &VideoSample) -> Result<VideoSample> {
    if sample.data.len() < sample.expected_len() {
      return Err(Error::invalid(format!(
        "frame buffer holds {} bytes, expected {}",
        sample.data.len(),
        sample.expected_len()
      )));
    }

    let (rotated, width, height) = rotate_rgba(
      &sample.data,
      sample.coded_width,
      sample.coded_height,
      self.rotation,
    );

    let data = if width == self.target_width && height == self.target_height {
      rotated
    } else {
      self.scale(&rotated, width, height)?
    };

    Ok(VideoSample {
      data: Bytes::from(data),
      coded_width: self.target_width,
      coded_height: self.target_height,
      timestamp: sample.timestamp,
      duration: sample.duration,
    })
  }

  fn scale(&mut self, rgba: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let src = fir::images::Image::from_vec_u8(width, height, rgba.to_vec(), fir::PixelType::U8x4)
      .map_err(|e| Error::invalid(format!("bad frame geometry: {e}")))?;

    match self.fit {
      Fit::Fill => {
        let mut dst =
          fir::images::Image::new(self.target_width, self.target_height, fir::PixelType::U8x4);
        self
          .resizer
          .resize(&src, &mut dst, None)
          .map_err(|e| Error::invalid(format!("resize failed: {e}")))?;
        Ok(dst.into_vec())
      }
      Fit::Cover => {
        // Crop the source to the target aspect, centered, then fill
        let src_aspect = f64::from(width) / f64::from(height);
        let dst_aspect = f64::from(self.target_width) / f64::from(self.target_height);
        let (crop_w, crop_h) = if src_aspect > dst_aspect {
          (f64::from(height) * dst_aspect, f64::from(height))
        } else {
          (f64::from(width), f64::from(width) / dst_aspect)
        };
        let left = (f64::from(width) - crop_w) / 2.0;
        let top = (f64::from(height) - crop_h) / 2.0;
        let mut dst =
          fir::images::Image::new(self.target_width, self.target_height, fir::PixelType::U8x4);
        let options = fir::ResizeOptions::new().crop(left, top, crop_w, crop_h);
        self
          .resizer
          .resize(&src, &mut dst, Some(&options))
          .map_err(|e| Error::invalid(format!("resize failed: {e}")))?;
        Ok(dst.into_vec())
      }
      Fit::Contain => {
        // Scale to fit inside, then blit centered onto black
        let scale = (f64::from(self.target_width) / f64::from(width))
          .min(f64::from(self.target_height) / f64::from(height));
        let scaled_w = ((f64::from(width) * scale).round() as u32).max(1);
        let scaled_h = ((f64::from(height) * scale).round() as u32).max(1);
        let mut scaled = fir::images::Image::new(scaled_w, scaled_h, fir::PixelType::U8x4);
        self
          .resizer
          .resize(&src, &mut scaled, None)
          .map_err(|e| Error::invalid(format!("resize failed: {e}")))?;

        let mut out = vec![0u8; self.target_width as usize * self.target_height as usize * 4];
        let x0 = ((self.target_width - scaled_w) / 2) as usize;
        let y0 = ((self.target_height - scaled_h) / 2) as usize;
        let scaled_bytes = scaled.buffer();
        let dst_stride = self.target_width as usize * 4;
        let src_stride = scaled_w as usize * 4;
        for row in 0..scaled_h as usize {
          let dst_off = (y0 + row) * dst_stride + x0 * 4;
          out[dst_off..dst_off + src_stride]
            .copy_from_slice(&scaled_bytes[row * src_stride..(row + 1) * src_stride]);
        }
        Ok(out)
      }
    }
  }
}

/// Rotate a packed RGBA buffer clockwise; returns the rotated buffer and its
/// dimensions
pub fn rotate_rgba(rgba: &[u8], width: u32, height: u32, rotation: Rotation) -> (Vec<u8>, u32, u32) {
  let w = width as usize;
  let h = height as usize;
  match rotation {
    Rotation::None => (rgba[..w * h * 4].to_vec(), width, height),
    Rotation::Clockwise180 => {
      let mut out = vec![0u8; w * h * 4];
      for y in 0..h {
        for x in 0..w {
          let src = ((h - 1 - y) * w + (w - 1 - x)) * 4;
          let dst = (y * w + x) * 4;
          out[dst..dst + 4].copy_from_slice(&rgba[src..src + 4]);
        }
      }
      (out, width, height)
    }
    Rotation::Clockwise90 => {
      let mut out = vec![0u8; w * h * 4];
      let (new_w, new_h) = (h, w);
      for y in 0..new_h {
        for x in 0..new_w {
          let sx = y;
          let sy = h - 1 - x;
          let src = (sy * w + sx) * 4;
          let dst = (y * new_w + x) * 4;
          out[dst..dst + 4].copy_from_slice(&rgba[src..src + 4]);
        }
      }
      (out, new_w as u32, new_h as u32)
    }
    Rotation::Clockwise270 => {
      let mut out = vec![0u8; w * h * 4];
      let (new_w, new_h) = (h, w);
      for y in 0..new_h {
        for x in 0..new_w {
          let sx = w - 1 - y;
          let sy = x;
          let src = (sy * w + sx) * 4;
          let dst = (y * new_w + x) * 4;
          out[dst..dst + 4].copy_from_slice(&rgba[src..src + 4]);
        }
      }
      (out, new_w as u32, new_h as u32)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn frame(width: u32, height: u32, pixels: &[u32]) -> VideoSample {
    let mut data = Vec::with_capacity(pixels.len() * 4);
    for &p in pixels {
      data.extend_from_slice(&p.to_be_bytes());
    }
    VideoSample {
      data: Bytes::from(data),
      coded_width: width,
      coded_height: height,
      timestamp: 0.0,
      duration: 1.0 / 30.0,
    }
  }

  fn pixel(data: &[u8], stride: u32, x: u32, y: u32) -> u32 {
    let off = ((y * stride + x) * 4) as usize;
    u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
  }

  #[test]
  fn test_rotate_90_moves_top_left_to_top_right() {
    // 2x3 frame, distinct pixels
    let pixels: Vec<u32> = (0..6).collect();
    let f = frame(2, 3, &pixels);
    let (out, w, h) = rotate_rgba(&f.data, 2, 3, Rotation::Clockwise90);
    assert_eq!((w, h), (3, 2));
    // src (0,0) lands at (new_w-1, 0)
    assert_eq!(pixel(&out, 3, 2, 0), 0);
    // src (1,2) (bottom-right) lands at (0, 1)
    assert_eq!(pixel(&out, 3, 0, 1), 5);
  }

  #[test]
  fn test_rotate_180() {
    let pixels: Vec<u32> = (0..4).collect();
    let f = frame(2, 2, &pixels);
    let (out, _, _) = rotate_rgba(&f.data, 2, 2, Rotation::Clockwise180);
    assert_eq!(pixel(&out, 2, 0, 0), 3);
    assert_eq!(pixel(&out, 2, 1, 1), 0);
  }

  #[test]
  fn test_render_fill_resizes() {
    let pixels = vec![0xFF00_00FFu32; 16];
    let f = frame(4, 4, &pixels);
    let mut renderer = FrameRenderer::new(2, 2, Fit::Fill, Rotation::None);
    let out = renderer.render(&f).unwrap();
    assert_eq!((out.coded_width, out.coded_height), (2, 2));
    assert_eq!(out.data.len(), 16);
    assert_eq!(pixel(&out.data, 2, 0, 0), 0xFF00_00FF);
  }

  #[test]
  fn test_render_contain_letterboxes() {
    // 4x2 source into 4x4 target: rows 0 and 3 stay black
    let pixels = vec![0xFFFF_FFFFu32; 8];
    let f = frame(4, 2, &pixels);
    let mut renderer = FrameRenderer::new(4, 4, Fit::Contain, Rotation::None);
    let out = renderer.render(&f).unwrap();
    assert_eq!(pixel(&out.data, 4, 0, 0), 0);
    assert_eq!(pixel(&out.data, 4, 0, 1), 0xFFFF_FFFF);
    assert_eq!(pixel(&out.data, 4, 3, 3), 0);
  }

  #[test]
  fn test_render_rotation_swaps_target_dims() {
    let pixels = vec![0x1122_3344u32; 12];
    let f = frame(4, 3, &pixels);
    // Rotated 90°, a 4x3 frame becomes 3x4; rendering to 3x4 is a no-scale
    let mut renderer = FrameRenderer::new(3, 4, Fit::Fill, Rotation::Clockwise90);
    let out = renderer.render(&f).unwrap();
    assert_eq!((out.coded_width, out.coded_height), (3, 4));
  }
}
