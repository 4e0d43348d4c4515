//! Container muxers
//!
//! Stateful writers that accept ordered encoded packets per track, keep
//! per-track timing tables, group packets into chunks/fragments/clusters,
//! and emit a container file through a [`Writer`](crate::io::Writer).

pub mod isobmff;
pub mod matroska;

pub use isobmff::{Mp4LayoutMode, Mp4Muxer, Mp4MuxerOptions};
pub use matroska::{MatroskaMuxer, MatroskaMuxerOptions, MatroskaVariant};

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::packet::PacketType;

/// Chunk duration threshold for non-fragmented layouts, seconds
pub(crate) const CHUNK_DURATION: f64 = 0.5;
/// Chunk duration threshold for fragmented/cluster layouts, seconds
pub(crate) const FRAGMENT_DURATION: f64 = 1.0;

/// Muxer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxerState {
  /// Initial state, tracks can be added
  ConfiguringTracks,
  /// First packet accepted, header committed
  Muxing,
  /// Finalized, no more operations allowed
  Finalized,
}

/// Per-packet timing record owned by a muxer track.
///
/// `data` is released once the containing chunk is flushed; the timing
/// metadata stays for index writing.
#[derive(Debug, Clone)]
pub(crate) struct SampleEntry {
  pub presentation_timestamp: f64,
  pub decode_timestamp: f64,
  pub duration: f64,
  pub data: Option<Bytes>,
  pub size: usize,
  pub packet_type: PacketType,
  /// Delta to the following sample in track timescale units, fixed
  /// retroactively when the next packet arrives. Falls back to the sample's
  /// own duration for the last sample of a track.
  pub timescale_units_to_next_sample: Option<u32>,
}

/// Per-track timestamp admission.
///
/// The first decode timestamp becomes the track's zero; regressions are
/// rejected. Packets arrive in decode order: decode timestamps equal
/// presentation timestamps until an out-of-order presentation timestamp
/// arrives on a delta packet (B-frames), after which the decode clock
/// advances by packet durations and the skew goes into composition offsets.
/// Key packets are never reordered, so a key packet with a backwards
/// presentation timestamp is a hard ordering violation.
#[derive(Debug, Default)]
pub(crate) struct TimestampAdmitter {
  zero: Option<f64>,
  last_decode_timestamp: f64,
  last_duration: f64,
  reordered: bool,
}

impl TimestampAdmitter {
  /// Normalize a packet's timestamps against the track zero.
  /// Returns `(presentation_timestamp, decode_timestamp)` in seconds.
  pub fn admit(
    &mut self,
    track_id: u32,
    timestamp: f64,
    duration: f64,
    packet_type: PacketType,
  ) -> Result<(f64, f64)> {
    let Some(zero) = self.zero else {
      self.zero = Some(timestamp);
      self.last_decode_timestamp = 0.0;
      self.last_duration = duration;
      return Ok((0.0, 0.0));
    };

    let pts = timestamp - zero;
    let dts = if self.reordered || pts < self.last_decode_timestamp {
      if packet_type.is_key() && pts < self.last_decode_timestamp {
        return Err(Error::UnorderedTimestamp {
          track_id,
          timestamp: pts,
          previous: self.last_decode_timestamp,
        });
      }
      self.reordered = true;
      self.last_decode_timestamp + self.last_duration
    } else {
      pts
    };

    if dts < 0.0 {
      return Err(Error::UnorderedTimestamp {
        track_id,
        timestamp: dts,
        previous: 0.0,
      });
    }
    self.last_decode_timestamp = dts;
    self.last_duration = duration;
    Ok((pts, dts))
  }

  pub fn has_samples(&self) -> bool {
    self.zero.is_some()
  }
}

/// Round a seconds value into timescale ticks
pub(crate) fn to_timescale(seconds: f64, timescale: u32) -> i64 {
  (seconds * f64::from(timescale)).round() as i64
}
