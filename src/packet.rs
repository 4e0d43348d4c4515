//! Encoded packet type shared by muxers, demuxers, and sinks
//!
//! A packet is a timestamped, sized byte buffer produced by an encoder or
//! read out of a container. Within one track `sequence_number` strictly
//! orders decode; `timestamp` orders presentation and may run out of order
//! for B-frames.

use bytes::Bytes;

/// Whether a packet can be decoded standalone or depends on earlier packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
  /// Decodable without reference to any previous packet
  Key,
  /// Depends on one or more previous packets
  Delta,
}

impl PacketType {
  pub fn is_key(&self) -> bool {
    matches!(self, PacketType::Key)
  }
}

/// An encoded, timestamped unit of media data
#[derive(Debug, Clone)]
pub struct EncodedPacket {
  /// Encoded payload. Empty for metadata-only retrievals; `byte_length`
  /// still reports the real payload size in that case.
  pub data: Bytes,
  /// Key or delta
  pub packet_type: PacketType,
  /// Presentation timestamp in seconds. May be negative before a track's
  /// start offset is applied.
  pub timestamp: f64,
  /// Duration in seconds, never negative
  pub duration: f64,
  /// Decode-order index within the track. Strictly increasing and unique.
  pub sequence_number: i64,
  /// Payload size in bytes, valid even when `data` is empty
  pub byte_length: usize,
}

impl EncodedPacket {
  /// Create a packet whose `byte_length` matches its payload
  pub fn new(
    data: Bytes,
    packet_type: PacketType,
    timestamp: f64,
    duration: f64,
    sequence_number: i64,
  ) -> Self {
    let byte_length = data.len();
    Self {
      data,
      packet_type,
      timestamp,
      duration,
      sequence_number,
      byte_length,
    }
  }

  /// Create a metadata-only packet: real size, no payload bytes
  pub fn metadata_only(
    byte_length: usize,
    packet_type: PacketType,
    timestamp: f64,
    duration: f64,
    sequence_number: i64,
  ) -> Self {
    Self {
      data: Bytes::new(),
      packet_type,
      timestamp,
      duration,
      sequence_number,
      byte_length,
    }
  }

  /// Whether this packet carries payload bytes
  pub fn has_data(&self) -> bool {
    !self.data.is_empty() || self.byte_length == 0
  }

  pub fn is_key(&self) -> bool {
    self.packet_type.is_key()
  }

  /// Presentation end timestamp in seconds
  pub fn end_timestamp(&self) -> f64 {
    self.timestamp + self.duration
  }

  /// Timestamp in microseconds, the resolution WebCodecs-style engines use
  pub fn timestamp_micros(&self) -> i64 {
    (self.timestamp * 1_000_000.0).round() as i64
  }

  /// Duration in microseconds
  pub fn duration_micros(&self) -> i64 {
    (self.duration * 1_000_000.0).round() as i64
  }
}
