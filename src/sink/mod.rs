//! Back-pressured packet and sample iterators
//!
//! [`PacketSink`] streams encoded packets out of a demuxer through a pump
//! task bounded by an adaptive queue; [`MediaSampleSink`] drives a decoder
//! wrapper to turn packet ranges or timestamp lists into decoded samples.

pub mod packet_sink;
pub mod sample_sink;

pub use packet_sink::{PacketIter, PacketSink};
pub use sample_sink::{
  AudioSampleSink, MediaSampleSink, SampleDecoder, SampleRangeIter, SampleTimestampIter,
  VideoSampleSink,
};

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::demux::Demuxer;

/// A demuxer shared between sinks and the conversion pipeline.
///
/// Demuxer state is single-owner behind an async mutex: suspension happens
/// at reader I/O, and every sink call holds the lock for exactly one
/// retrieval step.
pub type SharedDemuxer = Arc<Mutex<Demuxer>>;

/// Wrap a demuxer for sink construction
pub fn share_demuxer(demuxer: Demuxer) -> SharedDemuxer {
  Arc::new(Mutex::new(demuxer))
}
