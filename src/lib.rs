#![deny(clippy::all)]

//! In-process media container toolkit
//!
//! Muxes encoded audio/video packets into ISO-BMFF (MP4/MOV) and Matroska
//! (MKV/WebM) files, demuxes ISO-BMFF, Matroska, and RIFF/AVI back into
//! packets, and orchestrates conversion pipelines that copy or transcode
//! between formats with optional audio resampling, video resize/rotate, and
//! time-range trimming.
//!
//! Encoder and decoder engines are external: implement the traits in
//! [`codecs`] and register them; the built-in PCM decoder covers raw audio.

// Byte-format primitives and container state machines
pub mod demux;
pub mod mux;

// I/O layer: cached range reader, seekable/streaming writers
pub mod io;

// Data model
pub mod packet;
pub mod sample;
pub mod track;

// Codec interfaces, wrappers, codec strings
pub mod codecs;

// Back-pressured packet/sample iteration
pub mod sink;

// Audio resampling
pub mod resample;

// Conversion pipeline
pub mod convert;

pub mod error;

// Re-export the API surface at the crate root
pub use codecs::{
  decoder::{
    AudioDecoder, AudioDecoderConfig, AudioDecoderWrapper, DecoderRegistry, VideoDecoder,
    VideoDecoderConfig, VideoDecoderWrapper,
  },
  encoder::{
    AudioEncoder, AudioEncoderConfig, EncoderRegistry, VideoEncoder, VideoEncoderConfig,
  },
  pcm::PcmDecoder,
  AudioCodec, MediaCodec, VideoCodec,
};
pub use convert::{
  AudioConversionOptions, CancelHandle, Conversion, ConversionOptions, ConversionResult,
  DiscardReason, DiscardedTrack, Fit, FrameRenderer, OutputFormat, TrackSynchronizer,
  VideoConversionOptions,
};
pub use demux::{
  Demuxer, InputFormat, IsobmffDemuxer, MatroskaDemuxer, PacketRetrievalOptions, RiffDemuxer,
};
pub use error::{Error, Result};
pub use io::{
  BufferSource, BufferWriter, ChunkedStreamWriter, FileSource, Reader, ReaderOptions, Source,
  StreamWriter, Writer,
};
pub use mux::{
  MatroskaMuxer, MatroskaMuxerOptions, MatroskaVariant, Mp4LayoutMode, Mp4Muxer, Mp4MuxerOptions,
  MuxerState,
};
pub use packet::{EncodedPacket, PacketType};
pub use resample::AudioResampler;
pub use sample::{AudioSample, AudioSampleFormat, VideoSample};
pub use sink::{
  share_demuxer, AudioSampleSink, MediaSampleSink, PacketIter, PacketSink, SampleRangeIter,
  SampleTimestampIter, SharedDemuxer, VideoSampleSink,
};
pub use track::{
  AudioTrackConfig, AudioTrackInfo, Rotation, TrackInfo, VideoTrackConfig, VideoTrackInfo,
};
