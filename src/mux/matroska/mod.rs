//! Matroska/WebM muxing

pub mod ebml;
pub mod muxer;

pub use muxer::{MatroskaMuxer, MatroskaMuxerOptions, MatroskaVariant};
