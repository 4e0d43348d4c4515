//! ISO-BMFF (MP4/MOV) muxing

pub mod boxes;
pub mod muxer;

pub use muxer::{Mp4LayoutMode, Mp4Muxer, Mp4MuxerOptions};
