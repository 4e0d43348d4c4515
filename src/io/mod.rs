//! Reader/Writer I/O layer
//!
//! Demuxers read through a caching, range-addressable [`Reader`] over an
//! abstract [`Source`]; muxers write through one of three [`Writer`]
//! variants sharing a single seekable contract.

pub mod reader;
pub mod source;
pub mod writer;

pub use reader::{Reader, ReaderOptions};
pub use source::{BufferSource, FileSource, Source};
pub use writer::{BufferWriter, ChunkedStreamWriter, StreamWriter, Writer};
