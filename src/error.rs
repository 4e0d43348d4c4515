//! Crate-wide error type
//!
//! One taxonomy shared by muxers, demuxers, sinks, and the conversion
//! pipeline. I/O and codec-engine failures propagate to the awaiting caller;
//! errors raised inside background pump tasks are captured out-of-band and
//! re-raised at the next iterator step.

/// Error type for all mediamux operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// Malformed container, truncated box, impossible field value
  #[error("invalid input: {0}")]
  InvalidInput(String),

  /// Recognized but not implementable (e.g. codec accepted by the container
  /// but no engine registered)
  #[error("unsupported feature: {0}")]
  UnsupportedFeature(String),

  /// Caller supplied a packet whose decode timestamp regressed
  #[error("unordered timestamp on track {track_id}: {timestamp} after {previous}")]
  UnorderedTimestamp {
    track_id: u32,
    timestamp: f64,
    previous: f64,
  },

  /// Matroska cluster would exceed 2^15 ms of content; callers must supply
  /// key frames more often
  #[error("cluster starting at {cluster_timestamp} ms cannot hold a block at {block_timestamp} ms")]
  ClusterTooLong {
    cluster_timestamp: i64,
    block_timestamp: i64,
  },

  /// The muxer's declared expected chunk count was reached
  #[error("track {track_id} exceeded its declared chunk budget of {expected}")]
  TrackLimitExceeded { track_id: u32, expected: u32 },

  /// Operation not legal in the current state (add track after start, double
  /// finalize, ...)
  #[error("state violation: {0}")]
  StateViolation(&'static str),

  /// No decoder implementation registered for the codec
  #[error("no decoder available for {0}")]
  DecoderUnavailable(String),

  /// No encoder implementation registered for the codec
  #[error("no encoder available for {0}")]
  EncoderUnavailable(String),

  /// Operation terminated by the caller
  #[error("operation canceled")]
  Canceled,

  /// Underlying source or writer failure
  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),

  /// `Reader::view` over a range that was never loaded
  #[error("byte range {start}..{end} is not loaded")]
  NotLoaded { start: u64, end: u64 },
}

impl Error {
  /// Shorthand for [`Error::InvalidInput`] from anything displayable
  pub fn invalid(msg: impl Into<String>) -> Self {
    Error::InvalidInput(msg.into())
  }

  /// Shorthand for [`Error::UnsupportedFeature`]
  pub fn unsupported(msg: impl Into<String>) -> Self {
    Error::UnsupportedFeature(msg.into())
  }

  /// Whether this error came from a caller-driven cancellation
  pub fn is_canceled(&self) -> bool {
    matches!(self, Error::Canceled)
  }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
