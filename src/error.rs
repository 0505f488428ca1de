//! Error types for tactus.

use thiserror::Error;

/// Error type for tactus operations.
///
/// Only configuration and lifecycle failures surface here. Period-time
/// failures (underruns, overruns) are recoverable and travel through the
/// [`XrunMonitor`](crate::XrunMonitor) instead, so that nothing throws or
/// allocates across the real-time callback boundary.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid tempo: {0}. Must be a positive, finite BPM")]
    InvalidTempo(f64),

    #[error("Invalid delay factor: {0}. Must be positive and finite")]
    InvalidDelayFactor(f64),

    #[error("Invalid loop range: left={left}, right={right}")]
    InvalidLoopRange { left: u64, right: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Engine is not running")]
    NotRunning,

    #[error("Engine is already running")]
    AlreadyRunning,
}

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;
