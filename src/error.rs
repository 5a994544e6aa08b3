//! Error types

use thiserror::Error;

use crate::format::FormatResult;

/// Crate-wide error
#[derive(Debug, Error)]
pub enum Error {
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Clock error: {0}")]
    Clock(#[from] ClockError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate-wide result
pub type Result<T> = std::result::Result<T, Error>;

/// Ring buffer and frame accumulator contract violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("Requested {requested} bytes but only {available} are buffered")]
    InsufficientData { requested: usize, available: usize },

    #[error("Push of {len} bytes exceeds frame space ({remaining} of {target} bytes left)")]
    FrameOverflow {
        len: usize,
        remaining: usize,
        target: usize,
    },

    #[error("Frame is not ready")]
    NotReady,

    #[error("Capacity must be greater than zero")]
    ZeroCapacity,
}

/// Spectral analyzer contract violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error("Source has {len} samples, need {required} (offset + size)")]
    SourceTooShort { len: usize, required: usize },

    #[error("Invalid spectrum range [{offset}, {end}] for size {size}")]
    InvalidRange {
        offset: usize,
        end: usize,
        size: usize,
    },

    #[error("Transform size must be greater than zero")]
    InvalidSize,

    #[error("Sample rate must be greater than zero")]
    InvalidSampleRate,

    #[error("PCM length {len} is not a multiple of frame size {frame_bytes}")]
    MisalignedPcm { len: usize, frame_bytes: usize },
}

/// Audio device and stream errors
#[derive(Debug, Clone, Error)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("No default device available")]
    NoDefaultDevice,

    #[error("Unsupported format: {0:?}")]
    UnsupportedFormat(FormatResult),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Stream has not been initialized")]
    NotInitialized,

    #[error("Stream has been disposed")]
    Disposed,

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl From<cpal::DevicesError> for AudioError {
    fn from(e: cpal::DevicesError) -> Self {
        AudioError::DeviceNotFound(e.to_string())
    }
}

impl From<cpal::SupportedStreamConfigsError> for AudioError {
    fn from(e: cpal::SupportedStreamConfigsError) -> Self {
        AudioError::ConfigError(e.to_string())
    }
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(e: cpal::BuildStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

impl From<cpal::PlayStreamError> for AudioError {
    fn from(e: cpal::PlayStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

/// Scheduler misuse
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    #[error("Clock is already running")]
    AlreadyRunning,

    #[error("Buffer threshold mode requires a level probe")]
    MissingProbe,

    #[error("Tick interval must be greater than zero")]
    ZeroInterval,

    #[error("Failed to spawn clock thread: {0}")]
    Spawn(String),
}
