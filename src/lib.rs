//! # Spectro
//!
//! Real-time PCM capture buffering and windowed spectrum analysis.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      HARDWARE CALLBACK THREAD                        │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────┐    │
//! │  │ cpal input  │───▶│ RingProducer::enqueue (bounded, no lock) │    │
//! │  └─────────────┘    └──────────────────┬───────────────────────┘    │
//! └────────────────────────────────────────┼─────────────────────────────┘
//!                                          │ SPSC byte ring (audio::buffer)
//! ┌────────────────────────────────────────┼─────────────────────────────┐
//! │                      ANALYSIS THREAD (clock ticks)                   │
//! │                    ┌───────────────────▼──────────────────┐          │
//! │                    │ RingConsumer::dequeue                │          │
//! │                    └───────────────────┬──────────────────┘          │
//! │                    ┌───────────────────▼──────────────────┐          │
//! │                    │ FrameAccumulator::push → ready → pop │          │
//! │                    └───────────────────┬──────────────────┘          │
//! │                    ┌───────────────────▼──────────────────┐          │
//! │                    │ SpectralAnalyzer: window → FFT → dB  │          │
//! │                    └───────────────────┬──────────────────┘          │
//! │                    ┌───────────────────▼──────────────────┐          │
//! │                    │ SharedSpectrum (latest snapshot)     │          │
//! │                    └──────────────────────────────────────┘          │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod analysis;
pub mod audio;
pub mod clock;
pub mod config;
pub mod error;
pub mod format;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Sample rates tried in order during format negotiation
    pub const PRIORITIZED_SAMPLE_RATES: [u32; 2] = [48000, 44100];

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default bit depth of captured PCM
    pub const DEFAULT_BIT_DEPTH: u16 = 16;

    /// Default FFT size (samples per analysis window)
    pub const DEFAULT_FFT_SIZE: usize = 1024;

    /// Default ring buffer duration in seconds
    pub const DEFAULT_BUFFER_DURATION_SECS: u64 = 30;

    /// Bytes that must accumulate before the capture side posts a fill notification
    pub const FILL_THRESHOLD_BYTES: usize = 4096;

    /// Default analysis clock interval in milliseconds
    pub const DEFAULT_TICK_INTERVAL_MS: u64 = 10;

    /// Default playback fill timeout in milliseconds
    pub const DEFAULT_FILL_TIMEOUT_MS: u64 = 100;

    /// Default playback latency in milliseconds
    pub const DEFAULT_LATENCY_MS: u64 = 1000;

    /// Capacity of diagnostic event channels fed from real-time callbacks
    pub const EVENT_CHANNEL_CAPACITY: usize = 64;

    /// Size of the stack scratch used by capture callbacks to encode PCM
    pub const CALLBACK_CHUNK_BYTES: usize = 4096;
}
