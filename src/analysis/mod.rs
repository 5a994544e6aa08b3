//! Spectral analysis
//!
//! Windowed FFT over fixed-size frames and publication of the results.

pub mod analyzer;
pub mod snapshot;

pub use analyzer::{hamming_periodic, SpectralAnalyzer};
pub use snapshot::{SharedSpectrum, SpectrumSnapshot};
