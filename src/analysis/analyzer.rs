//! Windowed FFT spectral analyzer
//!
//! Owns a fixed transform size N, a periodic Hamming window and the N
//! complex slots of the most recent transform. The window is always
//! indexed relative to the start of the analysis frame, so `offset` only
//! chooses where in the source the frame begins.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f64::consts::PI;
use std::sync::Arc;

use crate::analysis::snapshot::SpectrumSnapshot;
use crate::error::AnalysisError;
use crate::format::{decode_mono, AudioFormat};

/// Periodic Hamming window: `0.54 - 0.46 cos(2πi/N)`
pub fn hamming_periodic(size: usize) -> Vec<f64> {
    (0..size)
        .map(|i| 0.54 - 0.46 * (2.0 * PI * i as f64 / size as f64).cos())
        .collect()
}

pub struct SpectralAnalyzer {
    size: usize,
    sample_rate: u32,
    resolution: f64,
    window: Vec<f64>,
    /// Coherent sum of the window, the amplitude gain at a bin-aligned tone
    window_sum: f64,
    fft: Arc<dyn Fft<f64>>,
    spectrum: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
    /// Decoded mono samples for PCM input
    mono: Vec<f64>,
    sequence: u64,
}

impl SpectralAnalyzer {
    /// Create an analyzer for `size`-point transforms at `sample_rate`
    ///
    /// Any size works; powers of two are the fast path.
    pub fn new(size: usize, sample_rate: u32) -> Result<Self, AnalysisError> {
        if size == 0 {
            return Err(AnalysisError::InvalidSize);
        }
        if sample_rate == 0 {
            return Err(AnalysisError::InvalidSampleRate);
        }
        if !size.is_power_of_two() {
            tracing::warn!("FFT size {} is not a power of two", size);
        }

        let window = hamming_periodic(size);
        let window_sum = window.iter().sum();
        let fft = FftPlanner::new().plan_fft_forward(size);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        Ok(Self {
            size,
            sample_rate,
            resolution: sample_rate as f64 / size as f64,
            window,
            window_sum,
            fft,
            spectrum: vec![Complex::new(0.0, 0.0); size],
            scratch,
            mono: vec![0.0; size],
            sequence: 0,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Hz per bin
    pub fn frequency_resolution(&self) -> f64 {
        self.resolution
    }

    pub fn window(&self) -> &[f64] {
        &self.window
    }

    /// Mean window value; a bin-aligned tone of amplitude A peaks at A·N·gain/2
    pub fn coherent_gain(&self) -> f64 {
        self.window_sum / self.size as f64
    }

    /// Number of transforms computed so far
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Window `samples[offset..offset + N]` and transform it in place
    pub fn fft(&mut self, samples: &[f64], offset: usize) -> Result<(), AnalysisError> {
        let required = offset.saturating_add(self.size);
        if samples.len() < required {
            return Err(AnalysisError::SourceTooShort {
                len: samples.len(),
                required,
            });
        }

        let frame = &samples[offset..required];
        for ((slot, &sample), &w) in self.spectrum.iter_mut().zip(frame).zip(&self.window) {
            *slot = Complex::new(sample * w, 0.0);
        }

        self.fft.process_with_scratch(&mut self.spectrum, &mut self.scratch);
        self.sequence += 1;
        Ok(())
    }

    /// Decode the first N frames of interleaved PCM to mono and transform them
    pub fn fft_pcm(&mut self, pcm: &[u8], format: &AudioFormat) -> Result<(), AnalysisError> {
        let needed = self.size * format.bytes_per_frame();
        if pcm.len() < needed {
            return Err(AnalysisError::SourceTooShort {
                len: pcm.len() / format.bytes_per_frame(),
                required: self.size,
            });
        }

        let mut mono = std::mem::take(&mut self.mono);
        let result = decode_mono(&pcm[..needed], format, &mut mono).and_then(|_| self.fft(&mono, 0));
        self.mono = mono;
        result
    }

    fn check_range(&self, offset: usize, end_index: usize) -> Result<(), AnalysisError> {
        if end_index >= self.size || offset > end_index {
            return Err(AnalysisError::InvalidRange {
                offset,
                end: end_index,
                size: self.size,
            });
        }
        Ok(())
    }

    /// Magnitude of each bin in `[offset, end_index]`
    pub fn power_spectrum(&self, offset: usize, end_index: usize) -> Result<Vec<f64>, AnalysisError> {
        self.check_range(offset, end_index)?;
        Ok(self.spectrum[offset..=end_index].iter().map(|c| c.norm()).collect())
    }

    /// Magnitude of each bin from `offset` to the last bin
    pub fn power_spectrum_from(&self, offset: usize) -> Result<Vec<f64>, AnalysisError> {
        self.power_spectrum(offset, self.size - 1)
    }

    /// Decibels relative to full scale over `[offset, end_index]`
    ///
    /// Normalized by the window's coherent sum, so a full-scale bin-aligned
    /// sinusoid reads 0 dBFS at its bin. For a rectangular window this is
    /// exactly `20·log10(2·|X[k]| / N)`.
    pub fn dbfs(&self, offset: usize, end_index: usize) -> Result<Vec<f64>, AnalysisError> {
        let mut power = self.power_spectrum(offset, end_index)?;
        for value in power.iter_mut() {
            *value = 20.0 * (2.0 * *value / self.window_sum).log10();
        }
        Ok(power)
    }

    pub fn dbfs_from(&self, offset: usize) -> Result<Vec<f64>, AnalysisError> {
        self.dbfs(offset, self.size - 1)
    }

    /// Decibels over `[offset, end_index]` normalized by the transform size,
    /// `20·log10(2·|X[k]| / N)`, with no window gain correction
    ///
    /// A full-scale sinusoid reads the window's coherent gain in dB
    /// (about -5.35 dB for Hamming) instead of 0 dBFS.
    pub fn dbfs_uncorrected(&self, offset: usize, end_index: usize) -> Result<Vec<f64>, AnalysisError> {
        let mut power = self.power_spectrum(offset, end_index)?;
        let size = self.size as f64;
        for value in power.iter_mut() {
            *value = 20.0 * (2.0 * *value / size).log10();
        }
        Ok(power)
    }

    /// Unnormalized decibels, `20·log10(|X[k]|)`
    pub fn db(&self, offset: usize, end_index: usize) -> Result<Vec<f64>, AnalysisError> {
        let mut power = self.power_spectrum(offset, end_index)?;
        for value in power.iter_mut() {
            *value = 20.0 * value.log10();
        }
        Ok(power)
    }

    pub fn db_from(&self, offset: usize) -> Result<Vec<f64>, AnalysisError> {
        self.db(offset, self.size - 1)
    }

    /// Nearest bin for `freq`, clamped to `[0, N]`
    pub fn bin_index(&self, freq: f64) -> usize {
        // NaN and negatives saturate to 0
        ((freq / self.resolution).round().max(0.0) as usize).min(self.size)
    }

    /// Center frequency of `bin`
    pub fn frequency(&self, bin: usize) -> f64 {
        bin as f64 * self.resolution
    }

    /// Live transform slots; only valid between calls to `fft`
    pub fn spectrum(&self) -> &[Complex<f64>] {
        &self.spectrum
    }

    /// Owned copy of bins `[0, N/2]` for handing to other threads
    pub fn snapshot(&self) -> SpectrumSnapshot {
        let magnitudes = self.spectrum[..=self.size / 2].iter().map(|c| c.norm()).collect();
        SpectrumSnapshot::new(
            self.sequence,
            self.size,
            self.sample_rate,
            self.window_sum,
            magnitudes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::BitDepth;

    fn sine(size: usize, cycles: f64, amplitude: f64, phase: f64) -> Vec<f64> {
        (0..size)
            .map(|i| amplitude * (2.0 * PI * cycles * i as f64 / size as f64 + phase).sin())
            .collect()
    }

    #[test]
    fn test_resolution_and_bin_mapping() {
        let analyzer = SpectralAnalyzer::new(1024, 44100).unwrap();
        assert!((analyzer.frequency_resolution() - 43.066).abs() < 0.001);
        assert_eq!(analyzer.bin_index(1000.0), 23);
        assert!((analyzer.frequency(23) - 990.53).abs() < 0.01);
    }

    #[test]
    fn test_bin_index_clamps() {
        let analyzer = SpectralAnalyzer::new(1024, 44100).unwrap();
        assert_eq!(analyzer.bin_index(-50.0), 0);
        assert_eq!(analyzer.bin_index(1e9), 1024);
        assert_eq!(analyzer.bin_index(f64::NAN), 0);
    }

    #[test]
    fn test_frequency_round_trip_within_half_bin() {
        let analyzer = SpectralAnalyzer::new(1024, 48000).unwrap();
        let half = analyzer.frequency_resolution() / 2.0;
        let mut f = 0.0;
        while f < 24000.0 {
            let back = analyzer.frequency(analyzer.bin_index(f));
            assert!((back - f).abs() <= half + 1e-9, "f={} back={}", f, back);
            f += 7.3;
        }
    }

    #[test]
    fn test_window_is_periodic_hamming() {
        let analyzer = SpectralAnalyzer::new(8, 8000).unwrap();
        let w = analyzer.window();
        assert!((w[0] - 0.08).abs() < 1e-12);
        assert!((w[4] - 1.0).abs() < 1e-12);
        assert!((w[2] - 0.54).abs() < 1e-12);
        assert!((analyzer.coherent_gain() - 0.54).abs() < 1e-12);
    }

    #[test]
    fn test_full_scale_sine_reads_zero_dbfs() {
        let size = 1024;
        let bin = 64;
        let mut analyzer = SpectralAnalyzer::new(size, 48000).unwrap();
        analyzer.fft(&sine(size, bin as f64, 1.0, 0.3), 0).unwrap();

        let dbfs = analyzer.dbfs(0, size / 2).unwrap();
        assert!(dbfs[bin].abs() < 0.5, "peak = {} dBFS", dbfs[bin]);
        for (k, &level) in dbfs.iter().enumerate() {
            if k + 1 < bin || k > bin + 1 {
                assert!(level < -40.0, "bin {} = {} dBFS", k, level);
            }
        }
    }

    #[test]
    fn test_uncorrected_dbfs_keeps_window_loss() {
        let size = 1024;
        let bin = 64;
        let mut analyzer = SpectralAnalyzer::new(size, 48000).unwrap();
        analyzer.fft(&sine(size, bin as f64, 1.0, 0.0), 0).unwrap();

        let corrected = analyzer.dbfs(bin, bin).unwrap()[0];
        let uncorrected = analyzer.dbfs_uncorrected(bin, bin).unwrap()[0];
        let magnitude = analyzer.power_spectrum(bin, bin).unwrap()[0];
        assert!((uncorrected - 20.0 * (2.0 * magnitude / size as f64).log10()).abs() < 1e-9);
        // Offset between the views is the coherent gain
        assert!((corrected - uncorrected + 20.0 * 0.54f64.log10()).abs() < 1e-9);
        assert!(analyzer.dbfs_uncorrected(0, size).is_err());
    }

    #[test]
    fn test_db_is_unnormalized() {
        let size = 256;
        let mut analyzer = SpectralAnalyzer::new(size, 8000).unwrap();
        analyzer.fft(&sine(size, 16.0, 1.0, 0.0), 0).unwrap();

        let magnitude = analyzer.power_spectrum(16, 16).unwrap()[0];
        let db = analyzer.db(16, 16).unwrap()[0];
        assert!((db - 20.0 * magnitude.log10()).abs() < 1e-9);
        assert!((magnitude - 0.54 * size as f64 / 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_window_relative_to_offset() {
        let size = 128;
        let offset = 37;
        let frame = sine(size, 5.0, 0.7, 0.0);
        let mut source = vec![0.9; offset];
        source.extend_from_slice(&frame);
        source.extend_from_slice(&[0.4; 11]);

        let mut shifted = SpectralAnalyzer::new(size, 8000).unwrap();
        shifted.fft(&source, offset).unwrap();
        let mut direct = SpectralAnalyzer::new(size, 8000).unwrap();
        direct.fft(&frame, 0).unwrap();

        for (a, b) in shifted.spectrum().iter().zip(direct.spectrum()) {
            assert!((a - b).norm() < 1e-9);
        }
    }

    #[test]
    fn test_short_source_rejected() {
        let mut analyzer = SpectralAnalyzer::new(64, 8000).unwrap();
        assert_eq!(
            analyzer.fft(&[0.0; 70], 10),
            Err(AnalysisError::SourceTooShort { len: 70, required: 74 })
        );
        assert_eq!(analyzer.sequence(), 0);
    }

    #[test]
    fn test_power_spectrum_range_errors() {
        let analyzer = SpectralAnalyzer::new(64, 8000).unwrap();
        assert!(matches!(
            analyzer.power_spectrum(0, 64),
            Err(AnalysisError::InvalidRange { .. })
        ));
        assert!(matches!(
            analyzer.power_spectrum(10, 9),
            Err(AnalysisError::InvalidRange { .. })
        ));
        assert!(analyzer.dbfs(0, 100).is_err());
        assert_eq!(analyzer.power_spectrum(5, 5).unwrap().len(), 1);
        assert_eq!(analyzer.power_spectrum_from(0).unwrap().len(), 64);
    }

    #[test]
    fn test_fft_pcm_stereo() {
        let size = 512;
        let format = AudioFormat::new(48000, 2, BitDepth::Sixteen, true).unwrap();
        let encoding = format.encoding();
        let tone = sine(size, 32.0, 0.5, 0.0);

        let mut pcm = vec![0u8; size * format.bytes_per_frame()];
        for (frame, &value) in pcm.chunks_exact_mut(4).zip(&tone) {
            encoding.encode(value as f32, &mut frame[..2]);
            encoding.encode(value as f32, &mut frame[2..]);
        }

        let mut analyzer = SpectralAnalyzer::new(size, 48000).unwrap();
        analyzer.fft_pcm(&pcm, &format).unwrap();

        let dbfs = analyzer.dbfs(32, 32).unwrap()[0];
        assert!((dbfs - 20.0 * 0.5f64.log10()).abs() < 0.1);
        assert!(analyzer.fft_pcm(&pcm[..100], &format).is_err());
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let size = 64;
        let mut analyzer = SpectralAnalyzer::new(size, 8000).unwrap();
        analyzer.fft(&sine(size, 4.0, 1.0, 0.0), 0).unwrap();
        let snapshot = analyzer.snapshot();

        analyzer.fft(&vec![0.0; size], 0).unwrap();
        assert_eq!(snapshot.magnitudes().len(), size / 2 + 1);
        assert_eq!(snapshot.peak_bin(), Some(4));
        assert_eq!(snapshot.sequence(), 1);
    }

    #[test]
    fn test_invalid_construction() {
        assert!(matches!(SpectralAnalyzer::new(0, 8000), Err(AnalysisError::InvalidSize)));
        assert!(matches!(SpectralAnalyzer::new(64, 0), Err(AnalysisError::InvalidSampleRate)));
    }
}
