//! Published spectrum snapshots
//!
//! The analyzer reuses its transform slots on every call, so readers on
//! other threads get an owned copy. The latest complete copy sits behind
//! an `Arc` that is swapped under a short lock.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Owned copy of the magnitudes of bins `[0, N/2]`
#[derive(Debug, Clone, Serialize)]
pub struct SpectrumSnapshot {
    sequence: u64,
    size: usize,
    sample_rate: u32,
    window_sum: f64,
    magnitudes: Vec<f64>,
}

impl SpectrumSnapshot {
    pub fn new(
        sequence: u64,
        size: usize,
        sample_rate: u32,
        window_sum: f64,
        magnitudes: Vec<f64>,
    ) -> Self {
        Self {
            sequence,
            size,
            sample_rate,
            window_sum,
            magnitudes,
        }
    }

    /// Transform count of the analyzer when this was taken
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Transform size N
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frequency_resolution(&self) -> f64 {
        self.sample_rate as f64 / self.size as f64
    }

    pub fn magnitudes(&self) -> &[f64] {
        &self.magnitudes
    }

    pub fn frequency(&self, bin: usize) -> f64 {
        bin as f64 * self.frequency_resolution()
    }

    /// dBFS of every bin, same normalization as the analyzer
    pub fn dbfs(&self) -> Vec<f64> {
        self.magnitudes
            .iter()
            .map(|&m| 20.0 * (2.0 * m / self.window_sum).log10())
            .collect()
    }

    /// dBFS of every bin normalized by the transform size, without window
    /// gain correction
    pub fn dbfs_uncorrected(&self) -> Vec<f64> {
        let size = self.size as f64;
        self.magnitudes
            .iter()
            .map(|&m| 20.0 * (2.0 * m / size).log10())
            .collect()
    }

    /// Loudest bin, ignoring DC
    pub fn peak_bin(&self) -> Option<usize> {
        self.magnitudes
            .iter()
            .enumerate()
            .skip(1)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(bin, _)| bin)
    }

    /// Frequency and dBFS of the loudest bin
    pub fn peak(&self) -> Option<(f64, f64)> {
        self.peak_bin().map(|bin| {
            let level = 20.0 * (2.0 * self.magnitudes[bin] / self.window_sum).log10();
            (self.frequency(bin), level)
        })
    }

    /// Maximum dBFS in each band `[edges[i], edges[i + 1])` (Hz)
    pub fn band_levels(&self, edges: &[f64], floor_db: f64) -> Vec<f64> {
        let dbfs = self.dbfs();
        let resolution = self.frequency_resolution();
        edges
            .windows(2)
            .map(|band| {
                let low = (band[0] / resolution).ceil().max(0.0) as usize;
                let high = ((band[1] / resolution).ceil().max(0.0) as usize).min(dbfs.len());
                dbfs.get(low..high)
                    .and_then(|bins| bins.iter().copied().reduce(f64::max))
                    .unwrap_or(floor_db)
                    .max(floor_db)
            })
            .collect()
    }
}

/// Latest-complete spectrum slot shared between the analysis thread and readers
#[derive(Clone, Default)]
pub struct SharedSpectrum {
    latest: Arc<Mutex<Option<Arc<SpectrumSnapshot>>>>,
}

impl SharedSpectrum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the latest snapshot
    pub fn publish(&self, snapshot: Arc<SpectrumSnapshot>) {
        *self.latest.lock() = Some(snapshot);
    }

    /// Handle to the latest snapshot, if any has been published
    pub fn latest(&self) -> Option<Arc<SpectrumSnapshot>> {
        self.latest.lock().clone()
    }

    pub fn latest_sequence(&self) -> Option<u64> {
        self.latest.lock().as_ref().map(|s| s.sequence())
    }
}
