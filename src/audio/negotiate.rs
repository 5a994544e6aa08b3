//! Format negotiation against advertised device capabilities
//!
//! Pure functions over `DeviceCapabilities`: no device access, safe to
//! retry. Dimensions are checked in priority order sample rate, channel
//! count, encoding, and the first one no configuration satisfies is
//! reported.

use serde::{Deserialize, Serialize};

use crate::format::{AudioFormat, BitDepth, FormatResult, SampleEncoding};

/// One advertised device configuration range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRange {
    pub channels: u16,
    pub min_sample_rate: u32,
    pub max_sample_rate: u32,
    /// Encodings the stream can deliver in this configuration
    pub encodings: Vec<SampleEncoding>,
}

impl ConfigRange {
    pub fn supports_rate(&self, sample_rate: u32) -> bool {
        (self.min_sample_rate..=self.max_sample_rate).contains(&sample_rate)
    }
}

/// Everything a device advertises
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub configs: Vec<ConfigRange>,
}

impl DeviceCapabilities {
    pub fn new(configs: Vec<ConfigRange>) -> Self {
        Self { configs }
    }

    /// Distinct channel counts across all configurations
    pub fn channel_counts(&self) -> Vec<u16> {
        let mut counts: Vec<u16> = self.configs.iter().map(|c| c.channels).collect();
        counts.sort_unstable();
        counts.dedup();
        counts
    }

    pub fn supports_rate(&self, sample_rate: u32) -> bool {
        self.configs.iter().any(|c| c.supports_rate(sample_rate))
    }
}

/// Classify `format` against `caps`
pub fn negotiate(format: &AudioFormat, caps: &DeviceCapabilities) -> FormatResult {
    let rate = format.sample_rate();
    let mut with_rate = caps.configs.iter().filter(|c| c.supports_rate(rate)).peekable();
    if with_rate.peek().is_none() {
        return FormatResult::UnsupportedSampleRate;
    }

    let mut with_channels = with_rate.filter(|c| c.channels == format.channels()).peekable();
    if with_channels.peek().is_none() {
        return FormatResult::UnsupportedChannel;
    }

    let encoding = format.encoding();
    if with_channels.any(|c| c.encodings.contains(&encoding)) {
        FormatResult::Ok
    } else {
        FormatResult::UnsupportedBitDepth
    }
}

/// Try each candidate sample rate in order
///
/// Returns the first format the device accepts, or the classification of
/// the last candidate tried. An empty candidate list reports
/// `UnsupportedSampleRate`.
pub fn select_format(
    candidate_rates: &[u32],
    channels: u16,
    bit_depth: BitDepth,
    signed: bool,
    caps: &DeviceCapabilities,
) -> Result<AudioFormat, FormatResult> {
    let mut last = FormatResult::UnsupportedSampleRate;
    for &rate in candidate_rates {
        let Ok(format) = AudioFormat::new(rate, channels, bit_depth, signed) else {
            last = FormatResult::UnsupportedSampleRate;
            continue;
        };
        match negotiate(&format, caps) {
            FormatResult::Ok => return Ok(format),
            result => {
                tracing::debug!("Format {} rejected: {:?}", format, result);
                last = result;
            }
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s16() -> SampleEncoding {
        SampleEncoding::new(BitDepth::Sixteen, true)
    }

    fn caps() -> DeviceCapabilities {
        DeviceCapabilities::new(vec![
            ConfigRange {
                channels: 2,
                min_sample_rate: 44100,
                max_sample_rate: 48000,
                encodings: vec![s16()],
            },
            ConfigRange {
                channels: 1,
                min_sample_rate: 8000,
                max_sample_rate: 16000,
                encodings: vec![SampleEncoding::new(BitDepth::ThirtyTwo, true)],
            },
        ])
    }

    #[test]
    fn test_negotiate_ok() {
        let format = AudioFormat::new(48000, 2, BitDepth::Sixteen, true).unwrap();
        assert_eq!(negotiate(&format, &caps()), FormatResult::Ok);
    }

    #[test]
    fn test_sample_rate_checked_first() {
        // Wrong rate, channels and depth: rate wins
        let format = AudioFormat::new(96000, 6, BitDepth::TwentyFour, false).unwrap();
        assert_eq!(negotiate(&format, &caps()), FormatResult::UnsupportedSampleRate);
    }

    #[test]
    fn test_channel_checked_before_depth() {
        let format = AudioFormat::new(44100, 1, BitDepth::TwentyFour, true).unwrap();
        assert_eq!(negotiate(&format, &caps()), FormatResult::UnsupportedChannel);
    }

    #[test]
    fn test_dimensions_must_hold_in_one_config() {
        // 16 kHz mono exists and s16 exists, but never together
        let format = AudioFormat::new(16000, 1, BitDepth::Sixteen, true).unwrap();
        assert_eq!(negotiate(&format, &caps()), FormatResult::UnsupportedBitDepth);

        let unsigned = AudioFormat::new(48000, 2, BitDepth::Sixteen, false).unwrap();
        assert_eq!(negotiate(&unsigned, &caps()), FormatResult::UnsupportedBitDepth);
    }

    #[test]
    fn test_empty_capabilities() {
        let format = AudioFormat::with_sample_rate(48000).unwrap();
        assert_eq!(
            negotiate(&format, &DeviceCapabilities::default()),
            FormatResult::UnsupportedSampleRate
        );
    }

    #[test]
    fn test_select_format_falls_back_in_order() {
        let caps = DeviceCapabilities::new(vec![ConfigRange {
            channels: 2,
            min_sample_rate: 44100,
            max_sample_rate: 44100,
            encodings: vec![s16()],
        }]);
        let format = select_format(&[48000, 44100], 2, BitDepth::Sixteen, true, &caps).unwrap();
        assert_eq!(format.sample_rate(), 44100);

        assert_eq!(
            select_format(&[48000, 44100], 4, BitDepth::Sixteen, true, &caps),
            Err(FormatResult::UnsupportedChannel)
        );
        assert_eq!(
            select_format(&[], 2, BitDepth::Sixteen, true, &caps),
            Err(FormatResult::UnsupportedSampleRate)
        );
    }

    #[test]
    fn test_channel_counts_dedup() {
        assert_eq!(caps().channel_counts(), vec![1, 2]);
    }
}
