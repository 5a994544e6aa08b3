//! PCM format description and sample codec
//!
//! `AudioFormat` fully determines the byte layout of interleaved PCM:
//! bytes per sample, bytes per frame and bytes per second. Samples are
//! little-endian; unsigned encodings are offset-binary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::constants::{DEFAULT_BIT_DEPTH, DEFAULT_CHANNELS};
use crate::error::{AnalysisError, AudioError};

/// Supported PCM bit depths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum BitDepth {
    Sixteen,
    TwentyFour,
    ThirtyTwo,
}

impl BitDepth {
    pub fn bits(self) -> u16 {
        match self {
            BitDepth::Sixteen => 16,
            BitDepth::TwentyFour => 24,
            BitDepth::ThirtyTwo => 32,
        }
    }

    pub fn bytes(self) -> usize {
        self.bits() as usize / 8
    }

    /// Full-scale magnitude of a signed sample at this depth
    fn full_scale(self) -> f64 {
        match self {
            BitDepth::Sixteen => 32_768.0,
            BitDepth::TwentyFour => 8_388_608.0,
            BitDepth::ThirtyTwo => 2_147_483_648.0,
        }
    }
}

impl TryFrom<u16> for BitDepth {
    type Error = AudioError;

    fn try_from(bits: u16) -> Result<Self, Self::Error> {
        match bits {
            16 => Ok(BitDepth::Sixteen),
            24 => Ok(BitDepth::TwentyFour),
            32 => Ok(BitDepth::ThirtyTwo),
            other => Err(AudioError::InvalidFormat(format!(
                "bit depth {} (expected 16, 24 or 32)",
                other
            ))),
        }
    }
}

impl From<BitDepth> for u16 {
    fn from(depth: BitDepth) -> u16 {
        depth.bits()
    }
}

/// Bit depth plus signedness, the per-sample encoding of a format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleEncoding {
    pub bit_depth: BitDepth,
    pub signed: bool,
}

impl SampleEncoding {
    pub fn new(bit_depth: BitDepth, signed: bool) -> Self {
        Self { bit_depth, signed }
    }

    /// Decode one little-endian sample to [-1.0, 1.0)
    ///
    /// `bytes` must hold at least `bit_depth.bytes()` bytes.
    #[inline]
    pub fn decode(self, bytes: &[u8]) -> f64 {
        let raw: i64 = match (self.bit_depth, self.signed) {
            (BitDepth::Sixteen, true) => i16::from_le_bytes([bytes[0], bytes[1]]) as i64,
            (BitDepth::Sixteen, false) => u16::from_le_bytes([bytes[0], bytes[1]]) as i64 - 32_768,
            (BitDepth::TwentyFour, true) => {
                // Sign-extend the top byte
                let sign = if bytes[2] & 0x80 != 0 { 0xFF } else { 0x00 };
                i32::from_le_bytes([bytes[0], bytes[1], bytes[2], sign]) as i64
            }
            (BitDepth::TwentyFour, false) => {
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]) as i64 - 8_388_608
            }
            (BitDepth::ThirtyTwo, true) => {
                i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64
            }
            (BitDepth::ThirtyTwo, false) => {
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64 - 2_147_483_648
            }
        };
        raw as f64 / self.bit_depth.full_scale()
    }

    /// Encode a normalized sample into `out`, returning the bytes written
    ///
    /// `out` must hold at least `bit_depth.bytes()` bytes.
    #[inline]
    pub fn encode(self, sample: f32, out: &mut [u8]) -> usize {
        let scale = self.bit_depth.full_scale();
        let max = scale - 1.0;
        let value = (sample.clamp(-1.0, 1.0) as f64 * scale).round().clamp(-scale, max) as i64;
        let raw = if self.signed { value } else { value + scale as i64 };
        let le = raw.to_le_bytes();
        let n = self.bit_depth.bytes();
        out[..n].copy_from_slice(&le[..n]);
        n
    }
}

/// Immutable PCM stream format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AudioFormat {
    sample_rate: u32,
    channels: u16,
    bit_depth: BitDepth,
    signed: bool,
}

impl AudioFormat {
    /// Create a format, rejecting a zero sample rate or channel count
    pub fn new(
        sample_rate: u32,
        channels: u16,
        bit_depth: BitDepth,
        signed: bool,
    ) -> Result<Self, AudioError> {
        if sample_rate == 0 {
            return Err(AudioError::InvalidFormat("sample rate must be positive".into()));
        }
        if channels == 0 {
            return Err(AudioError::InvalidFormat("channel count must be positive".into()));
        }
        Ok(Self {
            sample_rate,
            channels,
            bit_depth,
            signed,
        })
    }

    /// Stereo 16-bit signed format at the given rate
    pub fn with_sample_rate(sample_rate: u32) -> Result<Self, AudioError> {
        let depth = BitDepth::try_from(DEFAULT_BIT_DEPTH)?;
        Self::new(sample_rate, DEFAULT_CHANNELS, depth, true)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn bit_depth(&self) -> BitDepth {
        self.bit_depth
    }

    pub fn signed(&self) -> bool {
        self.signed
    }

    pub fn encoding(&self) -> SampleEncoding {
        SampleEncoding::new(self.bit_depth, self.signed)
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.bit_depth.bytes()
    }

    /// Bytes per frame (one sample for every channel)
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    pub fn bytes_per_second(&self) -> usize {
        self.bytes_per_frame() * self.sample_rate as usize
    }

    /// Bytes covering `duration`, rounded down to a whole frame
    pub fn bytes_for_duration(&self, duration: Duration) -> usize {
        let frames = (self.sample_rate as u128 * duration.as_micros()) / 1_000_000;
        frames as usize * self.bytes_per_frame()
    }

    /// Duration of `bytes` of PCM in this format
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let frames = (bytes / self.bytes_per_frame()) as u64;
        Duration::from_micros(frames * 1_000_000 / self.sample_rate as u64)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {}-bit {}",
            self.sample_rate,
            self.channels,
            self.bit_depth.bits(),
            if self.signed { "signed" } else { "unsigned" }
        )
    }
}

/// Outcome of format negotiation; a value, never an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatResult {
    Ok,
    UnsupportedSampleRate,
    UnsupportedChannel,
    UnsupportedBitDepth,
}

impl FormatResult {
    pub fn is_ok(self) -> bool {
        self == FormatResult::Ok
    }
}

/// Decode interleaved PCM into mono samples, averaging the channels
///
/// `pcm` must contain exactly `out.len()` frames.
pub fn decode_mono(pcm: &[u8], format: &AudioFormat, out: &mut [f64]) -> Result<(), AnalysisError> {
    let frame_bytes = format.bytes_per_frame();
    if pcm.len() % frame_bytes != 0 {
        return Err(AnalysisError::MisalignedPcm {
            len: pcm.len(),
            frame_bytes,
        });
    }
    let frames = pcm.len() / frame_bytes;
    if frames != out.len() {
        return Err(AnalysisError::SourceTooShort {
            len: frames,
            required: out.len(),
        });
    }

    let encoding = format.encoding();
    let sample_bytes = format.bytes_per_sample();
    let channels = format.channels() as f64;
    for (frame, slot) in pcm.chunks_exact(frame_bytes).zip(out.iter_mut()) {
        let sum: f64 = frame
            .chunks_exact(sample_bytes)
            .map(|sample| encoding.decode(sample))
            .sum();
        *slot = sum / channels;
    }
    Ok(())
}
