//! Audio device enumeration
//!
//! `AudioContext` owns a cpal host; every session builds its own, so there
//! is no process-wide device list to tear down.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{SampleFormat, StreamConfig, SupportedStreamConfigRange};
use serde::Serialize;

use crate::audio::negotiate::{ConfigRange, DeviceCapabilities};
use crate::error::AudioError;
use crate::format::{AudioFormat, BitDepth, SampleEncoding};

/// Stream direction of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Input,
    Output,
}

/// Serializable device summary
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub direction: Direction,
    pub capabilities: DeviceCapabilities,
}

/// Handle to one cpal device
#[derive(Clone)]
pub struct AudioDevice {
    device: cpal::Device,
    name: String,
    is_default: bool,
    direction: Direction,
}

impl AudioDevice {
    fn new(device: cpal::Device, direction: Direction, default_name: Option<&str>) -> Self {
        let name = device.name().unwrap_or_else(|_| "Unknown Device".to_string());
        let is_default = default_name.map(|d| d == name).unwrap_or(false);
        Self {
            device,
            name,
            is_default,
            direction,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn inner(&self) -> &cpal::Device {
        &self.device
    }

    fn supported_ranges(&self) -> Result<Vec<SupportedStreamConfigRange>, AudioError> {
        let ranges: Vec<SupportedStreamConfigRange> = match self.direction {
            Direction::Input => self.device.supported_input_configs()?.collect(),
            Direction::Output => self.device.supported_output_configs()?.collect(),
        };
        Ok(ranges)
    }

    /// Capabilities in negotiation terms
    pub fn capabilities(&self) -> Result<DeviceCapabilities, AudioError> {
        let configs = self
            .supported_ranges()?
            .iter()
            .filter_map(|range| {
                let encodings = encodings_for(range.sample_format());
                (!encodings.is_empty()).then(|| ConfigRange {
                    channels: range.channels(),
                    min_sample_rate: range.min_sample_rate().0,
                    max_sample_rate: range.max_sample_rate().0,
                    encodings,
                })
            })
            .collect();
        Ok(DeviceCapabilities::new(configs))
    }

    pub fn info(&self) -> Result<DeviceInfo, AudioError> {
        Ok(DeviceInfo {
            name: self.name.clone(),
            is_default: self.is_default,
            direction: self.direction,
            capabilities: self.capabilities()?,
        })
    }

    /// Pick the native stream config that delivers `format`
    ///
    /// A native integer format equal to the requested encoding wins over
    /// a float format converted in the callback.
    pub(crate) fn stream_config_for(
        &self,
        format: &AudioFormat,
    ) -> Result<(StreamConfig, SampleFormat), AudioError> {
        let wanted = format.encoding();
        let rate = format.sample_rate();
        let candidates: Vec<_> = self
            .supported_ranges()?
            .into_iter()
            .filter(|r| r.channels() == format.channels())
            .filter(|r| (r.min_sample_rate().0..=r.max_sample_rate().0).contains(&rate))
            .filter(|r| encodings_for(r.sample_format()).contains(&wanted))
            .collect();

        let chosen = candidates
            .iter()
            .find(|r| native_encoding(r.sample_format()) == Some(wanted))
            .or_else(|| candidates.first())
            .cloned()
            .ok_or_else(|| AudioError::InvalidFormat(format!("{} on {}", format, self.name)))?;

        let sample_format = chosen.sample_format();
        let config = chosen.with_sample_rate(cpal::SampleRate(rate)).config();
        Ok((config, sample_format))
    }
}

/// Integer encoding that a native cpal format carries unchanged
pub(crate) fn native_encoding(format: SampleFormat) -> Option<SampleEncoding> {
    match format {
        SampleFormat::I16 => Some(SampleEncoding::new(BitDepth::Sixteen, true)),
        SampleFormat::U16 => Some(SampleEncoding::new(BitDepth::Sixteen, false)),
        SampleFormat::I32 => Some(SampleEncoding::new(BitDepth::ThirtyTwo, true)),
        SampleFormat::U32 => Some(SampleEncoding::new(BitDepth::ThirtyTwo, false)),
        _ => None,
    }
}

/// Encodings a stream in `format` can deliver
///
/// Float streams are converted per sample in the callback, so they can
/// deliver every encoding.
fn encodings_for(format: SampleFormat) -> Vec<SampleEncoding> {
    match format {
        SampleFormat::F32 | SampleFormat::F64 => [BitDepth::Sixteen, BitDepth::TwentyFour, BitDepth::ThirtyTwo]
            .into_iter()
            .flat_map(|depth| [SampleEncoding::new(depth, true), SampleEncoding::new(depth, false)])
            .collect(),
        other => native_encoding(other).into_iter().collect(),
    }
}

/// Explicitly constructed device context
pub struct AudioContext {
    host: cpal::Host,
}

impl AudioContext {
    /// Context over the platform's default host
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
        }
    }

    pub fn host_name(&self) -> &'static str {
        self.host.id().name()
    }

    pub fn input_devices(&self) -> Result<Vec<AudioDevice>, AudioError> {
        let default_name = self.host.default_input_device().and_then(|d| d.name().ok());
        Ok(self
            .host
            .input_devices()?
            .map(|d| AudioDevice::new(d, Direction::Input, default_name.as_deref()))
            .collect())
    }

    pub fn output_devices(&self) -> Result<Vec<AudioDevice>, AudioError> {
        let default_name = self.host.default_output_device().and_then(|d| d.name().ok());
        Ok(self
            .host
            .output_devices()?
            .map(|d| AudioDevice::new(d, Direction::Output, default_name.as_deref()))
            .collect())
    }

    pub fn default_input(&self) -> Result<AudioDevice, AudioError> {
        let device = self.host.default_input_device().ok_or(AudioError::NoDefaultDevice)?;
        let name = device.name().ok();
        Ok(AudioDevice::new(device, Direction::Input, name.as_deref()))
    }

    pub fn default_output(&self) -> Result<AudioDevice, AudioError> {
        let device = self.host.default_output_device().ok_or(AudioError::NoDefaultDevice)?;
        let name = device.name().ok();
        Ok(AudioDevice::new(device, Direction::Output, name.as_deref()))
    }

    /// Input device by exact name, or the default when `name` is None
    pub fn input_device(&self, name: Option<&str>) -> Result<AudioDevice, AudioError> {
        match name {
            None => self.default_input(),
            Some(name) => self
                .input_devices()?
                .into_iter()
                .find(|d| d.name() == name)
                .ok_or_else(|| AudioError::DeviceNotFound(name.to_string())),
        }
    }

    /// Output device by exact name, or the default when `name` is None
    pub fn output_device(&self, name: Option<&str>) -> Result<AudioDevice, AudioError> {
        match name {
            None => self.default_output(),
            Some(name) => self
                .output_devices()?
                .into_iter()
                .find(|d| d.name() == name)
                .ok_or_else(|| AudioError::DeviceNotFound(name.to_string())),
        }
    }
}

impl Default for AudioContext {
    fn default() -> Self {
        Self::new()
    }
}
