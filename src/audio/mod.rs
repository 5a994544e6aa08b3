//! Audio subsystem
//!
//! Buffering, format negotiation, device access, capture and playback.

pub mod accumulator;
pub mod buffer;
pub mod capture;
pub mod device;
pub mod negotiate;
pub mod playback;

pub use accumulator::{FrameAccumulator, PushOutcome};
pub use buffer::{BufferLevel, Overflow, RingBuffer, RingConsumer, RingProducer};
pub use capture::{AudioCapture, CaptureState, InputEvent};
pub use device::{AudioContext, AudioDevice, DeviceInfo, Direction};
pub use negotiate::{negotiate, select_format, ConfigRange, DeviceCapabilities};
pub use playback::{AudioPlayback, OutputEvent, PcmSink};
