//! Audio capture from input devices
//!
//! The cpal callback encodes each delivery into the negotiated PCM layout
//! and enqueues it on the ring buffer. Integer streams already in that
//! layout are copied byte for byte. It never blocks, logs or allocates;
//! loss is recorded by the ring buffer and stream errors go out on a
//! bounded channel.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::{RingBuffer, RingConsumer, RingProducer};
use crate::audio::device::{native_encoding, AudioDevice};
use crate::audio::negotiate::negotiate;
use crate::constants::{CALLBACK_CHUNK_BYTES, EVENT_CHANNEL_CAPACITY, FILL_THRESHOLD_BYTES};
use crate::error::AudioError;
use crate::format::{AudioFormat, FormatResult, SampleEncoding};

/// Notifications from the input callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    /// The ring buffer holds at least the fill threshold
    Filled {
        /// Bytes buffered when the notification was posted
        available: usize,
    },
}

/// Capture lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Created, no format yet
    Created,
    /// Format negotiated and ring buffer allocated
    Initialized,
    Running,
    /// Stream torn down; `initialize` again to restart
    Stopped,
    Disposed,
}

/// Everything the stream thread needs, prepared by `initialize`
struct PendingStream {
    producer: RingProducer,
    config: StreamConfig,
    sample_format: SampleFormat,
}

/// Native samples that can be written without conversion
trait NativeSample: cpal::Sample {
    /// Little-endian bytes of an integer sample, `None` for floats
    fn write_le(self, out: &mut [u8]) -> Option<usize>;
}

macro_rules! impl_native_integer {
    ($($t:ty),*) => {$(
        impl NativeSample for $t {
            #[inline]
            fn write_le(self, out: &mut [u8]) -> Option<usize> {
                let bytes = self.to_le_bytes();
                out[..bytes.len()].copy_from_slice(&bytes);
                Some(bytes.len())
            }
        }
    )*};
}

impl_native_integer!(i16, u16, i32, u32);

impl NativeSample for f32 {
    fn write_le(self, _: &mut [u8]) -> Option<usize> {
        None
    }
}

impl NativeSample for f64 {
    fn write_le(self, _: &mut [u8]) -> Option<usize> {
        None
    }
}

/// Callback-side state shared by every sample type
struct CallbackContext {
    producer: RingProducer,
    encoding: SampleEncoding,
    /// Native samples already match `encoding`
    native: bool,
    samples_per_chunk: usize,
    fill_threshold: usize,
    events_tx: Sender<InputEvent>,
    frames_captured: Arc<AtomicU64>,
    channels: usize,
}

impl CallbackContext {
    #[inline]
    fn deliver<T>(&mut self, data: &[T])
    where
        T: NativeSample,
        f32: cpal::FromSample<T>,
    {
        let mut chunk = [0u8; CALLBACK_CHUNK_BYTES];
        for block in data.chunks(self.samples_per_chunk) {
            let mut len = 0;
            for &sample in block {
                let copied = if self.native {
                    sample.write_le(&mut chunk[len..])
                } else {
                    None
                };
                len += match copied {
                    Some(n) => n,
                    None => {
                        let value: f32 = cpal::Sample::from_sample(sample);
                        self.encoding.encode(value, &mut chunk[len..])
                    }
                };
            }
            // Rejected blocks are counted by the ring buffer
            self.producer.enqueue(&chunk[..len]);
        }

        self.frames_captured
            .fetch_add((data.len() / self.channels) as u64, Ordering::Relaxed);

        let available = self.producer.len();
        if available >= self.fill_threshold {
            let _ = self.events_tx.try_send(InputEvent::Filled { available });
        }
    }
}

/// Audio capture instance for a single input device
pub struct AudioCapture {
    device: AudioDevice,
    state: CaptureState,
    format: Option<AudioFormat>,
    pending: Option<PendingStream>,
    fill_threshold: usize,

    /// Whether the stream thread should keep running
    running: Arc<AtomicBool>,

    thread_handle: Option<JoinHandle<()>>,

    events_tx: Sender<InputEvent>,
    events_rx: Receiver<InputEvent>,

    error_rx: Option<Receiver<AudioError>>,

    frames_captured: Arc<AtomicU64>,
}

impl AudioCapture {
    pub fn new(device: AudioDevice) -> Self {
        // Single slot: one pending notification is enough to wake the consumer
        let (events_tx, events_rx) = bounded(1);
        Self {
            device,
            state: CaptureState::Created,
            format: None,
            pending: None,
            fill_threshold: FILL_THRESHOLD_BYTES,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            events_tx,
            events_rx,
            error_rx: None,
            frames_captured: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Override the fill notification threshold (bytes)
    pub fn with_fill_threshold(mut self, bytes: usize) -> Self {
        self.fill_threshold = bytes;
        self
    }

    /// Classify `format` against the device's advertised capabilities
    pub fn supports_format(&self, format: &AudioFormat) -> Result<FormatResult, AudioError> {
        if self.state == CaptureState::Disposed {
            return Err(AudioError::Disposed);
        }
        Ok(negotiate(format, &self.device.capabilities()?))
    }

    /// Negotiate `format`, allocate a ring buffer of `buffer_duration` and
    /// return its consumer half
    pub fn initialize(
        &mut self,
        format: AudioFormat,
        buffer_duration: Duration,
    ) -> Result<RingConsumer, AudioError> {
        match self.state {
            CaptureState::Disposed => return Err(AudioError::Disposed),
            CaptureState::Running => {
                return Err(AudioError::StreamError("cannot initialize a running stream".into()))
            }
            _ => {}
        }

        if format.bytes_per_frame() > CALLBACK_CHUNK_BYTES {
            return Err(AudioError::InvalidFormat(format!(
                "frame of {} bytes exceeds callback chunk",
                format.bytes_per_frame()
            )));
        }

        let result = self.supports_format(&format)?;
        if !result.is_ok() {
            return Err(AudioError::UnsupportedFormat(result));
        }

        let (config, sample_format) = self.device.stream_config_for(&format)?;
        let ring = RingBuffer::with_duration(&format, buffer_duration)
            .map_err(|e| AudioError::InvalidFormat(e.to_string()))?;
        let (producer, consumer) = ring.split();

        tracing::info!(
            "Capture initialized on '{}': {} ({:?} native), {} byte ring buffer",
            self.device.name(),
            format,
            sample_format,
            consumer.capacity()
        );

        self.pending = Some(PendingStream {
            producer,
            config,
            sample_format,
        });
        self.format = Some(format);
        self.state = CaptureState::Initialized;
        Ok(consumer)
    }

    /// Build and start the input stream
    pub fn start(&mut self) -> Result<(), AudioError> {
        match self.state {
            CaptureState::Running => return Ok(()),
            CaptureState::Disposed => return Err(AudioError::Disposed),
            CaptureState::Initialized => {}
            _ => return Err(AudioError::NotInitialized),
        }

        let (Some(pending), Some(format)) = (self.pending.take(), self.format) else {
            return Err(AudioError::NotInitialized);
        };

        let (error_tx, error_rx) = bounded::<AudioError>(EVENT_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        self.error_rx = Some(error_rx);

        let channels = format.channels() as usize;
        let frames_per_chunk = CALLBACK_CHUNK_BYTES / format.bytes_per_frame();
        let context = CallbackContext {
            producer: pending.producer,
            encoding: format.encoding(),
            native: native_encoding(pending.sample_format) == Some(format.encoding()),
            samples_per_chunk: frames_per_chunk * channels,
            fill_threshold: self.fill_threshold,
            events_tx: self.events_tx.clone(),
            frames_captured: self.frames_captured.clone(),
            channels,
        };

        let device = self.device.inner().clone();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name(format!("capture-{}", self.device.name()))
            .spawn(move || {
                let stream = match build_stream(
                    &device,
                    &pending.config,
                    pending.sample_format,
                    context,
                    error_tx,
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep the stream alive until stop is requested
                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                drop(stream);
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.thread_handle = Some(handle);
                self.state = CaptureState::Running;
                tracing::info!("Capture started on '{}'", self.device.name());
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                self.state = CaptureState::Stopped;
                tracing::error!("Failed to start capture: {}", e);
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                self.state = CaptureState::Stopped;
                Err(AudioError::StreamError("capture thread exited during start".into()))
            }
        }
    }

    /// Request stop and wait until the stream thread has released the stream
    pub fn stop(&mut self) -> Result<(), AudioError> {
        match self.state {
            CaptureState::Disposed => return Err(AudioError::Disposed),
            CaptureState::Created => return Err(AudioError::NotInitialized),
            _ => {}
        }

        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::info!("Capture stopped on '{}'", self.device.name());
        }
        self.pending = None;
        self.state = CaptureState::Stopped;
        Ok(())
    }

    /// Stop if running and release everything; the instance is unusable afterwards
    pub fn dispose(&mut self) {
        if self.state == CaptureState::Disposed {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.pending = None;
        self.state = CaptureState::Disposed;
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == CaptureState::Running
    }

    /// Negotiated format, once initialized
    pub fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    pub fn device(&self) -> &AudioDevice {
        &self.device
    }

    /// Receiver of fill-threshold notifications
    pub fn events(&self) -> Receiver<InputEvent> {
        self.events_rx.clone()
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }

    /// Check for stream errors
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    context: CallbackContext,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError> {
    match sample_format {
        SampleFormat::I16 => build_typed::<i16>(device, config, context, error_tx),
        SampleFormat::U16 => build_typed::<u16>(device, config, context, error_tx),
        SampleFormat::I32 => build_typed::<i32>(device, config, context, error_tx),
        SampleFormat::U32 => build_typed::<u32>(device, config, context, error_tx),
        SampleFormat::F32 => build_typed::<f32>(device, config, context, error_tx),
        SampleFormat::F64 => build_typed::<f64>(device, config, context, error_tx),
        other => Err(AudioError::InvalidFormat(format!("native sample format {:?}", other))),
    }
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut context: CallbackContext,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::SizedSample + NativeSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| context.deliver(data),
        move |err| {
            let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
        },
        None,
    )?;
    Ok(stream)
}
