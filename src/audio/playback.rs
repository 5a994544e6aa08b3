//! Audio playback to output devices
//!
//! PCM written through `write` lands in a ring buffer that the output
//! callback drains. Shortfalls are filled with silence and reported as
//! `OutputEvent`s so the feeding side can top the buffer up.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::{RingBuffer, RingConsumer, RingProducer};
use crate::audio::device::AudioDevice;
use crate::audio::negotiate::negotiate;
use crate::constants::{CALLBACK_CHUNK_BYTES, EVENT_CHANNEL_CAPACITY};
use crate::error::AudioError;
use crate::format::{AudioFormat, SampleEncoding};

/// Notifications from the output callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEvent {
    /// The device asked for more data than was buffered
    Underflow {
        /// Bytes missing from this callback, if known
        requested: Option<usize>,
    },
    /// A shortfall has lasted longer than the fill timeout
    UnderflowTimedOut,
}

/// Destination for PCM forwarded by the analysis session
pub trait PcmSink: Send {
    /// Queue `count` bytes of `buffer` from `offset` without blocking
    fn write(&mut self, buffer: &[u8], offset: usize, count: usize) -> bool;
}

struct PendingStream {
    consumer: RingConsumer,
    config: StreamConfig,
    sample_format: SampleFormat,
}

/// Callback-side state shared by every sample type
struct OutputContext {
    consumer: RingConsumer,
    encoding: SampleEncoding,
    bytes_per_sample: usize,
    bytes_per_frame: usize,
    channels: usize,
    fill_timeout: Duration,
    /// Start of the current shortfall episode
    starved_since: Option<Instant>,
    timeout_reported: bool,
    events_tx: Sender<OutputEvent>,
    samples_played: Arc<AtomicU64>,
    underruns: Arc<AtomicU64>,
}

impl OutputContext {
    #[inline]
    fn render<T>(&mut self, data: &mut [T])
    where
        T: cpal::Sample + cpal::FromSample<f32>,
    {
        let mut chunk = [0u8; CALLBACK_CHUNK_BYTES];
        let frames_per_chunk = CALLBACK_CHUNK_BYTES / self.bytes_per_frame;
        let mut missing_frames = 0;

        for block in data.chunks_mut(frames_per_chunk * self.channels) {
            // Only whole frames leave the ring buffer so channels stay aligned
            let wanted = block.len() / self.channels;
            let take = (self.consumer.len() / self.bytes_per_frame).min(wanted);
            let bytes = take * self.bytes_per_frame;
            let filled = if self.consumer.dequeue(&mut chunk[..bytes]).is_ok() {
                take
            } else {
                0
            };

            let samples = filled * self.channels;
            for (out, raw) in block[..samples]
                .iter_mut()
                .zip(chunk.chunks_exact(self.bytes_per_sample))
            {
                *out = T::from_sample(self.encoding.decode(raw) as f32);
            }
            for out in block[samples..].iter_mut() {
                *out = T::EQUILIBRIUM;
            }
            missing_frames += wanted - filled;
        }

        let total_frames = data.len() / self.channels;
        self.samples_played.fetch_add(
            ((total_frames - missing_frames) * self.channels) as u64,
            Ordering::Relaxed,
        );

        if missing_frames == 0 {
            self.starved_since = None;
            self.timeout_reported = false;
            return;
        }

        self.underruns.fetch_add(1, Ordering::Relaxed);
        let _ = self.events_tx.try_send(OutputEvent::Underflow {
            requested: Some(missing_frames * self.bytes_per_frame),
        });

        let since = *self.starved_since.get_or_insert_with(Instant::now);
        if !self.timeout_reported && since.elapsed() >= self.fill_timeout {
            self.timeout_reported = true;
            let _ = self.events_tx.try_send(OutputEvent::UnderflowTimedOut);
        }
    }
}

/// Audio playback instance for a single output device
pub struct AudioPlayback {
    device: AudioDevice,
    format: Option<AudioFormat>,
    fill_timeout: Duration,

    /// Write side of the ring buffer, present once initialized
    producer: Option<RingProducer>,
    pending: Option<PendingStream>,

    running: Arc<AtomicBool>,
    disposed: bool,

    thread_handle: Option<JoinHandle<()>>,

    events_tx: Sender<OutputEvent>,
    events_rx: Receiver<OutputEvent>,

    error_rx: Option<Receiver<AudioError>>,

    /// Total samples played
    samples_played: Arc<AtomicU64>,

    /// Callbacks that came up short
    underruns: Arc<AtomicU64>,
}

impl AudioPlayback {
    pub fn new(device: AudioDevice) -> Self {
        let (events_tx, events_rx) = bounded(EVENT_CHANNEL_CAPACITY);
        Self {
            device,
            format: None,
            fill_timeout: Duration::from_millis(crate::constants::DEFAULT_FILL_TIMEOUT_MS),
            producer: None,
            pending: None,
            running: Arc::new(AtomicBool::new(false)),
            disposed: false,
            thread_handle: None,
            events_tx,
            events_rx,
            error_rx: None,
            samples_played: Arc::new(AtomicU64::new(0)),
            underruns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Negotiate `format` and allocate a ring buffer of `buffer_duration`
    pub fn initialize(
        &mut self,
        format: AudioFormat,
        buffer_duration: Duration,
        fill_timeout: Duration,
    ) -> Result<(), AudioError> {
        if self.disposed {
            return Err(AudioError::Disposed);
        }
        if self.is_running() {
            return Err(AudioError::StreamError("cannot initialize a running stream".into()));
        }

        let result = negotiate(&format, &self.device.capabilities()?);
        if !result.is_ok() {
            return Err(AudioError::UnsupportedFormat(result));
        }

        if format.bytes_per_frame() > CALLBACK_CHUNK_BYTES {
            return Err(AudioError::InvalidFormat(format!(
                "frame of {} bytes exceeds callback chunk",
                format.bytes_per_frame()
            )));
        }

        let (config, sample_format) = self.device.stream_config_for(&format)?;
        let ring = RingBuffer::with_duration(&format, buffer_duration)
            .map_err(|e| AudioError::InvalidFormat(e.to_string()))?;
        let (producer, consumer) = ring.split();

        tracing::info!(
            "Playback initialized on '{}': {} ({:?} native), {} byte ring buffer",
            self.device.name(),
            format,
            sample_format,
            producer.capacity()
        );

        self.producer = Some(producer);
        self.pending = Some(PendingStream {
            consumer,
            config,
            sample_format,
        });
        self.format = Some(format);
        self.fill_timeout = fill_timeout;
        Ok(())
    }

    /// Start playback
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.disposed {
            return Err(AudioError::Disposed);
        }
        if self.is_running() {
            return Ok(());
        }

        let (Some(pending), Some(format)) = (self.pending.take(), self.format) else {
            return Err(AudioError::NotInitialized);
        };

        let (error_tx, error_rx) = bounded::<AudioError>(EVENT_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        self.error_rx = Some(error_rx);

        let context = OutputContext {
            consumer: pending.consumer,
            encoding: format.encoding(),
            bytes_per_sample: format.bytes_per_sample(),
            bytes_per_frame: format.bytes_per_frame(),
            channels: format.channels() as usize,
            fill_timeout: self.fill_timeout,
            starved_since: None,
            timeout_reported: false,
            events_tx: self.events_tx.clone(),
            samples_played: self.samples_played.clone(),
            underruns: self.underruns.clone(),
        };

        let device = self.device.inner().clone();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name(format!("playback-{}", self.device.name()))
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

                // Keep thread alive while running
                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.thread_handle = Some(handle);
                tracing::info!("Playback started on '{}'", self.device.name());
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                tracing::error!("Failed to start playback: {}", e);
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(AudioError::StreamError("playback thread exited during start".into()))
            }
        }
    }

    /// Queue `count` bytes of `buffer` starting at `offset`
    ///
    /// Never blocks. Returns false when the range is out of bounds, the
    /// playback is not initialized, or the ring buffer lacks room for the
    /// whole range; nothing is queued in that case.
    pub fn write(&mut self, buffer: &[u8], offset: usize, count: usize) -> bool {
        let Some(producer) = self.producer.as_mut() else {
            return false;
        };
        let Some(bytes) = offset
            .checked_add(count)
            .and_then(|end| buffer.get(offset..end))
        else {
            return false;
        };
        producer.enqueue(bytes)
    }

    /// Stop playback
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::info!("Playback stopped on '{}'", self.device.name());
        }
        // The ring buffer went down with the stream
        self.producer = None;
        self.pending = None;
    }

    /// Stop and release everything; the instance is unusable afterwards
    pub fn dispose(&mut self) {
        self.stop();
        self.disposed = true;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    /// Bytes queued and not yet played
    pub fn buffered(&self) -> usize {
        self.producer.as_ref().map(|p| p.len()).unwrap_or(0)
    }

    /// Receiver of underflow notifications
    pub fn events(&self) -> Receiver<OutputEvent> {
        self.events_rx.clone()
    }

    /// Get total samples played
    pub fn samples_played(&self) -> u64 {
        self.samples_played.load(Ordering::Relaxed)
    }

    /// Get underrun count
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Writes rejected for lack of space
    pub fn overflow_count(&self) -> u64 {
        self.producer.as_ref().map(|p| p.overflow_count()).unwrap_or(0)
    }

    /// Check for errors
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl PcmSink for AudioPlayback {
    fn write(&mut self, buffer: &[u8], offset: usize, count: usize) -> bool {
        AudioPlayback::write(self, buffer, offset, count)
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    context: OutputContext,
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
    mut context: OutputContext,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| context.render(data),
        move |err| {
            let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
        },
        None,
    )?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::BitDepth;

    fn context(consumer: RingConsumer, timeout: Duration) -> (OutputContext, Receiver<OutputEvent>) {
        context_with_channels(consumer, timeout, 1)
    }

    fn context_with_channels(
        consumer: RingConsumer,
        timeout: Duration,
        channels: usize,
    ) -> (OutputContext, Receiver<OutputEvent>) {
        let (events_tx, events_rx) = bounded(EVENT_CHANNEL_CAPACITY);
        let ctx = OutputContext {
            consumer,
            encoding: SampleEncoding::new(BitDepth::Sixteen, true),
            bytes_per_sample: 2,
            bytes_per_frame: 2 * channels,
            channels,
            fill_timeout: timeout,
            starved_since: None,
            timeout_reported: false,
            events_tx,
            samples_played: Arc::new(AtomicU64::new(0)),
            underruns: Arc::new(AtomicU64::new(0)),
        };
        (ctx, events_rx)
    }

    #[test]
    fn test_render_decodes_queued_samples() {
        let (mut producer, consumer) = RingBuffer::new(64).unwrap().split();
        let (mut ctx, events) = context(consumer, Duration::from_secs(1));

        // 0.5 and -0.25 in s16
        let mut pcm = Vec::new();
        pcm.extend_from_slice(&16384i16.to_le_bytes());
        pcm.extend_from_slice(&(-8192i16).to_le_bytes());
        assert!(producer.enqueue(&pcm));

        let mut out = [1.0f32; 2];
        ctx.render(&mut out);
        assert_eq!(out, [0.5, -0.25]);
        assert!(events.try_recv().is_err());
        assert_eq!(ctx.samples_played.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_shortfall_is_silent_and_reported() {
        let (mut producer, consumer) = RingBuffer::new(64).unwrap().split();
        let (mut ctx, events) = context(consumer, Duration::from_secs(60));
        assert!(producer.enqueue(&16384i16.to_le_bytes()));

        let mut out = [1.0f32; 4];
        ctx.render(&mut out);
        assert_eq!(out, [0.5, 0.0, 0.0, 0.0]);
        assert_eq!(
            events.try_recv().unwrap(),
            OutputEvent::Underflow { requested: Some(6) }
        );
        assert_eq!(ctx.underruns.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_timeout_reported_once_per_episode() {
        let (mut producer, consumer) = RingBuffer::new(64).unwrap().split();
        let (mut ctx, events) = context(consumer, Duration::ZERO);

        let mut out = [0i16; 2];
        ctx.render(&mut out);
        ctx.render(&mut out);
        let timeouts = events
            .try_iter()
            .filter(|e| *e == OutputEvent::UnderflowTimedOut)
            .count();
        assert_eq!(timeouts, 1);

        // A full callback ends the episode
        assert!(producer.enqueue(&[0u8; 4]));
        ctx.render(&mut out);
        assert!(ctx.starved_since.is_none());
        ctx.render(&mut out);
        assert!(events.try_iter().any(|e| e == OutputEvent::UnderflowTimedOut));
    }

    #[test]
    fn test_partial_frame_stays_buffered() {
        let (mut producer, consumer) = RingBuffer::new(64).unwrap().split();
        let (mut ctx, events) = context_with_channels(consumer, Duration::from_secs(60), 2);
        let left = 16384i16.to_le_bytes();
        let right = (-8192i16).to_le_bytes();

        // L R L: the trailing left sample is not a whole frame yet
        assert!(producer.enqueue(&[left, right, left].concat()));
        let mut out = [1.0f32; 4];
        ctx.render(&mut out);
        assert_eq!(out, [0.5, -0.25, 0.0, 0.0]);
        assert_eq!(
            events.try_recv().unwrap(),
            OutputEvent::Underflow { requested: Some(4) }
        );
        assert_eq!(ctx.consumer.len(), 2);

        assert!(producer.enqueue(&[right, left, right].concat()));
        ctx.render(&mut out);
        // Left slots still carry left samples
        assert_eq!(out, [0.5, -0.25, 0.5, -0.25]);
        assert!(ctx.consumer.is_empty());
        assert_eq!(ctx.samples_played.load(Ordering::Relaxed), 6);
    }
}
