//! Analysis session
//!
//! Consumer side of one capture stream: drains the ring buffer on clock
//! ticks, assembles analysis frames, transforms them and publishes the
//! result. Optionally forwards the same PCM to a playback sink, feeding it
//! whenever the sink reports an underflow.

use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::analysis::{SharedSpectrum, SpectralAnalyzer, SpectrumSnapshot};
use crate::audio::accumulator::FrameAccumulator;
use crate::audio::buffer::RingConsumer;
use crate::audio::playback::{AudioPlayback, OutputEvent, PcmSink};
use crate::clock::Scheduler;
use crate::format::AudioFormat;
use crate::Result;

/// What one drain moved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Bytes taken from the ring buffer
    pub bytes: usize,
    /// Frames transformed and published
    pub frames: usize,
}

struct Passthrough {
    sink: Box<dyn PcmSink>,
    events: Receiver<OutputEvent>,
    accumulator: FrameAccumulator,
    /// Bytes handed over when an underflow does not say how many it needs
    default_request: usize,
    bytes_per_frame: usize,
    dropped: u64,
}

impl Passthrough {
    fn feed(&mut self, bytes: &[u8]) {
        // Anything beyond the latency budget is discarded
        if let Ok(outcome) = self.accumulator.push(bytes, true) {
            self.dropped += (bytes.len() - outcome.accepted) as u64;
        }
    }

    fn service(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                OutputEvent::Underflow { requested } => {
                    let wanted = requested.unwrap_or(self.default_request);
                    let size = wanted.min(self.accumulator.len());
                    // Whole frames only, or the sink's channels drift
                    let size = size - size % self.bytes_per_frame;
                    if size == 0 {
                        continue;
                    }
                    let Ok(pcm) = self.accumulator.pop_front(size) else {
                        continue;
                    };
                    if !self.sink.write(&pcm, 0, pcm.len()) {
                        tracing::debug!("Passthrough sink full, {} bytes dropped", pcm.len());
                        self.dropped += pcm.len() as u64;
                    }
                }
                OutputEvent::UnderflowTimedOut => {
                    tracing::warn!(
                        "Playback underflow timed out with {} bytes pending",
                        self.accumulator.len()
                    );
                }
            }
        }
    }
}

/// Consumer of one capture stream
pub struct AnalysisSession {
    consumer: RingConsumer,
    format: AudioFormat,
    accumulator: FrameAccumulator,
    analyzer: SpectralAnalyzer,
    /// Staging for bytes moved from the ring buffer to the accumulator
    scratch: Vec<u8>,
    shared: SharedSpectrum,
    output: Option<mpsc::Sender<Arc<SpectrumSnapshot>>>,
    passthrough: Option<Passthrough>,
    frames_published: u64,
}

impl AnalysisSession {
    /// Analyze `format` PCM from `consumer` in windows of `fft_size` frames
    pub fn new(consumer: RingConsumer, format: AudioFormat, fft_size: usize) -> Result<Self> {
        let analyzer = SpectralAnalyzer::new(fft_size, format.sample_rate())?;
        let frame_bytes = fft_size * format.bytes_per_frame();
        let accumulator = FrameAccumulator::new(frame_bytes)?;

        tracing::info!(
            "Analysis session: {}-point FFT, {:.2} Hz bins, {} byte frames",
            fft_size,
            analyzer.frequency_resolution(),
            frame_bytes
        );

        Ok(Self {
            consumer,
            format,
            accumulator,
            analyzer,
            scratch: vec![0; frame_bytes],
            shared: SharedSpectrum::new(),
            output: None,
            passthrough: None,
            frames_published: 0,
        })
    }

    /// Also send every snapshot to an async consumer
    pub fn with_output(mut self, tx: mpsc::Sender<Arc<SpectrumSnapshot>>) -> Self {
        self.output = Some(tx);
        self
    }

    /// Forward captured PCM to `playback`, buffering up to `latency`
    pub fn with_passthrough(self, playback: AudioPlayback, latency: Duration) -> Result<Self> {
        let events = playback.events();
        self.with_sink(Box::new(playback), events, latency)
    }

    /// Forward captured PCM to any sink driven by `events`
    pub fn with_sink(
        mut self,
        sink: Box<dyn PcmSink>,
        events: Receiver<OutputEvent>,
        latency: Duration,
    ) -> Result<Self> {
        let capacity = self
            .format
            .bytes_for_duration(latency)
            .max(self.format.bytes_per_frame());
        self.passthrough = Some(Passthrough {
            sink,
            events,
            accumulator: FrameAccumulator::new(capacity)?,
            default_request: self.analyzer.size() * self.format.bytes_per_frame(),
            bytes_per_frame: self.format.bytes_per_frame(),
            dropped: 0,
        });
        Ok(self)
    }

    /// Handle readers can poll for the latest spectrum
    pub fn shared(&self) -> SharedSpectrum {
        self.shared.clone()
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn analyzer(&self) -> &SpectralAnalyzer {
        &self.analyzer
    }

    pub fn frames_published(&self) -> u64 {
        self.frames_published
    }

    /// Passthrough bytes discarded so far
    pub fn passthrough_dropped(&self) -> u64 {
        self.passthrough.as_ref().map(|p| p.dropped).unwrap_or(0)
    }

    /// Move everything buffered into the analyzer
    ///
    /// Publishes one snapshot per completed frame. A trailing partial
    /// frame stays in the accumulator for the next drain.
    pub fn drain(&mut self) -> Result<DrainReport> {
        self.report_overflows();

        let mut report = DrainReport::default();
        loop {
            let want = self.accumulator.remaining();
            let n = self.consumer.dequeue_available(&mut self.scratch[..want]);
            if n == 0 {
                break;
            }
            self.accumulator.push(&self.scratch[..n], false)?;
            if let Some(passthrough) = self.passthrough.as_mut() {
                passthrough.feed(&self.scratch[..n]);
            }
            report.bytes += n;

            if self.accumulator.is_ready() {
                let frame = self.accumulator.pop()?;
                self.analyzer.fft_pcm(&frame, &self.format)?;
                self.publish();
                report.frames += 1;
            }
            if n < want {
                break;
            }
        }

        if let Some(passthrough) = self.passthrough.as_mut() {
            passthrough.service();
        }
        Ok(report)
    }

    fn publish(&mut self) {
        let snapshot = Arc::new(self.analyzer.snapshot());
        self.shared.publish(snapshot.clone());
        self.frames_published += 1;

        if let Some(tx) = &self.output {
            match tx.try_send(snapshot) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!("Spectrum receiver lagging, snapshot skipped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!("Spectrum receiver closed");
                    self.output = None;
                }
            }
        }
    }

    fn report_overflows(&self) {
        for overflow in self.consumer.drain_overflows() {
            tracing::warn!(
                "Capture overflow: {} bytes rejected with {} free ({} total)",
                overflow.requested,
                overflow.free,
                self.consumer.overflow_count()
            );
        }
    }

    /// Drain on every tick of `scheduler`
    ///
    /// The session moves onto the clock thread; read results through the
    /// returned handle.
    pub fn run(self, scheduler: &mut Scheduler) -> Result<SharedSpectrum> {
        let shared = self.shared();
        scheduler.set_buffer_level(self.consumer.level());

        let mut session = self;
        scheduler.start(move |tick| {
            if tick.skipped > 0 {
                tracing::debug!("Analysis tick {} skipped {} deadlines", tick.sequence, tick.skipped);
            }
            if let Err(e) = session.drain() {
                tracing::error!("Analysis drain failed: {}", e);
            }
        })?;
        Ok(shared)
    }
}
