//! Analysis clock
//!
//! Fires ticks on one dedicated thread, independent of the hardware
//! callback cadence. Handlers run on that thread, so a tick never starts
//! while the previous one is still running; deadlines that pass during a
//! slow handler are skipped and counted on the next tick.
//!
//! In threshold mode a capture fill signal wakes the clock between polls,
//! so a frame is picked up as soon as the input side reports it.

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::BufferLevel;
use crate::audio::capture::InputEvent;
use crate::error::ClockError;

/// When the clock fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// Fixed period
    Interval(Duration),
    /// Check the level probe every `poll` and fire only once it reports
    /// at least `threshold_bytes`
    BufferThreshold {
        threshold_bytes: usize,
        poll: Duration,
    },
}

impl ClockMode {
    fn period(&self) -> Duration {
        match *self {
            ClockMode::Interval(period) => period,
            ClockMode::BufferThreshold { poll, .. } => poll,
        }
    }
}

/// One firing of the clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// 1-based count of fired ticks
    pub sequence: u64,
    /// Deadlines skipped since the previous tick
    pub skipped: u64,
}

type LevelProbe = Arc<dyn Fn() -> usize + Send + Sync>;

/// What ended a wait on the clock thread
enum Wake {
    Deadline,
    Filled,
    FillClosed,
    Stop,
}

/// Periodic tick source
pub struct Scheduler {
    mode: ClockMode,
    probe: Option<LevelProbe>,
    fill_signal: Option<Receiver<InputEvent>>,
    stop_tx: Option<Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
    ticks: Arc<AtomicU64>,
    skipped: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn new(mode: ClockMode) -> Self {
        Self {
            mode,
            probe: None,
            fill_signal: None,
            stop_tx: None,
            thread_handle: None,
            ticks: Arc::new(AtomicU64::new(0)),
            skipped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Fill-level source for `ClockMode::BufferThreshold`
    pub fn set_level_probe<F>(&mut self, probe: F)
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        self.probe = Some(Arc::new(probe));
    }

    /// Use a ring buffer's fill level as the probe
    pub fn set_buffer_level(&mut self, level: BufferLevel) {
        self.set_level_probe(move || level.len());
    }

    /// Capture notifications that trigger an early level check
    ///
    /// Only consulted in `ClockMode::BufferThreshold`.
    pub fn set_fill_signal(&mut self, events: Receiver<InputEvent>) {
        self.fill_signal = Some(events);
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    /// Start firing `handler` on the clock thread
    pub fn start<F>(&mut self, mut handler: F) -> Result<(), ClockError>
    where
        F: FnMut(&Tick) + Send + 'static,
    {
        if self.is_running() {
            return Err(ClockError::AlreadyRunning);
        }

        let period = self.mode.period();
        if period.is_zero() {
            return Err(ClockError::ZeroInterval);
        }

        let (gate, mut fill_signal) = match self.mode {
            ClockMode::Interval(_) => (None, None),
            ClockMode::BufferThreshold { threshold_bytes, .. } => {
                let probe = self.probe.clone().ok_or(ClockError::MissingProbe)?;
                (Some((probe, threshold_bytes)), self.fill_signal.clone())
            }
        };

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticks = self.ticks.clone();
        let skipped_total = self.skipped.clone();

        let handle = thread::Builder::new()
            .name("analysis-clock".to_string())
            .spawn(move || {
                let mut next = Instant::now() + period;
                let mut skipped = 0u64;

                loop {
                    let wait = next.saturating_duration_since(Instant::now());
                    let wake = match &fill_signal {
                        Some(events) => select! {
                            recv(stop_rx) -> _ => Wake::Stop,
                            recv(events) -> event => match event {
                                Ok(InputEvent::Filled { .. }) => Wake::Filled,
                                Err(_) => Wake::FillClosed,
                            },
                            default(wait) => Wake::Deadline,
                        },
                        None => match stop_rx.recv_timeout(wait) {
                            Err(RecvTimeoutError::Timeout) => Wake::Deadline,
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => Wake::Stop,
                        },
                    };

                    let early = match wake {
                        Wake::Stop => break,
                        Wake::FillClosed => {
                            fill_signal = None;
                            continue;
                        }
                        Wake::Filled => true,
                        Wake::Deadline => false,
                    };

                    let due = gate
                        .as_ref()
                        .map(|(probe, threshold)| probe() >= *threshold)
                        .unwrap_or(true);
                    if due {
                        let sequence = ticks.fetch_add(1, Ordering::Relaxed) + 1;
                        handler(&Tick { sequence, skipped });
                        skipped = 0;
                    }

                    // Early checks leave the poll schedule alone
                    if early {
                        continue;
                    }

                    next += period;
                    let now = Instant::now();
                    if now >= next {
                        let behind = (now - next).as_nanos() / period.as_nanos();
                        let missed = behind as u64 + 1;
                        next += period * missed as u32;
                        skipped += missed;
                        skipped_total.fetch_add(missed, Ordering::Relaxed);
                    }
                }
            })
            .map_err(|e| ClockError::Spawn(e.to_string()))?;

        self.stop_tx = Some(stop_tx);
        self.thread_handle = Some(handle);
        tracing::debug!("Clock started: {:?}", self.mode);
        Ok(())
    }

    /// Stop the clock and wait for an in-flight handler to finish
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.try_send(());
        }
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                tracing::error!("Clock thread panicked");
            }
            tracing::debug!("Clock stopped after {} ticks", self.ticks());
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }

    /// Ticks fired since creation
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Deadlines skipped since creation
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
