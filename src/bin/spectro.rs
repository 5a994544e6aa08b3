//! Spectrum monitor
//!
//! Captures from an input device, analyzes it on a clock and prints one
//! JSON line per spectrum until interrupted.
//!
//! Usage: `spectro [config.toml]`

use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spectro::{
    analysis::SpectrumSnapshot,
    audio::{select_format, AudioCapture, AudioContext, AudioPlayback},
    clock::Scheduler,
    config::AppConfig,
    session::AnalysisSession,
};

/// One printed line
#[derive(Serialize)]
struct SpectrumLine {
    sequence: u64,
    peak_hz: Option<f64>,
    peak_dbfs: Option<f64>,
    bands: Vec<f64>,
}

fn load_config() -> AppConfig {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(AppConfig::default_path);

    match path {
        Some(path) if path.exists() => match AppConfig::load(&path) {
            Ok(config) => {
                tracing::info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!("Failed to load {}: {}, using defaults", path.display(), e);
                AppConfig::default()
            }
        },
        _ => AppConfig::default(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting spectro");

    let config = load_config();
    let context = AudioContext::new();

    // List available input devices
    eprintln!("\n=== Available Input Devices ({}) ===", context.host_name());
    for device in context.input_devices()? {
        let default_marker = if device.is_default() { " [DEFAULT]" } else { "" };
        eprintln!("  {}{}", device.name(), default_marker);
        if let Ok(caps) = device.capabilities() {
            eprintln!("    Channels: {:?}", caps.channel_counts());
        }
    }
    eprintln!();

    let device = context.input_device(config.audio.input_device.as_deref())?;
    let caps = device.capabilities()?;
    let format = select_format(
        &config.audio.sample_rates,
        config.audio.channels,
        config.audio.bit_depth,
        config.audio.signed,
        &caps,
    )
    .map_err(|result| anyhow::anyhow!("No usable format on '{}': {:?}", device.name(), result))?;
    tracing::info!("Negotiated {} on '{}'", format, device.name());

    let mut capture =
        AudioCapture::new(device).with_fill_threshold(config.audio.fill_threshold_bytes);
    let consumer = capture.initialize(format, config.audio.buffer_duration())?;

    let (spectrum_tx, mut spectrum_rx) = tokio::sync::mpsc::channel::<std::sync::Arc<SpectrumSnapshot>>(16);
    let mut session =
        AnalysisSession::new(consumer, format, config.analysis.fft_size)?.with_output(spectrum_tx);

    if config.playback.enabled {
        let output = context.output_device(config.playback.output_device.as_deref())?;
        tracing::info!("Passthrough to '{}'", output.name());
        let mut playback = AudioPlayback::new(output);
        playback.initialize(format, config.playback.latency(), config.playback.fill_timeout())?;
        playback.start()?;
        session = session.with_passthrough(playback, config.playback.latency())?;
    }

    let mut scheduler = Scheduler::new(config.analysis.clock.to_mode());
    scheduler.set_fill_signal(capture.events());
    let shared = session.run(&mut scheduler)?;
    capture.start()?;

    let edges = config.analysis.band_edges(format.sample_rate());
    let floor_db = config.analysis.floor_db;
    let mut health = tokio::time::interval(Duration::from_secs(5));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted");
                break;
            }
            Some(snapshot) = spectrum_rx.recv() => {
                let peak = snapshot.peak();
                let line = SpectrumLine {
                    sequence: snapshot.sequence(),
                    peak_hz: peak.map(|(hz, _)| hz),
                    peak_dbfs: peak.map(|(_, db)| db),
                    bands: snapshot.band_levels(&edges, floor_db),
                };
                println!("{}", serde_json::to_string(&line)?);
            }
            _ = health.tick() => {
                while let Some(e) = capture.check_errors() {
                    tracing::warn!("Capture stream error: {}", e);
                }
                tracing::debug!(
                    "Captured {} frames, latest spectrum {:?}",
                    capture.frames_captured(),
                    shared.latest_sequence()
                );
            }
        }
    }

    // Analysis first so nothing reads a buffer whose producer is gone
    scheduler.stop();
    capture.stop()?;
    capture.dispose();

    tracing::info!("Stopped");
    Ok(())
}
