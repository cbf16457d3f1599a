//! Sola - voice booking assistant
//!
//! Runs the orchestrator against the Gemini Live API and drives it from
//! stdin. Transcripts and notices are printed as they arrive.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use sola::audio::{AudioPipeline, CaptureDevice, PlaybackDevice};
use sola::calendar::IcsCalendar;
use sola::config::SolaConfig;
use sola::gemini_client::GeminiConnector;
use sola::orchestrator::{debug_booking, Orchestrator, TransitionDelays};
use sola::places::{PlaceSearch, StaticDirectory};
use sola::tools::Dispatcher;
use sola::view::{Role, SessionView};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const HELP: &str = "commands: start | stop | cancel | dial | status | quit";

#[cfg(feature = "pulse")]
fn audio_devices(config: &SolaConfig) -> (Arc<dyn CaptureDevice>, Arc<dyn PlaybackDevice>) {
    use sola::audio::pulse::{PulseCapture, PulsePlayback};
    info!("Using PulseAudio devices");
    (
        Arc::new(PulseCapture::new(config.audio_device.clone())),
        Arc::new(PulsePlayback),
    )
}

#[cfg(not(feature = "pulse"))]
fn audio_devices(_config: &SolaConfig) -> (Arc<dyn CaptureDevice>, Arc<dyn PlaybackDevice>) {
    use sola::audio::null::{DiscardPlayback, SilentCapture};
    warn!("Built without the pulse feature: capture is silent and playback is discarded");
    (Arc::new(SilentCapture), Arc::new(DiscardPlayback))
}

fn place_search(config: &SolaConfig) -> Result<Arc<dyn PlaceSearch>> {
    let directory = match &config.places_file {
        Some(path) => StaticDirectory::from_file(path)
            .with_context(|| format!("loading places from {}", path.display()))?,
        None => StaticDirectory::default(),
    };
    info!("Place directory has {} entries", directory.places().len());
    Ok(Arc::new(directory))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    info!("Starting sola");

    let config = SolaConfig::from_env().context("reading configuration")?;
    let connector = Arc::new(GeminiConnector::new(
        config.gemini().context("configuring the Gemini connection")?,
    ));

    let view = SessionView::new();
    let (capture, playback) = audio_devices(&config);
    let audio = AudioPipeline::new(
        capture,
        playback,
        view.volume(),
        config.input_rate,
        config.output_rate,
        config.block_size,
    );
    let calendar = Arc::new(IcsCalendar::new(config.calendar_file.clone()));
    info!("Appointments go to {}", calendar.path().display());
    let dispatcher = Dispatcher::new(place_search(&config)?, calendar, view.clone());

    let (orchestrator, handle) = Orchestrator::new(
        TransitionDelays::from(&config),
        connector,
        audio,
        dispatcher,
        view,
    );
    let task = orchestrator.spawn();

    let mut messages = handle.subscribe_messages();
    tokio::spawn(async move {
        loop {
            match messages.recv().await {
                Ok(message) => {
                    let who = match message.role {
                        Role::User => "you",
                        Role::Assistant => "sola",
                        Role::System => "*",
                    };
                    println!("[{}] {}: {}", message.timestamp.format("%H:%M:%S"), who, message.text);
                }
                Err(RecvError::Lagged(n)) => warn!("Skipped {} messages", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let sent = match line.trim() {
            "" => continue,
            "start" => handle.start(),
            "stop" => handle.stop(),
            "cancel" => handle.cancel_booking(),
            "dial" => handle.dial(debug_booking()),
            "status" => {
                let status = handle.status().await?;
                println!("phase: {}", status.phase);
                if let Some(booking) = &status.booking {
                    println!(
                        "booking: {} {} on {} at {} ({})",
                        booking.service, booking.place_name, booking.date, booking.time, booking.status
                    );
                }
                if let Some(appointment) = &status.appointment {
                    println!("appointment: {} at {}", appointment.provider_name, appointment.date_time);
                }
                if let Some(outcome) = &status.last_outcome {
                    println!("last outcome: {}", outcome);
                }
                Ok(())
            }
            "quit" | "exit" => break,
            other => {
                println!("unknown command {:?}; {}", other, HELP);
                Ok(())
            }
        };
        sent?;
    }

    handle.shutdown()?;
    task.await.context("orchestrator task panicked")?;
    info!("Shutting down");
    Ok(())
}
