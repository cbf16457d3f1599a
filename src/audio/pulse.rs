//! PulseAudio microphone and speaker via the simple API.
//!
//! Each opened device runs on its own OS thread, since `Simple` reads and
//! writes block. Samples travel as 16-bit little-endian mono PCM.

use super::{BlockCallback, CaptureDevice, CaptureStream, PlaybackDevice, PlaybackOutput};
use crate::codec;
use crate::error::{Result, SessionError};
use async_trait::async_trait;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

const APP_NAME: &str = "sola";

fn mono_spec(rate: u32) -> Spec {
    Spec {
        format: Format::S16le,
        channels: 1,
        rate,
    }
}

fn connect(direction: Direction, device: Option<&str>, description: &str, rate: u32) -> Result<Simple> {
    let spec = mono_spec(rate);
    if !spec.is_valid() {
        return Err(SessionError::Device(format!("invalid sample spec at {} Hz", rate)));
    }
    Simple::new(
        None, // default server
        APP_NAME,
        direction,
        device,
        description,
        &spec,
        None, // default channel map
        None, // default buffering
    )
    .map_err(|e| SessionError::Device(format!("PulseAudio {}: {}", description, e)))
}

/// Microphone capture from the default (or a named) PulseAudio source.
#[derive(Debug, Clone, Default)]
pub struct PulseCapture {
    device: Option<String>,
}

impl PulseCapture {
    pub fn new(device: Option<String>) -> Self {
        Self { device }
    }
}

#[async_trait]
impl CaptureDevice for PulseCapture {
    async fn open(
        &self,
        sample_rate: u32,
        block_size: usize,
        mut on_block: BlockCallback,
    ) -> Result<Box<dyn CaptureStream>> {
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let device = self.device.clone();
        let flag = running.clone();

        let thread = std::thread::spawn(move || {
            let capture = match connect(Direction::Record, device.as_deref(), "microphone", sample_rate) {
                Ok(capture) => {
                    let _ = ready_tx.send(Ok(()));
                    capture
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            info!("Microphone capture connected ({:?})", device);

            let mut bytes = vec![0u8; block_size * 2];
            while flag.load(Ordering::SeqCst) {
                if let Err(e) = capture.read(&mut bytes) {
                    error!("Failed to read audio: {}", e);
                    break;
                }
                on_block(&codec::decode(&bytes));
            }
            debug!("Microphone capture thread exiting");
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(Box::new(PulseCaptureStream {
                running,
                thread: Some(thread),
            })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SessionError::Device("capture thread exited".to_string())),
        }
    }
}

struct PulseCaptureStream {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureStream for PulseCaptureStream {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // The thread finishes its current block read and exits; not joined
        // here so stop never blocks the caller.
        if self.thread.take().is_some() {
            debug!("Microphone capture stop requested");
        }
    }
}

impl Drop for PulseCaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Speaker output to the default PulseAudio sink.
#[derive(Debug, Clone, Default)]
pub struct PulsePlayback;

enum Chunk {
    Samples(Vec<f32>),
    Close,
}

#[async_trait]
impl PlaybackDevice for PulsePlayback {
    async fn open(&self, sample_rate: u32) -> Result<Box<dyn PlaybackOutput>> {
        let (tx, rx) = std_mpsc::channel::<Chunk>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        std::thread::spawn(move || {
            let output = match connect(Direction::Playback, None, "speaker", sample_rate) {
                Ok(output) => {
                    let _ = ready_tx.send(Ok(()));
                    output
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            while let Ok(chunk) = rx.recv() {
                match chunk {
                    Chunk::Samples(samples) => {
                        if let Err(e) = output.write(&codec::encode(&samples)) {
                            warn!("Playback write failed: {}", e);
                        }
                    }
                    Chunk::Close => break,
                }
            }
            if let Err(e) = output.drain() {
                debug!("Playback drain: {}", e);
            }
            debug!("Playback thread exiting");
        });

        ready_rx
            .await
            .map_err(|_| SessionError::Device("playback thread exited".to_string()))??;
        info!("Speaker output connected at {} Hz", sample_rate);

        Ok(Box::new(PulseOutput {
            tx: Some(tx),
            opened: Instant::now(),
            sample_rate,
            written_until: 0.0,
        }))
    }
}

struct PulseOutput {
    tx: Option<std_mpsc::Sender<Chunk>>,
    opened: Instant,
    sample_rate: u32,
    written_until: f64,
}

impl PlaybackOutput for PulseOutput {
    fn current_time(&self) -> f64 {
        self.opened.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, start_at: f64, samples: Vec<f32>) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        // The stream plays sequentially; the scheduler never leaves a gap.
        if start_at + 1e-3 < self.written_until {
            debug!("Playback scheduled {:.3}s before queue end", self.written_until - start_at);
        }
        self.written_until = start_at + codec::duration_secs(samples.len(), self.sample_rate);
        tx.send(Chunk::Samples(samples))
            .map_err(|_| SessionError::Device("playback thread stopped".to_string()))
    }

    fn close(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Chunk::Close);
        }
    }
}

impl Drop for PulseOutput {
    fn drop(&mut self) {
        self.close();
    }
}
