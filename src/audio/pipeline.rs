//! Audio duplex pipeline
//!
//! Capture: every block from the microphone updates the volume meter, is
//! encoded to PCM16 and sent to the open session, or dropped when no session
//! is open. Playback: inbound fragments are decoded and scheduled back to
//! back on the output clock.

use super::{BlockCallback, CaptureDevice, CaptureStream, PlaybackDevice, PlaybackOutput};
use crate::codec;
use crate::error::Result;
use crate::session::LiveSession;
use crate::view::VolumeMeter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, trace, warn};

/// Gapless, overlap-free placement of playback buffers.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PlaybackScheduler {
    next_start: f64,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Where the next buffer would start if it arrived now.
    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    /// Reserve `duration` seconds and return the start time.
    pub fn reserve(&mut self, now: f64, duration: f64) -> f64 {
        let start = now.max(self.next_start);
        self.next_start = start + duration;
        start
    }

    pub fn reset(&mut self) {
        self.next_start = 0.0;
    }
}

/// The capture callback's view of the current session.
///
/// The callback only ever reads two things: the open flag and the attached
/// session. Both are flipped from the orchestrator task.
#[derive(Clone, Default)]
pub struct SessionTap {
    session: Arc<RwLock<Option<Arc<dyn LiveSession>>>>,
    open: Arc<AtomicBool>,
}

impl SessionTap {
    pub fn attach(&self, session: Arc<dyn LiveSession>) {
        match self.session.write() {
            Ok(mut slot) => *slot = Some(session),
            Err(poisoned) => *poisoned.into_inner() = Some(session),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Disconnect the processing node from the session.
    pub fn detach(&self) {
        self.set_open(false);
        match self.session.write() {
            Ok(mut slot) => *slot = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    fn send(&self, pcm: Vec<u8>, sample_rate: u32) -> bool {
        let session = match self.session.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match session {
            Some(session) => match session.send_audio(pcm, sample_rate) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Audio block not sent: {}", e);
                    false
                }
            },
            None => false,
        }
    }
}

/// Build the per-block capture callback.
fn block_processor(tap: SessionTap, meter: VolumeMeter, sample_rate: u32) -> BlockCallback {
    let mut dropped: u64 = 0;
    Box::new(move |block: &[f32]| {
        meter.set(codec::rms(block));
        if !tap.is_open() || !tap.send(codec::encode(block), sample_rate) {
            dropped += 1;
            trace!("Dropped capture block ({} total)", dropped);
        }
    })
}

/// Opens the per-session audio resource set.
#[derive(Clone)]
pub struct AudioPipeline {
    capture: Arc<dyn CaptureDevice>,
    playback: Arc<dyn PlaybackDevice>,
    meter: VolumeMeter,
    input_rate: u32,
    output_rate: u32,
    block_size: usize,
}

impl AudioPipeline {
    pub fn new(
        capture: Arc<dyn CaptureDevice>,
        playback: Arc<dyn PlaybackDevice>,
        meter: VolumeMeter,
        input_rate: u32,
        output_rate: u32,
        block_size: usize,
    ) -> Self {
        Self {
            capture,
            playback,
            meter,
            input_rate,
            output_rate,
            block_size,
        }
    }

    pub fn meter(&self) -> &VolumeMeter {
        &self.meter
    }

    /// Open the output context and the microphone. Capture starts at once but
    /// blocks are dropped until a session is attached and marked open.
    pub async fn acquire(&self) -> Result<DuplexAudio> {
        let mut output = self.playback.open(self.output_rate).await?;
        let tap = SessionTap::default();
        let on_block = block_processor(tap.clone(), self.meter.clone(), self.input_rate);

        let capture = match self
            .capture
            .open(self.input_rate, self.block_size, on_block)
            .await
        {
            Ok(capture) => capture,
            Err(e) => {
                output.close();
                return Err(e);
            }
        };

        info!(
            "Audio acquired: capture {} Hz x {} samples, playback {} Hz",
            self.input_rate, self.block_size, self.output_rate
        );
        Ok(DuplexAudio {
            tap,
            capture: Some(capture),
            output: Some(output),
            scheduler: PlaybackScheduler::new(),
            output_rate: self.output_rate,
        })
    }
}

/// Audio resources owned by one live session.
pub struct DuplexAudio {
    tap: SessionTap,
    capture: Option<Box<dyn CaptureStream>>,
    output: Option<Box<dyn PlaybackOutput>>,
    scheduler: PlaybackScheduler,
    output_rate: u32,
}

impl DuplexAudio {
    pub fn tap(&self) -> &SessionTap {
        &self.tap
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    /// Decode one inbound PCM16 fragment and queue it after the previous one.
    pub fn play(&mut self, pcm: &[u8]) -> Result<()> {
        let Some(output) = self.output.as_mut() else {
            trace!("Playback closed, dropping {} bytes", pcm.len());
            return Ok(());
        };
        let samples = codec::decode(pcm);
        if samples.is_empty() {
            return Ok(());
        }
        let duration = codec::duration_secs(samples.len(), self.output_rate);
        let start = self.scheduler.reserve(output.current_time(), duration);
        trace!("Scheduling {:.3}s of audio at {:.3}", duration, start);
        output.schedule(start, samples)
    }

    /// Tear down in order: processing node, microphone, output context.
    /// Each step is skipped if already done.
    pub fn release(&mut self) {
        self.tap.detach();
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
            debug!("Capture stream stopped");
        }
        if let Some(mut output) = self.output.take() {
            output.close();
            debug!("Playback output closed");
        }
        self.scheduler.reset();
    }

    pub fn is_released(&self) -> bool {
        self.capture.is_none() && self.output.is_none()
    }
}

impl Drop for DuplexAudio {
    fn drop(&mut self) {
        if !self.is_released() {
            warn!("Audio resources dropped without release");
            self.release();
        }
    }
}
