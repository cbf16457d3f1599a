//! Headless devices: a silent microphone and a speaker that only keeps time.

use super::{BlockCallback, CaptureDevice, CaptureStream, PlaybackDevice, PlaybackOutput};
use crate::codec;
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Emits blocks of silence at the real-time cadence of the configured rate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentCapture;

#[async_trait]
impl CaptureDevice for SilentCapture {
    async fn open(
        &self,
        sample_rate: u32,
        block_size: usize,
        mut on_block: BlockCallback,
    ) -> Result<Box<dyn CaptureStream>> {
        let period = Duration::from_secs_f64(codec::duration_secs(block_size, sample_rate));
        info!("Silent capture: {} samples every {:?}", block_size, period);

        let task = tokio::spawn(async move {
            let block = vec![0.0f32; block_size];
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                on_block(&block);
            }
        });

        Ok(Box::new(SilentStream { task: Some(task) }))
    }
}

struct SilentStream {
    task: Option<JoinHandle<()>>,
}

impl CaptureStream for SilentStream {
    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Silent capture stopped");
        }
    }
}

impl Drop for SilentStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accepts scheduled audio and discards it, tracking the clock only.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardPlayback;

#[async_trait]
impl PlaybackDevice for DiscardPlayback {
    async fn open(&self, sample_rate: u32) -> Result<Box<dyn PlaybackOutput>> {
        Ok(Box::new(DiscardOutput {
            opened: Instant::now(),
            sample_rate,
            queued_until: 0.0,
            closed: false,
        }))
    }
}

struct DiscardOutput {
    opened: Instant,
    sample_rate: u32,
    queued_until: f64,
    closed: bool,
}

impl PlaybackOutput for DiscardOutput {
    fn current_time(&self) -> f64 {
        self.opened.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, start_at: f64, samples: Vec<f32>) -> Result<()> {
        self.queued_until = start_at + codec::duration_secs(samples.len(), self.sample_rate);
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            debug!("Discard playback closed, {:.2}s of audio queued", self.queued_until);
        }
    }
}
