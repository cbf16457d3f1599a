//! Audio device seams and the duplex pipeline built on them.
//!
//! Capture delivers fixed-size blocks of normalized `f32` samples to a
//! callback on the device's own cadence. Playback exposes a clock and accepts
//! buffers scheduled at an absolute time on that clock.

pub mod null;
pub mod pipeline;
#[cfg(feature = "pulse")]
pub mod pulse;

pub use pipeline::{AudioPipeline, DuplexAudio, PlaybackScheduler, SessionTap};

use crate::error::Result;
use async_trait::async_trait;

/// Called once per captured block. Must not block.
pub type BlockCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// A microphone that can be opened once per session.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Acquire the device and start delivering blocks of `block_size`
    /// samples. Fails with [`crate::error::SessionError::Device`] when the
    /// microphone is missing or refused.
    async fn open(
        &self,
        sample_rate: u32,
        block_size: usize,
        on_block: BlockCallback,
    ) -> Result<Box<dyn CaptureStream>>;
}

/// A running capture. `stop` is idempotent.
pub trait CaptureStream: Send {
    fn stop(&mut self);
}

/// A speaker that can be opened once per session.
#[async_trait]
pub trait PlaybackDevice: Send + Sync {
    async fn open(&self, sample_rate: u32) -> Result<Box<dyn PlaybackOutput>>;
}

/// An open output context with its own monotonic clock in seconds.
pub trait PlaybackOutput: Send {
    fn current_time(&self) -> f64;

    /// Queue `samples` to start at `start_at` on this output's clock.
    fn schedule(&mut self, start_at: f64, samples: Vec<f32>) -> Result<()>;

    /// Release the output. Idempotent.
    fn close(&mut self);
}
