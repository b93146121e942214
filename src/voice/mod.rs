//! Client-side voice handling
//!
//! Microphone capture, silence detection, utterance recording, progressive
//! playback, and call tones. Hardware sits behind the traits below so the
//! call loop runs the same against cpal devices and test fakes.

mod capture;
mod playback;
pub mod player;
pub mod recorder;
mod tone;
pub mod vad;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

pub use capture::{CpalMicrophone, SAMPLE_RATE, calculate_energy, samples_to_wav};
pub use playback::{SpeakerFactory, SpeakerSink, play_samples_blocking};
pub use player::{PlaybackOutcome, ProgressivePlayer};
pub use recorder::{Utterance, UtteranceRecorder};
pub use tone::{BeepTones, CallTone, TonePlayer};
pub use vad::{EnergyProbe, SilenceWindow, VadOutcome, VadSettings, WindowState, detect_silence};

use crate::Result;

/// Source of fresh microphone streams, one per utterance
#[async_trait]
pub trait Microphone: Send + Sync {
    /// Open the input device
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::MicrophoneDenied`] when access is refused or
    /// no input device exists
    async fn open(&self) -> Result<Box<dyn MicStream>>;
}

/// A live microphone stream
pub trait MicStream: Send {
    /// PCM samples captured since the previous call
    fn take_samples(&mut self) -> Vec<f32>;

    /// Capture sample rate in Hz
    fn sample_rate(&self) -> u32;

    /// Stop capturing and release the device. Safe to call repeatedly.
    fn close(&mut self);
}

/// Why a sink refused to start playing
#[derive(Debug, thiserror::Error)]
pub enum PlayError {
    /// The platform refused unprompted playback; retry after user interaction
    #[error("playback blocked: {0}")]
    Blocked(String),

    /// The output device failed
    #[error("output device error: {0}")]
    Device(String),
}

/// Append-only playback buffer bound to an audio output
#[async_trait]
pub trait MediaSink: Send {
    /// Append one chunk; resolves once the buffer update has completed
    async fn append(&mut self, chunk: Bytes) -> Result<()>;

    /// Start audible playback of buffered audio
    fn play(&mut self) -> std::result::Result<(), PlayError>;

    /// No more chunks will be appended
    fn end_of_stream(&mut self);

    /// Resolves when all buffered audio has been played
    async fn finished(&mut self);

    /// Stop playback and release the output. Safe to call repeatedly.
    fn release(&mut self);
}

/// Opens a fresh [`MediaSink`] per reply
#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn MediaSink>>;
}

/// Counts user interactions so waiters never miss one
#[derive(Debug)]
pub struct InteractionGate {
    count: watch::Sender<u64>,
}

impl Default for InteractionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl InteractionGate {
    #[must_use]
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count }
    }

    /// Record one interaction
    pub fn interacted(&self) {
        self.count.send_modify(|n| *n += 1);
    }

    /// Current interaction count, used as the baseline for [`Self::wait_after`]
    #[must_use]
    pub fn mark(&self) -> u64 {
        *self.count.borrow()
    }

    /// Resolve once an interaction newer than `mark` has happened
    pub async fn wait_after(&self, mark: u64) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting
        let _ = rx.wait_for(|n| *n > mark).await;
    }
}
