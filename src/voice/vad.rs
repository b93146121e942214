//! Voice activity detection
//!
//! A fixed-interval sampler feeds mean energy into [`SilenceWindow`], which
//! arms on quiet input and fires once after a continuous run of silence.
//! Any sample at or above the threshold disarms the window, so only an
//! unbroken quiet span ends an utterance.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Something the detector can sample energy from
pub trait EnergyProbe {
    /// Mean energy of the newest analysis window
    fn sample_energy(&mut self) -> f32;
}

/// Detector tunables
#[derive(Debug, Clone, Copy)]
pub struct VadSettings {
    /// Energy below this is silence
    pub threshold: f32,
    /// Continuous silence needed to end an utterance
    pub silence_duration: Duration,
    /// Sampling period
    pub sample_interval: Duration,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            silence_duration: Duration::from_millis(1500),
            sample_interval: Duration::from_millis(16),
        }
    }
}

/// Silence timer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// No silence in progress
    Idle,
    /// Silence began at the given instant
    Armed { since: Instant },
    /// Completion already signalled
    Fired,
}

/// Debounced silence trigger
#[derive(Debug, Clone)]
pub struct SilenceWindow {
    threshold: f32,
    duration: Duration,
    state: WindowState,
}

impl SilenceWindow {
    #[must_use]
    pub const fn new(threshold: f32, duration: Duration) -> Self {
        Self {
            threshold,
            duration,
            state: WindowState::Idle,
        }
    }

    /// Feed one energy sample taken at `now`
    ///
    /// Returns `true` exactly once: on the first sample that completes a
    /// continuous silent span of at least the configured duration.
    pub fn observe(&mut self, energy: f32, now: Instant) -> bool {
        match self.state {
            WindowState::Fired => false,
            _ if energy >= self.threshold => {
                if matches!(self.state, WindowState::Armed { .. }) {
                    tracing::trace!(energy, "speech resumed, silence timer reset");
                }
                self.state = WindowState::Idle;
                false
            }
            WindowState::Idle => {
                self.state = WindowState::Armed { since: now };
                false
            }
            WindowState::Armed { since } => {
                if now.saturating_duration_since(since) >= self.duration {
                    self.state = WindowState::Fired;
                    true
                } else {
                    false
                }
            }
        }
    }

    #[must_use]
    pub const fn state(&self) -> WindowState {
        self.state
    }
}

/// How sampling ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadOutcome {
    /// Silence confirmed; the utterance is complete
    Silence,
    /// Sampling was cancelled before silence was confirmed
    Cancelled,
}

/// Sample `probe` until silence is confirmed or `cancel` fires
///
/// The sampling timer lives inside this future, so dropping or cancelling
/// it leaves nothing behind that could fire later.
pub async fn detect_silence<P>(probe: &mut P, settings: &VadSettings, cancel: &CancellationToken) -> VadOutcome
where
    P: EnergyProbe + ?Sized,
{
    let mut ticker = tokio::time::interval(settings.sample_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut window = SilenceWindow::new(settings.threshold, settings.silence_duration);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return VadOutcome::Cancelled,
            now = ticker.tick() => {
                let energy = probe.sample_energy();
                if window.observe(energy, now) {
                    tracing::debug!("silence confirmed, utterance complete");
                    return VadOutcome::Silence;
                }
            }
        }
    }
}
