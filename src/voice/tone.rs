//! Call start/end tones
//!
//! Tones are best-effort. Failures come back as [`Error::Tone`] so the
//! caller can log them; they never stop a call from progressing.

use std::f32::consts::TAU;

use async_trait::async_trait;

use super::play_samples_blocking;
use crate::{Error, Result};

const TONE_SAMPLE_RATE: u32 = 24000;

/// Which tone to play
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTone {
    Start,
    End,
}

impl CallTone {
    /// (frequency Hz, duration ms) of each beep
    const fn beeps(self) -> &'static [(f32, u32)] {
        match self {
            Self::Start => &[(660.0, 120), (880.0, 160)],
            Self::End => &[(880.0, 120), (440.0, 220)],
        }
    }
}

/// Plays call tones
#[async_trait]
pub trait TonePlayer: Send + Sync {
    /// Play a tone
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tone`] if the tone could not be played
    async fn play(&self, tone: CallTone) -> Result<()>;
}

/// Sine beeps on the default output device
#[derive(Debug, Default, Clone, Copy)]
pub struct BeepTones;

/// Render a tone as mono samples with a short fade on each beep
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn render(tone: CallTone, sample_rate: u32) -> Vec<f32> {
    let rate = sample_rate as f32;
    let gap = (sample_rate / 25) as usize;
    let mut samples = Vec::new();

    for &(freq, ms) in tone.beeps() {
        let len = (sample_rate * ms / 1000) as usize;
        let fade = (len / 10).max(1);
        samples.extend((0..len).map(|i| {
            let envelope = (i.min(len - i) as f32 / fade as f32).min(1.0);
            0.2 * envelope * (TAU * freq * i as f32 / rate).sin()
        }));
        samples.extend(std::iter::repeat_n(0.0, gap));
    }

    samples
}

#[async_trait]
impl TonePlayer for BeepTones {
    async fn play(&self, tone: CallTone) -> Result<()> {
        let samples = render(tone, TONE_SAMPLE_RATE);
        tokio::task::spawn_blocking(move || play_samples_blocking(samples, TONE_SAMPLE_RATE))
            .await
            .map_err(|e| Error::Tone(e.to_string()))?
            .map_err(|e| Error::Tone(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tones_are_audible_and_bounded() {
        for tone in [CallTone::Start, CallTone::End] {
            let samples = render(tone, TONE_SAMPLE_RATE);
            assert!(!samples.is_empty());
            assert!(samples.iter().all(|s| s.abs() <= 0.2 + f32::EPSILON));
            assert!(samples.iter().any(|s| s.abs() > 0.1));
        }
    }

    #[test]
    fn test_tone_lengths_differ() {
        let start = render(CallTone::Start, TONE_SAMPLE_RATE).len();
        let end = render(CallTone::End, TONE_SAMPLE_RATE).len();
        assert!(end > start);
    }
}
