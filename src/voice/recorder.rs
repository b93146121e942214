//! Utterance recording
//!
//! A recorder owns one microphone stream for one utterance. Every energy
//! sample the VAD takes drains the stream into the recording, so detection
//! and capture see the same audio.

use std::time::Duration;

use bytes::Bytes;

use super::vad::EnergyProbe;
use super::{MicStream, calculate_energy, samples_to_wav};
use crate::Result;

/// Content type of encoded utterances
pub const UTTERANCE_CONTENT_TYPE: &str = "audio/wav";

/// File name reported in the upload
pub const UTTERANCE_FILE_NAME: &str = "speech.wav";

/// One finalized span of user speech
#[derive(Debug, Clone)]
pub struct Utterance {
    pub data: Bytes,
    pub content_type: &'static str,
    pub file_name: &'static str,
    pub duration: Duration,
}

/// Captures one utterance from a microphone stream
pub struct UtteranceRecorder {
    stream: Box<dyn MicStream>,
    samples: Vec<f32>,
}

impl UtteranceRecorder {
    /// Start recording from a freshly opened stream
    #[must_use]
    pub fn start(stream: Box<dyn MicStream>) -> Self {
        tracing::trace!("recorder started");
        Self {
            stream,
            samples: Vec::new(),
        }
    }

    /// Pull pending audio into the recording; returns its energy
    pub fn pump(&mut self) -> f32 {
        let chunk = self.stream.take_samples();
        let energy = calculate_energy(&chunk);
        self.samples.extend_from_slice(&chunk);
        energy
    }

    /// Samples accumulated so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Stop capturing and encode what was recorded
    ///
    /// Returns `Ok(None)` when no audio was captured at all; that is a no-op,
    /// not an error, and must not be uploaded.
    ///
    /// # Errors
    ///
    /// Returns error if WAV encoding fails
    pub fn finish(mut self) -> Result<Option<Utterance>> {
        self.pump();
        self.stream.close();

        if self.samples.is_empty() {
            tracing::debug!("recorder stopped with no audio");
            return Ok(None);
        }

        let sample_rate = self.stream.sample_rate();
        let wav = samples_to_wav(&self.samples, sample_rate)?;
        let micros = self.samples.len() as u64 * 1_000_000 / u64::from(sample_rate.max(1));
        let duration = Duration::from_micros(micros);

        tracing::debug!(
            samples = self.samples.len(),
            bytes = wav.len(),
            duration_ms = duration.as_millis(),
            "utterance finalized"
        );

        Ok(Some(Utterance {
            data: Bytes::from(wav),
            content_type: UTTERANCE_CONTENT_TYPE,
            file_name: UTTERANCE_FILE_NAME,
            duration,
        }))
    }

    /// Stop capturing and discard the recording
    pub fn abort(mut self) {
        self.stream.close();
        tracing::debug!(samples = self.samples.len(), "recording discarded");
    }
}

impl EnergyProbe for UtteranceRecorder {
    fn sample_energy(&mut self) -> f32 {
        self.pump()
    }
}

impl Drop for UtteranceRecorder {
    fn drop(&mut self) {
        self.stream.close();
    }
}
