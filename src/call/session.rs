//! Call session state and events

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::CallConfig;
use crate::voice::VadSettings;

/// Lifecycle of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    Connecting,
    Listening,
    Processing,
    Speaking,
    Ending,
}

impl CallState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
            Self::Ending => "ending",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One call, from start tone to end tone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub id: String,
    pub persona: String,
    pub language: String,
    pub started_at: DateTime<Utc>,
}

impl CallSession {
    #[must_use]
    pub fn new(persona: impl Into<String>, language: impl Into<String>) -> Self {
        let started_at = Utc::now();
        Self {
            id: format!("call-{}", started_at.timestamp_millis()),
            persona: persona.into(),
            language: language.into(),
            started_at,
        }
    }
}

/// Things worth telling the user about during a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// The controller moved to a new state
    State(CallState),
    /// An utterance was uploaded
    UtteranceSent { bytes: usize },
    /// The server refused the utterance; the call keeps listening
    TurnRejected { status: u16, message: String },
    /// The turn failed; the call keeps listening
    TurnFailed(String),
    /// Reply playback ran to the end
    ReplyPlayed { chunks: usize },
    /// A tone could not be played
    ToneFailed(String),
    /// The call could not start
    SetupFailed(String),
    /// The microphone was lost mid-call and the call ended
    Dropped(String),
}

/// Client-side call parameters
#[derive(Debug, Clone)]
pub struct CallSettings {
    pub persona: String,
    pub language: String,
    pub vad: VadSettings,
    /// Pause after playback before the microphone re-arms
    pub rearm_delay: Duration,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            persona: "jinx".to_string(),
            language: "en".to_string(),
            vad: VadSettings::default(),
            rearm_delay: Duration::from_millis(200),
        }
    }
}

impl From<&CallConfig> for CallSettings {
    fn from(config: &CallConfig) -> Self {
        Self {
            persona: config.persona.clone(),
            language: config.language.clone(),
            vad: VadSettings {
                threshold: config.silence_threshold,
                silence_duration: config.silence_duration,
                sample_interval: config.sample_interval,
            },
            rearm_delay: config.rearm_delay,
        }
    }
}
