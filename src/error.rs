//! Error types for companion calls

use thiserror::Error;

/// Result type alias for companion operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on either side of a voice call
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Persona not found
    #[error("persona not found: {0}")]
    PersonaNotFound(String),

    /// Audio device or encoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// Microphone access was refused or no input device exists.
    ///
    /// Fatal to call setup: recovering requires new user consent, so the
    /// controller never retries it.
    #[error("microphone unavailable: {0}")]
    MicrophoneDenied(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Reply generation error
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Call tone could not be played.
    ///
    /// Always non-fatal: callers log it and carry on without the tone.
    #[error("tone playback failed: {0}")]
    Tone(String),

    /// Playback was refused by the output sink even after the retry
    #[error("playback blocked: {0}")]
    PlaybackBlocked(String),

    /// Upload of an utterance failed before a reply arrived
    #[error("uplink error: {0}")]
    Uplink(String),

    /// A server pipeline stage failed
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// A call is already active on this controller
    #[error("a call is already in progress")]
    CallInProgress,

    /// The call was hung up before it finished connecting
    #[error("call ended while connecting")]
    CallEnded,

    /// Recording and playback tried to hold the audio device together
    #[error("audio device already held by {0}")]
    DuplexViolation(&'static str),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether this error only affects the current turn of a call
    ///
    /// Provider and upload failures leave the session usable; the user can
    /// simply speak again.
    #[must_use]
    pub const fn is_turn_local(&self) -> bool {
        matches!(
            self,
            Self::Stt(_)
                | Self::Llm(_)
                | Self::Tts(_)
                | Self::Uplink(_)
                | Self::Pipeline(_)
                | Self::Http(_)
                | Self::PlaybackBlocked(_)
        )
    }
}
