//! External speech and language providers
//!
//! The voice pipeline talks to three providers, one per stage. Each sits
//! behind a trait so the pipeline can be exercised without network access.

pub mod llm;
pub mod stt;
pub mod tts;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::Result;
use crate::db::TranscriptEntry;

pub use llm::{LlmProvider, ReplyClient};
pub use stt::{SpeechToText, SttProvider};
pub use tts::{TextToSpeech, TtsProvider};

/// Ordered synthesized audio, yielded as the provider emits it
pub type AudioByteStream = BoxStream<'static, Result<Bytes>>;

/// Audio uploaded for transcription
#[derive(Debug, Clone)]
pub struct AudioInput {
    pub data: Bytes,
    pub file_name: String,
    pub content_type: String,
}

/// Speech-to-text stage
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe audio; an empty string means nothing intelligible was heard
    async fn transcribe(&self, audio: &AudioInput, language: Option<&str>) -> Result<String>;
}

/// Reply generation stage
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Generate the persona's reply to `input` given the call so far
    async fn generate(
        &self,
        instructions: &str,
        history: &[TranscriptEntry],
        input: &str,
    ) -> Result<String>;
}

/// Voice parameters for one synthesis request
#[derive(Debug, Clone)]
pub struct VoiceSelection {
    pub voice_id: String,
    pub stability: f32,
    pub similarity_boost: f32,
    pub language: Option<String>,
}

/// Streaming text-to-speech stage
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Start synthesis and return the provider's byte stream
    ///
    /// Resolves once the provider has accepted the request; audio then
    /// arrives incrementally through the returned stream.
    async fn synthesize_stream(&self, text: &str, voice: &VoiceSelection) -> Result<AudioByteStream>;

    /// Content type of the produced audio
    fn content_type(&self) -> &'static str {
        "audio/mpeg"
    }
}
