//! Server-side call turn pipeline
//!
//! One uploaded utterance becomes one streamed spoken reply:
//!
//! ```text
//! audio ──▶ transcribe ──▶ generate reply ──▶ synthesize (stream) ──▶ client
//!                 │                │
//!                 └──── transcript log (user, assistant) ────┘
//! ```
//!
//! Stages run strictly in order. Synthesis is only started once the reply
//! text exists, and the first audio chunk is pulled before the caller
//! commits to a response, so a provider that fails up front yields an
//! error instead of a truncated clip.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, Weak};

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::db::TranscriptRepo;
use crate::persona::PersonaRegistry;
use crate::providers::{
    AudioByteStream, AudioInput, ReplyGenerator, SpeechSynthesizer, Transcriber, VoiceSelection,
};
use crate::Error;

/// Tunables for the pipeline
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Reply spoken when the model returns nothing
    pub fallback_reply: String,
    /// Transcript entries passed to the model as context
    pub history_limit: usize,
    /// Voice used when a persona has none configured
    pub default_voice: String,
    /// Language used when neither request nor persona specify one
    pub default_language: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            fallback_reply: "Sorry, I lost my train of thought. Say that again?".to_string(),
            history_limit: 20,
            default_voice: "alloy".to_string(),
            default_language: "en".to_string(),
        }
    }
}

/// One uploaded utterance
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub persona: Option<String>,
    pub language: Option<String>,
    pub audio: AudioInput,
}

/// Why a turn produced no audio
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    /// Uploaded audio had zero bytes
    #[error("audio file is empty")]
    EmptyAudio,

    /// Transcription produced no text
    #[error("could not understand audio")]
    Unintelligible,

    /// A provider or storage stage failed
    #[error(transparent)]
    Stage(#[from] Error),
}

/// Result of a successful turn
pub enum TurnOutcome {
    /// Synthesis is streaming; `first_chunk` has already been received
    Speech(TurnAudio),
    /// The synthesizer finished without producing any audio
    Silent,
}

/// Streaming reply audio
pub struct TurnAudio {
    pub session_id: String,
    pub transcript: String,
    pub reply: String,
    pub content_type: &'static str,
    pub first_chunk: Bytes,
    pub rest: AudioByteStream,
}

impl TurnAudio {
    /// The complete ordered audio stream, first chunk included
    #[must_use]
    pub fn into_stream(self) -> AudioByteStream {
        let Self {
            first_chunk, rest, ..
        } = self;
        futures::stream::once(async move { Ok(first_chunk) })
            .chain(rest)
            .boxed()
    }
}

/// Serializes turns that share a session id
#[derive(Default)]
struct SessionLocks {
    inner: std::sync::Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl SessionLocks {
    async fn lock(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.retain(|_, weak| weak.strong_count() > 0);
            if let Some(existing) = map.get(session_id).and_then(Weak::upgrade) {
                existing
            } else {
                let created = Arc::new(Mutex::new(()));
                map.insert(session_id.to_string(), Arc::downgrade(&created));
                created
            }
        };

        mutex.lock_owned().await
    }
}

/// Runs call turns through transcription, reply generation, and synthesis
pub struct VoicePipeline {
    transcriber: Arc<dyn Transcriber>,
    generator: Arc<dyn ReplyGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    transcripts: TranscriptRepo,
    personas: Arc<PersonaRegistry>,
    settings: PipelineSettings,
    locks: SessionLocks,
}

impl VoicePipeline {
    /// Create a pipeline from its stages
    #[must_use]
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        generator: Arc<dyn ReplyGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        transcripts: TranscriptRepo,
        personas: Arc<PersonaRegistry>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            transcriber,
            generator,
            synthesizer,
            transcripts,
            personas,
            settings,
            locks: SessionLocks::default(),
        }
    }

    /// Persona registry used for selector resolution
    #[must_use]
    pub fn personas(&self) -> &PersonaRegistry {
        &self.personas
    }

    /// Transcript storage
    #[must_use]
    pub const fn transcripts(&self) -> &TranscriptRepo {
        &self.transcripts
    }

    /// Run one call turn
    ///
    /// The caller's text and the reply are appended to the session
    /// transcript as soon as the reply exists, whatever then happens to the
    /// audio on its way to the client.
    ///
    /// # Errors
    ///
    /// Returns [`TurnError::EmptyAudio`] or [`TurnError::Unintelligible`] for
    /// unusable input, [`TurnError::Stage`] when a provider or storage fails
    pub async fn run_turn(&self, request: TurnRequest) -> Result<TurnOutcome, TurnError> {
        if request.audio.data.is_empty() {
            return Err(TurnError::EmptyAudio);
        }

        let persona = self.personas.resolve(request.persona.as_deref())?;
        let language = request
            .language
            .clone()
            .filter(|l| !l.is_empty())
            .or_else(|| persona.voice.language.clone())
            .unwrap_or_else(|| self.settings.default_language.clone());
        let session_id = request.session_id.as_str();

        tracing::info!(
            session_id,
            persona = persona.id(),
            language = %language,
            audio_bytes = request.audio.data.len(),
            "call turn started"
        );

        let (transcript, reply) = {
            let _turn = self.locks.lock(session_id).await;

            let transcript = self
                .transcriber
                .transcribe(&request.audio, Some(&language))
                .await?;
            let transcript = transcript.trim().to_string();
            if transcript.is_empty() {
                tracing::warn!(session_id, "transcription returned no text");
                return Err(TurnError::Unintelligible);
            }
            tracing::info!(session_id, transcript = %transcript, "caller said");

            let history = self
                .transcripts
                .history(session_id, self.settings.history_limit)?;
            let reply = self
                .generator
                .generate(&persona.call_instructions(), &history, &transcript)
                .await?;
            let reply = if reply.trim().is_empty() {
                tracing::warn!(session_id, "reply generation returned no text, using fallback");
                self.settings.fallback_reply.clone()
            } else {
                reply.trim().to_string()
            };
            tracing::info!(session_id, reply = %reply, "persona replied");

            self.transcripts
                .ensure_session(session_id, persona.id(), Some(&language))?;
            self.transcripts.append_turn(session_id, &transcript, &reply)?;

            (transcript, reply)
        };

        let voice = VoiceSelection {
            voice_id: persona.resolve_voice(&self.settings.default_voice),
            stability: persona.voice.stability,
            similarity_boost: persona.voice.similarity_boost,
            language: Some(language),
        };
        let mut stream = self.synthesizer.synthesize_stream(&reply, &voice).await?;

        // Hold the response until real audio exists
        let first_chunk = loop {
            match stream.next().await {
                Some(Ok(chunk)) if chunk.is_empty() => {}
                Some(Ok(chunk)) => break chunk,
                Some(Err(e)) => return Err(TurnError::Stage(e)),
                None => {
                    tracing::warn!(session_id, "synthesis produced no audio");
                    return Ok(TurnOutcome::Silent);
                }
            }
        };

        tracing::debug!(session_id, first_chunk = first_chunk.len(), "synthesis streaming");

        Ok(TurnOutcome::Speech(TurnAudio {
            session_id: request.session_id,
            transcript,
            reply,
            content_type: self.synthesizer.content_type(),
            first_chunk,
            rest: stream,
        }))
    }
}
