//! Configuration management for companion calls
//!
//! Layering is env > TOML file > default. Personas contribute their own
//! voice settings at turn time, not here.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::persona::DEFAULT_PERSONA_ID;
use crate::providers::{LlmProvider, SttProvider, TtsProvider};
use crate::{Error, Result};

/// Default call endpoint port
pub const DEFAULT_PORT: u16 = 18790;

/// Companion configuration
#[derive(Debug)]
pub struct Config {
    /// Path to data directory (database)
    pub data_dir: PathBuf,

    /// Directory of persona JSON files overlaying the built-ins
    pub persona_dir: Option<PathBuf>,

    /// Call endpoint server
    pub server: ServerConfig,

    /// Turn pipeline providers
    pub voice: VoiceConfig,

    /// Client-side call loop
    pub call: CallConfig,

    /// API keys
    pub api_keys: ApiKeys,
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted utterance upload
    pub max_upload_bytes: usize,
    /// Path to static files directory (web UI)
    pub static_dir: Option<PathBuf>,
}

/// Provider selection and reply tuning
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub stt_provider: SttProvider,
    pub stt_model: String,
    pub tts_provider: TtsProvider,
    pub tts_model: String,
    /// Voice used when a persona has none configured
    pub tts_voice: String,
    pub llm_provider: LlmProvider,
    pub llm_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub fallback_reply: String,
    pub history_limit: usize,
}

/// Client call loop configuration
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Base URL of the call endpoint server
    pub server_url: String,
    pub persona: String,
    pub language: String,
    /// Mean energy below which the microphone counts as silent
    pub silence_threshold: f32,
    /// Continuous silence that ends an utterance
    pub silence_duration: Duration,
    /// VAD sampling period
    pub sample_interval: Duration,
    /// Pause between the end of playback and the next recording
    pub rearm_delay: Duration,
}

/// API keys for hosted providers
#[derive(Debug, Default)]
pub struct ApiKeys {
    pub openai: Option<SecretString>,
    pub anthropic: Option<SecretString>,
    pub elevenlabs: Option<SecretString>,
    pub deepgram: Option<SecretString>,
}

impl ApiKeys {
    /// Key for the given speech-to-text backend
    #[must_use]
    pub fn stt(&self, provider: SttProvider) -> Option<SecretString> {
        match provider {
            SttProvider::Whisper => copy(self.openai.as_ref()),
            SttProvider::Deepgram => copy(self.deepgram.as_ref()),
        }
    }

    /// Key for the given text-to-speech backend
    #[must_use]
    pub fn tts(&self, provider: TtsProvider) -> Option<SecretString> {
        match provider {
            TtsProvider::OpenAI => copy(self.openai.as_ref()),
            TtsProvider::ElevenLabs => copy(self.elevenlabs.as_ref()),
        }
    }

    /// Key for the given reply backend
    #[must_use]
    pub fn llm(&self, provider: LlmProvider) -> Option<SecretString> {
        match provider {
            LlmProvider::Anthropic => copy(self.anthropic.as_ref()),
            LlmProvider::OpenAI => copy(self.openai.as_ref()),
        }
    }
}

fn copy(key: Option<&SecretString>) -> Option<SecretString> {
    key.map(|k| SecretString::from(k.expose_secret().to_owned()))
}

fn secret(value: Option<String>) -> Option<SecretString> {
    value.filter(|v| !v.is_empty()).map(SecretString::from)
}

/// Return the default data directory, `~/.local/share/companion` on Linux
pub fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".local/share/companion"),
        |d| d.data_dir().join("companion"),
    )
}

impl Config {
    /// Load configuration from the process environment and config file
    ///
    /// # Errors
    ///
    /// Returns error if a provider name or numeric setting is invalid
    pub fn load() -> Result<Self> {
        let path = std::env::var("COMPANION_CONFIG")
            .ok()
            .map(PathBuf::from)
            .or_else(file::config_file_path);
        let fc = file::load_config_file(path.as_deref());

        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a provider name or numeric setting is invalid
    pub fn from_sources(
        fc: file::CompanionConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        // API keys (env > toml > None)
        let api_keys = ApiKeys {
            openai: secret(env("OPENAI_API_KEY").or(fc.api_keys.openai)),
            anthropic: secret(
                env("ANTHROPIC_API_KEY")
                    .or_else(|| env("CLAUDE_API_KEY"))
                    .or(fc.api_keys.anthropic),
            ),
            elevenlabs: secret(env("ELEVENLABS_API_KEY").or(fc.api_keys.elevenlabs)),
            deepgram: secret(env("DEEPGRAM_API_KEY").or(fc.api_keys.deepgram)),
        };

        let server = ServerConfig {
            host: env("COMPANION_HOST")
                .or(fc.server.host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_env(&env, "COMPANION_PORT")?
                .or(fc.server.port)
                .unwrap_or(DEFAULT_PORT),
            max_upload_bytes: fc
                .server
                .max_upload_bytes
                .unwrap_or(crate::api::DEFAULT_MAX_UPLOAD_BYTES),
            static_dir: env("COMPANION_STATIC_DIR")
                .or(fc.server.static_dir)
                .map(PathBuf::from),
        };

        let fv = fc.voice;
        let voice = VoiceConfig {
            stt_provider: env("COMPANION_STT_PROVIDER")
                .or(fv.stt_provider)
                .as_deref()
                .unwrap_or("whisper")
                .parse()?,
            stt_model: env("COMPANION_STT_MODEL")
                .or(fv.stt_model)
                .unwrap_or_else(|| "gpt-4o-transcribe".to_string()),
            tts_provider: env("COMPANION_TTS_PROVIDER")
                .or(fv.tts_provider)
                .as_deref()
                .unwrap_or("elevenlabs")
                .parse()?,
            tts_model: env("COMPANION_TTS_MODEL")
                .or(fv.tts_model)
                .unwrap_or_else(|| "eleven_multilingual_v2".to_string()),
            tts_voice: fv.tts_voice.unwrap_or_else(|| "alloy".to_string()),
            llm_provider: env("COMPANION_LLM_PROVIDER")
                .or(fv.llm_provider)
                .as_deref()
                .unwrap_or("anthropic")
                .parse()?,
            llm_model: env("COMPANION_LLM_MODEL")
                .or(fv.llm_model)
                .unwrap_or_else(|| "claude-sonnet-4-5".to_string()),
            max_tokens: fv.max_tokens.unwrap_or(200),
            temperature: fv.temperature.unwrap_or(0.7),
            fallback_reply: fv
                .fallback_reply
                .unwrap_or_else(|| crate::pipeline::PipelineSettings::default().fallback_reply),
            history_limit: fv.history_limit.unwrap_or(20),
        };

        let fcall = fc.call;
        let call = CallConfig {
            server_url: env("COMPANION_SERVER_URL")
                .or(fcall.server_url)
                .unwrap_or_else(|| format!("http://127.0.0.1:{DEFAULT_PORT}")),
            persona: fcall
                .persona
                .unwrap_or_else(|| DEFAULT_PERSONA_ID.to_string()),
            language: fcall.language.unwrap_or_else(|| "en".to_string()),
            silence_threshold: fcall.silence_threshold.unwrap_or(0.01),
            silence_duration: Duration::from_millis(fcall.silence_duration_ms.unwrap_or(1500)),
            sample_interval: Duration::from_millis(fcall.sample_interval_ms.unwrap_or(16)),
            rearm_delay: Duration::from_millis(fcall.rearm_delay_ms.unwrap_or(200)),
        };

        if call.sample_interval.is_zero() {
            return Err(Error::Config("sample_interval_ms must be positive".to_string()));
        }

        let data_dir = env("COMPANION_DATA_DIR")
            .or(fc.data_dir)
            .map_or_else(default_data_dir, PathBuf::from);
        let persona_dir = env("COMPANION_PERSONA_DIR")
            .or(fc.persona_dir)
            .map(PathBuf::from);

        Ok(Self {
            data_dir,
            persona_dir,
            server,
            voice,
            call,
            api_keys,
        })
    }

    /// Path of the transcript database
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("companion.db")
    }

    /// Persona directory, if configured and present
    #[must_use]
    pub fn persona_dir(&self) -> Option<&Path> {
        self.persona_dir.as_deref()
    }
}

fn parse_env<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    env(key)
        .map(|v| {
            v.parse()
                .map_err(|_| Error::Config(format!("{key} has an invalid value: {v}")))
        })
        .transpose()
}
