//! TOML configuration file loading
//!
//! Supports `~/.config/companion/config.toml` (or `$COMPANION_CONFIG`) as a
//! persistent config source. All fields are optional; the file is a partial
//! overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct CompanionConfigFile {
    /// Data directory (database)
    pub data_dir: Option<String>,

    /// Directory of persona JSON files overlaying the built-ins
    pub persona_dir: Option<String>,

    #[serde(default)]
    pub server: ServerFileConfig,

    #[serde(default)]
    pub voice: VoiceFileConfig,

    #[serde(default)]
    pub call: CallFileConfig,

    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Call endpoint server configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_upload_bytes: Option<usize>,
    /// Web UI directory served as fallback
    pub static_dir: Option<String>,
}

/// Provider selection for the turn pipeline
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// "whisper" or "deepgram"
    pub stt_provider: Option<String>,
    pub stt_model: Option<String>,
    /// "elevenlabs" or "openai"
    pub tts_provider: Option<String>,
    pub tts_model: Option<String>,
    /// Voice used when a persona has none
    pub tts_voice: Option<String>,
    /// "anthropic" or "openai"
    pub llm_provider: Option<String>,
    pub llm_model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub fallback_reply: Option<String>,
    pub history_limit: Option<usize>,
}

/// Client-side call loop configuration
#[derive(Debug, Default, Deserialize)]
pub struct CallFileConfig {
    pub server_url: Option<String>,
    pub persona: Option<String>,
    pub language: Option<String>,
    pub silence_threshold: Option<f32>,
    pub silence_duration_ms: Option<u64>,
    pub sample_interval_ms: Option<u64>,
    pub rearm_delay_ms: Option<u64>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub anthropic: Option<String>,
    pub elevenlabs: Option<String>,
    pub deepgram: Option<String>,
}

/// Parse a config file body
///
/// # Errors
///
/// Returns error if the TOML is malformed
pub fn parse_config_file(content: &str) -> Result<CompanionConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load the TOML config file from `path`
///
/// Returns `CompanionConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> CompanionConfigFile {
    let Some(path) = path else {
        return CompanionConfigFile::default();
    };

    if !path.exists() {
        return CompanionConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match parse_config_file(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                CompanionConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            CompanionConfigFile::default()
        }
    }
}

/// Return the default config file path: `~/.config/companion/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("companion").join("config.toml"))
}
