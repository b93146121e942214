//! Persona configuration and management
//!
//! A persona is the companion character a caller talks to. It carries the
//! system instructions used for reply generation and the voice used for
//! speech synthesis. Two personas are embedded in the binary; JSON files in
//! the persona directory override or extend them.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Identifier of the persona used when a caller does not pick one
pub const DEFAULT_PERSONA_ID: &str = "jinx";

/// Embedded personas
const BUILTIN_PERSONAS: &[(&str, &str)] = &[
    ("jinx", include_str!("../personas/jinx.json")),
    ("mf", include_str!("../personas/mf.json")),
];

/// A companion character
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    /// Semantic version of this persona file
    pub version: String,

    /// Core identity (required)
    pub identity: Identity,

    /// Voice used for synthesized replies
    #[serde(default)]
    pub voice: VoiceProfile,

    /// Behavior and communication style
    #[serde(default)]
    pub personality: Personality,
}

/// Core identity of the persona
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Unique identifier, matched against the `character` upload field
    pub id: String,

    /// Display name
    pub name: String,

    /// Short descriptive phrase
    pub tagline: Option<String>,
}

/// Voice configuration for speech synthesis
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceProfile {
    /// Explicit provider voice identifier
    pub voice_id: Option<String>,

    /// Environment variable holding the voice identifier
    pub voice_id_env: Option<String>,

    /// Voice stability (`ElevenLabs`)
    #[serde(default = "default_stability")]
    pub stability: f32,

    /// Similarity boost (`ElevenLabs`)
    #[serde(default = "default_similarity_boost")]
    pub similarity_boost: f32,

    /// Default language (BCP 47 code)
    pub language: Option<String>,
}

const fn default_stability() -> f32 {
    0.5
}

const fn default_similarity_boost() -> f32 {
    0.8
}

impl Default for VoiceProfile {
    fn default() -> Self {
        Self {
            voice_id: None,
            voice_id_env: None,
            stability: default_stability(),
            similarity_boost: default_similarity_boost(),
            language: None,
        }
    }
}

/// Behavior and communication style
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Personality {
    /// Base system prompt
    pub system_prompt: Option<String>,

    /// Additional instructions for voice calls
    pub voice_guidelines: Option<String>,
}

impl Persona {
    /// Parse a persona from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is invalid or the identity is incomplete
    pub fn from_json(json: &str) -> Result<Self> {
        let persona: Self = serde_json::from_str(json)?;
        if persona.identity.id.trim().is_empty() {
            return Err(Error::Config("persona id must not be empty".to_string()));
        }
        Ok(persona)
    }

    /// Persona identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.identity.id
    }

    /// Display name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// System instructions for voice-call replies
    #[must_use]
    pub fn call_instructions(&self) -> String {
        let base = self.personality.system_prompt.as_deref().unwrap_or_default();
        match self.personality.voice_guidelines.as_deref() {
            Some(guidelines) if !base.is_empty() => format!("{base}\n\n{guidelines}"),
            Some(guidelines) => guidelines.to_string(),
            None => base.to_string(),
        }
    }

    /// Resolve the synthesis voice: explicit id, then env var, then `fallback`
    #[must_use]
    pub fn resolve_voice(&self, fallback: &str) -> String {
        if let Some(id) = self.voice.voice_id.as_deref().filter(|v| !v.is_empty()) {
            return id.to_string();
        }

        self.voice
            .voice_id_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| fallback.to_string())
    }
}

/// Available personas keyed by id
#[derive(Debug, Clone)]
pub struct PersonaRegistry {
    personas: BTreeMap<String, Persona>,
    default_id: String,
}

impl PersonaRegistry {
    /// Registry with the embedded personas only
    ///
    /// # Errors
    ///
    /// Returns error if an embedded persona fails to parse
    pub fn builtin() -> Result<Self> {
        let mut personas = BTreeMap::new();
        for (id, json) in BUILTIN_PERSONAS {
            let persona = Persona::from_json(json)
                .map_err(|e| Error::Config(format!("embedded persona {id}: {e}")))?;
            personas.insert(persona.id().to_string(), persona);
        }

        Ok(Self {
            personas,
            default_id: DEFAULT_PERSONA_ID.to_string(),
        })
    }

    /// Embedded personas overlaid with `*.json` files from `dir`
    ///
    /// A missing directory is not an error. Files that fail to parse are
    /// skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns error if the embedded personas fail to parse or `dir` cannot be read
    pub fn load(dir: &Path) -> Result<Self> {
        let mut registry = Self::builtin()?;
        if !dir.is_dir() {
            tracing::debug!(path = %dir.display(), "persona directory not found, using built-ins");
            return Ok(registry);
        }

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match std::fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|json| Persona::from_json(&json))
            {
                Ok(persona) => {
                    tracing::debug!(persona = persona.id(), path = %path.display(), "loaded persona");
                    registry.insert(persona);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping invalid persona file");
                }
            }
        }

        Ok(registry)
    }

    /// Add or replace a persona
    pub fn insert(&mut self, persona: Persona) {
        self.personas.insert(persona.id().to_string(), persona);
    }

    /// Change the fallback persona
    ///
    /// # Errors
    ///
    /// Returns error if no persona with that id is registered
    pub fn set_default(&mut self, id: &str) -> Result<()> {
        if !self.personas.contains_key(id) {
            return Err(Error::PersonaNotFound(id.to_string()));
        }
        self.default_id = id.to_string();
        Ok(())
    }

    /// Look up a persona by exact id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Persona> {
        self.personas.get(id)
    }

    /// Resolve a caller-supplied selector, falling back to the default persona
    ///
    /// # Errors
    ///
    /// Returns error only if the default persona itself is missing
    pub fn resolve(&self, selector: Option<&str>) -> Result<&Persona> {
        let selector = selector.map(str::trim).filter(|s| !s.is_empty());
        if let Some(persona) = selector.and_then(|id| self.get(&id.to_lowercase())) {
            return Ok(persona);
        }

        if let Some(requested) = selector {
            tracing::warn!(requested, fallback = %self.default_id, "unknown persona, using default");
        }

        self.get(&self.default_id)
            .ok_or_else(|| Error::PersonaNotFound(self.default_id.clone()))
    }

    /// All personas ordered by id
    pub fn iter(&self) -> impl Iterator<Item = &Persona> {
        self.personas.values()
    }
}
