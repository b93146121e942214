//! Companion Call - real-time voice calls with AI companions
//!
//! This library provides both halves of a half-duplex voice call:
//! - Client: silence detection, utterance recording, progressive playback
//!   and the call loop that ties them together
//! - Server: the streaming call endpoint running transcription, reply
//!   generation and speech synthesis for each utterance
//! - Personas, transcript storage and configuration shared by both
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── client ────────────────────────────┐
//! │  mic → VAD → Recorder → CallSessionController → Player → speaker │
//! └───────────────────────────────┬──────────────▲─────────────────┘
//!                     multipart POST            │ chunked audio
//! ┌───────────────────────────────▼──────────────┴─────────────────┐
//! │  /api/call/stream → VoicePipeline: STT → LLM → streaming TTS     │
//! │                          └── transcript log (SQLite)             │
//! └─────────────────────────────── server ─────────────────────────┘
//! ```

pub mod api;
pub mod call;
pub mod config;
pub mod db;
pub mod error;
pub mod persona;
pub mod pipeline;
pub mod providers;
pub mod voice;

pub use api::{ApiServer, ApiServerBuilder, ApiState};
pub use call::{CallDevices, CallEvent, CallSession, CallSessionController, CallSettings, CallState};
pub use config::Config;
pub use db::{DbPool, TranscriptRepo};
pub use error::{Error, Result};
pub use persona::{Persona, PersonaRegistry};
pub use pipeline::{PipelineSettings, TurnError, TurnOutcome, TurnRequest, VoicePipeline};
