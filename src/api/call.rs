//! Streaming voice call endpoint
//!
//! `POST /api/call/stream` takes one multipart utterance (`audio`,
//! `character`, `language`, `sessionId`) and answers with the persona's
//! spoken reply as a chunked `audio/mpeg` body.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Multipart, Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::TryStreamExt;
use serde::Serialize;

use super::ApiState;
use crate::db::{CallRecord, TranscriptEntry};
use crate::pipeline::{TurnError, TurnOutcome, TurnRequest};
use crate::providers::AudioInput;

/// Header echoing the session id the turn was recorded under
pub const SESSION_HEADER: &str = "x-session-id";

/// Build call router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/stream", post(stream_call).fallback(method_not_allowed))
        .route("/{session_id}/transcript", get(transcript))
        .with_state(state)
}

/// Fields of one uploaded utterance
#[derive(Debug, Default)]
struct Upload {
    audio: Option<AudioInput>,
    character: Option<String>,
    language: Option<String>,
    session_id: Option<String>,
}

async fn read_upload(multipart: &mut Multipart) -> Result<Upload, CallError> {
    let mut upload = Upload::default();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        tracing::warn!(error = %e, "malformed multipart upload");
        CallError::MissingAudio
    })? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "audio" => {
                let file_name = field.file_name().unwrap_or("speech.wav").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field.bytes().await.map_err(|e| {
                    tracing::warn!(error = %e, "failed to read audio field");
                    CallError::MissingAudio
                })?;
                upload.audio = Some(AudioInput {
                    data,
                    file_name,
                    content_type,
                });
            }
            "character" | "language" | "sessionId" => {
                let value = field.text().await.map_err(|_| CallError::MissingAudio)?;
                let value = Some(value.trim().to_string()).filter(|v| !v.is_empty());
                match name.as_str() {
                    "character" => upload.character = value,
                    "language" => upload.language = value,
                    _ => upload.session_id = value,
                }
            }
            other => tracing::debug!(field = other, "ignoring unknown upload field"),
        }
    }

    Ok(upload)
}

/// Run one call turn and stream the spoken reply
async fn stream_call(
    State(state): State<Arc<ApiState>>,
    mut multipart: Multipart,
) -> Result<Response, CallError> {
    let upload = read_upload(&mut multipart).await?;
    let audio = upload.audio.ok_or(CallError::MissingAudio)?;
    let session_id = upload
        .session_id
        .unwrap_or_else(|| format!("call-{}", chrono::Utc::now().timestamp_millis()));

    tracing::debug!(session_id = %session_id, audio_bytes = audio.data.len(), "audio upload received");

    let request = TurnRequest {
        session_id,
        persona: upload.character,
        language: upload.language,
        audio,
    };

    match state.pipeline.run_turn(request).await {
        Ok(TurnOutcome::Speech(turn)) => {
            let session_id = turn.session_id.clone();
            let content_type = turn.content_type;
            let log_id = session_id.clone();
            let body = turn.into_stream().inspect_err(move |e| {
                tracing::error!(session_id = %log_id, error = %e, "synthesis stream failed mid-reply");
            });

            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CACHE_CONTROL, "no-cache")
                .header(SESSION_HEADER, session_id.as_str())
                .body(Body::from_stream(body))
                .map_err(|e| CallError::Failed(e.to_string()))
        }
        Ok(TurnOutcome::Silent) => Ok(StatusCode::NO_CONTENT.into_response()),
        Err(TurnError::EmptyAudio) => Err(CallError::EmptyAudio),
        Err(TurnError::Unintelligible) => Err(CallError::Unintelligible),
        Err(TurnError::Stage(e)) => {
            tracing::error!(error = %e, "voice call failed");
            Err(CallError::Failed(e.to_string()))
        }
    }
}

async fn method_not_allowed() -> CallError {
    CallError::MethodNotAllowed
}

/// Stored transcript response
#[derive(Debug, Serialize)]
pub struct TranscriptResponse {
    pub session: CallRecord,
    pub entries: Vec<TranscriptEntry>,
}

/// Read back a call transcript
async fn transcript(
    State(state): State<Arc<ApiState>>,
    Path(session_id): Path<String>,
) -> Result<Json<TranscriptResponse>, CallError> {
    let repo = state.pipeline.transcripts();
    let session = repo
        .find_session(&session_id)
        .map_err(|e| CallError::Failed(e.to_string()))?
        .ok_or(CallError::SessionNotFound)?;
    let entries = repo
        .transcript(&session_id)
        .map_err(|e| CallError::Failed(e.to_string()))?;

    Ok(Json(TranscriptResponse { session, entries }))
}

/// Call API errors
#[derive(Debug)]
pub enum CallError {
    MissingAudio,
    EmptyAudio,
    Unintelligible,
    MethodNotAllowed,
    SessionNotFound,
    Failed(String),
}

impl CallError {
    const fn status(&self) -> StatusCode {
        match self {
            Self::MissingAudio | Self::EmptyAudio | Self::Unintelligible => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::SessionNotFound => StatusCode::NOT_FOUND,
            Self::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    const fn message(&self) -> &'static str {
        match self {
            Self::MissingAudio => "Audio file missing or invalid",
            Self::EmptyAudio => "Audio file is empty",
            Self::Unintelligible => "Could not transcribe audio - please speak clearly",
            Self::MethodNotAllowed => "Method not allowed",
            Self::SessionNotFound => "Session not found",
            // Provider detail stays in the server log
            Self::Failed(_) => "Voice call failed.",
        }
    }
}

impl IntoResponse for CallError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: &'static str,
        }

        (self.status(), Json(ErrorResponse { error: self.message() })).into_response()
    }
}
