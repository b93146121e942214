//! Utterance upload to the call endpoint

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};

use super::CallSession;
use crate::providers::AudioByteStream;
use crate::voice::Utterance;
use crate::{Error, Result};

const STREAM_PATH: &str = "/api/call/stream";

/// What the server made of one utterance
pub enum UplinkReply {
    /// Synthesized speech, in arrival order
    Audio(AudioByteStream),
    /// Nothing to play; resume listening
    NoContent,
    /// The server refused the utterance
    Rejected { status: u16, message: String },
}

impl std::fmt::Debug for UplinkReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio(_) => f.write_str("Audio(..)"),
            Self::NoContent => f.write_str("NoContent"),
            Self::Rejected { status, message } => f
                .debug_struct("Rejected")
                .field("status", status)
                .field("message", message)
                .finish(),
        }
    }
}

/// Sends utterances to the server, one request each
#[async_trait]
pub trait VoiceUplink: Send + Sync {
    /// Upload `utterance`, consuming it
    ///
    /// # Errors
    ///
    /// Returns [`Error::Uplink`] if the request could not be completed
    async fn send(&self, session: &CallSession, utterance: Utterance) -> Result<UplinkReply>;
}

#[derive(serde::Deserialize)]
struct ErrorBody {
    error: String,
}

/// Multipart POST to `/api/call/stream`
#[derive(Debug, Clone)]
pub struct HttpUplink {
    client: reqwest::Client,
    url: String,
}

impl HttpUplink {
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(server_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("companion-call/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            url: format!("{}{STREAM_PATH}", server_url.trim_end_matches('/')),
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl VoiceUplink for HttpUplink {
    async fn send(&self, session: &CallSession, utterance: Utterance) -> Result<UplinkReply> {
        let bytes = utterance.data.len();
        let audio = Part::bytes(utterance.data.to_vec())
            .file_name(utterance.file_name)
            .mime_str(utterance.content_type)
            .map_err(|e| Error::Uplink(e.to_string()))?;

        let form = Form::new()
            .part("audio", audio)
            .text("character", session.persona.clone())
            .text("language", session.language.clone())
            .text("sessionId", session.id.clone());

        tracing::debug!(session_id = %session.id, bytes, "uploading utterance");

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Uplink(e.to_string()))?;

        let status = response.status();
        match status {
            StatusCode::OK => Ok(UplinkReply::Audio(
                response
                    .bytes_stream()
                    .map_err(|e| Error::Uplink(e.to_string()))
                    .boxed(),
            )),
            StatusCode::NO_CONTENT => Ok(UplinkReply::NoContent),
            _ => {
                let body = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<ErrorBody>(&body)
                    .map(|b| b.error)
                    .unwrap_or(body);
                tracing::debug!(status = status.as_u16(), message = %message, "utterance rejected");
                Ok(UplinkReply::Rejected {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }
}
