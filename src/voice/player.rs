//! Progressive audio player
//!
//! Chunks from the reply stream are appended to a [`MediaSink`] one at a
//! time, in arrival order, and playback starts right after the first
//! append. A play attempt refused by the platform is retried once, on the
//! next user interaction, while appends keep flowing.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{InteractionGate, MediaSink, PlayError, SinkFactory};
use crate::providers::AudioByteStream;
use crate::{Error, Result};

/// How a reply's playback ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// All audio was played
    Finished { chunks: usize },
    /// The stream carried no audio; nothing was played
    Empty,
    /// Hang-up arrived first; reading stopped
    Cancelled { chunks: usize },
}

/// Where playback currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Playing {
    NotStarted,
    /// First attempt was blocked; retry on interactions newer than `mark`
    AwaitingInteraction { mark: u64 },
    Started,
}

/// Plays streamed replies through sinks from a [`SinkFactory`]
pub struct ProgressivePlayer {
    sinks: Arc<dyn SinkFactory>,
    interactions: Arc<InteractionGate>,
}

impl ProgressivePlayer {
    #[must_use]
    pub fn new(sinks: Arc<dyn SinkFactory>, interactions: Arc<InteractionGate>) -> Self {
        Self { sinks, interactions }
    }

    /// Play `stream` to the end, or until `cancel` fires
    ///
    /// The sink is released on every path before this returns.
    ///
    /// # Errors
    ///
    /// Returns the stream's error if reading fails, [`Error::PlaybackBlocked`]
    /// if the retried play attempt also fails, or a sink error
    pub async fn play(&self, stream: AudioByteStream, cancel: &CancellationToken) -> Result<PlaybackOutcome> {
        if cancel.is_cancelled() {
            return Ok(PlaybackOutcome::Cancelled { chunks: 0 });
        }

        let mut sink = self.sinks.open().await?;
        let result = self.drive(sink.as_mut(), stream, cancel).await;
        sink.release();

        match &result {
            Ok(outcome) => tracing::debug!(?outcome, "playback ended"),
            Err(e) => tracing::warn!(error = %e, "playback failed"),
        }
        result
    }

    async fn drive(
        &self,
        sink: &mut dyn MediaSink,
        mut stream: AudioByteStream,
        cancel: &CancellationToken,
    ) -> Result<PlaybackOutcome> {
        let mut chunks = 0usize;
        let mut playing = Playing::NotStarted;
        let mut stream_done = false;

        loop {
            let awaiting = match playing {
                Playing::AwaitingInteraction { mark } => Some(mark),
                _ => None,
            };

            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    return Ok(PlaybackOutcome::Cancelled { chunks });
                }

                () = self.interactions.wait_after(awaiting.unwrap_or_default()), if awaiting.is_some() => {
                    tracing::debug!("retrying playback after user interaction");
                    sink.play().map_err(|e| Error::PlaybackBlocked(e.to_string()))?;
                    playing = Playing::Started;
                }

                next = stream.next(), if !stream_done => match next {
                    Some(Ok(chunk)) if chunk.is_empty() => {}
                    Some(Ok(chunk)) => {
                        let bytes = chunk.len();
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => return Ok(PlaybackOutcome::Cancelled { chunks }),
                            appended = sink.append(chunk) => appended?,
                        }
                        chunks += 1;
                        tracing::trace!(chunk = chunks, bytes, "chunk appended");

                        if playing == Playing::NotStarted {
                            playing = self.start(sink)?;
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        stream_done = true;
                        if chunks == 0 {
                            return Ok(PlaybackOutcome::Empty);
                        }
                        sink.end_of_stream();
                    }
                },

                () = sink.finished(), if stream_done && playing == Playing::Started => {
                    return Ok(PlaybackOutcome::Finished { chunks });
                }
            }
        }
    }

    /// First play attempt, made once the buffer holds audio
    fn start(&self, sink: &mut dyn MediaSink) -> Result<Playing> {
        match sink.play() {
            Ok(()) => Ok(Playing::Started),
            Err(PlayError::Blocked(reason)) => {
                tracing::warn!(reason = %reason, "playback blocked, waiting for user interaction");
                Ok(Playing::AwaitingInteraction {
                    mark: self.interactions.mark(),
                })
            }
            Err(PlayError::Device(e)) => Err(Error::Audio(e)),
        }
    }
}
