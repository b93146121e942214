//! Call session controller
//!
//! Runs the listen, upload, speak loop of one call on a background task.
//! State changes are published on a watch channel and user-facing events
//! on a broadcast channel. Hang-up cancels the task and waits for it, so
//! nothing from the call outlives [`CallSessionController::hang_up`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::client::{UplinkReply, VoiceUplink};
use super::duplex::{AudioDevice, DeviceRole};
use super::session::{CallEvent, CallSession, CallSettings, CallState};
use crate::voice::{
    CallTone, InteractionGate, MicStream, Microphone, PlaybackOutcome, ProgressivePlayer,
    SinkFactory, TonePlayer, UtteranceRecorder, VadOutcome, detect_silence,
};
use crate::{Error, Result};

const EVENT_CAPACITY: usize = 64;

/// Hardware and network the controller drives
#[derive(Clone)]
pub struct CallDevices {
    pub microphone: Arc<dyn Microphone>,
    pub sinks: Arc<dyn SinkFactory>,
    pub uplink: Arc<dyn VoiceUplink>,
    pub tones: Arc<dyn TonePlayer>,
}

/// How one turn of the loop ended
enum Flow {
    Continue,
    HungUp,
}

struct Shared {
    devices: CallDevices,
    settings: CallSettings,
    state: watch::Sender<CallState>,
    events: broadcast::Sender<CallEvent>,
    interactions: Arc<InteractionGate>,
    stop_requests: InteractionGate,
    device: AudioDevice,
    player: ProgressivePlayer,
}

struct ActiveCall {
    session: CallSession,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    ended: Arc<AtomicBool>,
}

/// Owns at most one call at a time
pub struct CallSessionController {
    shared: Arc<Shared>,
    active: Mutex<Option<ActiveCall>>,
}

impl CallSessionController {
    #[must_use]
    pub fn new(devices: CallDevices, settings: CallSettings) -> Self {
        let (state, _) = watch::channel(CallState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let interactions = Arc::new(InteractionGate::new());
        let player = ProgressivePlayer::new(Arc::clone(&devices.sinks), Arc::clone(&interactions));

        Self {
            shared: Arc::new(Shared {
                devices,
                settings,
                state,
                events,
                interactions,
                stop_requests: InteractionGate::new(),
                device: AudioDevice::new(),
                player,
            }),
            active: Mutex::new(None),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CallState {
        *self.shared.state.borrow()
    }

    /// Watch state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.shared.state.subscribe()
    }

    /// Receive call events from now on
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.events.subscribe()
    }

    /// The audio device shared by recording and playback
    #[must_use]
    pub fn audio_device(&self) -> AudioDevice {
        self.shared.device.clone()
    }

    /// Session of the running call, if any
    pub async fn active_session(&self) -> Option<CallSession> {
        let active = self.active.lock().await;
        active
            .as_ref()
            .filter(|call| !call.task.is_finished())
            .map(|call| call.session.clone())
    }

    /// A user interaction: retries blocked playback and ends the current
    /// recording early
    pub fn interact(&self) {
        self.shared.interactions.interacted();
        self.shared.stop_requests.interacted();
    }

    /// End the current recording now instead of waiting for silence
    pub fn force_stop(&self) {
        self.shared.stop_requests.interacted();
    }

    /// Start a call
    ///
    /// Registers the call, then plays the start tone and opens the
    /// microphone before handing over to the call loop. The call can be hung
    /// up while it connects.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CallInProgress`] if a call is running, the
    /// microphone error that prevented the call from starting, or
    /// [`Error::CallEnded`] when it was hung up before connecting
    pub async fn start_call(&self) -> Result<CallSession> {
        let (session, connected) = {
            let mut active = self.active.lock().await;
            if active.as_ref().is_some_and(|call| !call.task.is_finished()) {
                return Err(Error::CallInProgress);
            }
            if let Some(stale) = active.take() {
                let _ = stale.task.await;
            }

            let shared = &self.shared;
            let session = CallSession::new(&shared.settings.persona, &shared.settings.language);
            tracing::info!(session_id = %session.id, persona = %session.persona, "starting call");
            shared.set_state(CallState::Connecting);

            let cancel = CancellationToken::new();
            let ended = Arc::new(AtomicBool::new(false));
            let (connected_tx, connected) = oneshot::channel();
            let span = tracing::info_span!("call", session_id = %session.id);
            let task = tokio::spawn(
                connect_and_run(
                    Arc::clone(shared),
                    session.clone(),
                    cancel.clone(),
                    Arc::clone(&ended),
                    connected_tx,
                )
                .instrument(span),
            );

            *active = Some(ActiveCall {
                session: session.clone(),
                cancel,
                task,
                ended,
            });
            (session, connected)
        };

        match connected.await {
            Ok(Ok(())) => Ok(session),
            Ok(Err(e)) => {
                self.reap(&session.id).await;
                Err(e)
            }
            Err(_) => Err(Error::CallEnded),
        }
    }

    /// Drop the entry of a call that never connected
    async fn reap(&self, session_id: &str) {
        let mut active = self.active.lock().await;
        if let Some(call) = active.take_if(|call| call.session.id == session_id) {
            let _ = call.task.await;
        }
    }

    /// End the call
    ///
    /// Cancels in-flight reads, waits for the call task to release the
    /// microphone and the player, plays the end tone and returns to
    /// [`CallState::Idle`]. Does nothing when no call is active.
    pub async fn hang_up(&self) {
        let mut active = self.active.lock().await;
        let Some(call) = active.take() else {
            tracing::debug!("hang-up with no active call");
            return;
        };

        tracing::info!(session_id = %call.session.id, "hanging up");
        call.cancel.cancel();
        if !call.ended.load(Ordering::SeqCst) {
            self.shared.set_state(CallState::Ending);
        }

        if let Err(e) = call.task.await {
            tracing::error!(error = %e, "call task failed");
        }
        self.shared.finish(&call.ended).await;
    }
}

impl Drop for CallSessionController {
    fn drop(&mut self) {
        if let Some(call) = self.active.get_mut() {
            call.cancel.cancel();
        }
    }
}

async fn connect_and_run(
    shared: Arc<Shared>,
    session: CallSession,
    cancel: CancellationToken,
    ended: Arc<AtomicBool>,
    connected: oneshot::Sender<Result<()>>,
) {
    let opened = tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        opened = shared.connect() => Some(opened),
    };

    let stream = match opened {
        Some(Ok(stream)) => stream,
        Some(Err(e)) => {
            tracing::error!(error = %e, "call setup failed");
            ended.store(true, Ordering::SeqCst);
            shared.emit(CallEvent::SetupFailed(e.to_string()));
            shared.set_state(CallState::Idle);
            let _ = connected.send(Err(e));
            return;
        }
        None => {
            // Anything half-opened was dropped with the connect future
            tracing::debug!("hung up while connecting");
            let _ = connected.send(Err(Error::CallEnded));
            return;
        }
    };

    let _ = connected.send(Ok(()));
    run_call(shared, session, stream, cancel, ended).await;
}

async fn run_call(
    shared: Arc<Shared>,
    session: CallSession,
    first_stream: Box<dyn MicStream>,
    cancel: CancellationToken,
    ended: Arc<AtomicBool>,
) {
    let mut pending = Some(first_stream);

    loop {
        match shared.turn(&session, pending.take(), &cancel).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::HungUp) => {
                tracing::debug!("call loop stopped");
                return;
            }
            Err(e) if e.is_turn_local() => {
                tracing::warn!(error = %e, "turn failed");
                shared.emit(CallEvent::TurnFailed(e.to_string()));
            }
            Err(e) => {
                tracing::error!(error = %e, "call dropped");
                shared.emit(CallEvent::Dropped(e.to_string()));
                shared.finish(&ended).await;
                return;
            }
        }
    }
}

impl Shared {
    fn set_state(&self, next: CallState) {
        self.transition(next, None);
    }

    /// Move to a turn state unless the call is being hung up
    fn advance(&self, next: CallState, cancel: &CancellationToken) -> bool {
        self.transition(next, Some(cancel))
    }

    fn transition(&self, next: CallState, cancel: Option<&CancellationToken>) -> bool {
        let mut allowed = true;
        self.state.send_if_modified(|state| {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                allowed = false;
                return false;
            }
            if *state == next {
                return false;
            }
            *state = next;
            tracing::debug!(state = %next, "call state");
            // Emitted under the state lock so events follow state order
            self.emit(CallEvent::State(next));
            true
        });
        allowed
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn tone(&self, tone: CallTone) {
        if let Err(e) = self.devices.tones.play(tone).await {
            tracing::warn!(?tone, error = %e, "call tone failed");
            self.emit(CallEvent::ToneFailed(e.to_string()));
        }
    }

    /// Start tone, then a fresh microphone stream
    async fn connect(&self) -> Result<Box<dyn MicStream>> {
        self.tone(CallTone::Start).await;
        self.devices.microphone.open().await
    }

    /// Ending tone and back to idle, once per call
    async fn finish(&self, ended: &AtomicBool) {
        if ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(CallState::Ending);
        self.tone(CallTone::End).await;
        self.set_state(CallState::Idle);
    }

    /// One listen, upload, speak cycle
    ///
    /// Turn-local failures are reported as events and end the turn early;
    /// only errors that make further turns impossible are returned.
    async fn turn(
        &self,
        session: &CallSession,
        stream: Option<Box<dyn MicStream>>,
        cancel: &CancellationToken,
    ) -> Result<Flow> {
        let capture = self.device.acquire(DeviceRole::Capture)?;

        let mut stream = match stream {
            Some(stream) => stream,
            None => tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(Flow::HungUp),
                opened = self.devices.microphone.open() => opened?,
            },
        };

        if !self.advance(CallState::Listening, cancel) {
            stream.close();
            return Ok(Flow::HungUp);
        }
        let stop_mark = self.stop_requests.mark();
        let mut recorder = UtteranceRecorder::start(stream);

        let heard = tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            () = self.stop_requests.wait_after(stop_mark) => {
                tracing::debug!("recording stopped by user");
                true
            }
            outcome = detect_silence(&mut recorder, &self.settings.vad, cancel) => {
                outcome == VadOutcome::Silence
            }
        };

        if !heard {
            recorder.abort();
            return Ok(Flow::HungUp);
        }

        let utterance = recorder.finish()?;
        drop(capture);

        let Some(utterance) = utterance else {
            return Ok(Flow::Continue);
        };

        if !self.advance(CallState::Processing, cancel) {
            return Ok(Flow::HungUp);
        }
        self.emit(CallEvent::UtteranceSent {
            bytes: utterance.data.len(),
        });

        let reply = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(Flow::HungUp),
            reply = self.devices.uplink.send(session, utterance) => reply,
        };

        let mut audio = match reply {
            Ok(UplinkReply::Audio(audio)) => audio,
            Ok(UplinkReply::NoContent) => {
                tracing::debug!("no reply audio, listening again");
                return Ok(Flow::Continue);
            }
            Ok(UplinkReply::Rejected { status, message }) => {
                tracing::warn!(status, message = %message, "utterance rejected");
                self.emit(CallEvent::TurnRejected { status, message });
                return Ok(Flow::Continue);
            }
            Err(e) => {
                tracing::warn!(error = %e, "turn failed");
                self.emit(CallEvent::TurnFailed(e.to_string()));
                return Ok(Flow::Continue);
            }
        };

        // Speaking starts with the first chunk, not with the response headers
        let first = loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(Flow::HungUp),
                next = audio.next() => next,
            };
            match next {
                Some(Ok(chunk)) if chunk.is_empty() => {}
                Some(Ok(chunk)) => break chunk,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "reply stream failed");
                    self.emit(CallEvent::TurnFailed(e.to_string()));
                    return Ok(Flow::Continue);
                }
                None => {
                    tracing::debug!("reply carried no audio");
                    return Ok(Flow::Continue);
                }
            }
        };

        let playback = self.device.acquire(DeviceRole::Playback)?;
        if !self.advance(CallState::Speaking, cancel) {
            return Ok(Flow::HungUp);
        }

        let stream = futures::stream::once(async move { Ok(first) })
            .chain(audio)
            .boxed();
        let played = self.player.play(stream, cancel).await;
        drop(playback);

        match played {
            Ok(PlaybackOutcome::Cancelled { chunks }) => {
                tracing::debug!(chunks, "playback cut short by hang-up");
                return Ok(Flow::HungUp);
            }
            Ok(PlaybackOutcome::Finished { chunks }) => {
                self.emit(CallEvent::ReplyPlayed { chunks });
            }
            Ok(PlaybackOutcome::Empty) => {}
            Err(e) => {
                tracing::warn!(error = %e, "reply playback failed");
                self.emit(CallEvent::TurnFailed(e.to_string()));
            }
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => Ok(Flow::HungUp),
            () = tokio::time::sleep(self.settings.rearm_delay) => Ok(Flow::Continue),
        }
    }
}
