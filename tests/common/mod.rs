//! Shared test utilities
//!
//! Hardware-free stand-ins for providers, microphones, sinks, the uplink
//! and tones.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::broadcast;

use companion_call::call::{CallSession, UplinkReply, VoiceUplink};
use companion_call::db::{TranscriptEntry, TranscriptRepo};
use companion_call::providers::{
    AudioByteStream, AudioInput, ReplyGenerator, SpeechSynthesizer, Transcriber, VoiceSelection,
};
use companion_call::voice::{
    CallTone, MediaSink, MicStream, Microphone, PlayError, SinkFactory, TonePlayer, Utterance,
};
use companion_call::{
    ApiServerBuilder, CallDevices, CallEvent, DbPool, Error, PersonaRegistry, PipelineSettings,
    Result, VoicePipeline, db,
};

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

// ---- server side ----

/// Returns a fixed transcription, or fails
pub struct FakeTranscriber {
    text: Option<&'static str>,
    pub calls: AtomicUsize,
}

impl FakeTranscriber {
    pub fn says(text: &'static str) -> Arc<Self> {
        Arc::new(Self {
            text: Some(text),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            text: None,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, _audio: &AudioInput, _language: Option<&str>) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.text
            .map(str::to_string)
            .ok_or_else(|| Error::Stt("provider unavailable".into()))
    }
}

/// Replies with fixed text and remembers the history length it saw
pub struct FakeGenerator {
    reply: &'static str,
    pub histories: Mutex<Vec<usize>>,
}

impl FakeGenerator {
    pub fn replies(reply: &'static str) -> Arc<Self> {
        Arc::new(Self {
            reply,
            histories: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ReplyGenerator for FakeGenerator {
    async fn generate(
        &self,
        _instructions: &str,
        history: &[TranscriptEntry],
        _input: &str,
    ) -> Result<String> {
        self.histories.lock().unwrap().push(history.len());
        Ok(self.reply.to_string())
    }
}

/// Streams a fixed list of chunks
pub struct FakeSynth {
    chunks: Vec<&'static [u8]>,
    pub voices: Mutex<Vec<String>>,
}

impl FakeSynth {
    pub fn streams(chunks: &[&'static [u8]]) -> Arc<Self> {
        Arc::new(Self {
            chunks: chunks.to_vec(),
            voices: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynth {
    async fn synthesize_stream(&self, _text: &str, voice: &VoiceSelection) -> Result<AudioByteStream> {
        self.voices.lock().unwrap().push(voice.voice_id.clone());
        let items: Vec<Result<Bytes>> = self
            .chunks
            .iter()
            .map(|c| Ok(Bytes::from_static(c)))
            .collect();
        Ok(futures::stream::iter(items).boxed())
    }
}

/// Pipeline over in-memory storage and the given stages
pub fn test_pipeline(
    db: &DbPool,
    transcriber: Arc<dyn Transcriber>,
    generator: Arc<dyn ReplyGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
) -> Arc<VoicePipeline> {
    Arc::new(VoicePipeline::new(
        transcriber,
        generator,
        synthesizer,
        TranscriptRepo::new(db.clone()),
        Arc::new(PersonaRegistry::builtin().expect("built-in personas")),
        PipelineSettings {
            default_voice: "test-voice".to_string(),
            ..PipelineSettings::default()
        },
    ))
}

/// Full API router over the given stages
pub fn test_router(
    db: DbPool,
    transcriber: Arc<dyn Transcriber>,
    generator: Arc<dyn ReplyGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
) -> axum::Router {
    let pipeline = test_pipeline(&db, transcriber, generator, synthesizer);
    ApiServerBuilder::new(db, pipeline).build().router()
}

const BOUNDARY: &str = "companion-test-boundary";

/// Multipart upload builder for `/api/call/stream`
#[derive(Default)]
pub struct UploadForm {
    audio: Option<Vec<u8>>,
    text: Vec<(&'static str, String)>,
}

impl UploadForm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn audio(mut self, data: &[u8]) -> Self {
        self.audio = Some(data.to_vec());
        self
    }

    #[must_use]
    pub fn field(mut self, name: &'static str, value: &str) -> Self {
        self.text.push((name, value.to_string()));
        self
    }

    pub fn into_request(self) -> Request<Body> {
        let mut body = Vec::new();
        if let Some(audio) = self.audio {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"audio\"; \
                     filename=\"speech.wav\"\r\nContent-Type: audio/wav\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(&audio);
            body.extend_from_slice(b"\r\n");
        }
        for (name, value) in self.text {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/api/call/stream")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }
}

// ---- client side ----

/// Who is using the audio hardware right now
#[derive(Default)]
pub struct Activity {
    pub recording: AtomicBool,
    pub playing: AtomicBool,
    pub overlapped: AtomicBool,
}

/// What one opened microphone stream yields on each read
#[derive(Debug, Clone, Copy)]
pub enum MicPlan {
    /// `loud_reads` reads of speech, then silence forever
    Speech { loud_reads: usize },
    /// Never yields any samples
    NoData,
}

/// Microphone that follows a plan per opened stream
pub struct FakeMicrophone {
    plans: Mutex<VecDeque<MicPlan>>,
    denied: bool,
    /// `open()` never resolves, like an unanswered permission prompt
    stalled: bool,
    activity: Arc<Activity>,
    pub opens: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
}

impl FakeMicrophone {
    pub fn new(plans: &[MicPlan], activity: Arc<Activity>) -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(plans.iter().copied().collect()),
            denied: false,
            stalled: false,
            activity,
            opens: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn denied(activity: Arc<Activity>) -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(VecDeque::new()),
            denied: true,
            stalled: false,
            activity,
            opens: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn stalled(activity: Arc<Activity>) -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(VecDeque::new()),
            denied: false,
            stalled: true,
            activity,
            opens: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[async_trait]
impl Microphone for FakeMicrophone {
    async fn open(&self) -> Result<Box<dyn MicStream>> {
        if self.denied {
            return Err(Error::MicrophoneDenied("permission denied".into()));
        }
        if self.stalled {
            std::future::pending::<()>().await;
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let plan = self
            .plans
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MicPlan::Speech { loud_reads: 0 });

        if self.activity.playing.load(Ordering::SeqCst) {
            self.activity.overlapped.store(true, Ordering::SeqCst);
        }
        self.activity.recording.store(true, Ordering::SeqCst);

        Ok(Box::new(FakeMicStream {
            plan,
            reads: 0,
            closed: false,
            activity: Arc::clone(&self.activity),
            closes: Arc::clone(&self.closes),
        }))
    }
}

pub struct FakeMicStream {
    plan: MicPlan,
    reads: usize,
    closed: bool,
    activity: Arc<Activity>,
    closes: Arc<AtomicUsize>,
}

impl MicStream for FakeMicStream {
    fn take_samples(&mut self) -> Vec<f32> {
        self.reads += 1;
        match self.plan {
            MicPlan::Speech { loud_reads } if self.reads <= loud_reads => vec![0.3; 256],
            MicPlan::Speech { .. } => vec![0.0; 256],
            MicPlan::NoData => Vec::new(),
        }
    }

    fn sample_rate(&self) -> u32 {
        16000
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.activity.recording.store(false, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// What a sink was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOp {
    Append(Bytes),
    Play,
    End,
    Release,
}

/// Sinks that log every operation
pub struct FakeSinks {
    activity: Arc<Activity>,
    pub ops: Arc<Mutex<Vec<SinkOp>>>,
    pub opened: AtomicUsize,
    /// Time each sink takes to play out after the stream ends
    pub play_time: Duration,
}

impl FakeSinks {
    pub fn new(activity: Arc<Activity>) -> Arc<Self> {
        Arc::new(Self {
            activity,
            ops: Arc::new(Mutex::new(Vec::new())),
            opened: AtomicUsize::new(0),
            play_time: Duration::from_millis(300),
        })
    }

    pub fn ops(&self) -> Vec<SinkOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn appended(&self) -> Vec<Bytes> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                SinkOp::Append(b) => Some(b),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl SinkFactory for FakeSinks {
    async fn open(&self) -> Result<Box<dyn MediaSink>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if self.activity.recording.load(Ordering::SeqCst) {
            self.activity.overlapped.store(true, Ordering::SeqCst);
        }
        self.activity.playing.store(true, Ordering::SeqCst);

        Ok(Box::new(FakeSink {
            activity: Arc::clone(&self.activity),
            ops: Arc::clone(&self.ops),
            play_time: self.play_time,
            released: false,
        }))
    }
}

struct FakeSink {
    activity: Arc<Activity>,
    ops: Arc<Mutex<Vec<SinkOp>>>,
    play_time: Duration,
    released: bool,
}

#[async_trait]
impl MediaSink for FakeSink {
    async fn append(&mut self, chunk: Bytes) -> Result<()> {
        assert!(!self.released, "append after release");
        tokio::task::yield_now().await;
        self.ops.lock().unwrap().push(SinkOp::Append(chunk));
        Ok(())
    }

    fn play(&mut self) -> std::result::Result<(), PlayError> {
        self.ops.lock().unwrap().push(SinkOp::Play);
        Ok(())
    }

    fn end_of_stream(&mut self) {
        self.ops.lock().unwrap().push(SinkOp::End);
    }

    async fn finished(&mut self) {
        tokio::time::sleep(self.play_time).await;
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.activity.playing.store(false, Ordering::SeqCst);
            self.ops.lock().unwrap().push(SinkOp::Release);
        }
    }
}

/// Scripted server behaviour for one utterance
pub enum Scripted {
    Audio(Vec<&'static [u8]>),
    Stream(AudioByteStream),
    NoContent,
    Rejected(u16, &'static str),
    Fail,
}

/// What the uplink received
#[derive(Debug, Clone)]
pub struct Sent {
    pub session_id: String,
    pub persona: String,
    pub bytes: usize,
    pub content_type: &'static str,
}

/// Uplink answering from a script; blocks forever once the script runs out
pub struct FakeUplink {
    script: Mutex<VecDeque<Scripted>>,
    pub sent: Mutex<Vec<Sent>>,
}

impl FakeUplink {
    pub fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl VoiceUplink for FakeUplink {
    async fn send(&self, session: &CallSession, utterance: Utterance) -> Result<UplinkReply> {
        self.sent.lock().unwrap().push(Sent {
            session_id: session.id.clone(),
            persona: session.persona.clone(),
            bytes: utterance.data.len(),
            content_type: utterance.content_type,
        });

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Audio(chunks)) => {
                let items: Vec<Result<Bytes>> =
                    chunks.into_iter().map(|c| Ok(Bytes::from_static(c))).collect();
                Ok(UplinkReply::Audio(futures::stream::iter(items).boxed()))
            }
            Some(Scripted::Stream(stream)) => Ok(UplinkReply::Audio(stream)),
            Some(Scripted::NoContent) => Ok(UplinkReply::NoContent),
            Some(Scripted::Rejected(status, message)) => Ok(UplinkReply::Rejected {
                status,
                message: message.to_string(),
            }),
            Some(Scripted::Fail) => Err(Error::Uplink("connection reset".into())),
            None => std::future::pending().await,
        }
    }
}

/// Tones that are recorded, or always fail
pub struct FakeTones {
    fail: bool,
    pub played: Mutex<Vec<CallTone>>,
}

impl FakeTones {
    pub fn working() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            played: Mutex::new(Vec::new()),
        })
    }

    pub fn blocked() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            played: Mutex::new(Vec::new()),
        })
    }

    pub fn played(&self) -> Vec<CallTone> {
        self.played.lock().unwrap().clone()
    }
}

#[async_trait]
impl TonePlayer for FakeTones {
    async fn play(&self, tone: CallTone) -> Result<()> {
        if self.fail {
            return Err(Error::Tone("autoplay blocked".into()));
        }
        self.played.lock().unwrap().push(tone);
        Ok(())
    }
}

/// Everything a controller test needs to inspect
pub struct Rig {
    pub activity: Arc<Activity>,
    pub mic: Arc<FakeMicrophone>,
    pub sinks: Arc<FakeSinks>,
    pub uplink: Arc<FakeUplink>,
    pub tones: Arc<FakeTones>,
}

impl Rig {
    pub fn new(plans: &[MicPlan], script: Vec<Scripted>) -> Self {
        let activity = Arc::new(Activity::default());
        Self {
            mic: FakeMicrophone::new(plans, Arc::clone(&activity)),
            sinks: FakeSinks::new(Arc::clone(&activity)),
            uplink: FakeUplink::new(script),
            tones: FakeTones::working(),
            activity,
        }
    }

    pub fn devices(&self) -> CallDevices {
        CallDevices {
            microphone: self.mic.clone(),
            sinks: self.sinks.clone(),
            uplink: self.uplink.clone(),
            tones: self.tones.clone(),
        }
    }
}

/// Next call event, failing the test if none arrives in a minute of call time
pub async fn next_event(events: &mut broadcast::Receiver<CallEvent>) -> CallEvent {
    tokio::time::timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("timed out waiting for a call event")
        .expect("event channel closed")
}

/// Collect events up to and including the first that matches `until`
pub async fn events_until(
    events: &mut broadcast::Receiver<CallEvent>,
    until: impl Fn(&CallEvent) -> bool,
) -> Vec<CallEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = until(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}
