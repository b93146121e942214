//! Call session controller integration tests
//!
//! Drives whole calls against fake hardware on a paused clock

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::time::Instant;

use companion_call::voice::{CallTone, VadSettings};
use companion_call::{CallEvent, CallSessionController, CallSettings, CallState, Error, Result};

mod common;
use common::{FakeTones, MicPlan, Rig, Scripted, SinkOp, events_until, next_event};

const REPLY: &[&[u8]] = &[b"chunk-1", b"chunk-2", b"chunk-3", b"chunk-4", b"chunk-5"];

fn controller(rig: &Rig) -> CallSessionController {
    CallSessionController::new(rig.devices(), CallSettings::default())
}

fn drain(events: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

/// Poll `done` on the paused clock, failing after a minute of call time
async fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(60);
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn is_state(state: CallState) -> impl Fn(&CallEvent) -> bool {
    move |event| *event == CallEvent::State(state)
}

#[tokio::test(start_paused = true)]
async fn test_normal_turn_plays_reply_and_rearms() {
    let rig = Rig::new(
        &[MicPlan::Speech { loud_reads: 20 }],
        vec![Scripted::Audio(REPLY.to_vec())],
    );
    let controller = controller(&rig);
    let mut events = controller.events();

    let session = controller.start_call().await.unwrap();
    assert!(session.id.starts_with("call-"));

    let seen = events_until(&mut events, |e| matches!(e, CallEvent::ReplyPlayed { .. })).await;
    assert_eq!(
        seen,
        vec![
            CallEvent::State(CallState::Connecting),
            CallEvent::State(CallState::Listening),
            CallEvent::State(CallState::Processing),
            CallEvent::UtteranceSent {
                bytes: rig.uplink.sent()[0].bytes
            },
            CallEvent::State(CallState::Speaking),
            CallEvent::ReplyPlayed { chunks: 5 },
        ]
    );
    let played_at = Instant::now();

    // Microphone re-arms after the mandatory pause
    assert_eq!(next_event(&mut events).await, CallEvent::State(CallState::Listening));
    let pause = played_at.elapsed();
    assert!(pause >= Duration::from_millis(200), "{pause:?}");
    assert!(pause < Duration::from_millis(250), "{pause:?}");

    // One upload, tagged with the call's session
    let sent = rig.uplink.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].session_id, session.id);
    assert_eq!(sent[0].persona, "jinx");
    assert_eq!(sent[0].content_type, "audio/wav");

    // Chunks in order, playback only once the first is in the buffer
    let mut expected = vec![SinkOp::Append(Bytes::from_static(REPLY[0])), SinkOp::Play];
    expected.extend(REPLY[1..].iter().map(|c| SinkOp::Append(Bytes::from_static(c))));
    expected.extend([SinkOp::End, SinkOp::Release]);
    assert_eq!(rig.sinks.ops(), expected);

    controller.hang_up().await;
    assert_eq!(controller.state(), CallState::Idle);
    assert_eq!(rig.tones.played(), vec![CallTone::Start, CallTone::End]);
    assert!(!rig.activity.overlapped.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_hang_up_mid_reply_cancels_reads() {
    let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Bytes>>();
    let rig = Rig::new(
        &[MicPlan::Speech { loud_reads: 10 }],
        vec![Scripted::Stream(rx.boxed())],
    );
    let controller = controller(&rig);
    let mut events = controller.events();

    for chunk in &REPLY[..3] {
        tx.unbounded_send(Ok(Bytes::from_static(chunk))).unwrap();
    }

    controller.start_call().await.unwrap();
    events_until(&mut events, is_state(CallState::Speaking)).await;
    wait_until(|| rig.sinks.appended().len() == 3).await;

    controller.hang_up().await;

    assert_eq!(controller.state(), CallState::Idle);
    let after = drain(&mut events);
    assert_eq!(
        after,
        vec![
            CallEvent::State(CallState::Ending),
            CallEvent::State(CallState::Idle),
        ]
    );

    // The read side is gone; late chunks cannot reach the player
    assert!(tx.unbounded_send(Ok(Bytes::from_static(REPLY[3]))).is_err());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(rig.sinks.appended().len(), 3);
    assert_eq!(rig.sinks.ops().last(), Some(&SinkOp::Release));
    assert!(!rig.sinks.ops().contains(&SinkOp::End));
    assert_eq!(rig.tones.played(), vec![CallTone::Start, CallTone::End]);
}

#[tokio::test(start_paused = true)]
async fn test_denied_microphone_aborts_setup() {
    let mut rig = Rig::new(&[], vec![]);
    rig.mic = common::FakeMicrophone::denied(rig.activity.clone());
    let controller = controller(&rig);
    let mut events = controller.events();

    let err = controller.start_call().await.unwrap_err();
    assert!(matches!(err, Error::MicrophoneDenied(_)));
    assert_eq!(controller.state(), CallState::Idle);

    let seen = drain(&mut events);
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0], CallEvent::State(CallState::Connecting));
    assert!(matches!(seen[1], CallEvent::SetupFailed(_)));
    assert_eq!(seen[2], CallEvent::State(CallState::Idle));

    // Nothing to hang up
    controller.hang_up().await;
    assert!(drain(&mut events).is_empty());
    assert!(controller.active_session().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_hang_up_is_idempotent() {
    let rig = Rig::new(&[], vec![]);
    let controller = controller(&rig);
    let mut events = controller.events();

    // Before any call
    controller.hang_up().await;

    controller.start_call().await.unwrap();
    events_until(&mut events, is_state(CallState::Listening)).await;

    tokio::join!(controller.hang_up(), controller.hang_up());
    controller.hang_up().await;

    assert_eq!(controller.state(), CallState::Idle);
    assert_eq!(rig.tones.played(), vec![CallTone::Start, CallTone::End]);
    assert_eq!(
        rig.mic.opens.load(Ordering::SeqCst),
        rig.mic.closes.load(Ordering::SeqCst)
    );
    assert!(!rig.activity.recording.load(Ordering::SeqCst));

    // A new call can follow
    controller.start_call().await.unwrap();
    controller.hang_up().await;
    assert_eq!(controller.state(), CallState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_tone_failure_never_blocks_the_call() {
    let mut rig = Rig::new(
        &[MicPlan::Speech { loud_reads: 10 }],
        vec![Scripted::Audio(REPLY.to_vec())],
    );
    rig.tones = FakeTones::blocked();
    let controller = controller(&rig);
    let mut events = controller.events();

    controller.start_call().await.unwrap();
    let seen = events_until(&mut events, |e| matches!(e, CallEvent::ReplyPlayed { .. })).await;
    assert!(matches!(seen[1], CallEvent::ToneFailed(_)));
    assert!(seen.contains(&CallEvent::State(CallState::Speaking)));

    controller.hang_up().await;
    assert_eq!(controller.state(), CallState::Idle);
    assert!(
        drain(&mut events)
            .iter()
            .any(|e| matches!(e, CallEvent::ToneFailed(_)))
    );
}

#[tokio::test(start_paused = true)]
async fn test_rejected_utterance_returns_to_listening() {
    let rig = Rig::new(
        &[MicPlan::Speech { loud_reads: 10 }],
        vec![Scripted::Rejected(400, "Audio file is empty")],
    );
    let controller = controller(&rig);
    let mut events = controller.events();

    controller.start_call().await.unwrap();
    events_until(&mut events, is_state(CallState::Processing)).await;
    let seen = events_until(&mut events, is_state(CallState::Listening)).await;

    assert!(seen.contains(&CallEvent::TurnRejected {
        status: 400,
        message: "Audio file is empty".into(),
    }));
    assert_eq!(rig.sinks.opened.load(Ordering::SeqCst), 0);

    controller.hang_up().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_content_and_failures_keep_the_session() {
    let rig = Rig::new(
        &[
            MicPlan::Speech { loud_reads: 10 },
            MicPlan::Speech { loud_reads: 10 },
            MicPlan::Speech { loud_reads: 10 },
        ],
        vec![
            Scripted::NoContent,
            Scripted::Fail,
            Scripted::Audio(REPLY.to_vec()),
        ],
    );
    let controller = controller(&rig);
    let mut events = controller.events();

    controller.start_call().await.unwrap();
    let seen = events_until(&mut events, |e| matches!(e, CallEvent::ReplyPlayed { .. })).await;

    assert!(seen.iter().any(|e| matches!(e, CallEvent::TurnFailed(_))));
    assert_eq!(rig.uplink.sent().len(), 3);
    // Only the third turn had anything to play
    assert_eq!(rig.sinks.opened.load(Ordering::SeqCst), 1);

    controller.hang_up().await;
    assert!(!rig.activity.overlapped.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_recording_without_data_is_not_uploaded() {
    let rig = Rig::new(&[MicPlan::NoData, MicPlan::NoData], vec![]);
    let controller = controller(&rig);
    let mut events = controller.events();

    controller.start_call().await.unwrap();
    wait_until(|| rig.mic.opens.load(Ordering::SeqCst) >= 3).await;

    assert!(rig.uplink.sent().is_empty());
    assert!(
        !drain(&mut events)
            .iter()
            .any(|e| *e == CallEvent::State(CallState::Processing))
    );

    controller.hang_up().await;
}

#[tokio::test(start_paused = true)]
async fn test_interaction_forces_stop() {
    let rig = Rig::new(&[MicPlan::Speech { loud_reads: usize::MAX }], vec![]);
    let controller = controller(&rig);
    let mut events = controller.events();

    controller.start_call().await.unwrap();
    events_until(&mut events, is_state(CallState::Listening)).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    controller.interact();
    events_until(&mut events, is_state(CallState::Processing)).await;
    assert_eq!(rig.uplink.sent().len(), 1);

    controller.hang_up().await;
    assert_eq!(controller.state(), CallState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_second_call_is_refused_while_active() {
    let rig = Rig::new(&[], vec![]);
    let controller = controller(&rig);

    let first = controller.start_call().await.unwrap();
    assert!(matches!(
        controller.start_call().await,
        Err(Error::CallInProgress)
    ));
    assert_eq!(controller.active_session().await, Some(first));

    controller.hang_up().await;
}

#[tokio::test(start_paused = true)]
async fn test_recording_and_playback_never_overlap() {
    let plans: Vec<MicPlan> = (0..6)
        .map(|i| MicPlan::Speech { loud_reads: 5 + i * 7 })
        .collect();
    let script = (0..6)
        .map(|i| {
            if i % 3 == 2 {
                Scripted::NoContent
            } else {
                Scripted::Audio(REPLY[..=i % 5].to_vec())
            }
        })
        .collect();
    let rig = Rig::new(&plans, script);
    let controller = controller(&rig);
    let device = controller.audio_device();

    controller.start_call().await.unwrap();

    // Check exclusivity at every step of several turns
    wait_until(|| {
        assert!(
            !(rig.activity.recording.load(Ordering::SeqCst)
                && rig.activity.playing.load(Ordering::SeqCst))
        );
        rig.uplink.sent().len() >= 6
    })
    .await;

    controller.hang_up().await;
    assert!(!rig.activity.overlapped.load(Ordering::SeqCst));
    assert_eq!(device.holder(), None);
}

#[tokio::test(start_paused = true)]
async fn test_hang_up_while_connecting_ends_the_call() {
    let mut rig = Rig::new(&[], vec![]);
    rig.mic = common::FakeMicrophone::stalled(rig.activity.clone());
    let controller = Arc::new(controller(&rig));
    let mut events = controller.events();

    let starter = Arc::clone(&controller);
    let start = tokio::spawn(async move { starter.start_call().await });
    wait_until(|| rig.tones.played() == vec![CallTone::Start]).await;
    assert_eq!(controller.state(), CallState::Connecting);

    tokio::time::timeout(Duration::from_secs(2), controller.hang_up())
        .await
        .expect("hang-up waits for the microphone");

    assert_eq!(controller.state(), CallState::Idle);
    assert!(matches!(start.await.unwrap(), Err(Error::CallEnded)));
    assert_eq!(
        drain(&mut events),
        vec![
            CallEvent::State(CallState::Connecting),
            CallEvent::State(CallState::Ending),
            CallEvent::State(CallState::Idle),
        ]
    );
    assert_eq!(rig.tones.played(), vec![CallTone::Start, CallTone::End]);
    assert!(controller.active_session().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_hang_up_during_upload_cancels_it() {
    // No scripted reply: the upload never completes
    let rig = Rig::new(&[MicPlan::Speech { loud_reads: 10 }], vec![]);
    let controller = controller(&rig);
    let mut events = controller.events();

    controller.start_call().await.unwrap();
    events_until(&mut events, |e| matches!(e, CallEvent::UtteranceSent { .. })).await;
    assert_eq!(controller.state(), CallState::Processing);
    assert_eq!(rig.uplink.sent().len(), 1);

    controller.hang_up().await;

    assert_eq!(controller.state(), CallState::Idle);
    assert_eq!(
        drain(&mut events),
        vec![
            CallEvent::State(CallState::Ending),
            CallEvent::State(CallState::Idle),
        ]
    );
    assert_eq!(rig.sinks.opened.load(Ordering::SeqCst), 0);
    assert_eq!(rig.mic.opens.load(Ordering::SeqCst), 1);
    assert_eq!(rig.mic.closes.load(Ordering::SeqCst), 1);
    assert_eq!(rig.tones.played(), vec![CallTone::Start, CallTone::End]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_turn_state_follows_ending() {
    let settings = CallSettings {
        vad: VadSettings {
            silence_duration: Duration::from_millis(20),
            sample_interval: Duration::from_millis(2),
            ..VadSettings::default()
        },
        rearm_delay: Duration::from_millis(5),
        ..CallSettings::default()
    };

    for round in 0..12u64 {
        let script = (0..4).map(|_| Scripted::Audio(REPLY.to_vec())).collect();
        let rig = Rig::new(&[], script);
        let controller = CallSessionController::new(rig.devices(), settings.clone());
        let mut events = controller.events();

        controller.start_call().await.unwrap();
        tokio::time::sleep(Duration::from_millis(round * 37 % 400)).await;
        controller.hang_up().await;

        let seen = drain(&mut events);
        let ending = seen
            .iter()
            .position(|e| *e == CallEvent::State(CallState::Ending))
            .expect("hang-up publishes Ending");
        for event in &seen[ending..] {
            if let CallEvent::State(state) = event {
                assert!(
                    matches!(state, CallState::Ending | CallState::Idle),
                    "round {round}: {seen:?}"
                );
            }
        }
        assert_eq!(seen.last(), Some(&CallEvent::State(CallState::Idle)));
    }
}
