//! Audio playback to speakers
//!
//! [`SpeakerSink`] is the progressive buffer used during calls: appended MP3
//! bytes are decoded on a worker thread as they arrive and queued for the
//! output callback, which stays silent until `play` is called.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::Notify;

use super::{MediaSink, PlayError, SinkFactory};
use crate::{Error, Result};

/// Poll period of the worker while waiting for bytes or for the queue to drain
const WORKER_POLL: Duration = Duration::from_millis(20);

/// Find an output config at `sample_rate`, preferring mono
fn output_config(device: &cpal::Device, sample_rate: u32) -> Result<StreamConfig> {
    let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
        c.channels() == channels
            && c.min_sample_rate() <= SampleRate(sample_rate)
            && c.max_sample_rate() >= SampleRate(sample_rate)
    };

    let supported = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| supports(c, 1))
        .or_else(|| {
            // Fallback: try stereo
            device
                .supported_output_configs()
                .ok()?
                .find(|c| supports(c, 2))
        })
        .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

    Ok(supported.with_sample_rate(SampleRate(sample_rate)).config())
}

fn default_output_device() -> Result<cpal::Device> {
    cpal::default_host()
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))
}

/// State shared between the sink, its worker thread, and the output callback
#[derive(Default)]
struct Shared {
    queue: Mutex<VecDeque<f32>>,
    playing: AtomicBool,
    stopped: AtomicBool,
    done: AtomicBool,
    failure: Mutex<Option<String>>,
    finished: Notify,
}

impl Shared {
    fn push(&self, samples: impl IntoIterator<Item = f32>) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(samples);
    }

    fn is_drained(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    fn fail(&self, message: String) {
        tracing::error!(error = %message, "speaker playback failed");
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn mark_done(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.finished.notify_one();
        }
    }
}

/// Blocking reader over appended chunks, fed to the MP3 decoder
struct ChunkReader {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
    shared: Arc<Shared>,
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.current.is_empty() {
            if self.shared.stopped.load(Ordering::SeqCst) {
                return Ok(0);
            }
            match self.rx.recv_timeout(WORKER_POLL) {
                Ok(chunk) => self.current = chunk,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                // End of stream
                Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }

        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

/// Convert one decoded frame to mono f32
fn frame_to_mono(frame: &minimp3::Frame) -> Vec<f32> {
    if frame.channels == 2 {
        // Stereo: average channels
        frame
            .data
            .chunks(2)
            .map(|chunk| {
                let left = f32::from(chunk[0]) / 32768.0;
                let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                f32::midpoint(left, right)
            })
            .collect()
    } else {
        frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect()
    }
}

fn open_output(sample_rate: u32, shared: &Arc<Shared>) -> Result<cpal::Stream> {
    let device = default_output_device()?;
    let config = output_config(&device, sample_rate)?;
    let channels = usize::from(config.channels);

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "speaker output opened"
    );

    let callback_state = Arc::clone(shared);
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if !callback_state.playing.load(Ordering::SeqCst) {
                    data.fill(0.0);
                    return;
                }

                let mut queue = callback_state
                    .queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                for frame in data.chunks_mut(channels) {
                    let sample = queue.pop_front().unwrap_or(0.0);
                    frame.fill(sample);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}

/// Decode appended bytes until end of stream, then hold the output open
/// until the queue drains or the sink is released
fn run_worker(rx: mpsc::Receiver<Bytes>, shared: &Arc<Shared>) {
    let reader = ChunkReader {
        rx,
        current: Bytes::new(),
        shared: Arc::clone(shared),
    };
    let mut decoder = minimp3::Decoder::new(reader);
    let mut output: Option<cpal::Stream> = None;

    while !shared.stopped.load(Ordering::SeqCst) {
        match decoder.next_frame() {
            Ok(frame) => {
                if output.is_none() {
                    let rate = u32::try_from(frame.sample_rate).unwrap_or(24000);
                    match open_output(rate, shared) {
                        Ok(stream) => output = Some(stream),
                        Err(e) => {
                            shared.fail(e.to_string());
                            break;
                        }
                    }
                }
                shared.push(frame_to_mono(&frame));
            }
            Err(minimp3::Error::Eof) => break,
            Err(minimp3::Error::SkippedData) => {}
            Err(e) => {
                shared.fail(format!("MP3 decode error: {e}"));
                break;
            }
        }
    }

    while output.is_some() && !shared.stopped.load(Ordering::SeqCst) && !shared.is_drained() {
        std::thread::sleep(WORKER_POLL);
    }
    // Let the device flush its last buffer
    if output.is_some() && !shared.stopped.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    drop(output);
    shared.mark_done();
    tracing::debug!("speaker worker exited");
}

/// Progressive MP3 sink on the default output device
pub struct SpeakerSink {
    tx: Option<mpsc::Sender<Bytes>>,
    shared: Arc<Shared>,
    released: bool,
}

impl SpeakerSink {
    /// Start a sink and its decoder thread
    ///
    /// # Errors
    ///
    /// Returns error if the worker thread cannot be spawned
    pub fn new() -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared::default());

        let worker_state = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("speaker".to_string())
            .spawn(move || run_worker(rx, &worker_state))?;

        Ok(Self {
            tx: Some(tx),
            shared,
            released: false,
        })
    }
}

#[async_trait]
impl MediaSink for SpeakerSink {
    async fn append(&mut self, chunk: Bytes) -> Result<()> {
        if let Some(message) = self.shared.failure() {
            return Err(Error::Audio(message));
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::Audio("append after end of stream".to_string()))?;
        tx.send(chunk)
            .map_err(|_| Error::Audio("speaker worker has exited".to_string()))
    }

    fn play(&mut self) -> std::result::Result<(), PlayError> {
        if let Some(message) = self.shared.failure() {
            return Err(PlayError::Device(message));
        }
        self.shared.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn end_of_stream(&mut self) {
        self.tx.take();
    }

    async fn finished(&mut self) {
        if self.shared.done.load(Ordering::SeqCst) {
            return;
        }
        self.shared.finished.notified().await;
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.tx.take();
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.playing.store(false, Ordering::SeqCst);
        tracing::debug!("speaker sink released");
    }
}

impl Drop for SpeakerSink {
    fn drop(&mut self) {
        self.release();
    }
}

/// Opens a [`SpeakerSink`] per reply
#[derive(Debug, Default, Clone, Copy)]
pub struct SpeakerFactory;

#[async_trait]
impl SinkFactory for SpeakerFactory {
    async fn open(&self) -> Result<Box<dyn MediaSink>> {
        Ok(Box::new(SpeakerSink::new()?))
    }
}

/// Play mono f32 samples to completion on the default output device
///
/// Blocks the calling thread; use from `spawn_blocking`.
///
/// # Errors
///
/// Returns error if the output device cannot be opened
pub fn play_samples_blocking(samples: Vec<f32>, sample_rate: u32) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }

    let device = default_output_device()?;
    let config = output_config(&device, sample_rate)?;
    let channels = usize::from(config.channels);
    let sample_count = samples.len();

    let samples = Arc::new(samples);
    let position = Arc::new(Mutex::new(0usize));
    let finished = Arc::new(AtomicBool::new(false));

    let samples_cb = Arc::clone(&samples);
    let position_cb = Arc::clone(&position);
    let finished_cb = Arc::clone(&finished);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut pos = position_cb.lock().unwrap_or_else(PoisonError::into_inner);
                for frame in data.chunks_mut(channels) {
                    let sample = samples_cb.get(*pos).copied().unwrap_or_else(|| {
                        finished_cb.store(true, Ordering::SeqCst);
                        0.0
                    });
                    frame.fill(sample);
                    if *pos < samples_cb.len() {
                        *pos += 1;
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    // Poll for completion with timeout
    let duration_ms = (sample_count as u64 * 1000) / u64::from(sample_rate.max(1));
    let timeout = Duration::from_millis(duration_ms + 500);
    let start = std::time::Instant::now();
    while !finished.load(Ordering::SeqCst) && start.elapsed() < timeout {
        std::thread::sleep(Duration::from_millis(20));
    }

    drop(stream);
    tracing::debug!(samples = sample_count, "playback complete");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(chunks: &[&'static [u8]]) -> ChunkReader {
        let (tx, rx) = mpsc::channel();
        for chunk in chunks {
            tx.send(Bytes::from_static(chunk)).unwrap();
        }
        drop(tx);
        ChunkReader {
            rx,
            current: Bytes::new(),
            shared: Arc::new(Shared::default()),
        }
    }

    #[test]
    fn test_chunk_reader_preserves_order_across_chunks() {
        let mut r = reader(&[b"abc", b"", b"defg"]);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcdefg");
    }

    #[test]
    fn test_chunk_reader_stops_when_released() {
        let (_tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared::default());
        shared.stopped.store(true, Ordering::SeqCst);
        let mut r = ChunkReader {
            rx,
            current: Bytes::new(),
            shared,
        };
        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_stereo_frames_average_to_mono() {
        let frame = minimp3::Frame {
            data: vec![16384, 0, -16384, -16384],
            sample_rate: 24000,
            channels: 2,
            layer: 3,
            bitrate: 128,
        };
        let mono = frame_to_mono(&frame);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.25).abs() < 1e-4);
        assert!((mono[1] + 0.5).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let mut sink = SpeakerSink {
            tx: None,
            shared: Arc::new(Shared::default()),
            released: false,
        };
        sink.release();
        sink.release();
        assert!(sink.shared.stopped.load(Ordering::SeqCst));

        sink.shared.mark_done();
        sink.finished().await;
        sink.finished().await;
    }
}
