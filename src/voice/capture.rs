//! Audio capture from microphone

use std::sync::{Arc, Mutex, PoisonError, mpsc};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use super::{MicStream, Microphone};
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Default input device, opened fresh for every utterance
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalMicrophone;

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn open(&self) -> Result<Box<dyn MicStream>> {
        let stream = tokio::task::spawn_blocking(CpalMicStream::start)
            .await
            .map_err(|e| Error::Audio(format!("capture thread failed: {e}")))??;
        Ok(Box::new(stream))
    }
}

fn input_config(device: &cpal::Device) -> Result<StreamConfig> {
    let supported = device
        .supported_input_configs()
        .map_err(|e| Error::MicrophoneDenied(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        })
        .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

    Ok(supported.with_sample_rate(SampleRate(SAMPLE_RATE)).config())
}

/// Live capture backed by a cpal input stream
///
/// cpal streams are not `Send`, so the stream lives on its own thread and
/// samples cross over through a shared buffer. Closing only signals that
/// thread; it tears the stream down on its own without blocking the caller.
pub struct CpalMicStream {
    buffer: Arc<Mutex<Vec<f32>>>,
    stop: Option<mpsc::Sender<()>>,
}

impl CpalMicStream {
    fn start() -> Result<Self> {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let shared = Arc::clone(&buffer);
        let worker = std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(shared) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Hold the stream until asked to stop or the owner goes away
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("audio capture stopped");
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::Audio("capture thread exited during setup".to_string()))??;

        // Detached: the thread exits once stop is signalled or the sender drops
        drop(worker);
        tracing::debug!(sample_rate = SAMPLE_RATE, "audio capture started");

        Ok(Self {
            buffer,
            stop: Some(stop_tx),
        })
    }
}

fn build_input_stream(buffer: Arc<Mutex<Vec<f32>>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::MicrophoneDenied("no input device available".to_string()))?;
    let config = input_config(&device)?;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        channels = config.channels,
        "opening input device"
    );

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend_from_slice(data);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                Error::MicrophoneDenied("input device not available".to_string())
            }
            other => Error::Audio(other.to_string()),
        })?;

    stream
        .play()
        .map_err(|e| Error::MicrophoneDenied(e.to_string()))?;

    Ok(stream)
}

impl MicStream for CpalMicStream {
    fn take_samples(&mut self) -> Vec<f32> {
        let mut buf = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *buf)
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for CpalMicStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Convert f32 samples to WAV bytes for upload
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
