use crate::audio::{INPUT_CHUNK_SIZE, StreamResampler, downmix};
use crate::device;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FrameCount, StreamConfig};
use interview_core::capture::{CaptureError, MicStream, Microphone, TRANSCRIPTION_SAMPLE_RATE};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Upper bound on how long a release waits for the resampler tail.
const FLUSH_WAIT: Duration = Duration::from_millis(500);

/// Microphone backed by a cpal input device.
///
/// cpal streams cannot leave the thread that built them, so each open stream
/// lives on its own thread until the returned [`MicStream`] is released.
/// Samples arrive downmixed to mono at 16 kHz.
#[derive(Debug, Clone, Default)]
pub struct CpalMicrophone {
    device_name: Option<String>,
}

impl CpalMicrophone {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn open(&self) -> Result<MicStream, CaptureError> {
        let (chunks_tx, chunks_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (flushed_tx, flushed_rx) = std_mpsc::channel::<()>();
        let device_name = self.device_name.clone();

        std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || hold_stream(device_name, chunks_tx, ready_tx, stop_rx, flushed_tx))
            .map_err(|e| CaptureError::Device(format!("failed to spawn capture thread: {e}")))?;

        ready_rx
            .await
            .map_err(|_| CaptureError::Device("capture thread exited early".to_string()))??;

        // The receiver closes right after this returns, so the tail has to be
        // queued first.
        Ok(MicStream::new(TRANSCRIPTION_SAMPLE_RATE, chunks_rx, move || {
            if stop_tx.send(()).is_ok() && flushed_rx.recv_timeout(FLUSH_WAIT).is_err() {
                tracing::warn!("Capture thread did not flush in time, recording tail dropped");
            }
        }))
    }
}

fn hold_stream(
    device_name: Option<String>,
    chunks: mpsc::UnboundedSender<Vec<f32>>,
    ready: oneshot::Sender<Result<(), CaptureError>>,
    stop: std_mpsc::Receiver<()>,
    flushed: std_mpsc::Sender<()>,
) {
    let (stream, resampler) = match build_stream(device_name.as_deref(), chunks.clone()) {
        Ok(built) => built,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    // Returns on release, or when the sender is dropped with the MicStream.
    let _ = stop.recv();
    drop(stream);
    flush_tail(&resampler, &chunks);
    let _ = flushed.send(());
    tracing::debug!("Microphone released");
}

/// Sends whatever the resampler still holds once no more input can arrive.
fn flush_tail(resampler: &Mutex<StreamResampler>, chunks: &mpsc::UnboundedSender<Vec<f32>>) {
    let tail = match resampler.lock() {
        Ok(mut resampler) => resampler.flush(),
        Err(_) => {
            tracing::warn!("Resampler poisoned, recording tail dropped");
            return;
        }
    };
    if !tail.is_empty() && chunks.send(tail).is_err() {
        tracing::trace!("Recording tail dropped, stream already released");
    }
}

fn build_stream(
    device_name: Option<&str>,
    chunks: mpsc::UnboundedSender<Vec<f32>>,
) -> Result<(cpal::Stream, Arc<Mutex<StreamResampler>>), CaptureError> {
    let input = device::get_or_default_input(device_name)
        .map_err(|e| CaptureError::Device(format!("{e:#}")))?;
    let name = input.name().unwrap_or_else(|_| "unknown".to_string());
    tracing::info!("Using input device: {:?}", name);

    let default_config = input
        .default_input_config()
        .map_err(|e| classify(e.to_string()))?;
    let config = StreamConfig {
        channels: default_config.channels(),
        sample_rate: default_config.sample_rate(),
        buffer_size: cpal::BufferSize::Fixed(FrameCount::from(INPUT_CHUNK_SIZE as u32)),
    };
    let channel_count = config.channels as usize;
    tracing::debug!("Input stream config: {:?}", &config);

    let resampler = StreamResampler::new(config.sample_rate.0, TRANSCRIPTION_SAMPLE_RATE)
        .map_err(|e| CaptureError::Device(format!("resampler setup failed: {e}")))?;
    let resampler = Arc::new(Mutex::new(resampler));
    let callback_resampler = resampler.clone();

    let input_data_fn = move |data: &[f32], _: &cpal::InputCallbackInfo| {
        let mono = downmix(data, channel_count);
        let Ok(mut resampler) = callback_resampler.lock() else {
            return;
        };
        let resampled = resampler.push(&mono);
        if !resampled.is_empty() && chunks.send(resampled).is_err() {
            tracing::trace!("Audio chunk dropped, stream already released");
        }
    };

    let stream = input
        .build_input_stream(
            &config,
            input_data_fn,
            move |err| tracing::error!("An error occurred on input stream: {}", err),
            None,
        )
        .map_err(|e| classify(e.to_string()))?;
    stream.play().map_err(|e| classify(e.to_string()))?;
    Ok((stream, resampler))
}

/// Host backends report refused access only as text.
fn classify(message: String) -> CaptureError {
    let lowered = message.to_lowercase();
    if lowered.contains("permission") || lowered.contains("denied") || lowered.contains("not allowed") {
        CaptureError::PermissionDenied
    } else {
        CaptureError::Device(message)
    }
}
