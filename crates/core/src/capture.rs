//! Microphone capture capability.
//!
//! The session controller only ever talks to [`AudioCapture`]. Two strategies
//! implement it: [`DiscreteRecorder`] records a whole clip until it is stopped,
//! [`ContinuousRecognizer`] drives a recognition engine that produces text by
//! itself and has to be restarted after every segment while the candidate
//! still wants the microphone on.

use async_trait::async_trait;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

mod continuous;
mod discrete;

pub use continuous::{ContinuousRecognizer, RecognitionEngine, RecognitionErrorKind, RecognitionEvent};
pub use discrete::DiscreteRecorder;

/// Sample rate of every clip handed to transcription.
pub const TRANSCRIPTION_SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("audio device error: {0}")]
    Device(String),
    #[error("recognition engine error: {0}")]
    Engine(String),
    #[error("audio encoding failed: {0}")]
    Encoding(String),
}

impl CaptureError {
    /// Fatal errors end capture for good: intent is cleared and the candidate
    /// has to toggle the microphone again (or type).
    pub fn is_fatal(&self) -> bool {
        matches!(self, CaptureError::PermissionDenied | CaptureError::Device(_))
    }
}

/// One encoded audio artifact (16-bit mono WAV).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    bytes: Vec<u8>,
}

impl AudioClip {
    pub const FILE_NAME: &'static str = "input.wav";
    pub const MIME_TYPE: &'static str = "audio/wav";

    pub fn from_wav_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Encodes mono samples as a WAV clip. Returns `None` for an empty buffer
    /// so callers can drop silent recordings without a round trip.
    pub fn encode(samples: &[f32], sample_rate: u32) -> Result<Option<Self>, CaptureError> {
        if samples.is_empty() {
            return Ok(None);
        }

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut bytes = Vec::new();
        let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec)
            .map_err(|e| CaptureError::Encoding(e.to_string()))?;
        for &sample in samples {
            let v = (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            writer
                .write_sample(v)
                .map_err(|e| CaptureError::Encoding(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| CaptureError::Encoding(e.to_string()))?;

        Ok(Some(Self { bytes }))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// What a capture strategy produced for one candidate utterance.
#[derive(Debug, Clone, PartialEq)]
pub enum Utterance {
    /// Text recognised directly by an engine.
    Transcript(String),
    /// A recording that still needs transcription.
    Recording(AudioClip),
}

/// Events a capture adapter pushes to the session controller.
#[derive(Debug)]
pub enum CaptureEvent {
    Captured(Utterance),
    Interim(String),
    Error(CaptureError),
}

/// The candidate's wish to have the microphone on.
///
/// Owned by the session controller and handed to the adapter on `begin`. It
/// is deliberately separate from whether the adapter is running right now, so
/// an engine restart racing with a stop request always sees the latest wish.
#[derive(Debug, Clone, Default)]
pub struct ListeningIntent(Arc<AtomicBool>);

impl ListeningIntent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assert(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_asserted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// An open microphone stream.
///
/// Chunks are mono samples at `sample_rate`. Dropping the stream (or calling
/// [`MicStream::release`]) gives the device back.
pub struct MicStream {
    pub sample_rate: u32,
    pub chunks: mpsc::UnboundedReceiver<Vec<f32>>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl MicStream {
    pub fn new(
        sample_rate: u32,
        chunks: mpsc::UnboundedReceiver<Vec<f32>>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            sample_rate,
            chunks,
            release: Some(Box::new(release)),
        }
    }

    /// Stops the device and returns every chunk that was already delivered.
    pub async fn release(mut self) -> Vec<f32> {
        if let Some(release) = self.release.take() {
            release();
        }
        self.chunks.close();
        let mut samples = Vec::new();
        while let Some(chunk) = self.chunks.recv().await {
            samples.extend(chunk);
        }
        samples
    }
}

impl Drop for MicStream {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for MicStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicStream")
            .field("sample_rate", &self.sample_rate)
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// Source of microphone streams. Opening is where permission is requested.
#[async_trait]
pub trait Microphone: Send + Sync {
    async fn open(&self) -> Result<MicStream, CaptureError>;
}

/// The capability the session controller depends on.
#[async_trait]
pub trait AudioCapture: Send {
    /// Starts acquiring audio. Any stream still held is released first.
    async fn begin(&mut self, intent: ListeningIntent) -> Result<(), CaptureError>;

    /// Stops acquiring audio and releases the device. Strategies that only
    /// know what was said once recording stops return it here.
    async fn end(&mut self) -> Option<Utterance>;

    fn is_active(&self) -> bool;
}
