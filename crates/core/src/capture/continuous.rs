use super::{AudioCapture, CaptureError, CaptureEvent, ListeningIntent, Utterance};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// Error classes a recognition engine reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    /// Nothing was said before the engine gave up on the segment.
    NoSpeech,
    /// The segment was stopped on request.
    Aborted,
    /// Microphone access was refused.
    NotAllowed,
    /// No usable audio input.
    AudioCapture,
    /// The engine could not reach its recognition backend.
    Network(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    Result { transcript: String, is_final: bool },
    Error(RecognitionErrorKind),
    /// The engine terminated the current segment.
    End,
}

/// A speech recognition engine that works in segments.
#[async_trait]
pub trait RecognitionEngine: Send {
    /// Starts one segment. Every segment finishes with [`RecognitionEvent::End`].
    async fn start(&mut self, events: mpsc::Sender<RecognitionEvent>) -> Result<(), CaptureError>;

    /// Stops the current segment and releases the device. No further events
    /// are sent for it.
    async fn abort(&mut self);
}

/// Keeps a recognition engine running for as long as the listening intent
/// is asserted, restarting it after every segment the engine ends.
pub struct ContinuousRecognizer {
    engine: Arc<Mutex<Box<dyn RecognitionEngine>>>,
    events: mpsc::Sender<CaptureEvent>,
    pump: Option<JoinHandle<()>>,
}

impl ContinuousRecognizer {
    pub fn new(engine: Box<dyn RecognitionEngine>, events: mpsc::Sender<CaptureEvent>) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            events,
            pump: None,
        }
    }

    async fn release(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.engine.lock().await.abort().await;
    }
}

#[async_trait]
impl AudioCapture for ContinuousRecognizer {
    async fn begin(&mut self, intent: ListeningIntent) -> Result<(), CaptureError> {
        self.release().await;

        let (tx, rx) = mpsc::channel(32);
        self.engine.lock().await.start(tx.clone()).await?;
        tracing::debug!("Recognition engine started");

        self.pump = Some(tokio::spawn(pump(
            self.engine.clone(),
            intent,
            tx,
            rx,
            self.events.clone(),
        )));
        Ok(())
    }

    async fn end(&mut self) -> Option<Utterance> {
        self.release().await;
        tracing::debug!("Recognition engine stopped");
        // Recognised text has already been delivered as events.
        None
    }

    fn is_active(&self) -> bool {
        self.pump.as_ref().is_some_and(|pump| !pump.is_finished())
    }
}

async fn pump(
    engine: Arc<Mutex<Box<dyn RecognitionEngine>>>,
    intent: ListeningIntent,
    tx: mpsc::Sender<RecognitionEvent>,
    mut rx: mpsc::Receiver<RecognitionEvent>,
    out: mpsc::Sender<CaptureEvent>,
) {
    while let Some(event) = rx.recv().await {
        let forward = match event {
            RecognitionEvent::Result {
                transcript,
                is_final: true,
            } => Some(CaptureEvent::Captured(Utterance::Transcript(transcript))),
            RecognitionEvent::Result {
                transcript,
                is_final: false,
            } => Some(CaptureEvent::Interim(transcript)),
            RecognitionEvent::Error(RecognitionErrorKind::NoSpeech) => {
                tracing::debug!("No speech detected in segment");
                None
            }
            RecognitionEvent::Error(RecognitionErrorKind::Aborted) => None,
            RecognitionEvent::Error(RecognitionErrorKind::NotAllowed) => {
                intent.clear();
                Some(CaptureEvent::Error(CaptureError::PermissionDenied))
            }
            RecognitionEvent::Error(RecognitionErrorKind::AudioCapture) => {
                intent.clear();
                Some(CaptureEvent::Error(CaptureError::Device(
                    "no audio input available".to_string(),
                )))
            }
            RecognitionEvent::Error(RecognitionErrorKind::Network(message)) => {
                tracing::warn!("Recognition backend unreachable: {}", message);
                Some(CaptureEvent::Error(CaptureError::Engine(message)))
            }
            RecognitionEvent::End => {
                if !intent.is_asserted() {
                    tracing::debug!("Segment ended with listening intent cleared, going idle");
                    break;
                }
                tracing::debug!("Segment ended, restarting recognition");
                if let Err(e) = engine.lock().await.start(tx.clone()).await {
                    intent.clear();
                    let _ = out.send(CaptureEvent::Error(e)).await;
                    break;
                }
                None
            }
        };

        if let Some(event) = forward {
            if out.send(event).await.is_err() {
                tracing::warn!("Capture event receiver dropped, stopping recognition pump");
                break;
            }
        }
    }
}
