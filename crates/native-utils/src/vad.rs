//! Energy-based speech segmentation.
//!
//! [`VadRecognitionEngine`] turns a plain microphone into a segment-wise
//! recognition engine: it listens until somebody speaks and then falls
//! silent, ships the segment off for transcription and reports the text.

use crate::audio::rms;
use async_trait::async_trait;
use interview_core::capture::{
    AudioClip, CaptureError, Microphone, RecognitionEngine, RecognitionErrorKind, RecognitionEvent,
};
use interview_core::exchange::TurnExchange;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy)]
pub struct VadSettings {
    /// Frame RMS at or above this counts as speech.
    pub threshold: f32,
    pub frame: Duration,
    /// Give up on a segment when nobody spoke for this long.
    pub no_speech_after: Duration,
    /// Close a segment after this much silence following speech.
    pub trailing_silence: Duration,
    pub max_segment: Duration,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            threshold: 0.02,
            frame: Duration::from_millis(30),
            no_speech_after: Duration::from_secs(8),
            trailing_silence: Duration::from_millis(900),
            max_segment: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// The no-speech window passed without any voiced frame.
    NoSpeech,
    /// Samples from the first voiced frame to the end of the segment.
    Complete(Vec<f32>),
}

/// Splits a sample stream into one speech segment.
#[derive(Debug)]
pub struct SpeechSegmenter {
    settings: VadSettings,
    frame_len: usize,
    no_speech_samples: usize,
    trailing_samples: usize,
    max_samples: usize,
    partial: Vec<f32>,
    voiced: Vec<f32>,
    heard_speech: bool,
    silent_samples: usize,
    seen_samples: usize,
}

impl SpeechSegmenter {
    pub fn new(settings: VadSettings, sample_rate: u32) -> Self {
        let samples = |d: Duration| (d.as_secs_f64() * sample_rate as f64).round() as usize;
        Self {
            settings,
            frame_len: samples(settings.frame).max(1),
            no_speech_samples: samples(settings.no_speech_after),
            trailing_samples: samples(settings.trailing_silence),
            max_samples: samples(settings.max_segment),
            partial: Vec::new(),
            voiced: Vec::new(),
            heard_speech: false,
            silent_samples: 0,
            seen_samples: 0,
        }
    }

    /// Consumes samples; returns the segment once it is decided.
    pub fn push(&mut self, samples: &[f32]) -> Option<Segment> {
        self.partial.extend_from_slice(samples);
        while self.partial.len() >= self.frame_len {
            let frame: Vec<f32> = self.partial.drain(..self.frame_len).collect();
            if let Some(segment) = self.push_frame(&frame) {
                return Some(segment);
            }
        }
        None
    }

    fn push_frame(&mut self, frame: &[f32]) -> Option<Segment> {
        self.seen_samples += frame.len();
        if rms(frame) >= self.settings.threshold {
            self.heard_speech = true;
            self.silent_samples = 0;
        } else {
            self.silent_samples += frame.len();
        }

        if !self.heard_speech {
            if self.seen_samples >= self.no_speech_samples {
                return Some(Segment::NoSpeech);
            }
            return None;
        }

        self.voiced.extend_from_slice(frame);
        if self.silent_samples >= self.trailing_samples || self.voiced.len() >= self.max_samples {
            return Some(Segment::Complete(std::mem::take(&mut self.voiced)));
        }
        None
    }
}

/// Recognition engine built from a microphone, a segmenter and the backend
/// transcription call.
pub struct VadRecognitionEngine<M: Microphone> {
    mic: M,
    exchange: Arc<dyn TurnExchange>,
    settings: VadSettings,
    task: Option<JoinHandle<()>>,
}

impl<M: Microphone> VadRecognitionEngine<M> {
    pub fn new(mic: M, exchange: Arc<dyn TurnExchange>, settings: VadSettings) -> Self {
        Self {
            mic,
            exchange,
            settings,
            task: None,
        }
    }
}

#[async_trait]
impl<M: Microphone> RecognitionEngine for VadRecognitionEngine<M> {
    async fn start(&mut self, events: mpsc::Sender<RecognitionEvent>) -> Result<(), CaptureError> {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let mut stream = match self.mic.open().await {
            Ok(stream) => stream,
            Err(CaptureError::PermissionDenied) => {
                let _ = events
                    .send(RecognitionEvent::Error(RecognitionErrorKind::NotAllowed))
                    .await;
                return Err(CaptureError::PermissionDenied);
            }
            Err(e) => return Err(e),
        };
        let mut segmenter = SpeechSegmenter::new(self.settings, stream.sample_rate);
        let exchange = self.exchange.clone();

        self.task = Some(tokio::spawn(async move {
            let sample_rate = stream.sample_rate;
            let segment = loop {
                match stream.chunks.recv().await {
                    Some(chunk) => {
                        if let Some(segment) = segmenter.push(&chunk) {
                            break Some(segment);
                        }
                    }
                    None => break None,
                }
            };
            // The device is not needed while the segment is transcribed.
            drop(stream);

            let event = match segment {
                None => RecognitionEvent::Error(RecognitionErrorKind::AudioCapture),
                Some(Segment::NoSpeech) => RecognitionEvent::Error(RecognitionErrorKind::NoSpeech),
                Some(Segment::Complete(samples)) => transcribe(exchange.as_ref(), &samples, sample_rate).await,
            };
            let _ = events.send(event).await;
            let _ = events.send(RecognitionEvent::End).await;
        }));
        Ok(())
    }

    async fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn transcribe(exchange: &dyn TurnExchange, samples: &[f32], sample_rate: u32) -> RecognitionEvent {
    let clip = match AudioClip::encode(samples, sample_rate) {
        Ok(Some(clip)) => clip,
        Ok(None) => return RecognitionEvent::Error(RecognitionErrorKind::NoSpeech),
        Err(e) => {
            tracing::error!("Failed to encode speech segment: {}", e);
            return RecognitionEvent::Error(RecognitionErrorKind::AudioCapture);
        }
    };

    match exchange.transcribe(clip).await {
        Ok(text) if text.trim().is_empty() => RecognitionEvent::Error(RecognitionErrorKind::NoSpeech),
        Ok(text) => RecognitionEvent::Result {
            transcript: text,
            is_final: true,
        },
        Err(e) => RecognitionEvent::Error(RecognitionErrorKind::Network(e.to_string())),
    }
}
