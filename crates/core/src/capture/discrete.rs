use super::{
    AudioCapture, AudioClip, CaptureError, CaptureEvent, ListeningIntent, MicStream, Microphone, Utterance,
};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Records until told to stop, then hands the whole clip back for
/// transcription. It never restarts on its own.
///
/// A recording that cannot be assembled is reported on `events` so it is not
/// mistaken for silence.
pub struct DiscreteRecorder<M: Microphone> {
    mic: M,
    events: mpsc::Sender<CaptureEvent>,
    stream: Option<MicStream>,
}

impl<M: Microphone> DiscreteRecorder<M> {
    pub fn new(mic: M, events: mpsc::Sender<CaptureEvent>) -> Self {
        Self {
            mic,
            events,
            stream: None,
        }
    }

    fn into_utterance(&self, encoded: Result<Option<AudioClip>, CaptureError>) -> Option<Utterance> {
        match encoded {
            Ok(Some(clip)) => Some(Utterance::Recording(clip)),
            Ok(None) => {
                tracing::debug!("Recording stopped with no audio, discarding");
                None
            }
            Err(e) => {
                tracing::error!("Failed to assemble recording: {}", e);
                // The controller drains this port and may be the caller, so never wait on it.
                if let Err(e) = self.events.try_send(CaptureEvent::Error(e)) {
                    tracing::warn!("Recording error not delivered: {}", e);
                }
                None
            }
        }
    }
}

#[async_trait]
impl<M: Microphone> AudioCapture for DiscreteRecorder<M> {
    async fn begin(&mut self, _intent: ListeningIntent) -> Result<(), CaptureError> {
        // Only one stream may hold the device.
        if let Some(previous) = self.stream.take() {
            tracing::debug!("Releasing previous recording before starting a new one");
            drop(previous);
        }

        let stream = self.mic.open().await?;
        tracing::debug!("Recording started at {} Hz", stream.sample_rate);
        self.stream = Some(stream);
        Ok(())
    }

    async fn end(&mut self) -> Option<Utterance> {
        let stream = self.stream.take()?;
        let sample_rate = stream.sample_rate;
        let samples = stream.release().await;

        let encoded = AudioClip::encode(&samples, sample_rate);
        if let Ok(Some(clip)) = &encoded {
            tracing::debug!("Recording stopped: {} samples, {} bytes", samples.len(), clip.len());
        }
        self.into_utterance(encoded)
    }

    fn is_active(&self) -> bool {
        self.stream.is_some()
    }
}
