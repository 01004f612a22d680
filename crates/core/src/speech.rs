//! Speech output capability.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;

/// Voices tried, in order, when the candidate did not pick one that exists.
pub const PREFERRED_VOICES: [&str; 3] = ["Google US English", "Samantha", "en-us"];

/// Identifies one call to [`SpeechOutput::speak`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UtteranceId(pub u64);

impl UtteranceId {
    /// Advances the counter and returns the new id.
    pub fn next(counter: &mut u64) -> Self {
        *counter += 1;
        UtteranceId(*counter)
    }
}

impl fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "utterance-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechEvent {
    Started { id: UtteranceId },
    Finished { id: UtteranceId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voice {
    pub id: String,
    pub name: String,
    pub language: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("failed to start speech engine: {0}")]
    Spawn(String),
    #[error("speech engine i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Speaks assistant messages.
///
/// Implementations report playback on the speech port they were built with,
/// as [`SpeechEvent::Started`] and [`SpeechEvent::Finished`] carrying the id
/// that `speak` returned. A cancelled utterance may still report `Finished`.
#[async_trait]
pub trait SpeechOutput: Send {
    /// Starts speaking `text`. An utterance still playing is cancelled first.
    async fn speak(&mut self, text: &str, voice_hint: Option<&str>) -> Result<UtteranceId, SpeechError>;

    /// Stops playback. Safe to call when nothing is playing.
    async fn cancel(&mut self);

    fn is_speaking(&self) -> bool;

    /// Cancels playback and drops cached voices.
    async fn teardown(&mut self);
}

/// Picks the voice to speak with.
///
/// The hint wins when it names an available voice by id or name. Otherwise
/// the first voice matching [`PREFERRED_VOICES`], then the first voice at
/// all. `None` means the engine default.
pub fn select_voice<'a>(voices: &'a [Voice], hint: Option<&str>) -> Option<&'a Voice> {
    if let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) {
        if let Some(voice) = voices.iter().find(|v| v.id == hint || v.name == hint) {
            return Some(voice);
        }
        tracing::debug!("Requested voice {:?} not available, falling back", hint);
    }

    PREFERRED_VOICES
        .iter()
        .find_map(|preferred| {
            voices
                .iter()
                .find(|v| v.name.contains(preferred) || v.id == *preferred)
        })
        .or_else(|| voices.first())
}

/// Lazily loaded voice list, owned by one speech adapter.
#[derive(Debug, Default)]
pub struct VoiceCache {
    voices: Option<Vec<Voice>>,
}

impl VoiceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_load<F, Fut>(&mut self, load: F) -> &[Voice]
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Vec<Voice>>,
    {
        if self.voices.is_none() {
            let voices = load().await;
            tracing::debug!("Loaded {} voices", voices.len());
            self.voices = Some(voices);
        }
        self.voices.as_deref().unwrap_or_default()
    }

    pub fn is_loaded(&self) -> bool {
        self.voices.is_some()
    }

    pub fn clear(&mut self) {
        self.voices = None;
    }
}
