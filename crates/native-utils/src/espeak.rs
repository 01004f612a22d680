use async_trait::async_trait;
use interview_core::speech::{
    SpeechError, SpeechEvent, SpeechOutput, UtteranceId, Voice, VoiceCache, select_voice,
};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

pub const DEFAULT_BINARY: &str = "espeak-ng";

struct Playback {
    id: UtteranceId,
    stop: oneshot::Sender<()>,
    done: Arc<AtomicBool>,
}

/// Speech output that shells out to espeak-ng, one child process per
/// utterance.
pub struct EspeakSpeech {
    binary: String,
    events: mpsc::Sender<SpeechEvent>,
    voices: VoiceCache,
    counter: u64,
    current: Option<Playback>,
}

impl EspeakSpeech {
    pub fn new(binary: impl Into<String>, events: mpsc::Sender<SpeechEvent>) -> Self {
        Self {
            binary: binary.into(),
            events,
            voices: VoiceCache::new(),
            counter: 0,
            current: None,
        }
    }

    async fn choose_voice(&mut self, hint: Option<&str>) -> Option<String> {
        let binary = self.binary.clone();
        let voices = self.voices.get_or_load(|| list_voices(binary)).await;
        select_voice(voices, hint).map(|v| v.id.clone())
    }
}

#[async_trait]
impl SpeechOutput for EspeakSpeech {
    async fn speak(&mut self, text: &str, voice_hint: Option<&str>) -> Result<UtteranceId, SpeechError> {
        self.cancel().await;

        let voice = self.choose_voice(voice_hint).await;
        let mut command = Command::new(&self.binary);
        if let Some(voice) = &voice {
            command.arg("-v").arg(voice);
        }
        command
            .arg("--stdin")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| SpeechError::Spawn(format!("{}: {}", self.binary, e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            // An engine that exits early closes the pipe; its exit still ends playback.
            if let Err(e) = write_text(&mut stdin, text).await {
                tracing::warn!("Failed to hand text to {}: {}", self.binary, e);
            }
        }

        let id = UtteranceId::next(&mut self.counter);
        tracing::debug!("Speaking {} with voice {:?}", id, voice);
        let _ = self.events.send(SpeechEvent::Started { id }).await;

        let (stop_tx, stop_rx) = oneshot::channel();
        let done = Arc::new(AtomicBool::new(false));
        let finished = done.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    if let Err(e) = status {
                        tracing::warn!("Speech process for {} failed: {}", id, e);
                    }
                }
                _ = stop_rx => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!("Failed to stop speech process for {}: {}", id, e);
                    }
                }
            }
            finished.store(true, Ordering::SeqCst);
            let _ = events.send(SpeechEvent::Finished { id }).await;
        });

        self.current = Some(Playback {
            id,
            stop: stop_tx,
            done,
        });
        Ok(id)
    }

    async fn cancel(&mut self) {
        if let Some(playback) = self.current.take() {
            if !playback.done.load(Ordering::SeqCst) {
                tracing::debug!("Cancelling {}", playback.id);
            }
            let _ = playback.stop.send(());
        }
    }

    fn is_speaking(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|playback| !playback.done.load(Ordering::SeqCst))
    }

    async fn teardown(&mut self) {
        self.cancel().await;
        self.voices.clear();
    }
}

async fn write_text(stdin: &mut tokio::process::ChildStdin, text: &str) -> std::io::Result<()> {
    stdin.write_all(text.as_bytes()).await?;
    stdin.shutdown().await
}

/// Asks the binary for its voices. An engine that cannot list them is still
/// usable with its default voice.
pub async fn list_voices(binary: String) -> Vec<Voice> {
    match Command::new(&binary).arg("--voices").output().await {
        Ok(output) if output.status.success() => parse_voice_list(&String::from_utf8_lossy(&output.stdout)),
        Ok(output) => {
            tracing::warn!("{} --voices exited with {}", binary, output.status);
            Vec::new()
        }
        Err(e) => {
            tracing::warn!("Could not list voices from {}: {}", binary, e);
            Vec::new()
        }
    }
}

/// Parses the `--voices` table:
/// `Pty Language Age/Gender VoiceName File Other Languages`.
pub fn parse_voice_list(table: &str) -> Vec<Voice> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut columns = line.split_whitespace();
            let _priority = columns.next()?;
            let language = columns.next()?;
            let _age_gender = columns.next()?;
            let name = columns.next()?;
            Some(Voice {
                id: language.to_string(),
                name: name.replace('_', " "),
                language: language.to_string(),
            })
        })
        .collect()
}
