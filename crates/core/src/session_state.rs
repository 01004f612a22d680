use crate::capture::{AudioCapture, CaptureError, CaptureEvent, ListeningIntent, Utterance};
use crate::context::SessionConfig;
use crate::dialogue::{DialogueHistory, Message};
use crate::exchange::{ChatTurnRequest, ExchangeError, FeedbackRequest, TurnExchange};
use crate::feedback::FeedbackReport;
use crate::speech::{SpeechError, SpeechEvent, SpeechOutput, UtteranceId};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

const INBOX_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    AwaitingCandidate,
    CapturingAudio,
    AwaitingBackendReply,
    Speaking,
    Ended,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::NotStarted => "not started",
            SessionState::AwaitingCandidate => "awaiting candidate",
            SessionState::CapturingAudio => "capturing audio",
            SessionState::AwaitingBackendReply => "awaiting backend reply",
            SessionState::Speaking => "speaking",
            SessionState::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// What the caller asks the session to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Start,
    ToggleMic,
    SubmitText(String),
    End,
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Intent::Start => "start",
            Intent::ToggleMic => "toggle-mic",
            Intent::SubmitText(_) => "submit-text",
            Intent::End => "end",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{intent} is not accepted while {state}")]
    Rejected {
        intent: &'static str,
        state: SessionState,
    },
    #[error("nothing to send")]
    EmptyUtterance,
    #[error("microphone unavailable: {0}")]
    Capture(#[from] CaptureError),
    #[error("speech playback failed: {0}")]
    Speech(#[from] SpeechError),
    #[error("transcription failed: {0}")]
    Transcription(ExchangeError),
    #[error("interviewer reply failed: {0}")]
    ChatTurn(ExchangeError),
}

/// What the session reports back to the caller.
#[derive(Debug)]
pub enum SessionNotice {
    /// A message was appended to the history.
    Message(Message),
    /// Partial recognition text, for display only.
    Interim(String),
    Error(SessionError),
}

/// Published after every handled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub listening: bool,
    pub speaking: bool,
    pub history_len: usize,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::NotStarted,
            listening: false,
            speaking: false,
            history_len: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Bound on every transcribe and chat-turn call.
    pub reply_timeout: Duration,
    pub feedback_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(30),
            feedback_timeout: Duration::from_secs(60),
        }
    }
}

/// Senders the adapters report on. Build the capture and speech adapters
/// with these before handing them to the controller.
#[derive(Debug, Clone)]
pub struct EventPorts {
    pub capture: mpsc::Sender<CaptureEvent>,
    pub speech: mpsc::Sender<SpeechEvent>,
}

/// Receiving ends of [`EventPorts`], consumed by [`SessionController::run`].
#[derive(Debug)]
pub struct EventInboxes {
    capture: mpsc::Receiver<CaptureEvent>,
    speech: mpsc::Receiver<SpeechEvent>,
}

pub fn event_channels() -> (EventPorts, EventInboxes) {
    let (capture_tx, capture_rx) = mpsc::channel(INBOX_CAPACITY);
    let (speech_tx, speech_rx) = mpsc::channel(INBOX_CAPACITY);
    (
        EventPorts {
            capture: capture_tx,
            speech: speech_tx,
        },
        EventInboxes {
            capture: capture_rx,
            speech: speech_rx,
        },
    )
}

/// The caller's side of a running session.
///
/// Dropping `intents` ends a started session.
#[derive(Debug)]
pub struct SessionHandle {
    pub intents: mpsc::Sender<Intent>,
    pub notices: mpsc::UnboundedReceiver<SessionNotice>,
    pub snapshots: watch::Receiver<SessionSnapshot>,
    /// Resolves once, after the session ended. `None` when no report could
    /// be produced.
    pub feedback: oneshot::Receiver<Option<FeedbackReport>>,
}

#[derive(Debug)]
enum Completion {
    Transcribed(Result<String, ExchangeError>),
    Replied(Result<String, ExchangeError>),
}

#[derive(Debug)]
struct Ticketed {
    ticket: u64,
    completion: Completion,
}

#[derive(Debug)]
enum Input {
    Intent(Intent),
    Capture(CaptureEvent),
    Speech(SpeechEvent),
    Completion(Ticketed),
}

/// Turn-taking state machine for one interview.
///
/// The controller is the only writer of the state and the history. Backend
/// calls run on spawned tasks and come back as ticketed completions, so a
/// reply that arrives after the session moved on is recognised and dropped.
pub struct SessionController {
    config: SessionConfig,
    options: SessionOptions,
    state: SessionState,
    history: DialogueHistory,
    intent: ListeningIntent,
    capture: Box<dyn AudioCapture>,
    speech: Box<dyn SpeechOutput>,
    exchange: Arc<dyn TurnExchange>,
    current_utterance: Option<UtteranceId>,
    ticket: u64,
    intents: mpsc::Receiver<Intent>,
    completions_tx: mpsc::Sender<Ticketed>,
    completions_rx: mpsc::Receiver<Ticketed>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    snapshots: watch::Sender<SessionSnapshot>,
    feedback: Option<oneshot::Sender<Option<FeedbackReport>>>,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        options: SessionOptions,
        capture: Box<dyn AudioCapture>,
        speech: Box<dyn SpeechOutput>,
        exchange: Arc<dyn TurnExchange>,
    ) -> (Self, SessionHandle) {
        let (intents_tx, intents_rx) = mpsc::channel(INBOX_CAPACITY);
        let (completions_tx, completions_rx) = mpsc::channel(INBOX_CAPACITY);
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (snapshots_tx, snapshots_rx) = watch::channel(SessionSnapshot::default());
        let (feedback_tx, feedback_rx) = oneshot::channel();

        let controller = Self {
            config,
            options,
            state: SessionState::NotStarted,
            history: DialogueHistory::new(),
            intent: ListeningIntent::new(),
            capture,
            speech,
            exchange,
            current_utterance: None,
            ticket: 0,
            intents: intents_rx,
            completions_tx,
            completions_rx,
            notices: notices_tx,
            snapshots: snapshots_tx,
            feedback: Some(feedback_tx),
        };
        let handle = SessionHandle {
            intents: intents_tx,
            notices: notices_rx,
            snapshots: snapshots_rx,
            feedback: feedback_rx,
        };
        (controller, handle)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn history(&self) -> &DialogueHistory {
        &self.history
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            listening: self.capture.is_active(),
            speaking: self.speech.is_speaking(),
            history_len: self.history.len(),
        }
    }

    /// Runs the session until it ends or the caller goes away.
    pub async fn run(mut self, mut inboxes: EventInboxes) {
        loop {
            let input = tokio::select! {
                intent = self.intents.recv() => match intent {
                    Some(intent) => Input::Intent(intent),
                    None => {
                        tracing::info!("Session handle dropped");
                        if self.state != SessionState::NotStarted {
                            self.handle(Input::Intent(Intent::End)).await;
                        }
                        break;
                    }
                },
                Some(event) = inboxes.capture.recv() => Input::Capture(event),
                Some(event) = inboxes.speech.recv() => Input::Speech(event),
                Some(done) = self.completions_rx.recv() => Input::Completion(done),
            };

            self.handle(input).await;
            if self.state == SessionState::Ended {
                break;
            }
        }
        tracing::debug!("Session loop finished");
    }

    async fn handle(&mut self, input: Input) {
        match input {
            Input::Intent(intent) => self.on_intent(intent).await,
            Input::Capture(event) => self.on_capture(event).await,
            Input::Speech(event) => self.on_speech(event),
            Input::Completion(done) => self.on_completion(done).await,
        }
        self.snapshots.send_replace(self.snapshot());
    }

    async fn on_intent(&mut self, intent: Intent) {
        use SessionState::*;

        match (self.state, intent) {
            (NotStarted, Intent::Start) => {
                let greeting = self.config.greeting();
                self.history.append_assistant(greeting.clone());
                self.notify(SessionNotice::Message(Message::assistant(greeting.clone())));
                self.transition(AwaitingCandidate);
                self.speak(greeting).await;
            }
            (_, Intent::Start) => {
                tracing::debug!("Start ignored, session is {}", self.state);
            }

            (AwaitingCandidate | Speaking, Intent::ToggleMic) => self.open_mic().await,
            (CapturingAudio, Intent::ToggleMic) => {
                self.intent.clear();
                match self.capture.end().await {
                    Some(utterance) => self.accept_utterance(utterance),
                    None => self.transition(AwaitingCandidate),
                }
            }

            (AwaitingCandidate | CapturingAudio, Intent::SubmitText(text)) => {
                if text.trim().is_empty() {
                    self.notify(SessionNotice::Error(SessionError::EmptyUtterance));
                    return;
                }
                if self.state == CapturingAudio {
                    self.intent.clear();
                    if self.capture.end().await.is_some() {
                        tracing::debug!("Discarding captured audio in favour of typed text");
                    }
                }
                self.begin_chat_turn(text.trim().to_string());
            }

            (NotStarted | Ended, Intent::End) => self.reject(Intent::End),
            (_, Intent::End) => self.end().await,

            (_, intent) => self.reject(intent),
        }
    }

    async fn on_capture(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Captured(utterance) => {
                if self.state != SessionState::CapturingAudio {
                    tracing::debug!("Discarding utterance captured while {}", self.state);
                    return;
                }
                self.intent.clear();
                self.capture.end().await;
                self.accept_utterance(utterance);
            }
            CaptureEvent::Interim(text) => {
                if self.state == SessionState::CapturingAudio {
                    self.notify(SessionNotice::Interim(text));
                }
            }
            CaptureEvent::Error(error) => {
                if error.is_fatal() {
                    tracing::warn!("Capture failed: {}", error);
                    self.intent.clear();
                    if self.state == SessionState::CapturingAudio {
                        self.capture.end().await;
                        self.transition(SessionState::AwaitingCandidate);
                    }
                } else {
                    tracing::warn!("Recoverable capture error: {}", error);
                }
                self.notify(SessionNotice::Error(SessionError::Capture(error)));
            }
        }
    }

    fn on_speech(&mut self, event: SpeechEvent) {
        match event {
            SpeechEvent::Started { id } => tracing::debug!("Playback of {} started", id),
            SpeechEvent::Finished { id } => {
                if self.state == SessionState::Speaking && self.current_utterance == Some(id) {
                    self.current_utterance = None;
                    self.transition(SessionState::AwaitingCandidate);
                } else {
                    tracing::debug!("Ignoring stale finish of {}", id);
                }
            }
        }
    }

    async fn on_completion(&mut self, done: Ticketed) {
        if done.ticket != self.ticket || self.state != SessionState::AwaitingBackendReply {
            tracing::debug!(
                "Discarding completion for ticket {} (current {}, session {})",
                done.ticket,
                self.ticket,
                self.state
            );
            return;
        }

        match done.completion {
            Completion::Transcribed(Ok(text)) => {
                if text.trim().is_empty() {
                    tracing::info!("No speech detected in recording");
                    self.transition(SessionState::AwaitingCandidate);
                } else {
                    self.begin_chat_turn(text.trim().to_string());
                }
            }
            Completion::Transcribed(Err(e)) => {
                tracing::warn!("Transcription failed: {}", e);
                self.notify(SessionNotice::Error(SessionError::Transcription(e)));
                self.transition(SessionState::AwaitingCandidate);
            }
            Completion::Replied(Ok(reply)) => {
                self.history.append_assistant(reply.clone());
                self.notify(SessionNotice::Message(Message::assistant(reply.clone())));
                self.speak(reply).await;
            }
            Completion::Replied(Err(e)) => {
                tracing::warn!("Chat turn failed: {}", e);
                self.notify(SessionNotice::Error(SessionError::ChatTurn(e)));
                self.transition(SessionState::AwaitingCandidate);
            }
        }
    }

    async fn open_mic(&mut self) {
        if self.current_utterance.take().is_some() || self.speech.is_speaking() {
            self.speech.cancel().await;
        }

        self.intent.assert();
        match self.capture.begin(self.intent.clone()).await {
            Ok(()) => self.transition(SessionState::CapturingAudio),
            Err(e) => {
                tracing::warn!("Could not open microphone: {}", e);
                self.intent.clear();
                self.notify(SessionNotice::Error(SessionError::Capture(e)));
                self.transition(SessionState::AwaitingCandidate);
            }
        }
    }

    fn accept_utterance(&mut self, utterance: Utterance) {
        match utterance {
            Utterance::Transcript(text) if text.trim().is_empty() => {
                tracing::info!("No speech detected");
                self.transition(SessionState::AwaitingCandidate);
            }
            Utterance::Transcript(text) => self.begin_chat_turn(text.trim().to_string()),
            Utterance::Recording(clip) => {
                self.transition(SessionState::AwaitingBackendReply);
                let exchange = self.exchange.clone();
                let limit = self.options.reply_timeout;
                self.dispatch(async move {
                    Completion::Transcribed(bounded(limit, exchange.transcribe(clip)).await)
                });
            }
        }
    }

    fn begin_chat_turn(&mut self, text: String) {
        let prior = self.history.append_user(text.clone());
        self.notify(SessionNotice::Message(Message::user(text.clone())));
        self.transition(SessionState::AwaitingBackendReply);

        let request = ChatTurnRequest::new(text, prior, self.config.clone());
        let exchange = self.exchange.clone();
        let limit = self.options.reply_timeout;
        self.dispatch(async move { Completion::Replied(bounded(limit, exchange.chat_turn(request)).await) });
    }

    async fn speak(&mut self, text: String) {
        // The microphone is never open while the interviewer talks.
        self.intent.clear();
        if self.capture.is_active() {
            self.capture.end().await;
        }

        match self.speech.speak(&text, self.config.voice.as_deref()).await {
            Ok(id) => {
                self.current_utterance = Some(id);
                self.transition(SessionState::Speaking);
            }
            Err(e) => {
                tracing::error!("Speech playback failed: {}", e);
                self.notify(SessionNotice::Error(SessionError::Speech(e)));
                self.transition(SessionState::AwaitingCandidate);
            }
        }
    }

    async fn end(&mut self) {
        self.speech.cancel().await;
        self.current_utterance = None;
        self.intent.clear();
        if self.capture.is_active() {
            self.capture.end().await;
        }
        self.speech.teardown().await;

        // Anything still in flight belongs to the old ticket.
        self.ticket += 1;
        self.transition(SessionState::Ended);
        self.request_feedback();
    }

    fn request_feedback(&mut self) {
        let Some(reply) = self.feedback.take() else {
            return;
        };

        let request = match FeedbackRequest::new(&self.history, &self.config) {
            Ok(request) => request,
            Err(e) => {
                tracing::info!("Skipping feedback: {}", e);
                let _ = reply.send(None);
                return;
            }
        };

        let exchange = self.exchange.clone();
        let limit = self.options.feedback_timeout;
        tokio::spawn(async move {
            let report = match bounded(limit, exchange.generate_feedback(request)).await {
                Ok(report) => Some(report),
                Err(e) => {
                    tracing::error!("Feedback generation failed: {}", e);
                    None
                }
            };
            if reply.send(report).is_err() {
                tracing::debug!("Feedback receiver dropped");
            }
        });
    }

    fn dispatch<F>(&mut self, call: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        self.ticket += 1;
        let ticket = self.ticket;
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let completion = call.await;
            let _ = tx.send(Ticketed { ticket, completion }).await;
        });
    }

    fn reject(&mut self, intent: Intent) {
        tracing::warn!("Rejected {} while {}", intent.name(), self.state);
        self.notify(SessionNotice::Error(SessionError::Rejected {
            intent: intent.name(),
            state: self.state,
        }));
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            tracing::debug!("Session state: {} -> {}", self.state, next);
            self.state = next;
        }
    }

    fn notify(&self, notice: SessionNotice) {
        // The caller may have stopped listening; the session carries on.
        let _ = self.notices.send(notice);
    }
}

async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, ExchangeError>>,
) -> Result<T, ExchangeError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(ExchangeError::Timeout(limit)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::AudioClip;
    use crate::exchange::MockTurnExchange;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const GREETING: &str =
        "Hello! I'm your AI Interviewer for the Frontend Developer position. Please introduce yourself.";

    /// Capture double that hands back a queued utterance on `end`.
    #[derive(Default, Clone)]
    struct FakeCapture {
        active: Arc<AtomicBool>,
        begins: Arc<AtomicUsize>,
        deny: bool,
        on_end: Arc<Mutex<Option<Utterance>>>,
    }

    #[async_trait]
    impl AudioCapture for FakeCapture {
        async fn begin(&mut self, _intent: ListeningIntent) -> Result<(), CaptureError> {
            if self.deny {
                return Err(CaptureError::PermissionDenied);
            }
            self.begins.fetch_add(1, Ordering::SeqCst);
            self.active.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn end(&mut self) -> Option<Utterance> {
            self.active.store(false, Ordering::SeqCst);
            self.on_end.lock().unwrap().take()
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
    }

    #[derive(Default, Clone)]
    struct FakeSpeech {
        speaking: Arc<AtomicBool>,
        spoken: Arc<Mutex<Vec<String>>>,
        torn_down: Arc<AtomicBool>,
        counter: u64,
    }

    #[async_trait]
    impl SpeechOutput for FakeSpeech {
        async fn speak(&mut self, text: &str, _voice_hint: Option<&str>) -> Result<UtteranceId, SpeechError> {
            self.spoken.lock().unwrap().push(text.to_string());
            self.speaking.store(true, Ordering::SeqCst);
            Ok(UtteranceId::next(&mut self.counter))
        }

        async fn cancel(&mut self) {
            self.speaking.store(false, Ordering::SeqCst);
        }

        fn is_speaking(&self) -> bool {
            self.speaking.load(Ordering::SeqCst)
        }

        async fn teardown(&mut self) {
            self.speaking.store(false, Ordering::SeqCst);
            self.torn_down.store(true, Ordering::SeqCst);
        }
    }

    /// Exchange whose calls never finish in time.
    struct StalledExchange;

    #[async_trait]
    impl TurnExchange for StalledExchange {
        async fn transcribe(&self, _clip: AudioClip) -> Result<String, ExchangeError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(String::new())
        }

        async fn chat_turn(&self, _request: ChatTurnRequest) -> Result<String, ExchangeError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("too late".to_string())
        }

        async fn generate_feedback(&self, _request: FeedbackRequest) -> Result<FeedbackReport, ExchangeError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(ExchangeError::Transport("unreachable".to_string()))
        }
    }

    struct Fixture {
        controller: SessionController,
        handle: SessionHandle,
        capture: FakeCapture,
        speech: FakeSpeech,
    }

    impl Fixture {
        fn new(exchange: impl TurnExchange + 'static) -> Self {
            Self::with_options(exchange, FakeCapture::default(), SessionOptions::default())
        }

        fn with_options(exchange: impl TurnExchange + 'static, capture: FakeCapture, options: SessionOptions) -> Self {
            let speech = FakeSpeech::default();
            let config = SessionConfig::new("Frontend Developer").with_skills("React");
            let (controller, handle) = SessionController::new(
                config,
                options,
                Box::new(capture.clone()),
                Box::new(speech.clone()),
                Arc::new(exchange),
            );
            Self {
                controller,
                handle,
                capture,
                speech,
            }
        }

        async fn send(&mut self, input: Input) {
            self.controller.handle(input).await;
            let capture_on = self.capture.active.load(Ordering::SeqCst);
            let speech_on = self.speech.speaking.load(Ordering::SeqCst);
            assert!(
                !(capture_on && speech_on),
                "microphone and speech active together in {}",
                self.controller.state()
            );
        }

        async fn intent(&mut self, intent: Intent) {
            self.send(Input::Intent(intent)).await;
        }

        /// Waits for the next backend completion and feeds it in.
        async fn settle(&mut self) {
            let done = tokio::time::timeout(Duration::from_secs(2), self.controller.completions_rx.recv())
                .await
                .expect("backend call did not complete")
                .expect("completion channel closed");
            self.send(Input::Completion(done)).await;
        }

        async fn finish_speaking(&mut self) {
            let id = self.controller.current_utterance.expect("nothing is being spoken");
            self.speech.speaking.store(false, Ordering::SeqCst);
            self.send(Input::Speech(SpeechEvent::Finished { id })).await;
        }

        fn spoken(&self) -> Vec<String> {
            self.speech.spoken.lock().unwrap().clone()
        }

        fn notices(&mut self) -> Vec<SessionNotice> {
            let mut notices = Vec::new();
            while let Ok(notice) = self.handle.notices.try_recv() {
                notices.push(notice);
            }
            notices
        }
    }

    #[tokio::test]
    async fn test_start_appends_and_speaks_greeting() {
        let mut f = Fixture::new(MockTurnExchange::new());

        f.intent(Intent::Start).await;

        assert_eq!(f.controller.state(), SessionState::Speaking);
        assert_eq!(f.controller.history().messages(), &[Message::assistant(GREETING)]);
        assert_eq!(f.spoken(), vec![GREETING.to_string()]);
        assert_eq!(f.handle.snapshots.borrow().history_len, 1);

        // A second start changes nothing.
        f.intent(Intent::Start).await;
        assert_eq!(f.controller.history().len(), 1);
        assert_eq!(f.spoken().len(), 1);
    }

    #[tokio::test]
    async fn test_recorded_answer_flows_through_transcription_and_reply() {
        // --- 1. Arrange ---
        let mut mock = MockTurnExchange::new();
        mock.expect_transcribe()
            .times(1)
            .returning(|_| Ok("I have five years of experience".to_string()));
        mock.expect_chat_turn()
            .withf(|request| {
                request.message == "I have five years of experience"
                    && request.history.as_slice() == [Message::assistant(GREETING)]
            })
            .times(1)
            .returning(|_| Ok("Great, let's dig into React.".to_string()));

        let mut f = Fixture::new(mock);
        let clip = AudioClip::from_wav_bytes(vec![1, 2, 3]);
        *f.capture.on_end.lock().unwrap() = Some(Utterance::Recording(clip));

        // --- 2. Act ---
        f.intent(Intent::Start).await;
        f.finish_speaking().await;
        f.intent(Intent::ToggleMic).await;
        assert_eq!(f.controller.state(), SessionState::CapturingAudio);
        f.intent(Intent::ToggleMic).await;
        assert_eq!(f.controller.state(), SessionState::AwaitingBackendReply);
        f.settle().await; // transcript
        f.settle().await; // reply

        // --- 3. Assert ---
        assert_eq!(
            f.controller.history().messages(),
            &[
                Message::assistant(GREETING),
                Message::user("I have five years of experience"),
                Message::assistant("Great, let's dig into React."),
            ]
        );
        assert_eq!(f.controller.state(), SessionState::Speaking);
        assert_eq!(f.spoken().last().unwrap(), "Great, let's dig into React.");
        assert!(!f.capture.active.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_history_grows_by_two_per_successful_turn() {
        let mut mock = MockTurnExchange::new();
        mock.expect_chat_turn()
            .withf(|request| {
                request
                    .history
                    .as_slice()
                    .iter()
                    .all(|m| m.content != request.message)
            })
            .times(3)
            .returning(|request| Ok(format!("Tell me more about {}", request.message)));

        let mut f = Fixture::new(mock);
        f.intent(Intent::Start).await;

        for n in 1..=3 {
            f.finish_speaking().await;
            f.intent(Intent::SubmitText(format!("answer {n}"))).await;
            f.settle().await;
            assert_eq!(f.controller.history().len(), 2 * n + 1);
        }
    }

    #[tokio::test]
    async fn test_feedback_with_short_history_skips_backend() {
        let mut mock = MockTurnExchange::new();
        mock.expect_generate_feedback().never();

        let mut f = Fixture::new(mock);
        f.intent(Intent::Start).await;
        f.intent(Intent::End).await;

        assert_eq!(f.controller.state(), SessionState::Ended);
        assert_eq!(f.handle.feedback.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_end_delivers_feedback_for_full_history() {
        let mut mock = MockTurnExchange::new();
        mock.expect_chat_turn()
            .returning(|_| Ok("Great, let's dig into React.".to_string()));
        mock.expect_generate_feedback()
            .withf(|request| request.history.len() == 3 && request.context.role == "Frontend Developer")
            .times(1)
            .returning(|_| {
                Ok(FeedbackReport {
                    rating: 72,
                    summary: "Solid fundamentals.".to_string(),
                    strengths: vec!["Clear answers".to_string()],
                    weaknesses: vec![],
                    improvements: vec![],
                })
            });

        let mut f = Fixture::new(mock);
        f.intent(Intent::Start).await;
        f.finish_speaking().await;
        f.intent(Intent::SubmitText("I have five years of experience".to_string()))
            .await;
        f.settle().await;
        f.intent(Intent::End).await;

        let report = f.handle.feedback.await.unwrap().expect("feedback expected");
        assert_eq!(report.rating, 72);
    }

    #[tokio::test]
    async fn test_end_while_speaking_releases_speech_and_microphone() {
        let mut f = Fixture::new(MockTurnExchange::new());
        f.intent(Intent::Start).await;
        assert!(f.speech.speaking.load(Ordering::SeqCst));

        f.intent(Intent::End).await;

        assert_eq!(f.controller.state(), SessionState::Ended);
        assert!(!f.speech.speaking.load(Ordering::SeqCst));
        assert!(!f.capture.active.load(Ordering::SeqCst));
        assert!(f.speech.torn_down.load(Ordering::SeqCst));
        assert!(!f.controller.intent.is_asserted());
    }

    #[tokio::test]
    async fn test_toggle_sequences_never_overlap_capture_and_speech() {
        #[derive(Clone, Copy, Debug)]
        enum Step {
            Toggle,
            Finish,
            Reply,
        }
        let steps = [Step::Toggle, Step::Finish, Step::Reply];

        for code in 0..3usize.pow(5) {
            let mut mock = MockTurnExchange::new();
            mock.expect_chat_turn()
                .returning(|_| Ok("Next question.".to_string()));
            let mut f = Fixture::new(mock);
            f.intent(Intent::Start).await;

            let mut rest = code;
            for _ in 0..5 {
                let step = steps[rest % 3];
                rest /= 3;
                match step {
                    Step::Toggle => {
                        *f.capture.on_end.lock().unwrap() =
                            Some(Utterance::Transcript("an answer".to_string()));
                        f.intent(Intent::ToggleMic).await;
                    }
                    Step::Finish if f.controller.current_utterance.is_some() => f.finish_speaking().await,
                    Step::Reply if f.controller.state() == SessionState::AwaitingBackendReply => {
                        f.settle().await
                    }
                    _ => {}
                }
            }
        }
    }

    #[tokio::test]
    async fn test_toggle_while_speaking_cancels_speech_first() {
        let mut f = Fixture::new(MockTurnExchange::new());
        f.intent(Intent::Start).await;

        f.intent(Intent::ToggleMic).await;

        assert_eq!(f.controller.state(), SessionState::CapturingAudio);
        assert!(!f.speech.speaking.load(Ordering::SeqCst));
        assert!(f.capture.active.load(Ordering::SeqCst));
        assert!(f.controller.intent.is_asserted());
    }

    #[tokio::test]
    async fn test_stale_finish_signal_is_ignored() {
        let mut mock = MockTurnExchange::new();
        mock.expect_chat_turn()
            .returning(|_| Ok("Why React?".to_string()));
        let mut f = Fixture::new(mock);

        f.intent(Intent::Start).await;
        let greeting_id = f.controller.current_utterance.unwrap();
        f.intent(Intent::ToggleMic).await;
        f.intent(Intent::SubmitText("I like React".to_string())).await;
        f.settle().await;
        assert_eq!(f.controller.state(), SessionState::Speaking);

        f.send(Input::Speech(SpeechEvent::Finished { id: greeting_id })).await;
        assert_eq!(f.controller.state(), SessionState::Speaking);

        f.finish_speaking().await;
        assert_eq!(f.controller.state(), SessionState::AwaitingCandidate);
    }

    #[tokio::test]
    async fn test_failed_chat_turn_keeps_history_without_reply() {
        let mut mock = MockTurnExchange::new();
        mock.expect_chat_turn().times(1).returning(|_| {
            Err(ExchangeError::Status {
                status: 500,
                message: "Failed to generate response capabilities.".to_string(),
            })
        });
        let mut f = Fixture::new(mock);
        f.intent(Intent::Start).await;
        f.finish_speaking().await;
        f.notices();

        f.intent(Intent::SubmitText("Hello".to_string())).await;
        f.settle().await;

        assert_eq!(f.controller.state(), SessionState::AwaitingCandidate);
        assert_eq!(f.controller.history().len(), 2);
        assert_eq!(f.controller.history().last(), Some(&Message::user("Hello")));
        let notices = f.notices();
        assert!(matches!(
            notices.last(),
            Some(SessionNotice::Error(SessionError::ChatTurn(ExchangeError::Status { status: 500, .. })))
        ));
    }

    #[tokio::test]
    async fn test_empty_transcript_returns_to_candidate() {
        let mut mock = MockTurnExchange::new();
        mock.expect_transcribe().returning(|_| Ok("  ".to_string()));
        mock.expect_chat_turn().never();
        let mut f = Fixture::new(mock);
        *f.capture.on_end.lock().unwrap() = Some(Utterance::Recording(AudioClip::from_wav_bytes(vec![0; 8])));

        f.intent(Intent::Start).await;
        f.intent(Intent::ToggleMic).await;
        f.intent(Intent::ToggleMic).await;
        f.settle().await;

        assert_eq!(f.controller.state(), SessionState::AwaitingCandidate);
        assert_eq!(f.controller.history().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_transcription_is_recoverable() {
        let mut mock = MockTurnExchange::new();
        mock.expect_transcribe()
            .times(1)
            .returning(|_| Err(ExchangeError::Transport("connection reset".to_string())));
        mock.expect_chat_turn().never();
        let mut f = Fixture::new(mock);
        *f.capture.on_end.lock().unwrap() = Some(Utterance::Recording(AudioClip::from_wav_bytes(vec![0; 8])));

        f.intent(Intent::Start).await;
        f.intent(Intent::ToggleMic).await;
        f.notices();
        f.intent(Intent::ToggleMic).await;
        f.settle().await;

        assert_eq!(f.controller.state(), SessionState::AwaitingCandidate);
        assert_eq!(f.controller.history().len(), 1);
        assert!(matches!(
            f.notices().last(),
            Some(SessionNotice::Error(SessionError::Transcription(ExchangeError::Transport(_))))
        ));

        // The candidate can simply try again.
        f.intent(Intent::ToggleMic).await;
        assert_eq!(f.controller.state(), SessionState::CapturingAudio);
    }

    #[tokio::test]
    async fn test_only_one_chat_turn_in_flight() {
        let mut mock = MockTurnExchange::new();
        mock.expect_chat_turn()
            .withf(|request| request.message == "first answer")
            .times(1)
            .returning(|_| Ok("Go on.".to_string()));
        let mut f = Fixture::new(mock);
        f.intent(Intent::Start).await;
        f.finish_speaking().await;

        f.intent(Intent::SubmitText("first answer".to_string())).await;
        assert_eq!(f.controller.state(), SessionState::AwaitingBackendReply);
        f.notices();

        f.intent(Intent::SubmitText("second answer".to_string())).await;
        f.intent(Intent::ToggleMic).await;

        let rejected = f
            .notices()
            .into_iter()
            .filter(|notice| {
                matches!(
                    notice,
                    SessionNotice::Error(SessionError::Rejected {
                        state: SessionState::AwaitingBackendReply,
                        ..
                    })
                )
            })
            .count();
        assert_eq!(rejected, 2);
        assert_eq!(f.controller.history().len(), 2);
        assert!(!f.capture.active.load(Ordering::SeqCst));

        f.settle().await;
        assert_eq!(f.controller.history().len(), 3);
        assert_eq!(f.controller.state(), SessionState::Speaking);
    }

    #[tokio::test]
    async fn test_empty_recording_returns_to_candidate_without_transcribing() {
        let mut mock = MockTurnExchange::new();
        mock.expect_transcribe().never();
        mock.expect_chat_turn().never();
        let mut f = Fixture::new(mock);
        f.intent(Intent::Start).await;
        f.intent(Intent::ToggleMic).await;
        assert_eq!(f.controller.state(), SessionState::CapturingAudio);

        // Nothing queued: the recorder discarded an empty clip.
        f.intent(Intent::ToggleMic).await;

        assert_eq!(f.controller.state(), SessionState::AwaitingCandidate);
        assert_eq!(f.controller.history().len(), 1);
        assert!(!f.capture.active.load(Ordering::SeqCst));
        assert!(!f.controller.intent.is_asserted());
        assert!(f.controller.completions_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_encoding_failure_is_reported_to_the_candidate() {
        let mut f = Fixture::new(MockTurnExchange::new());
        f.intent(Intent::Start).await;
        f.finish_speaking().await;
        f.notices();

        f.send(Input::Capture(CaptureEvent::Error(CaptureError::Encoding(
            "writer closed".to_string(),
        ))))
        .await;

        assert_eq!(f.controller.state(), SessionState::AwaitingCandidate);
        assert!(matches!(
            f.notices().last(),
            Some(SessionNotice::Error(SessionError::Capture(CaptureError::Encoding(_))))
        ));
    }

    #[tokio::test]
    async fn test_reply_timeout_is_recoverable() {
        let options = SessionOptions {
            reply_timeout: Duration::from_millis(50),
            feedback_timeout: Duration::from_millis(50),
        };
        let mut f = Fixture::with_options(StalledExchange, FakeCapture::default(), options);
        f.intent(Intent::Start).await;
        f.finish_speaking().await;
        f.notices();

        f.intent(Intent::SubmitText("Hello".to_string())).await;
        f.settle().await;

        assert_eq!(f.controller.state(), SessionState::AwaitingCandidate);
        assert!(matches!(
            f.notices().last(),
            Some(SessionNotice::Error(SessionError::ChatTurn(ExchangeError::Timeout(_))))
        ));

        // Feedback times out too and the caller still gets an answer.
        f.intent(Intent::End).await;
        assert_eq!(f.handle.feedback.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_completion_after_end_is_discarded() {
        let mut mock = MockTurnExchange::new();
        mock.expect_chat_turn()
            .returning(|_| Ok("Too late".to_string()));
        mock.expect_generate_feedback()
            .returning(|_| Err(ExchangeError::Transport("offline".to_string())));
        let mut f = Fixture::new(mock);
        f.intent(Intent::Start).await;
        f.intent(Intent::ToggleMic).await;
        f.intent(Intent::SubmitText("Hello".to_string())).await;

        f.intent(Intent::End).await;
        f.settle().await;

        assert_eq!(f.controller.state(), SessionState::Ended);
        assert_eq!(f.controller.history().len(), 2);
        assert_eq!(f.spoken().len(), 1, "late reply must not be spoken");
        assert_eq!(f.handle.feedback.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_intents_outside_their_states_are_rejected() {
        let mut f = Fixture::new(MockTurnExchange::new());

        f.intent(Intent::End).await;
        f.intent(Intent::ToggleMic).await;
        assert_eq!(f.controller.state(), SessionState::NotStarted);

        f.intent(Intent::Start).await;
        f.intent(Intent::SubmitText("while speaking".to_string())).await;
        assert_eq!(f.controller.state(), SessionState::Speaking);
        f.finish_speaking().await;
        f.intent(Intent::SubmitText("   ".to_string())).await;
        assert_eq!(f.controller.state(), SessionState::AwaitingCandidate);
        assert_eq!(f.controller.history().len(), 1);

        let errors: Vec<_> = f
            .notices()
            .into_iter()
            .filter_map(|n| match n {
                SessionNotice::Error(e) => Some(e),
                _ => None,
            })
            .collect();
        assert!(matches!(
            errors[0],
            SessionError::Rejected {
                intent: "end",
                state: SessionState::NotStarted
            }
        ));
        assert!(matches!(errors[1], SessionError::Rejected { intent: "toggle-mic", .. }));
        assert!(matches!(
            errors[2],
            SessionError::Rejected {
                intent: "submit-text",
                state: SessionState::Speaking
            }
        ));
        assert!(matches!(errors[3], SessionError::EmptyUtterance));
    }

    #[tokio::test]
    async fn test_permission_denied_leaves_session_text_capable() {
        let capture = FakeCapture {
            deny: true,
            ..Default::default()
        };
        let mut mock = MockTurnExchange::new();
        mock.expect_chat_turn().times(1).returning(|_| Ok("Thanks.".to_string()));
        let mut f = Fixture::with_options(mock, capture, SessionOptions::default());
        f.intent(Intent::Start).await;
        f.finish_speaking().await;

        f.intent(Intent::ToggleMic).await;
        assert_eq!(f.controller.state(), SessionState::AwaitingCandidate);
        assert!(!f.controller.intent.is_asserted());

        f.intent(Intent::SubmitText("Typed answer".to_string())).await;
        f.settle().await;
        assert_eq!(f.controller.history().len(), 3);
    }

    #[tokio::test]
    async fn test_fatal_capture_error_while_listening_clears_intent() {
        let mut f = Fixture::new(MockTurnExchange::new());
        f.intent(Intent::Start).await;
        f.intent(Intent::ToggleMic).await;

        f.send(Input::Capture(CaptureEvent::Error(CaptureError::Device(
            "unplugged".to_string(),
        ))))
        .await;

        assert_eq!(f.controller.state(), SessionState::AwaitingCandidate);
        assert!(!f.controller.intent.is_asserted());
        assert!(!f.capture.active.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_recognised_transcript_only_counts_while_capturing() {
        let mut mock = MockTurnExchange::new();
        mock.expect_chat_turn()
            .withf(|request| request.message == "I use hooks")
            .times(1)
            .returning(|_| Ok("Which ones?".to_string()));
        let mut f = Fixture::new(mock);
        f.intent(Intent::Start).await;

        // Late result from an engine that was already stopped.
        f.send(Input::Capture(CaptureEvent::Captured(Utterance::Transcript(
            "stray words".to_string(),
        ))))
        .await;
        assert_eq!(f.controller.history().len(), 1);

        f.intent(Intent::ToggleMic).await;
        f.send(Input::Capture(CaptureEvent::Interim("I use".to_string()))).await;
        f.send(Input::Capture(CaptureEvent::Captured(Utterance::Transcript(
            "I use hooks".to_string(),
        ))))
        .await;
        assert_eq!(f.controller.state(), SessionState::AwaitingBackendReply);
        assert!(!f.capture.active.load(Ordering::SeqCst));
        f.settle().await;
        assert_eq!(f.controller.history().len(), 3);
    }

    #[tokio::test]
    async fn test_dropping_the_handle_ends_a_started_session() {
        let f = Fixture::new(MockTurnExchange::new());
        let (_ports, inboxes) = event_channels();
        let Fixture {
            controller, handle, ..
        } = f;
        let SessionHandle {
            intents,
            mut notices,
            snapshots,
            feedback,
        } = handle;

        let session = tokio::spawn(controller.run(inboxes));
        intents.send(Intent::Start).await.unwrap();
        match notices.recv().await {
            Some(SessionNotice::Message(message)) => assert_eq!(message.content, GREETING),
            other => panic!("Expected the greeting, got {:?}", other),
        }

        drop(intents);
        session.await.unwrap();

        assert_eq!(snapshots.borrow().state, SessionState::Ended);
        assert_eq!(feedback.await.unwrap(), None);
    }
}
