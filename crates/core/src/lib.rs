pub mod capture;
pub mod context;
pub mod dialogue;
pub mod exchange;
pub mod feedback;
pub mod session_state;
pub mod speech;

pub use capture::{AudioCapture, CaptureError, CaptureEvent, ListeningIntent, Utterance};
pub use context::SessionConfig;
pub use dialogue::{DialogueHistory, Message, Role};
pub use exchange::{ExchangeError, HttpTurnExchange, TurnExchange};
pub use feedback::{FeedbackReport, RatingBand};
pub use session_state::{
    EventInboxes, EventPorts, Intent, SessionController, SessionError, SessionHandle, SessionNotice,
    SessionOptions, SessionSnapshot, SessionState, event_channels,
};
pub use speech::{SpeechError, SpeechEvent, SpeechOutput, UtteranceId, Voice};
