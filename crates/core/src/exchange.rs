use crate::capture::AudioClip;
use crate::context::SessionConfig;
use crate::dialogue::{DialogueHistory, Message, PriorHistory};
use crate::feedback::FeedbackReport;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fewest history entries the feedback service will accept.
pub const MIN_FEEDBACK_HISTORY: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("no response within {0:?}")]
    Timeout(Duration),
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        ExchangeError::Transport(e.to_string())
    }
}

/// One conversational turn sent to the backend.
///
/// `history` is a [`PriorHistory`], so it can only be the log as it stood
/// before `message` was appended.
#[derive(Debug, Clone, Serialize)]
pub struct ChatTurnRequest {
    pub message: String,
    pub history: PriorHistory,
    pub context: SessionConfig,
}

impl ChatTurnRequest {
    pub fn new(message: impl Into<String>, history: PriorHistory, context: SessionConfig) -> Self {
        Self {
            message: message.into(),
            history,
            context,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackRequest {
    pub history: Vec<Message>,
    pub context: SessionConfig,
}

impl FeedbackRequest {
    /// Fails without touching the network when the history is too short to
    /// review.
    pub fn new(history: &DialogueHistory, context: &SessionConfig) -> Result<Self, ExchangeError> {
        if history.len() < MIN_FEEDBACK_HISTORY {
            return Err(ExchangeError::Validation(format!(
                "feedback needs at least {MIN_FEEDBACK_HISTORY} history entries, got {}",
                history.len()
            )));
        }
        Ok(Self {
            history: history.to_vec(),
            context: context.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    response: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptionReply {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    error: String,
}

/// The three stateless calls a session makes to the interview backend.
///
/// The session controller only depends on this trait, so tests drive it with
/// `MockTurnExchange` and the binary plugs in [`HttpTurnExchange`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TurnExchange: Send + Sync {
    /// Speech to text. An empty transcript is a valid answer.
    async fn transcribe(&self, clip: AudioClip) -> Result<String, ExchangeError>;

    async fn chat_turn(&self, request: ChatTurnRequest) -> Result<String, ExchangeError>;

    async fn generate_feedback(&self, request: FeedbackRequest) -> Result<FeedbackReport, ExchangeError>;
}

pub struct HttpTurnExchange {
    client: Client,
    base_url: String,
}

impl HttpTurnExchange {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: Client::new(),
            base_url,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read_body(response: reqwest::Response) -> Result<String, ExchangeError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            // The backend reports failures as {"error": "..."}.
            let message = serde_json::from_str::<ErrorReply>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            return Err(ExchangeError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(body)
    }

    async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ExchangeError> {
        let response = self.client.post(self.endpoint(path)).json(body).send().await?;
        let body = Self::read_body(response).await?;
        serde_json::from_str(&body).map_err(|e| ExchangeError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl TurnExchange for HttpTurnExchange {
    async fn transcribe(&self, clip: AudioClip) -> Result<String, ExchangeError> {
        tracing::debug!("Uploading {} bytes for transcription", clip.len());
        let part = Part::bytes(clip.into_bytes())
            .file_name(AudioClip::FILE_NAME)
            .mime_str(AudioClip::MIME_TYPE)?;
        let form = Form::new().part("audio", part);

        let response = self
            .client
            .post(self.endpoint("/api/chat/transcribe"))
            .multipart(form)
            .send()
            .await?;
        let body = Self::read_body(response).await?;
        let reply: TranscriptionReply =
            serde_json::from_str(&body).map_err(|e| ExchangeError::Malformed(e.to_string()))?;
        Ok(reply.text.trim().to_string())
    }

    async fn chat_turn(&self, request: ChatTurnRequest) -> Result<String, ExchangeError> {
        tracing::debug!(
            "Sending chat turn with {} prior messages",
            request.history.len()
        );
        let reply: ChatReply = self.post_json("/api/chat", &request).await?;
        let text = reply.response.trim();
        if text.is_empty() {
            return Err(ExchangeError::Malformed("empty reply".to_string()));
        }
        Ok(text.to_string())
    }

    async fn generate_feedback(&self, request: FeedbackRequest) -> Result<FeedbackReport, ExchangeError> {
        let response = self
            .client
            .post(self.endpoint("/api/chat/feedback"))
            .json(&request)
            .send()
            .await?;
        let body = Self::read_body(response).await?;
        FeedbackReport::from_json(&body).map_err(ExchangeError::Malformed)
    }
}
