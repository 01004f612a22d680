use serde::{Deserialize, Serialize};

/// Who produced a message in the interview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One exchanged message. Never edited once it is part of a history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Append-only log of the conversation, in turn order.
///
/// The session controller is the only writer. There is no way to remove or
/// edit a message, so the length only ever grows during a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DialogueHistory {
    messages: Vec<Message>,
}

impl DialogueHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a candidate utterance and returns the history as it stood
    /// before the append. That snapshot is what a chat turn must carry.
    pub fn append_user(&mut self, content: impl Into<String>) -> PriorHistory {
        let prior = PriorHistory(self.messages.clone());
        self.messages.push(Message::user(content));
        prior
    }

    pub fn append_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(Message::assistant(content));
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn to_vec(&self) -> Vec<Message> {
        self.messages.clone()
    }
}

/// History snapshot taken just before a user utterance was appended.
///
/// Only [`DialogueHistory::append_user`] produces one, so a chat turn built
/// from it can never contain the utterance it is about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PriorHistory(Vec<Message>);

impl PriorHistory {
    pub fn as_slice(&self) -> &[Message] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
