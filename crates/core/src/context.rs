use serde::{Deserialize, Serialize};

/// Role used when the candidate leaves the target role blank.
pub const DEFAULT_ROLE: &str = "Software Engineer";

/// Interview context collected at setup time.
///
/// It is sent unmodified as `context` with every backend call and never
/// changes once the session has started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub role: String,
    #[serde(default)]
    pub skills: String,
    #[serde(default)]
    pub job_description: String,
    #[serde(default)]
    pub resume_text: String,
    #[serde(rename = "selectedVoiceURI", default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(rename = "selectedAvatar", default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl SessionConfig {
    pub fn new(role: impl Into<String>) -> Self {
        let role = role.into();
        let role = if role.trim().is_empty() {
            DEFAULT_ROLE.to_string()
        } else {
            role.trim().to_string()
        };
        Self {
            role,
            ..Default::default()
        }
    }

    pub fn with_skills(mut self, skills: impl Into<String>) -> Self {
        self.skills = skills.into();
        self
    }

    pub fn with_job_description(mut self, job_description: impl Into<String>) -> Self {
        self.job_description = job_description.into();
        self
    }

    pub fn with_resume_text(mut self, resume_text: impl Into<String>) -> Self {
        self.resume_text = resume_text.into();
        self
    }

    pub fn with_voice(mut self, voice: Option<String>) -> Self {
        self.voice = voice.filter(|v| !v.trim().is_empty());
        self
    }

    pub fn with_avatar(mut self, avatar: Option<String>) -> Self {
        self.avatar = avatar.filter(|a| !a.trim().is_empty());
        self
    }

    /// The skills field split on commas, blanks dropped.
    pub fn skill_list(&self) -> Vec<&str> {
        self.skills
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// First assistant message of every session.
    pub fn greeting(&self) -> String {
        format!(
            "Hello! I'm your AI Interviewer for the {} position. Please introduce yourself.",
            self.role
        )
    }
}
