//! Application Configuration Module
//!
//! Loads the process-wide settings of the interviewer service from the
//! environment. Per-session values (role, skills, résumé) come from the
//! command line instead.

use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:5000";
pub const DEFAULT_REPLY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_FEEDBACK_TIMEOUT_SECS: u64 = 60;

/// How candidate speech becomes text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Record until the microphone is toggled off, then transcribe.
    Discrete,
    /// Segment speech automatically and keep listening while the mic is on.
    Continuous,
}

impl FromStr for CaptureMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "discrete" => Ok(CaptureMode::Discrete),
            "continuous" => Ok(CaptureMode::Continuous),
            other => Err(ConfigError::InvalidValue {
                var: "CAPTURE_MODE".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Holds all configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend_url: String,
    pub capture_mode: CaptureMode,
    pub reply_timeout: Duration,
    pub feedback_timeout: Duration,
    pub tts_binary: String,
    pub input_device: Option<String>,
    pub log_level: Level,
}

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is set but empty")]
    MissingVar(String),
    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    // *   `INTERVIEW_BACKEND_URL`: Base URL of the interview backend. Defaults to "http://localhost:5000".
    // *   `CAPTURE_MODE`: "discrete" or "continuous". Defaults to "discrete".
    // *   `REPLY_TIMEOUT_SECS`: Bound on transcription and reply calls. Defaults to 30.
    // *   `FEEDBACK_TIMEOUT_SECS`: Bound on the feedback call. Defaults to 60.
    // *   `TTS_BINARY`: Speech synthesizer to run. Defaults to "espeak-ng".
    // *   `INPUT_DEVICE`: (Optional) Name of the input device. Defaults to the host default.
    // *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file. This is useful for local development and is ignored if not present.
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let backend_url = required_or(&lookup, "INTERVIEW_BACKEND_URL", DEFAULT_BACKEND_URL)?;
        let tts_binary = required_or(&lookup, "TTS_BINARY", interview_native_utils::espeak::DEFAULT_BINARY)?;

        let capture_mode = match lookup("CAPTURE_MODE") {
            Some(value) => value.parse()?,
            None => CaptureMode::Discrete,
        };

        let reply_timeout = seconds(&lookup, "REPLY_TIMEOUT_SECS", DEFAULT_REPLY_TIMEOUT_SECS)?;
        let feedback_timeout = seconds(&lookup, "FEEDBACK_TIMEOUT_SECS", DEFAULT_FEEDBACK_TIMEOUT_SECS)?;

        let input_device = lookup("INPUT_DEVICE").filter(|name| !name.trim().is_empty());

        // Configure logging level from RUST_LOG, with a sensible default.
        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        Ok(Self {
            backend_url,
            capture_mode,
            reply_timeout,
            feedback_timeout,
            tts_binary,
            input_device,
            log_level,
        })
    }
}

fn required_or(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
    default: &str,
) -> Result<String, ConfigError> {
    match lookup(var) {
        Some(value) if value.trim().is_empty() => Err(ConfigError::MissingVar(var.to_string())),
        Some(value) => Ok(value.trim().to_string()),
        None => Ok(default.to_string()),
    }
}

fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let Some(value) = lookup(var) else {
        return Ok(Duration::from_secs(default));
    };
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::InvalidValue {
            var: var.to_string(),
            value,
        }),
    }
}
