//! Terminal front end: turns stdin lines into intents and session output
//! into printable lines.

use interview_core::dialogue::Role;
use interview_core::feedback::FeedbackReport;
use interview_core::session_state::{Intent, SessionNotice, SessionSnapshot};
use std::io::BufRead;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Intent(Intent),
    /// Print the latest snapshot. Handled locally, never sent to the session.
    Status,
}

/// Maps one input line to a command. Blank lines map to nothing.
pub fn parse_line(line: &str) -> Option<ConsoleCommand> {
    let line = line.trim();
    match line {
        "" => None,
        "/mic" => Some(ConsoleCommand::Intent(Intent::ToggleMic)),
        "/end" => Some(ConsoleCommand::Intent(Intent::End)),
        "/status" => Some(ConsoleCommand::Status),
        text => Some(ConsoleCommand::Intent(Intent::SubmitText(text.to_string()))),
    }
}

/// Where a rendered line belongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Out(String),
    Err(String),
}

impl Line {
    pub fn print(&self) {
        match self {
            Line::Out(text) => println!("{text}"),
            Line::Err(text) => eprintln!("{text}"),
        }
    }
}

pub fn render_notice(notice: &SessionNotice) -> Line {
    match notice {
        SessionNotice::Message(message) => {
            let speaker = match message.role {
                Role::Assistant => "Interviewer",
                Role::User => "You",
            };
            Line::Out(format!("{speaker}: {}", message.content))
        }
        SessionNotice::Interim(text) => Line::Out(format!("  ... {text}")),
        SessionNotice::Error(error) => Line::Err(format!("Error: {error}")),
    }
}

pub fn render_snapshot(snapshot: &SessionSnapshot) -> String {
    format!(
        "[{}] mic: {} | speaking: {} | messages: {}",
        snapshot.state,
        if snapshot.listening { "on" } else { "off" },
        if snapshot.speaking { "yes" } else { "no" },
        snapshot.history_len,
    )
}

pub fn render_feedback(report: Option<&FeedbackReport>) -> String {
    match report {
        Some(report) => format!("--- Interview Feedback ---\n{report}"),
        None => "No feedback report available".to_string(),
    }
}

/// Forwards stdin lines until EOF or until the receiver goes away.
///
/// Reading runs on a plain thread: a blocked read cannot be cancelled, and on
/// a runtime worker it would hold up shutdown.
pub fn spawn_stdin_reader() -> std::io::Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || forward_lines(std::io::stdin().lock(), tx))?;
    Ok(rx)
}

fn forward_lines(reader: impl BufRead, tx: mpsc::Sender<String>) {
    for line in reader.lines() {
        match line {
            Ok(line) => {
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("Failed to read from stdin: {}", e);
                break;
            }
        }
    }
    tracing::debug!("Stdin reader finished");
}
