use anyhow::{Context, Result};
use clap::Parser;
use interview_core::capture::{AudioCapture, ContinuousRecognizer, DiscreteRecorder};
use interview_core::context::SessionConfig;
use interview_core::exchange::{HttpTurnExchange, TurnExchange};
use interview_core::session_state::{Intent, SessionController, SessionOptions, event_channels};
use interview_native_utils::{CpalMicrophone, EspeakSpeech, VadRecognitionEngine, VadSettings};
use interviewer_service::config::{CaptureMode, Config};
use interviewer_service::console::{self, ConsoleCommand};
use interviewer_service::resume;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::fmt::time::ChronoLocal;

#[derive(Parser)]
#[command(version, about = "Practice a job interview by voice or text")]
struct Cli {
    /// Target role. Defaults to "Software Engineer".
    #[arg(long, default_value = "")]
    role: String,
    /// Comma-separated skills to focus on
    #[arg(long, default_value = "")]
    skills: String,
    #[arg(long, default_value = "")]
    job_description: String,
    /// Plain-text résumé file
    #[arg(long)]
    resume: Option<PathBuf>,
    /// Preferred synthesizer voice, by id or name
    #[arg(long)]
    voice: Option<String>,
    #[arg(long)]
    avatar: Option<String>,
    /// List audio devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Configuration loaded successfully. Starting interviewer service...");

    // --- 3. Parse Command-Line Arguments ---
    let args = Cli::parse();
    if args.list_devices {
        println!("Input devices:");
        for line in interview_native_utils::device::list_input_devices()? {
            println!("{line}");
        }
        println!("Output devices:");
        for line in interview_native_utils::device::list_output_devices()? {
            println!("{line}");
        }
        return Ok(());
    }

    // --- 4. Build the Session Context ---
    let resume_text = match &args.resume {
        Some(path) => resume::load_resume(path).context("Failed to load résumé")?,
        None => String::new(),
    };
    let session_config = SessionConfig::new(args.role)
        .with_skills(args.skills)
        .with_job_description(args.job_description)
        .with_resume_text(resume_text)
        .with_voice(args.voice)
        .with_avatar(args.avatar);
    tracing::info!(
        "Interviewing for {} ({} skills listed)",
        session_config.role,
        session_config.skill_list().len()
    );
    if let Some(avatar) = &session_config.avatar {
        tracing::debug!("Avatar: {}", avatar);
    }

    // --- 5. Initialize the Backend Client ---
    let exchange: Arc<dyn TurnExchange> = Arc::new(HttpTurnExchange::new(config.backend_url.clone()));
    tracing::info!("Using interview backend at {}", config.backend_url);

    // --- 6. Wire Capture and Speech Adapters ---
    let (ports, inboxes) = event_channels();
    let mic = CpalMicrophone::new(config.input_device.clone());
    let capture: Box<dyn AudioCapture> = match config.capture_mode {
        CaptureMode::Discrete => Box::new(DiscreteRecorder::new(mic, ports.capture.clone())),
        CaptureMode::Continuous => {
            let engine = VadRecognitionEngine::new(mic, exchange.clone(), VadSettings::default());
            Box::new(ContinuousRecognizer::new(Box::new(engine), ports.capture.clone()))
        }
    };
    tracing::info!("Capture mode: {:?}", config.capture_mode);
    let speech = Box::new(EspeakSpeech::new(config.tts_binary.clone(), ports.speech.clone()));

    let options = SessionOptions {
        reply_timeout: config.reply_timeout,
        feedback_timeout: config.feedback_timeout,
    };
    let (controller, handle) = SessionController::new(session_config, options, capture, speech, exchange);
    let intents = handle.intents;
    let mut notices = handle.notices;
    let snapshots = handle.snapshots;
    let feedback = handle.feedback;

    // --- 7. Run the Session ---
    let mut session = tokio::spawn(controller.run(inboxes));

    let printer = tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            console::render_notice(&notice).print();
        }
    });

    intents
        .send(Intent::Start)
        .await
        .context("Session stopped before it started")?;
    println!("Commands: /mic toggles the microphone, /status shows the session, /end finishes. Anything else is sent as text.");

    let mut lines = console::spawn_stdin_reader().context("Failed to start stdin reader")?;
    let command_intents = intents.clone();
    let command_handler = tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            match console::parse_line(&line) {
                Some(ConsoleCommand::Status) => {
                    println!("{}", console::render_snapshot(&snapshots.borrow()));
                }
                Some(ConsoleCommand::Intent(intent)) => {
                    if command_intents.send(intent).await.is_err() {
                        break;
                    }
                }
                None => {}
            }
        }
        // Stdin closed: finish the interview rather than leave it hanging.
        let _ = command_intents.send(Intent::End).await;
    });

    tokio::select! {
        result = &mut session => {
            if let Err(e) = result {
                tracing::error!("Session task failed: {:?}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl-C, ending the interview...");
            let _ = intents.send(Intent::End).await;
            if let Err(e) = session.await {
                tracing::error!("Session task failed: {:?}", e);
            }
        }
    }
    command_handler.abort();
    drop(intents);
    drop(ports);

    // The controller is gone, so the printer drains and stops.
    let _ = printer.await;

    // --- 8. Report Feedback ---
    println!("Generating feedback...");
    let report = feedback.await.ok().flatten();
    println!("{}", console::render_feedback(report.as_ref()));

    tracing::info!("Shutting down...");
    Ok(())
}
