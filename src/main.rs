use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paircall::config::ConfigStore;
use paircall::events::{EventBus, SessionEvent};
use paircall::negotiation::{DeviceMediaSource, NegotiationEngine, RtcPeerFactory};
use paircall::session::{Orchestrator, SessionHandle};
use paircall::signaling::{
    Participant, ReportReason, SignalingTransport, TokioScheduler, WebSocketConnector,
};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

/// paircall command line arguments
#[derive(Parser, Debug)]
#[command(name = "paircall")]
#[command(version, about = "Random one-to-one video chat from the terminal", long_about = None)]
struct CliArgs {
    /// Signaling relay URL (overrides database config)
    #[arg(short = 'r', long, value_name = "URL")]
    relay_url: Option<String>,

    /// Store the --relay-url value for later runs
    #[arg(long, requires = "relay_url")]
    save: bool,

    /// Data directory path (default: ~/.paircall)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Name shown to partners
    #[arg(short = 'n', long, default_value = "Anonymous")]
    name: String,

    /// Country shown to partners
    #[arg(short = 'c', long, default_value = "Unknown")]
    country: String,

    /// Preferred language
    #[arg(long, default_value = "en")]
    language: String,

    /// Interest tag, may be repeated
    #[arg(short = 'i', long = "interest", value_name = "TAG")]
    interests: Vec<String>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Log output format
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose, args.log_format);

    tracing::info!("Starting paircall v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = args.data_dir.clone().unwrap_or_else(get_data_dir);
    tracing::info!("Data directory: {}", data_dir.display());
    tokio::fs::create_dir_all(&data_dir).await?;

    // Initialize configuration store
    let config_store = ConfigStore::new(&data_dir.join("paircall.db")).await?;
    if let (true, Some(url)) = (args.save, &args.relay_url) {
        let url = url.clone();
        config_store.update(|c| c.signaling.relay_url = url).await?;
        tracing::info!("Saved signaling relay URL to configuration");
    }
    let mut config = (*config_store.get()).clone();

    // Unsaved CLI overrides apply to this run only
    if let Some(url) = &args.relay_url {
        config.signaling.relay_url = url.clone();
    }
    config.validate()?;
    tracing::info!("Signaling relay: {}", config.signaling.relay_url);

    let events = Arc::new(EventBus::new());

    let transport = SignalingTransport::new(
        Arc::new(WebSocketConnector::new(
            config.signaling.relay_url.clone(),
            config.signaling.connect_timeout(),
        )),
        Arc::new(TokioScheduler),
        config.signaling.retry_policy(),
    );

    let (engine, engine_events) = NegotiationEngine::new(
        Arc::new(RtcPeerFactory::new(config.rtc.clone())),
        Arc::new(DeviceMediaSource::new(
            config.media.video_device.clone(),
            config.media.audio_device.clone(),
        )),
        Arc::new(transport.clone()),
        config.media.constraints.clone(),
    );

    let (session, session_task) = Orchestrator::spawn(
        config.session.clone(),
        transport.clone(),
        engine,
        engine_events,
        events.clone(),
    );

    tokio::spawn(log_events(events.subscribe()));

    let mut profile = Participant::new(args.name, args.country);
    profile.language = args.language;
    profile.interests = args.interests;
    tracing::info!("Local participant id: {}", profile.id);

    session.get_started().await?;
    if let Err(e) = session
        .complete_onboarding(profile, config.session.default_preferences.clone())
        .await
    {
        tracing::error!("Onboarding failed: {}", e);
        session.shutdown().await;
        return Err(e.into());
    }
    transport.connect();

    println!("Commands: search, cancel, end, next, say <text>, report <reason>, video, audio, status, quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for Ctrl-C: {}", e);
                }
                tracing::info!("Shutdown signal received");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !run_command(&session, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Failed to read stdin: {}", e);
                    break;
                }
            },
        }
    }

    session.shutdown().await;
    if let Err(e) = session_task.await {
        tracing::warn!("Session task ended abnormally: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Execute one stdin command. Returns `false` to quit.
async fn run_command(session: &SessionHandle, line: &str) -> bool {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let result = match command {
        "" => Ok(()),
        "search" => session.start_search().await,
        "cancel" => session.cancel_search().await,
        "end" => session.end_call().await,
        "next" => session.next_partner().await,
        "say" => session.send_message(rest).await,
        "report" => {
            let reason = match rest.trim() {
                "" => ReportReason::InappropriateBehavior,
                other => ReportReason::from(other.to_string()),
            };
            session.report_user(reason).await
        }
        "video" => session
            .toggle_video()
            .await
            .map(|on| println!("camera {}", if on { "on" } else { "off" })),
        "audio" => session
            .toggle_audio()
            .await
            .map(|on| println!("microphone {}", if on { "on" } else { "off" })),
        "status" => {
            print_status(session);
            Ok(())
        }
        "quit" | "exit" => return false,
        other => {
            println!("unknown command '{}'", other);
            Ok(())
        }
    };

    if let Err(e) = result {
        println!("{}", e.user_message());
    }
    true
}

fn print_status(session: &SessionHandle) {
    let state = session.snapshot();
    println!("phase:     {}", state.phase);
    println!("transport: {}", state.transport);
    if let Some(partner) = &state.partner {
        println!(
            "partner:   {} from {} ({}s)",
            partner.display_name,
            partner.country,
            state.call_duration_secs()
        );
    }
    if let Some(quality) = state.quality {
        println!("quality:   {}", quality);
    }
    if let Some(media) = &state.local_media {
        println!(
            "camera:    {}, microphone: {}",
            if media.video_enabled() { "on" } else { "off" },
            if media.audio_enabled() { "on" } else { "off" }
        );
    }
    if let Some(error) = &state.error {
        println!("error:     {}", error);
    }
}

/// Render session events as log lines
async fn log_events(mut rx: broadcast::Receiver<SessionEvent>) {
    loop {
        match rx.recv().await {
            Ok(SessionEvent::Message { message }) => {
                println!("[{}] {}", message.timestamp.format("%H:%M:%S"), message.message);
            }
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => tracing::info!(event = event.event_name(), "{}", json),
                Err(e) => tracing::warn!("Failed to encode event: {}", e),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Event log lagged, {} events skipped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Initialize logging
fn init_logging(level: LogLevel, verbose_count: u8, format: LogFormat) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "paircall=error",
        LogLevel::Warn => "paircall=warn",
        LogLevel::Info => "paircall=info",
        LogLevel::Verbose => "paircall=debug,webrtc=warn",
        LogLevel::Debug => "paircall=debug,webrtc=info",
        LogLevel::Trace => "paircall=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let result = match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    // Check environment variable first
    if let Some(path) = std::env::var_os("PAIRCALL_DATA_DIR") {
        return PathBuf::from(path);
    }

    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".paircall"),
        None => PathBuf::from(".paircall"),
    }
}
