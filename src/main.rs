//! # CallShield Client - Main Application Entry Point
//!
//! This is the main entry point for the callshield-client command line tool.
//! It drives the client side of a voice-authentication call against the
//! risk-analysis service:
//!
//! ## Subcommands:
//! - **call**: Run a live call session (microphone -> gate -> WebSocket) with
//!   the scripted agent turns and risk polling, until Ctrl+C or remote end
//! - **enroll**: Record a voice sample and register it for a user
//! - **monitor**: Read-only view that follows the active session and logs
//!   risk changes and the AI-voice alert
//! - **devices**: List the available input devices
//!
//! ## Application Architecture:
//! - **config**: Client configuration (TOML file + environment variables)
//! - **audio**: Capture, framing, spectrum tap and agent playback
//! - **transport**: Outbound audio WebSocket with the turn gate
//! - **scheduler**: Agent/caller turn timeline
//! - **poller / risk**: Session status and risk polling, derived view
//! - **session**: Call lifecycle that wires everything together
//! - **slot**: Active session id shared between surfaces

// Module declarations
mod api;         // HTTP client for the risk service (api.rs)
mod audio;       // Capture, encoding and playback (audio/ directory)
mod config;      // Configuration management (config.rs)
mod enrollment;  // Voice enrollment recording (enrollment.rs)
mod error;       // Error handling types (error.rs)
mod models;      // Wire and domain types (models.rs)
mod monitor;     // Read-only risk monitor (monitor.rs)
mod poller;      // Status/risk polling loop (poller.rs)
mod risk;        // Derived risk view and fraud alert latch (risk.rs)
mod scheduler;   // Turn scheduler and clip cache (scheduler.rs)
mod session;     // Call lifecycle manager (session.rs)
mod slot;        // Shared active-session slot (slot.rs)
mod transport;   // Audio WebSocket transport (transport.rs)

use anyhow::Result;
use api::{HttpSessionApi, SessionApi};
use audio::{AgentPlayer, AudioInput, CpalInput, NullPlayer, RodioPlayer};
use clap::{Parser, Subcommand};
use config::AppConfig;
use enrollment::EnrollmentRequest;
use monitor::Monitor;
use session::{EndReason, InputFactory, SessionManager};
use slot::SharedSlot;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal, set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "callshield", version, about = "Voice-authentication call client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a live call session
    Call,
    /// Record and upload an enrollment sample
    Enroll {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        name: String,
        /// Recording length in seconds
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Follow the active session and log its risk state
    Monitor {
        /// Follow this id instead of the shared slot
        #[arg(long)]
        session_id: Option<String>,
    },
    /// List input devices
    Devices,
}

/// The application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Installs signal handlers** so Ctrl+C ends a call cleanly
/// 4. **Dispatches** to the chosen subcommand
#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenv::dotenv().ok();

    init_tracing()?;

    let cli = Cli::parse();
    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting callshield-client v{}", env!("CARGO_PKG_VERSION"));
    info!("Risk service at {}", config.api.base_url);

    setup_signal_handlers();

    match cli.command {
        Command::Call => run_call(config).await,
        Command::Enroll {
            user_id,
            name,
            seconds,
        } => run_enroll(config, user_id, name, seconds).await,
        Command::Monitor { session_id } => run_monitor(config, session_id).await,
        Command::Devices => {
            for device in CpalInput::list_input_devices()? {
                info!("Input device: {}", device);
            }
            Ok(())
        }
    }
}

/// Run one call until the user stops it or the service ends it.
async fn run_call(config: AppConfig) -> Result<()> {
    let api: Arc<dyn SessionApi> = Arc::new(HttpSessionApi::new(&config.api)?);
    let player: Arc<dyn AgentPlayer> = match RodioPlayer::new() {
        Ok(player) => Arc::new(player),
        Err(e) => {
            warn!("No audio output ({}), agent turns will be silent", e);
            Arc::new(NullPlayer)
        }
    };
    let input_factory: InputFactory =
        Arc::new(|| Box::new(CpalInput::new()) as Box<dyn AudioInput>);

    let slot = SharedSlot::open(&config.slot.dir, &config.slot.key).await?;
    let writer = slot.claim_writer()?;

    let mut manager = SessionManager::new(config, api, player, input_factory, writer);
    let mut poller_rx = manager.poller_state();
    let mut last = poller_rx.borrow_and_update().clone();

    let session_id = match manager.start().await {
        Ok(id) => id,
        Err(e) => {
            error!("Could not start call: {}", e.user_message());
            return Err(e.into());
        }
    };
    info!("Call {} live, press Ctrl+C to hang up", session_id);

    let reason = loop {
        tokio::select! {
            reason = manager.wait_for_end() => break reason,
            _ = wait_for_shutdown() => {
                info!("Shutdown signal received, hanging up...");
                break EndReason::UserRequested;
            }
            changed = poller_rx.changed() => {
                if changed.is_err() {
                    continue;
                }
                let next = poller_rx.borrow_and_update().clone();
                for event in monitor::describe_changes(&last, &next) {
                    monitor::log_event(&event, &next);
                }
                last = next;
            }
        }
    };

    manager.end(reason.clone()).await;
    match reason.into_error() {
        Some(e) => {
            error!("Call ended: {}", e.user_message());
            Err(e.into())
        }
        None => {
            info!("Call ended");
            Ok(())
        }
    }
}

/// Record an enrollment sample and upload it.
async fn run_enroll(config: AppConfig, user_id: String, name: String, seconds: u64) -> Result<()> {
    let request = EnrollmentRequest::new(user_id, name)?;
    let api = HttpSessionApi::new(&config.api)?;

    let recording = enrollment::record(
        Box::new(CpalInput::new()),
        &config.audio,
        Duration::from_secs(seconds),
        wait_for_shutdown(),
    )
    .await?;

    match enrollment::submit(&api, &request, &recording).await {
        Ok(response) => {
            info!("{}", response.message);
            Ok(())
        }
        Err(e) => {
            error!("Enrollment failed: {}", e.user_message());
            Err(e.into())
        }
    }
}

/// Follow the active (or an explicit) session until shutdown.
async fn run_monitor(config: AppConfig, session_id: Option<String>) -> Result<()> {
    let api: Arc<dyn SessionApi> = Arc::new(HttpSessionApi::new(&config.api)?);
    let mut monitor = match session_id {
        Some(id) => Monitor::follow_session(api, id, &config),
        None => {
            let slot = SharedSlot::open(&config.slot.dir, &config.slot.key).await?;
            info!("Watching {}", slot.path().display());
            Monitor::follow_slot(api, slot, &config)
        }
    };

    loop {
        tokio::select! {
            events = monitor.next_events() => {
                let Some(events) = events else { break };
                for event in &events {
                    monitor::log_event(event, monitor.state());
                }
            }
            _ = wait_for_shutdown() => {
                info!("Shutdown signal received, stopping monitor...");
                break;
            }
        }
    }
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "info", "callshield_client=trace")
/// - If not set, defaults to "callshield_client=debug"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "callshield_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Set up signal handlers for graceful shutdown.
///
/// SIGTERM and SIGINT (Ctrl+C) both set the global shutdown flag, which
/// ends the running call, recording or monitor through `wait_for_shutdown`.
fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown signal to be set.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
