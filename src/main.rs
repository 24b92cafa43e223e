use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use voxwire::audio::list_input_devices;
use voxwire::session::{SessionController, SessionEvent};
use voxwire::{Config, SessionConfig};

#[derive(Parser)]
#[command(name = "voxwire", version, about = "Real-time voice call client")]
struct Cli {
    /// Path to the config file (defaults to the platform config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a live call.
    Call {
        /// Target language for translated output.
        #[arg(long, default_value = "中文")]
        lang: String,
        /// Ask the remote service to translate instead of relaying.
        #[arg(long)]
        simultaneous: bool,
    },
    /// Run the negotiation relay server.
    Relay {
        /// Listen address override.
        #[arg(long)]
        listen: Option<String>,
    },
    /// List audio input devices.
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("voxwire=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Call { lang, simultaneous } => run_call(config, lang, simultaneous).await,
        Command::Relay { listen } => {
            let listen = listen.unwrap_or_else(|| config.relay.listen_addr.clone());
            voxwire::relay::serve(&listen, config.endpoints.negotiate_upstream_url).await
        }
        Command::Devices => {
            for device in list_input_devices() {
                let marker = if device.is_default { " (default)" } else { "" };
                println!("{}{marker}", device.name);
            }
            Ok(())
        }
    }
}

async fn run_call(config: Config, lang: String, simultaneous: bool) -> Result<()> {
    let session_config = SessionConfig {
        target_language: lang,
        simultaneous_translation: simultaneous,
    };
    let (handle, mut events) = SessionController::start(config, session_config)?;
    tracing::info!("call started, press Ctrl-C to end");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("ending call");
                handle.end_call().await;
            }
            event = events.recv() => match event {
                Some(SessionEvent::StatusChanged(status)) => {
                    tracing::info!(status = ?status, "connection status");
                }
                Some(SessionEvent::ModeChanged(mode)) => {
                    tracing::info!(mode = ?mode, "turn changed");
                }
                Some(SessionEvent::PlaybackInterrupted(point)) => {
                    tracing::info!(
                        fragment = point.fragment_index,
                        offset_ms = point.offset.as_millis() as u64,
                        "playback interrupted"
                    );
                }
                Some(SessionEvent::UtteranceCaptured(artifact)) => {
                    tracing::info!(
                        bytes = artifact.wav.len(),
                        start_ms = artifact.started_at.as_millis() as u64,
                        "utterance captured"
                    );
                }
                Some(SessionEvent::Ended) => break,
                None => break,
            }
        }
    }

    Ok(())
}
