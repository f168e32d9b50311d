//! `parley` command line: run hands-free capture or inspect input devices

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parley_lib::audio::{CaptureBackend, CpalBackend};
use parley_lib::config::{default_config_path, load_config, Config};
use parley_lib::handsfree::{ChannelObserver, HandsfreeNotification};
use parley_lib::platform::SystemPermissionProvider;
use parley_lib::playback::SilentOutput;
use parley_lib::preferences::{JsonFileStore, PreferenceStore, PREFERRED_INPUT_DEVICE_KEY};
use parley_lib::transcription::NoopSpeechEngine;
use parley_lib::{HandsfreeDependencies, HandsfreeManager};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(about = "Hands-free voice capture", author, version)]
struct Cli {
    /// Config file (defaults to ~/.parley/config.json)
    #[arg(long, env = "PARLEY_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Listen hands-free and print notifications until Ctrl-C
    Listen {
        /// Print notifications as JSON lines
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Include per-block input levels
        #[arg(long, default_value_t = false)]
        levels: bool,
    },
    /// List audio input devices; the preferred one is marked with '*'
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    parley_lib::logging::init_logging();
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    match cli.command {
        Command::Listen { json, levels } => listen(config, json, levels).await,
        Command::Devices => list_devices(&config),
    }
}

async fn listen(config: Config, json: bool, levels: bool) -> Result<()> {
    let manager = HandsfreeManager::new(HandsfreeDependencies {
        backend: Arc::new(CpalBackend::new(config.audio.realtime_processing)),
        permissions: Arc::new(SystemPermissionProvider),
        preferences: Arc::new(JsonFileStore::open_default()),
        speech_engine: Arc::new(NoopSpeechEngine::default()),
        speech_output: Arc::new(SilentOutput),
    });

    let (observer, notifications) = ChannelObserver::new(levels);
    manager.set_observer(Arc::new(observer));
    let printer = std::thread::Builder::new()
        .name("parley-printer".to_string())
        .spawn(move || {
            for notification in notifications.iter() {
                print_notification(&notification, json);
            }
        })
        .context("failed to spawn output thread")?;

    manager.init(config)?;
    let started = manager.start_hands_free().await;

    if started.is_ok() {
        tracing::info!("Listening; press Ctrl-C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("failed to wait for Ctrl-C")?;
    }

    manager.shutdown();
    // Dropping the observer closes the channel and ends the printer
    manager.clear_observer();
    let _ = printer.join();

    started.context("hands-free capture failed to start")
}

fn print_notification(notification: &HandsfreeNotification, json: bool) {
    if json {
        match serde_json::to_string(notification) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!("Failed to serialise notification: {}", e),
        }
        return;
    }

    match notification {
        HandsfreeNotification::StateChange(change) => {
            println!("[state] {:?} -> {:?}: {}", change.previous_state, change.new_state, change.description)
        }
        HandsfreeNotification::VoiceStart {
            timestamp_ms,
            level_db,
        } => println!("[voice] start at {timestamp_ms}ms ({level_db:.1} dB)"),
        HandsfreeNotification::VoiceEnd {
            timestamp_ms,
            duration_ms,
        } => println!("[voice] end at {timestamp_ms}ms after {duration_ms}ms"),
        HandsfreeNotification::Transcript { text, is_final } => {
            let kind = if *is_final { "final" } else { "interim" };
            println!("[text:{kind}] {text}")
        }
        HandsfreeNotification::Error(error) => println!("[error:{}] {}", error.code(), error),
        HandsfreeNotification::Level(level) => println!("[level] {:.1} dB", level.db),
        HandsfreeNotification::BargeIn => println!("[barge-in]"),
    }
}

fn list_devices(config: &Config) -> Result<()> {
    let backend = CpalBackend::new(config.audio.realtime_processing);
    let devices = backend
        .enumerate_devices()
        .context("failed to enumerate input devices")?;
    let preferred = JsonFileStore::open_default()
        .get(PREFERRED_INPUT_DEVICE_KEY)
        .context("failed to read preferences")?;

    if devices.is_empty() {
        println!("No audio input devices found");
        return Ok(());
    }

    for device in devices {
        let marker = if preferred.as_deref() == Some(device.device_id.as_str()) {
            '*'
        } else {
            ' '
        };
        let label = if device.label.is_empty() {
            "(unnamed)"
        } else {
            device.label.as_str()
        };
        println!("{marker} {label}  [{}]", device.device_id);
    }
    Ok(())
}
