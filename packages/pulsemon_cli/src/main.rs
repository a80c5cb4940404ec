//! Operator CLI over the pulsemon subsystem: inspect device history,
//! drive recording sessions, decode raw HRM payloads, and run a live
//! demo against the simulated stack.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::info;

use pulsemon::ble::manager::{ConnectionManager, MonitorEvent, DEFAULT_SCAN_DURATION};
use pulsemon::ble::platform::AlwaysGranted;
use pulsemon::ble::simulated::SimStack;
use pulsemon::history::{format_relative_time, DeviceHistory};
use pulsemon::hr;
use pulsemon::session::{format_duration, SessionManager};
use pulsemon::storage::FileStore;
use pulsemon::types::PeripheralId;

#[derive(Parser)]
#[command(name = "pulsemon", about = "BLE heart-rate telemetry and session recording")]
struct Cli {
    /// Data directory for device history and session records.
    #[arg(long, default_value = ".pulsemon")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect or edit the connected-device history.
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
    /// Manage recording sessions.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Decode a hex-encoded Heart Rate Measurement payload.
    Decode {
        /// Raw payload, e.g. "0648fa03".
        payload: String,
        #[arg(long, default_value = "cli")]
        device: String,
    },
    /// Run a scripted demo against the simulated BLE stack.
    Demo {
        /// Number of samples to stream before disconnecting.
        #[arg(long, default_value_t = 5)]
        samples: usize,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// List stored devices, most recently connected first.
    List,
    /// Remove one device by id.
    Remove { id: String },
    /// Clear the entire history.
    Clear,
}

#[derive(Subcommand)]
enum SessionAction {
    /// Start a recording session.
    Start {
        name: String,
        #[arg(long)]
        device_id: String,
        #[arg(long)]
        device_name: String,
    },
    /// Stop the active session and move it to history.
    Stop,
    /// Show the active session, if any.
    Active,
    /// List completed sessions.
    List,
    /// Discard the active session without recording it (destructive).
    ClearActive,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let store = Arc::new(FileStore::new(&cli.data_dir));

    match cli.command {
        Command::History { action } => {
            let history = DeviceHistory::new(store);
            match action {
                HistoryAction::List => {
                    let devices = history.devices()?;
                    if devices.is_empty() {
                        println!("No devices in history.");
                    }
                    let now = Utc::now();
                    for device in devices {
                        println!(
                            "{}  {}  (last connected {})",
                            device.id,
                            device.name,
                            format_relative_time(device.last_connected, now)
                        );
                    }
                }
                HistoryAction::Remove { id } => {
                    history.remove(&PeripheralId::new(id))?;
                    println!("Removed.");
                }
                HistoryAction::Clear => {
                    history.clear()?;
                    println!("History cleared.");
                }
            }
        }
        Command::Session { action } => {
            let sessions = SessionManager::new(store);
            match action {
                SessionAction::Start {
                    name,
                    device_id,
                    device_name,
                } => {
                    let session = sessions
                        .start(&name, &PeripheralId::new(device_id), &device_name)
                        .await?;
                    println!("Recording session \"{}\" started ({})", session.name, session.id);
                }
                SessionAction::Stop => {
                    let session = sessions.stop().await?;
                    println!(
                        "Session \"{}\" completed after {}",
                        session.name,
                        format_duration(session.duration_ms.unwrap_or(0))
                    );
                }
                SessionAction::Active => match sessions.active_session()? {
                    Some(session) => println!(
                        "Recording \"{}\" on {} since {}",
                        session.name, session.device_name, session.start_time
                    ),
                    None => println!("No active session."),
                },
                SessionAction::List => {
                    let history = sessions.history()?;
                    if history.is_empty() {
                        println!("No completed sessions.");
                    }
                    for session in history {
                        println!(
                            "{}  {}  {}  {}",
                            session.start_time.format("%Y-%m-%d %H:%M"),
                            session.name,
                            session.device_name,
                            format_duration(session.duration_ms.unwrap_or(0))
                        );
                    }
                }
                SessionAction::ClearActive => {
                    sessions.clear_active().await?;
                    println!("Active session discarded (not recorded to history).");
                }
            }
        }
        Command::Decode { payload, device } => {
            let bytes = hex::decode(payload.trim()).context("payload is not valid hex")?;
            let sample = hr::decode(&bytes, &PeripheralId::new(device))
                .map_err(|e| anyhow::anyhow!(e))?;
            println!("{}", serde_json::to_string_pretty(&sample)?);
        }
        Command::Demo { samples } => {
            run_demo(store, samples).await?;
        }
    }
    Ok(())
}

/// Scan, connect, and stream a handful of synthetic samples end to end.
async fn run_demo(store: Arc<FileStore>, samples: usize) -> Result<()> {
    let history = Arc::new(DeviceHistory::new(store));
    let stack = SimStack::new();
    let sensor = stack
        .add_sensor("SIM-POLAR-H10", Some("Polar H10 (sim)"), Some(-55), None)
        .await;
    let manager = ConnectionManager::new(
        Arc::clone(&stack) as _,
        Arc::new(AlwaysGranted),
        Arc::clone(&history),
    );

    let mut discoveries = manager.start_scan(DEFAULT_SCAN_DURATION).await?;
    let found = discoveries
        .recv()
        .await
        .context("simulated sensor never advertised")?;
    println!("Found {} ({})", found.name.as_deref().unwrap_or("?"), found.id);
    manager.stop_scan().await?;

    manager.connect(&found.id).await?;
    info!("Connected; starting monitor");
    let mut events = manager.subscribe();
    manager.start_monitoring().await?;

    // Synthetic sensor: contact detected, bpm wandering around 70 with
    // one plausible RR interval per beat.
    let emitter = {
        let sensor = sensor.clone();
        tokio::spawn(async move {
            let mut bpm = 68u8;
            loop {
                let rr = (60_000_000 / bpm as u32 / 1000 * 1024 / 1000) as u16;
                let payload = [&[0x06, bpm][..], &rr.to_le_bytes()[..]].concat();
                sensor.emit_hrm(&payload);
                bpm = if bpm >= 80 { 68 } else { bpm + 1 };
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        })
    };

    let mut received = 0;
    while received < samples {
        match events.recv().await? {
            MonitorEvent::Sample(sample) => {
                received += 1;
                println!(
                    "[{}] {} bpm  rr={:?}  contact={:?}",
                    sample.timestamp.format("%H:%M:%S"),
                    sample.bpm,
                    sample.rr_intervals_ms,
                    sample.sensor_contact
                );
            }
            MonitorEvent::Disconnected { id, .. } => {
                emitter.abort();
                bail!("sensor {id} dropped mid-demo");
            }
        }
    }

    emitter.abort();
    manager.disconnect().await?;
    println!("Disconnected. Device recorded in history.");
    Ok(())
}
