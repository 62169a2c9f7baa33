//! sound-mixer - inspect and watch audio devices from the terminal
//!
//! # Commands
//!
//! - `sound-mixer list` - every device with volume and mute state
//! - `sound-mixer default <output|input>` - the default device for a direction
//! - `sound-mixer sessions <device-id>` - per-application streams of a device
//! - `sound-mixer watch <device-id>` - print volume/mute changes until killed

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sound_mixer_rs::platform::memory::SessionSpec;
use sound_mixer_rs::{
    platform_provider, AudioProvider, Device, DeviceKind, DeviceRegistry, EventKind,
    MemoryProvider, QueuedContext,
};

#[derive(Parser)]
#[command(name = "sound-mixer")]
#[command(about = "Inspect and watch audio devices and sessions")]
#[command(version)]
struct Cli {
    /// Audio backend to use
    #[arg(long, value_enum, default_value_t = Backend::Platform)]
    backend: Backend,

    /// Log filter (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// The operating system's sound server
    Platform,

    /// A simulated set of demo devices
    Memory,
}

#[derive(Subcommand)]
enum Commands {
    /// List every device
    List,

    /// Show the default device for a direction
    Default {
        /// output or input
        kind: DeviceKind,
    },

    /// List the sessions of a device
    Sessions { device_id: String },

    /// Print volume and mute changes of a device
    Watch { device_id: String },
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn demo_provider() -> Result<MemoryProvider> {
    let provider = MemoryProvider::new();
    provider.add_endpoint("demo-speakers", "Demo Speakers", DeviceKind::Output);
    provider.add_endpoint("demo-headphones", "Demo Headphones", DeviceKind::Output);
    provider.add_endpoint_with_channels("demo-mic", "Demo Microphone", DeviceKind::Input, 1);
    provider.set_default(DeviceKind::Output, Some("demo-speakers"));
    provider.set_default(DeviceKind::Input, Some("demo-mic"));
    provider.add_session(
        "demo-speakers",
        SessionSpec::new("demo-player", "Music Player", "/usr/bin/music-player"),
    )?;
    provider.add_session(
        "demo-speakers",
        SessionSpec::anonymous("System Sounds", "system"),
    )?;
    Ok(provider)
}

fn print_device(device: &Device) -> Result<()> {
    let desc = device.descriptor();
    let volume = device.volume()?;
    let muted = device.mute()?;
    let balance = device.balance()?;
    print!(
        "{:<6} {:>3}%{} {}  [{}]",
        desc.kind.to_string(),
        (volume * 100.0).round() as u32,
        if muted { " (muted)" } else { "" },
        desc.name,
        desc.id
    );
    if balance.stereo {
        print!("  L {:.2} / R {:.2}", balance.left, balance.right);
    }
    println!();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let provider: Arc<dyn AudioProvider> = match cli.backend {
        Backend::Platform => platform_provider().context("failed to open audio backend")?,
        Backend::Memory => Arc::new(demo_provider()?),
    };
    let context = QueuedContext::new();
    let registry = DeviceRegistry::new(provider, context.clone());

    match cli.command {
        Commands::List => {
            for device in registry.devices() {
                print_device(&device)?;
            }
        }
        Commands::Default { kind } => {
            let device = registry.default_device(kind)?;
            print_device(&device)?;
        }
        Commands::Sessions { device_id } => {
            let device = registry
                .device(&device_id)
                .with_context(|| format!("no device '{device_id}'"))?;
            for session in device.sessions()? {
                println!(
                    "{:>3}%{} {}  [{}] {}  ({})",
                    (session.volume()? * 100.0).round() as u32,
                    if session.mute()? { " (muted)" } else { "" },
                    session.display_name(),
                    session.state()?,
                    session.process_path(),
                    session.id()
                );
            }
        }
        Commands::Watch { device_id } => {
            let device = registry
                .device(&device_id)
                .with_context(|| format!("no device '{device_id}'"))?;
            registry.on(
                &device,
                EventKind::Volume,
                Box::new(|record| println!("volume {:.0}%", record.volume * 100.0)),
            );
            registry.on(
                &device,
                EventKind::Mute,
                Box::new(|record| println!("{}", if record.muted { "muted" } else { "unmuted" })),
            );
            info!(device_id = %device_id, "Watching for changes");
            println!("Watching {} (Ctrl-C to stop)", device.descriptor().name);
            loop {
                context.run_pending();
                thread::sleep(Duration::from_millis(50));
            }
        }
    }

    Ok(())
}
