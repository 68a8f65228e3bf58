//! owletd - owlet daemon
//!
//! Opens a session for every device in the config file, applies the
//! configured pins and logs pin changes until interrupted.
//!
//! Usage:
//!   owletd [OPTIONS] <config.toml>

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use owlet::{
    Controller, ControllerEvent, JsonFileSettings, MemorySettings, OwletError, SessionEvent,
    SettingsStore,
};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{DaemonConfig, DeviceConfig};

#[derive(Parser)]
#[command(name = "owletd")]
#[command(author, version, about = "Owlet GPIO peripherals daemon")]
struct Args {
    /// Daemon config file (TOML)
    #[arg(env = "OWLETD_CONFIG")]
    config: PathBuf,

    /// Log protocol traffic
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    tracing::info!("Starting owletd");
    let config = DaemonConfig::load(&args.config)?;

    let settings: Arc<dyn SettingsStore> = match &config.settings_file {
        Some(path) => {
            let store = JsonFileSettings::open(path)
                .with_context(|| format!("Failed to open settings {}", path.display()))?;
            tracing::info!(path = %store.path().display(), "Using settings file");
            Arc::new(store)
        }
        None => Arc::new(MemorySettings::new()),
    };
    let controller = Controller::new(settings, config.session.clone());
    let mut events = controller.subscribe();

    for device in &config.devices {
        if let Err(e) = start_device(&controller, device).await {
            tracing::error!(device_id = %device.id, "Failed to start device: {:#}", e);
        }
    }
    if controller.device_ids().is_empty() {
        anyhow::bail!("No device could be started");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, closing sessions");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => tracing::warn!("Skipped {} events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    controller.shutdown().await;
    Ok(())
}

fn init_logging(args: &Args) {
    let default_filter = if args.verbose {
        "owletd=debug,owlet=trace"
    } else {
        "owletd=info,owlet=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if args.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn start_device(controller: &Controller, device: &DeviceConfig) -> anyhow::Result<()> {
    let descriptor = match (&device.transport, &device.owlet_id) {
        (Some(descriptor), _) => descriptor.clone(),
        (None, Some(owlet_id)) => controller.resolve_owlet(owlet_id, &device.id, &[])?,
        (None, None) => anyhow::bail!("No endpoint"),
    };
    tracing::info!(device_id = %device.id, endpoint = %descriptor, "Opening device");
    controller.open_session(&device.id, &descriptor)?;

    for (pin, config) in device.pin_configs()? {
        match controller.configure_pin(&device.id, pin, config).await {
            Ok(()) => {}
            // Recorded, applied once the device is ready
            Err(OwletError::NotReady) => {
                tracing::debug!(device_id = %device.id, pin, "Pin queued for replay")
            }
            Err(e) => tracing::warn!(device_id = %device.id, pin, "Pin not configured: {}", e),
        }
    }
    Ok(())
}

fn log_event(event: &ControllerEvent) {
    let device_id = &event.device_id;
    match &event.event {
        SessionEvent::ConnectionChanged(true) => {
            tracing::info!(%device_id, "Device connected")
        }
        SessionEvent::ConnectionChanged(false) => {
            tracing::warn!(%device_id, "Device disconnected")
        }
        SessionEvent::PinChanged { pin, value } => {
            tracing::info!(%device_id, pin, ?value, "Pin changed")
        }
    }
}
