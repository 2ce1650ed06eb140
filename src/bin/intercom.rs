//! Intercom Application
//!
//! ```text
//! intercom devices
//! intercom listen [port]
//! intercom connect <host> [port]
//! ```
//!
//! Settings come from `intercom.toml` in the user config directory when it
//! exists. Runs until Ctrl+C.

use anyhow::{bail, Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_intercom::{
    audio::{CpalBackend, Direction},
    config::AppConfig,
    network::NetworkEvent,
    Intercom,
};

enum Role {
    Devices,
    Listen(u16),
    Connect(String, u16),
}

fn parse_args(default_port: u16) -> Result<Role> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let port_arg = |arg: Option<&String>| -> Result<u16> {
        match arg {
            Some(p) => p.parse().with_context(|| format!("Invalid port: {}", p)),
            None => Ok(default_port),
        }
    };

    match args.first().map(String::as_str) {
        Some("devices") => Ok(Role::Devices),
        Some("listen") => Ok(Role::Listen(port_arg(args.get(1))?)),
        Some("connect") => {
            let host = args.get(1).context("connect needs a host")?.clone();
            Ok(Role::Connect(host, port_arg(args.get(2))?))
        }
        _ => bail!("usage: intercom devices | listen [port] | connect <host> [port]"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::load_or_default().context("Failed to load configuration")?;
    let role = parse_args(config.network.port)?;

    let mut intercom = Intercom::new(config, Box::new(CpalBackend::new()))?;

    if let Role::Devices = role {
        println!("\n=== Capture Devices ===");
        for name in intercom.list_devices(Direction::Input)? {
            println!("  {}", name);
        }
        println!("\n=== Playback Devices ===");
        for name in intercom.list_devices(Direction::Output)? {
            println!("  {}", name);
        }
        println!();
        intercom.shutdown().await;
        return Ok(());
    }

    tracing::info!("Starting LAN Intercom");

    let mut events = intercom
        .events()
        .context("Event stream already taken")?;

    match &role {
        Role::Listen(port) => {
            let addr = intercom.listen(*port).await?;
            tracing::info!("Waiting for peer on {}", addr);
        }
        Role::Connect(host, port) => intercom.connect(host, *port)?,
        Role::Devices => {}
    }

    intercom.start_audio().context("Failed to start audio")?;
    tracing::info!("Audio running - press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            event = events.recv() => match event {
                Some(NetworkEvent::Status(status)) => {
                    tracing::info!("[{}] {}", status.state, status.reason);
                }
                Some(NetworkEvent::Latency(sample)) => {
                    tracing::info!("Round trip: {} ms, input level {}", sample.round_trip_ms, intercom.level());
                }
                Some(NetworkEvent::Error(e)) => tracing::warn!("{}", e),
                None => break,
            },
        }
    }

    let stats = intercom.queue_stats();
    tracing::info!(
        "Send queue: {} enqueued, {} dropped, {} rejected",
        stats.enqueued,
        stats.dropped,
        stats.rejected
    );

    intercom.shutdown().await;
    Ok(())
}
