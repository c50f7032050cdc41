//! meshvoice-relay: signaling relay for mesh voice rooms.
//!
//! Tracks room membership and forwards offers, answers and candidates
//! between members of the same room. Audio never passes through here.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;

use meshvoice::relay::{server, AllowAll, Relay};
use meshvoice::room::InMemoryRegistry;
use meshvoice::RelayConfig;

#[derive(Parser)]
#[command(name = "meshvoice-relay", about = "Signaling relay for mesh voice rooms")]
struct Args {
    /// TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file.
    #[arg(short, long)]
    bind: Option<String>,

    /// Members allowed per room (at most 5).
    #[arg(long)]
    room_capacity: Option<usize>,

    /// Seconds of silence before a session loses its membership.
    #[arg(long)]
    membership_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshvoice=info,meshvoice_relay=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => RelayConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RelayConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(capacity) = args.room_capacity {
        config.room_capacity = capacity;
    }
    if let Some(timeout) = args.membership_timeout {
        config.membership_timeout_secs = timeout;
    }
    config.validate()?;

    let registry = Arc::new(InMemoryRegistry::with_capacity(config.room_capacity));
    let relay = Relay::new(registry, Arc::new(AllowAll));

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!(
        bind = %config.bind,
        capacity = config.room_capacity,
        "meshvoice-relay listening"
    );

    server::run(listener, relay, config).await;
    Ok(())
}
