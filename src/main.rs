//! meshvoice: terminal voice client.
//!
//! Joins one room and talks to everyone in it. Type `m` + Enter to toggle
//! mute, `s` for status, `r` to retry after an error, `q` to leave.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use meshvoice::audio::CpalBackend;
use meshvoice::media::MediaSessionManager;
use meshvoice::rtc::RtcConnector;
use meshvoice::signaling::WsConnector;
use meshvoice::{ClientConfig, ClientStatus, Supervisor};

#[derive(Parser)]
#[command(name = "meshvoice", about = "Voice chat in small mesh rooms")]
struct Args {
    /// TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay URL, e.g. ws://127.0.0.1:8080
    #[arg(short, long)]
    server: Option<String>,

    /// Room to join.
    #[arg(short, long)]
    room: Option<String>,

    /// Name shown to the other members.
    #[arg(short, long)]
    name: Option<String>,

    #[arg(long)]
    input_device: Option<String>,

    #[arg(long)]
    output_device: Option<String>,
}

fn print_status(status: &ClientStatus) {
    let mut line = format!("[{}]", status.state);
    if status.state.is_joined() {
        line.push_str(&format!(" peers: {}", status.members.len()));
        let connected = status
            .peers
            .iter()
            .filter(|p| p.state == meshvoice::negotiator::PeerState::Connected)
            .count();
        line.push_str(&format!(", connected: {connected}"));
        if status.muted {
            line.push_str(", muted");
        }
    }
    if let (Some(code), Some(error)) = (&status.error_code, &status.last_error) {
        line.push_str(&format!(" {code}: {error}"));
    }
    println!("{line}");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshvoice=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(server) = args.server {
        config.server_url = server;
    }
    if let Some(room) = args.room {
        config.room_id = room;
    }
    if let Some(name) = args.name {
        config.display_name = name;
    }
    if args.input_device.is_some() {
        config.audio.input_device = args.input_device;
    }
    if args.output_device.is_some() {
        config.audio.output_device = args.output_device;
    }
    config.validate()?;

    let connector = RtcConnector::new(&config.ice_servers).context("initialising WebRTC")?;
    let media = Arc::new(MediaSessionManager::new(Arc::new(CpalBackend)));
    let signaling = Arc::new(WsConnector::new(config.server_url.clone()));
    let room = config.room_id.clone();
    let handle = Supervisor::new(config, signaling, Arc::new(connector), media).spawn();

    let mut status = handle.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let snapshot = status.borrow_and_update().clone();
            print_status(&snapshot);
        }
    });

    println!("Joining room {room}. Commands: m = mute, s = status, r = retry, q = leave");
    handle.join().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "m" => {
                        let muted = handle.toggle_mute().await;
                        println!("{}", if muted { "Muted" } else { "Unmuted" });
                    }
                    "s" => print_status(&handle.snapshot()),
                    "r" => {
                        if handle.snapshot().state.is_error() {
                            handle.join().await;
                        } else {
                            println!("Nothing to retry");
                        }
                    }
                    "q" => break,
                    "" => {}
                    other => println!("Unknown command {other:?}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.leave().await;
    Ok(())
}
