//! `commhub`: run a standalone hub from a JSON settings file.
//!
//! Prints every payload it receives and can send one message to a peer once
//! that peer becomes known.

mod settings;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use hub_network::{Hub, HubError, PeerId, logging};

use crate::settings::AppSettings;

#[derive(Debug, Parser)]
#[command(name = "commhub", version, about = "Peer-to-peer communication hub")]
struct Cli {
    /// Settings file (JSON).
    #[arg(long, short, default_value = "commhub.json")]
    config: PathBuf,

    /// Override the listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Override the bootstrap list (comma-separated).
    #[arg(long)]
    bootstrap: Option<String>,

    /// Override the log level.
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Hex public key of a peer to send `--message` to.
    #[arg(long, value_name = "KEY", requires = "message")]
    send_to: Option<String>,

    /// Payload for `--send-to`.
    #[arg(long)]
    message: Option<String>,
}

/// How long `--send-to` keeps retrying while the peer is unknown or
/// unreachable.
const SEND_PATIENCE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = AppSettings::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        settings.listen = listen;
    }
    if let Some(bootstrap) = cli.bootstrap {
        settings.bootstrap = bootstrap;
    }
    if let Some(level) = cli.log_level {
        settings.log_level = level;
    }

    let level = settings.log_level()?;
    let _log_guard = match &settings.logs_dir {
        Some(dir) => Some(logging::init_logging_to_dir(dir, level)?),
        None => {
            logging::init_logging(level)?;
            None
        }
    };

    let identity = settings.identity()?;
    let hub = Hub::new(identity, settings.hub.clone())?;
    let mut inbound = hub
        .take_messages()
        .ok_or_else(|| anyhow::anyhow!("inbound channel already taken"))?;

    let bound = hub.start(&settings.listen, &settings.bootstrap).await?;
    info!(
        peer = %hub.local_peer_id(),
        addr = %bound,
        level = %logging::current_level(),
        "commhub started"
    );
    println!("{}", hub.local_peer_id());

    if let (Some(key), Some(message)) = (cli.send_to, cli.message) {
        let peer = PeerId::from_hex(&key)?;
        send_when_reachable(&hub, &peer, message.into_bytes()).await;
    }

    loop {
        tokio::select! {
            msg = inbound.recv() => {
                let Some(msg) = msg else { break };
                println!("{}: {}", msg.from, String::from_utf8_lossy(&msg.payload));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    hub.stop().await;
    Ok(())
}

/// Retry a send while the peer is still being discovered or dialed.
async fn send_when_reachable(hub: &Hub, peer: &PeerId, payload: Vec<u8>) {
    let deadline = tokio::time::Instant::now() + SEND_PATIENCE;
    loop {
        match hub.send(peer, payload.clone()) {
            Ok(()) => {
                info!(peer = %peer, len = payload.len(), "message queued");
                return;
            }
            Err(HubError::UnknownPeer(_) | HubError::PeerUnreachable(_))
                if tokio::time::Instant::now() < deadline =>
            {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Err(e @ (HubError::UnknownPeer(_) | HubError::PeerUnreachable(_))) => {
                warn!(peer = %peer, "giving up on send: {e}");
                return;
            }
            Err(e) => {
                error!(peer = %peer, "send failed: {e}");
                return;
            }
        }
    }
}
