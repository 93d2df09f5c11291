//! Bootstrap and peer-list gossip.
//!
//! On start the hub dials each of its bootstrap entries and swaps peer lists
//! with them through the hello exchange. Afterwards a single loop wakes every
//! `gossip_interval`, retries the bootstrap list while nothing is connected,
//! and pushes our peer list to a random few connected peers. Discovery only ever
//! adds address hints; it never removes a record or sets a state.

use std::fmt;
use std::sync::Arc;

use rand::seq::IteratorRandom;
use tracing::{debug, info, trace, warn};

use crate::address_book::{PeerState, Upsert};
use crate::codec::PeerEntry;
use crate::connection::ConnectionManager;
use crate::error::HubError;
use crate::identity::PeerId;

/// Where to seed the peer set from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bootstrap {
    /// Accept inbound connections only.
    None,
    /// A bare `host:port`; the remote's key is learned from its hello.
    Address(String),
    /// `<hex key>@host:port`; the key is known up front and checked on dial.
    Peer { peer_id: PeerId, address: String },
}

impl Bootstrap {
    pub fn parse(input: &str) -> Result<Self, HubError> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Self::None);
        }
        match input.split_once('@') {
            Some((key, address)) => {
                let peer_id = PeerId::from_hex(key)?;
                Ok(Self::Peer {
                    peer_id,
                    address: validate_address(address)?,
                })
            }
            None => Ok(Self::Address(validate_address(input)?)),
        }
    }

    /// Parse a comma-separated bootstrap list. Empty entries are skipped;
    /// any malformed entry fails the whole list.
    pub fn parse_list(input: &str) -> Result<Vec<Self>, HubError> {
        let mut list = Vec::new();
        for entry in input.split(',') {
            match Self::parse(entry)? {
                Self::None => {}
                bootstrap => list.push(bootstrap),
            }
        }
        Ok(list)
    }

    /// Like [`parse_list`](Self::parse_list), but logs and drops malformed
    /// entries instead of failing.
    pub fn parse_list_lossy(input: &str) -> Vec<Self> {
        input
            .split(',')
            .filter_map(|entry| match Self::parse(entry) {
                Ok(Self::None) => None,
                Ok(bootstrap) => Some(bootstrap),
                Err(e) => {
                    warn!(entry = entry.trim(), "ignoring bootstrap entry: {e}");
                    None
                }
            })
            .collect()
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Display for Bootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("<none>"),
            Self::Address(address) => f.write_str(address),
            Self::Peer { peer_id, address } => write!(f, "{peer_id}@{address}"),
        }
    }
}

fn validate_address(address: &str) -> Result<String, HubError> {
    let invalid = || HubError::InvalidAddress(address.to_string());
    if address.contains(',') {
        return Err(invalid());
    }
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    Ok(address.to_string())
}

/// Discovery loop. Runs until the manager is cancelled.
pub async fn run(manager: Arc<ConnectionManager>, bootstraps: Vec<Bootstrap>) {
    let cancel = manager.cancel_token().clone();

    let mut bootstrapped = tokio::select! {
        _ = cancel.cancelled() => return,
        ok = bootstrap_all(&manager, &bootstraps) => ok,
    };

    let period = manager.config().gossip_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !bootstraps.is_empty() && (!bootstrapped || manager.book().connected().is_empty()) {
            debug!(entries = bootstraps.len(), "no connected peers, retrying bootstrap");
            bootstrapped = tokio::select! {
                _ = cancel.cancelled() => break,
                ok = bootstrap_all(&manager, &bootstraps) => ok,
            };
        }

        gossip_round(&manager);
    }
    debug!("discovery stopped");
}

/// Try every bootstrap entry in order. True if at least one took, or if
/// there was nothing to try.
pub async fn bootstrap_all(
    manager: &Arc<ConnectionManager>,
    bootstraps: &[Bootstrap],
) -> bool {
    if bootstraps.is_empty() {
        return true;
    }
    let mut any = false;
    for bootstrap in bootstraps {
        any |= bootstrap_once(manager, bootstrap).await;
    }
    any
}

/// One bootstrap attempt. Failures are logged, never returned: a hub with an
/// unreachable bootstrap stays up and waits for inbound peers.
pub async fn bootstrap_once(manager: &Arc<ConnectionManager>, bootstrap: &Bootstrap) -> bool {
    match bootstrap {
        Bootstrap::None => true,
        Bootstrap::Address(address) => match manager.dial_address(address).await {
            Ok(peer) => {
                info!(peer = %peer, addr = %address, "bootstrapped");
                true
            }
            Err(e) => {
                warn!(addr = %address, "bootstrap failed: {e}");
                false
            }
        },
        Bootstrap::Peer { peer_id, address } => {
            if *peer_id == *manager.local_id() {
                warn!(addr = %address, "bootstrap key is our own, ignoring");
                return false;
            }
            manager.book().upsert(peer_id, address);
            manager.connect(peer_id);
            info!(peer = %peer_id, addr = %address, "bootstrap peer seeded");
            true
        }
    }
}

/// Push our peer list to up to `gossip_fanout` randomly chosen connected
/// peers. Returns how many were sent to.
pub fn gossip_round(manager: &ConnectionManager) -> usize {
    let fanout = manager.config().gossip_fanout;
    let targets = manager
        .book()
        .connected()
        .into_iter()
        .choose_multiple(&mut rand::rng(), fanout);
    if targets.is_empty() {
        return 0;
    }

    let frame = manager.peer_list_frame();
    for peer in &targets {
        manager.send_control(peer, frame.clone());
    }
    trace!(targets = targets.len(), known = manager.book().len(), "gossip round");
    targets.len()
}

/// Fold a received peer list into the address book and start sessions for
/// peers we are not connected to. Returns the number of new records.
pub fn merge(manager: &Arc<ConnectionManager>, from: &PeerId, entries: Vec<PeerEntry>) -> usize {
    let mut added = 0;
    for entry in entries {
        if entry.peer_id == *manager.local_id() || entry.peer_id == *from {
            continue;
        }
        if manager.book().upsert(&entry.peer_id, &entry.address) == Upsert::Inserted {
            debug!(peer = %entry.peer_id, addr = %entry.address, via = %from, "peer discovered");
            added += 1;
        }
        let connected = manager
            .book()
            .lookup(&entry.peer_id)
            .is_some_and(|r| r.state == PeerState::Connected);
        if !connected {
            manager.connect(&entry.peer_id);
        }
    }
    added
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
