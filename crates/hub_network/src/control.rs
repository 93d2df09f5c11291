//! Process-wide control plane.
//!
//! Blocking free functions over one lazily created [`Hub`] that runs on its
//! own multi-threaded tokio runtime, so there is exactly one hub lifecycle per
//! process. These must not be called from inside an async task.

use std::net::SocketAddr;
use std::sync::OnceLock;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

use crate::config::HubConfig;
use crate::connection::InboundMessage;
use crate::error::HubError;
use crate::hub::{Hub, HubState};
use crate::identity::{NodeIdentity, PeerId};
use crate::logging;

struct Control {
    runtime: Runtime,
    hub: Hub,
}

static CONTROL: OnceLock<Control> = OnceLock::new();
static SETUP: Mutex<Option<(NodeIdentity, HubConfig)>> = Mutex::new(None);

/// Replace the identity and config the process hub will be created with.
/// Fails with `AlreadyRunning` once the hub exists.
pub fn configure(identity: NodeIdentity, config: HubConfig) -> Result<(), HubError> {
    config.validate().map_err(HubError::InvalidConfig)?;
    let mut setup = SETUP.lock();
    if CONTROL.get().is_some() {
        return Err(HubError::AlreadyRunning);
    }
    *setup = Some((identity, config));
    Ok(())
}

fn control() -> Result<&'static Control, HubError> {
    if let Some(control) = CONTROL.get() {
        return Ok(control);
    }

    let mut setup = SETUP.lock();
    if let Some(control) = CONTROL.get() {
        return Ok(control);
    }
    let (identity, config) = setup
        .take()
        .unwrap_or_else(|| (NodeIdentity::generate(), HubConfig::default()));
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("commhub")
        .build()?;
    let hub = Hub::new(identity, config)?;
    tracing::debug!(peer = %hub.local_peer_id(), "process hub created");
    Ok(CONTROL.get_or_init(|| Control { runtime, hub }))
}

/// Bind `local_addr` and bootstrap from `bootstrap` (may be empty).
pub fn start(local_addr: &str, bootstrap: &str) -> Result<(), HubError> {
    let control = control()?;
    control
        .runtime
        .block_on(control.hub.start(local_addr, bootstrap))
        .map(|_| ())
}

/// Stop the hub, waiting at most the shutdown grace bound. A no-op when the
/// hub is not running.
pub fn stop() {
    if let Some(control) = CONTROL.get() {
        control.runtime.block_on(control.hub.stop());
    }
}

/// Enqueue `payload` for the peer whose public key is `public_key`. An
/// all-zero key addresses every connected peer.
pub fn send(public_key: &[u8], payload: &[u8]) -> Result<(), HubError> {
    let peer = PeerId::from_bytes(public_key)?;
    if is_broadcast_key(public_key) {
        return broadcast(payload).map(|_| ());
    }
    let control = CONTROL.get().ok_or(HubError::NotRunning)?;
    control.hub.send(&peer, Bytes::copy_from_slice(payload))
}

/// Enqueue `payload` for every connected peer. Returns how many peers it
/// was queued for.
pub fn broadcast(payload: &[u8]) -> Result<usize, HubError> {
    let control = CONTROL.get().ok_or(HubError::NotRunning)?;
    control.hub.broadcast(Bytes::copy_from_slice(payload))
}

// No X25519 public key is all zeroes.
fn is_broadcast_key(key: &[u8]) -> bool {
    key.iter().all(|&b| b == 0)
}

/// Change the verbosity of every component.
pub fn set_log_level(level: &str) -> Result<(), HubError> {
    logging::set_log_level(level).map(|_| ())
}

pub fn state() -> HubState {
    CONTROL
        .get()
        .map_or(HubState::Stopped, |control| control.hub.state())
}

pub fn local_addr() -> Option<SocketAddr> {
    CONTROL.get().and_then(|control| control.hub.local_addr())
}

pub fn local_peer_id() -> Result<PeerId, HubError> {
    Ok(control()?.hub.local_peer_id().clone())
}

/// Inbound payloads of the process hub. `None` after the first call.
pub fn take_messages() -> Result<Option<mpsc::Receiver<InboundMessage>>, HubError> {
    Ok(control()?.hub.take_messages())
}

#[cfg(test)]
mod tests {
    use super::*;

    // The process hub is global, so the whole lifecycle is one test.
    #[test]
    fn test_process_hub_lifecycle() {
        assert_eq!(state(), HubState::Stopped);
        assert!(matches!(
            send(&[7; 32], b"early"),
            Err(HubError::NotRunning)
        ));
        assert!(matches!(send(&[], b"x"), Err(HubError::InvalidPeerId(_))));
        assert!(matches!(send(&[0; 32], b"x"), Err(HubError::NotRunning)));

        let identity = NodeIdentity::generate();
        let expected = identity.peer_id().clone();
        configure(identity, HubConfig::default()).unwrap();

        start("127.0.0.1:0", "").unwrap();
        assert_eq!(state(), HubState::Running);
        assert_eq!(local_peer_id().unwrap(), expected);
        assert!(local_addr().is_some());
        assert!(matches!(
            start("127.0.0.1:0", ""),
            Err(HubError::AlreadyRunning)
        ));
        assert!(matches!(
            configure(NodeIdentity::generate(), HubConfig::default()),
            Err(HubError::AlreadyRunning)
        ));

        assert!(matches!(send(&[7; 32], b"hi"), Err(HubError::UnknownPeer(_))));
        // Nobody connected: the broadcast key reaches no one, without error.
        assert!(send(&[0; 33], b"all").is_ok());
        assert_eq!(broadcast(b"all").unwrap(), 0);
        assert!(matches!(set_log_level("noisy"), Err(HubError::InvalidLevel(_))));
        assert!(take_messages().unwrap().is_some());

        let addr = local_addr().unwrap().to_string();
        stop();
        assert_eq!(state(), HubState::Stopped);
        stop();

        // Same address again right away.
        start(&addr, "").unwrap();
        assert_eq!(state(), HubState::Running);
        stop();
    }
}
