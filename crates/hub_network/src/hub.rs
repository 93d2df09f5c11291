//! Hub: the facade behind start / stop / send.
//!
//! [`Hub`] owns the address book across start/stop cycles and, while running,
//! one [`ConnectionManager`] plus the listener and discovery tasks. Its
//! lifecycle is an explicit [`HubState`]:
//!
//! ```text
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//! ```
//!
//! Only one `start` can move the hub out of `Stopped`; a concurrent one sees
//! `Starting` and fails with `AlreadyRunning`.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::address_book::{AddressBook, PeerRecord};
use crate::config::HubConfig;
use crate::connection::{ConnectionManager, InboundMessage};
use crate::discovery::{self, Bootstrap};
use crate::error::HubError;
use crate::identity::{NodeIdentity, PeerId};
use crate::transport;

/// Process lifecycle of a hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HubState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Resources that exist only while the hub is running.
struct Running {
    manager: Arc<ConnectionManager>,
    listener: JoinHandle<()>,
    local_addr: SocketAddr,
}

pub struct Hub {
    identity: NodeIdentity,
    config: HubConfig,
    book: Arc<AddressBook>,
    state: Mutex<HubState>,
    running: Mutex<Option<Running>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
}

impl Hub {
    /// Create a stopped hub.
    pub fn new(identity: NodeIdentity, config: HubConfig) -> Result<Self, HubError> {
        config.validate().map_err(HubError::InvalidConfig)?;
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_capacity);
        Ok(Self {
            identity,
            config,
            book: Arc::new(AddressBook::new()),
            state: Mutex::new(HubState::Stopped),
            running: Mutex::new(None),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        })
    }

    pub fn local_peer_id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn state(&self) -> HubState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == HubState::Running
    }

    /// Address the listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// The receiving end of inbound payload delivery. Returns `None` after
    /// the first call.
    pub fn take_messages(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inbound_rx.lock().take()
    }

    /// Snapshot of every known peer.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.book.all()
    }

    pub fn lookup(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.book.lookup(peer)
    }

    /// Peers currently connected.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.book.connected()
    }

    /// Bind the listener on `local_addr` and launch bootstrap against
    /// `bootstrap` in the background. Returns the bound address.
    ///
    /// `bootstrap` is empty, or a comma-separated list of `host:port` and
    /// `<hex key>@host:port` entries. Only local failures are returned: an
    /// entry that cannot be reached (or parsed) is logged and the hub stays
    /// running.
    pub async fn start(&self, local_addr: &str, bootstrap: &str) -> Result<SocketAddr, HubError> {
        {
            let mut state = self.state.lock();
            if *state != HubState::Stopped {
                return Err(HubError::AlreadyRunning);
            }
            *state = HubState::Starting;
        }

        let launched = self.launch(local_addr, bootstrap).await;
        let mut state = self.state.lock();
        match launched {
            Ok(bound) => {
                *state = HubState::Running;
                info!(peer = %self.local_peer_id(), addr = %bound, "hub running");
                Ok(bound)
            }
            Err(e) => {
                *state = HubState::Stopped;
                Err(e)
            }
        }
    }

    async fn launch(&self, local_addr: &str, bootstrap: &str) -> Result<SocketAddr, HubError> {
        let listener = transport::bind(local_addr).await?;
        let bound = listener.local_addr()?;
        let advertise = self
            .config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| bound.to_string());

        let manager = ConnectionManager::new(
            self.local_peer_id().clone(),
            advertise,
            Arc::clone(&self.book),
            self.config.clone(),
            self.inbound_tx.clone(),
        );

        let bootstraps = Bootstrap::parse_list_lossy(bootstrap);

        let listener = tokio::spawn(Arc::clone(&manager).run_listener(listener));
        manager.spawn(discovery::run(Arc::clone(&manager), bootstraps));

        *self.running.lock() = Some(Running {
            manager,
            listener,
            local_addr: bound,
        });
        Ok(bound)
    }

    /// Close every connection and release the listener. Waits at most the
    /// shutdown grace bound. A no-op unless running.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state != HubState::Running {
                return;
            }
            *state = HubState::Stopping;
        }
        info!("hub stopping");

        let running = self.running.lock().take();
        if let Some(running) = running {
            running.manager.shutdown().await;
            release_listener(running.listener, self.config.shutdown_grace).await;
        }

        *self.state.lock() = HubState::Stopped;
        info!("hub stopped");
    }

    fn manager(&self) -> Result<Arc<ConnectionManager>, HubError> {
        self.running
            .lock()
            .as_ref()
            .map(|r| Arc::clone(&r.manager))
            .ok_or(HubError::NotRunning)
    }

    /// Enqueue `payload` for `peer`. Fails fast, never waits on the network.
    pub fn send(&self, peer: &PeerId, payload: impl Into<Bytes>) -> Result<(), HubError> {
        self.manager()?.send(peer, payload.into())
    }

    /// Enqueue `payload` for every connected peer. Returns how many peers it
    /// was queued for; peers with a full queue are skipped.
    pub fn broadcast(&self, payload: impl Into<Bytes>) -> Result<usize, HubError> {
        self.manager()?.broadcast(payload.into())
    }

    /// Record an address hint for `peer` and, while running, start
    /// connecting to it.
    pub fn add_peer(&self, peer: &PeerId, address: &str) -> Result<(), HubError> {
        if peer == self.local_peer_id() {
            return Err(HubError::InvalidPeerId("cannot add the local peer".into()));
        }
        self.book.upsert(peer, address);
        if let Ok(manager) = self.manager() {
            manager.connect(peer);
        }
        Ok(())
    }

    /// Close the peer's connection and drop its record.
    pub fn evict(&self, peer: &PeerId) -> bool {
        match self.manager() {
            Ok(manager) => manager.evict(peer),
            Err(_) => self.book.remove(peer).is_some(),
        }
    }
}

async fn release_listener(mut handle: JoinHandle<()>, grace: std::time::Duration) {
    if tokio::time::timeout(grace, &mut handle).await.is_err() {
        debug!("listener did not exit in time, aborting");
        handle.abort();
        let _ = handle.await;
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.manager.cancel_token().cancel();
            running.listener.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> Hub {
        Hub::new(NodeIdentity::generate(), HubConfig::default()).unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = HubConfig::default();
        config.outbound_queue_capacity = 0;
        assert!(matches!(
            Hub::new(NodeIdentity::generate(), config),
            Err(HubError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let hub = hub();
        assert_eq!(hub.state(), HubState::Stopped);
        assert!(hub.local_addr().is_none());

        let addr = hub.start("127.0.0.1:0", "").await.unwrap();
        assert_eq!(hub.state(), HubState::Running);
        assert_eq!(hub.local_addr(), Some(addr));
        assert!(matches!(
            hub.start("127.0.0.1:0", "").await,
            Err(HubError::AlreadyRunning)
        ));

        hub.stop().await;
        assert_eq!(hub.state(), HubState::Stopped);
        assert!(hub.local_addr().is_none());

        // Stopping twice is harmless.
        hub.stop().await;
        assert_eq!(hub.state(), HubState::Stopped);
    }

    #[tokio::test]
    async fn test_bind_error_leaves_hub_stopped() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let hub = hub();
        assert!(matches!(
            hub.start(&addr, "").await,
            Err(HubError::BindError { .. })
        ));
        assert_eq!(hub.state(), HubState::Stopped);
        assert!(hub.start("127.0.0.1:0", "").await.is_ok());
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_bootstrap_is_not_fatal() {
        let hub = hub();
        hub.start("127.0.0.1:0", "definitely not an address").await.unwrap();
        assert!(hub.is_running());
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_send_requires_running_hub() {
        let hub = hub();
        let peer = PeerId::from_bytes(vec![1; 32]).unwrap();
        assert!(matches!(hub.send(&peer, b"x".to_vec()), Err(HubError::NotRunning)));

        hub.start("127.0.0.1:0", "").await.unwrap();
        assert!(matches!(
            hub.send(&peer, b"x".to_vec()),
            Err(HubError::UnknownPeer(_))
        ));
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_requires_running_hub() {
        let hub = hub();
        assert!(matches!(hub.broadcast(b"x".to_vec()), Err(HubError::NotRunning)));

        hub.start("127.0.0.1:0", "").await.unwrap();
        assert_eq!(hub.broadcast(b"x".to_vec()).unwrap(), 0);
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_comma_bootstrap_list_is_not_fatal() {
        let hub = hub();
        hub.start("127.0.0.1:0", "127.0.0.1:1, not-an-address,").await.unwrap();
        assert!(hub.is_running());
        hub.stop().await;
    }

    #[test]
    fn test_take_messages_once() {
        let hub = hub();
        assert!(hub.take_messages().is_some());
        assert!(hub.take_messages().is_none());
    }

    #[tokio::test]
    async fn test_add_peer_and_evict_while_stopped() {
        let hub = hub();
        let peer = PeerId::from_bytes(vec![2; 32]).unwrap();
        hub.add_peer(&peer, "10.0.0.2:1").unwrap();
        assert_eq!(hub.lookup(&peer).unwrap().address, "10.0.0.2:1");
        assert!(hub.add_peer(&hub.local_peer_id().clone(), "x:1").is_err());
        assert!(hub.evict(&peer));
        assert!(hub.peers().is_empty());
    }
}
