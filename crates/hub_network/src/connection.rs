//! Connection manager: one supervised connection per peer.
//!
//! Each peer with a live or pending connection owns a slot holding the
//! sender half of its outbound queue and a cancellation token. A supervisor
//! task per slot walks the per-peer state machine:
//!
//! ```text
//! Unknown -> Connecting -> Connected -> (Failed | Retiring) -> Unknown
//! ```
//!
//! A failed connection is never reused. The supervisor drops its queue, waits
//! out a jittered backoff and builds a fresh connection, re-validating the
//! remote key in the handshake. Once the retry ceiling is exceeded the slot is
//! released and the record stays `Failed` until an inbound connection or a
//! discovery refresh brings the peer back.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::address_book::{AddressBook, PeerState};
use crate::backoff::Backoff;
use crate::codec::{CodecError, Frame, HubCodec, PeerEntry};
use crate::config::HubConfig;
use crate::discovery;
use crate::error::HubError;
use crate::identity::PeerId;
use crate::transport::{self, Established, FramedStream, link_error, normalize_advertised};

/// An application payload received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: PeerId,
    pub payload: Bytes,
}

type FrameSink = SplitSink<FramedStream, Frame>;
type FrameStream = SplitStream<FramedStream>;

struct PeerSlot {
    generation: u64,
    cancel: CancellationToken,
    /// Present while a connection exists (Connecting or Connected).
    outbound: Option<mpsc::Sender<Frame>>,
    /// Whether the current connection was dialed by us.
    we_initiated: bool,
}

/// Owns every peer connection for one start/stop cycle of the hub.
pub struct ConnectionManager {
    local_id: PeerId,
    advertise: String,
    book: Arc<AddressBook>,
    config: HubConfig,
    codec: HubCodec,
    backoff: Backoff,
    slots: RwLock<HashMap<PeerId, PeerSlot>>,
    next_generation: AtomicU64,
    inbound_tx: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    runtime: Handle,
}

impl ConnectionManager {
    /// Create a manager. Must be called from within a tokio runtime; tasks
    /// are spawned onto that runtime even when later calls come from plain
    /// threads.
    pub fn new(
        local_id: PeerId,
        advertise: String,
        book: Arc<AddressBook>,
        config: HubConfig,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            advertise,
            codec: HubCodec::new(config.max_frame_len),
            backoff: Backoff::from_config(&config),
            config,
            book,
            slots: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            inbound_tx,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            runtime: Handle::current(),
        })
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn book(&self) -> &Arc<AddressBook> {
        &self.book
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Token observed by every loop this manager runs.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Spawn a task tracked for shutdown.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn_on(task, &self.runtime);
    }

    /// Number of peers with a supervised connection.
    pub fn active_sessions(&self) -> usize {
        self.slots.read().len()
    }

    /// Generation of the peer's current session, if one exists.
    pub fn session_generation(&self, peer: &PeerId) -> Option<u64> {
        self.slots.read().get(peer).map(|slot| slot.generation)
    }

    fn local_entry(&self) -> PeerEntry {
        PeerEntry::new(self.local_id.clone(), self.advertise.clone())
    }

    /// Our self entry followed by every addressed peer we know, trimmed to
    /// the frame limit.
    pub fn peer_list_frame(&self) -> Frame {
        let known = self
            .book
            .all()
            .into_iter()
            .filter(|r| r.has_address() && r.peer_id != self.local_id)
            .map(|r| PeerEntry::new(r.peer_id, r.address));
        Frame::control_within(
            std::iter::once(self.local_entry()).chain(known),
            self.config.max_frame_len,
        )
    }

    fn heartbeat_frame(&self) -> Frame {
        Frame::Control(vec![self.local_entry()])
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Enqueue a payload for `peer`, lazily starting a connection if the peer
    /// has none. Never waits on the network.
    pub fn send(self: &Arc<Self>, peer: &PeerId, payload: Bytes) -> Result<(), HubError> {
        self.check_payload(&payload)?;

        let record = self
            .book
            .lookup(peer)
            .ok_or_else(|| HubError::UnknownPeer(peer.clone()))?;

        let queue = {
            let slots = self.slots.read();
            slots.get(peer).map(|slot| slot.outbound.clone())
        };

        let tx = match queue {
            Some(Some(tx)) => tx,
            // Slot without a queue: waiting out a backoff.
            Some(None) => return Err(HubError::PeerUnreachable(peer.clone())),
            None => {
                if record.state == PeerState::Failed || !record.has_address() {
                    return Err(HubError::PeerUnreachable(peer.clone()));
                }
                self.ensure_session(peer)
                    .ok_or_else(|| HubError::PeerUnreachable(peer.clone()))?
            }
        };

        enqueue(&tx, peer, Frame::Payload(payload))
    }

    /// Enqueue `payload` for every connected peer. Peers whose queue is full
    /// or closing are skipped. Returns how many peers it was queued for.
    pub fn broadcast(&self, payload: Bytes) -> Result<usize, HubError> {
        self.check_payload(&payload)?;

        let queues: Vec<_> = {
            let slots = self.slots.read();
            self.book
                .connected()
                .into_iter()
                .filter_map(|peer| {
                    let tx = slots.get(&peer)?.outbound.clone()?;
                    Some((peer, tx))
                })
                .collect()
        };

        let mut queued = 0;
        for (peer, tx) in &queues {
            match enqueue(tx, peer, Frame::Payload(payload.clone())) {
                Ok(()) => queued += 1,
                Err(e) => debug!(peer = %peer, "broadcast skipped peer: {e}"),
            }
        }
        trace!(queued, connected = queues.len(), len = payload.len(), "broadcast");
        Ok(queued)
    }

    fn check_payload(&self, payload: &Bytes) -> Result<(), HubError> {
        if payload.len() > self.config.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len: payload.len(),
                max: self.config.max_frame_len,
            }
            .into());
        }
        Ok(())
    }

    /// Best-effort control frame; dropped if the peer has no open queue.
    pub fn send_control(&self, peer: &PeerId, frame: Frame) {
        let tx = self
            .slots
            .read()
            .get(peer)
            .and_then(|slot| slot.outbound.clone());
        if let Some(tx) = tx {
            if let Err(e) = enqueue(&tx, peer, frame) {
                trace!(peer = %peer, "control frame dropped: {e}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Start dialing `peer` if it is known, addressed and has no session.
    /// A peer left `Failed` by the retry ceiling gets a fresh retry budget.
    pub fn connect(self: &Arc<Self>, peer: &PeerId) {
        if *peer == self.local_id || self.cancel.is_cancelled() {
            return;
        }
        let Some(record) = self.book.lookup(peer) else {
            return;
        };
        if !record.has_address() || self.slots.read().contains_key(peer) {
            return;
        }
        if record.state == PeerState::Failed {
            info!(peer = %peer, "resurrecting failed peer");
            self.book.reset_failures(peer);
        }
        let _ = self.ensure_session(peer);
    }

    /// Return the peer's outbound queue, creating a session and its
    /// supervisor if none exists. `None` when the existing session has no
    /// queue or the manager is shutting down.
    fn ensure_session(self: &Arc<Self>, peer: &PeerId) -> Option<mpsc::Sender<Frame>> {
        if self.cancel.is_cancelled() {
            return None;
        }

        let mut slots = self.slots.write();
        if let Some(slot) = slots.get(peer) {
            return slot.outbound.clone();
        }

        let (tx, rx) = mpsc::channel(self.config.outbound_queue_capacity);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.child_token();
        slots.insert(
            peer.clone(),
            PeerSlot {
                generation,
                cancel: cancel.clone(),
                outbound: Some(tx.clone()),
                we_initiated: true,
            },
        );
        self.book.set_state(peer, PeerState::Connecting);
        drop(slots);

        debug!(peer = %peer, generation, "session created");
        let this = Arc::clone(self);
        let peer = peer.clone();
        self.spawn(async move { this.supervise(peer, generation, cancel, None, rx).await });
        Some(tx)
    }

    /// Take over a handshaken connection, replacing the peer's current
    /// session when the newcomer wins. Returns false if it was rejected.
    ///
    /// Between two connections for the same pair, the one dialed by the
    /// smaller PeerId survives on both ends; between two dialed by the same
    /// side, the newer one survives.
    fn adopt(self: &Arc<Self>, est: Established) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let peer = est.remote.peer_id.clone();

        let mut slots = self.slots.write();
        if let Some(slot) = slots.get(&peer) {
            let live = matches!(
                self.book.lookup(&peer).map(|r| r.state),
                Some(PeerState::Connecting | PeerState::Connected)
            );
            if live && !self.newcomer_wins(&peer, slot.we_initiated, est.outbound) {
                debug!(peer = %peer, addr = %est.remote_addr, "duplicate connection rejected");
                return false;
            }
            if let Some(old) = slots.remove(&peer) {
                debug!(peer = %peer, generation = old.generation, "session replaced");
                old.cancel.cancel();
            }
        }

        let (tx, rx) = mpsc::channel(self.config.outbound_queue_capacity);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.child_token();
        slots.insert(
            peer.clone(),
            PeerSlot {
                generation,
                cancel: cancel.clone(),
                outbound: Some(tx),
                we_initiated: est.outbound,
            },
        );
        self.book.set_state(&peer, PeerState::Connected);
        drop(slots);

        info!(peer = %peer, addr = %est.remote_addr, outbound = est.outbound, "peer connected");
        let this = Arc::clone(self);
        self.spawn(async move { this.supervise(peer, generation, cancel, Some(est), rx).await });
        true
    }

    fn newcomer_wins(&self, peer: &PeerId, existing_ours: bool, new_ours: bool) -> bool {
        if existing_ours == new_ours {
            return true;
        }
        let initiator = |ours: bool| if ours { &self.local_id } else { peer };
        initiator(new_ours) < initiator(existing_ours)
    }

    /// Run `f` only while `generation` is still the peer's session.
    fn if_current(&self, peer: &PeerId, generation: u64, f: impl FnOnce(&mut PeerSlot)) -> bool {
        let mut slots = self.slots.write();
        match slots.get_mut(peer) {
            Some(slot) if slot.generation == generation => {
                f(slot);
                true
            }
            _ => false,
        }
    }

    fn release(&self, peer: &PeerId, generation: u64) {
        let mut slots = self.slots.write();
        if slots.get(peer).is_some_and(|slot| slot.generation == generation) {
            slots.remove(peer);
        }
    }

    /// Drive one peer's state machine until cancelled, evicted or out of
    /// retries.
    async fn supervise(
        self: Arc<Self>,
        peer: PeerId,
        generation: u64,
        cancel: CancellationToken,
        mut first: Option<Established>,
        mut rx: mpsc::Receiver<Frame>,
    ) {
        loop {
            let est = match first.take() {
                Some(est) => est,
                None => {
                    let Some(record) = self.book.lookup(&peer) else {
                        debug!(peer = %peer, "record gone, ending session");
                        break;
                    };
                    self.if_current(&peer, generation, |slot| slot.we_initiated = true);

                    let dialed = tokio::select! {
                        _ = cancel.cancelled() => break,
                        res = self.dial_peer(&peer, &record.address) => res,
                    };
                    match dialed {
                        Ok(est) => {
                            let still_current = self.if_current(&peer, generation, |_| {
                                self.book.set_state(&peer, PeerState::Connected);
                            });
                            if !still_current {
                                break;
                            }
                            info!(peer = %peer, addr = %est.remote_addr, "peer connected");
                            est
                        }
                        Err(e) => {
                            warn!(peer = %peer, addr = %record.address, "dial failed: {e}");
                            match self.fail(&peer, generation, &cancel).await {
                                Some(fresh) => {
                                    rx = fresh;
                                    continue;
                                }
                                None => break,
                            }
                        }
                    }
                }
            };

            self.book.upsert(&peer, &est.remote.address);
            discovery::merge(&self, &peer, est.known_peers.clone());
            let outcome = self.drive(&peer, generation, est, &mut rx, &cancel).await;
            if cancel.is_cancelled() {
                break;
            }
            match outcome {
                Ok(()) => debug!(peer = %peer, "connection closed"),
                Err(e) => warn!(peer = %peer, "connection lost: {e}"),
            }
            match self.fail(&peer, generation, &cancel).await {
                Some(fresh) => rx = fresh,
                None => break,
            }
        }

        self.release(&peer, generation);
        trace!(peer = %peer, generation, "supervisor exited");
    }

    /// Failed-state handling: drop the dead queue, count the failure, wait
    /// out the backoff and hand back a fresh queue for the next connection.
    /// `None` means give up (ceiling reached, cancelled or superseded).
    async fn fail(
        &self,
        peer: &PeerId,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Option<mpsc::Receiver<Frame>> {
        let mut failures = 0;
        let current = self.if_current(peer, generation, |slot| {
            slot.outbound = None;
            failures = self.book.record_failure(peer);
        });
        if !current || cancel.is_cancelled() {
            return None;
        }

        if self.backoff.exhausted(failures) {
            error!(peer = %peer, failures, "retry ceiling reached, peer marked failed");
            return None;
        }

        let delay = self.backoff.delay(failures);
        debug!(peer = %peer, failures, ?delay, "redial scheduled");
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        let (tx, rx) = mpsc::channel(self.config.outbound_queue_capacity);
        let installed = self.if_current(peer, generation, |slot| {
            slot.outbound = Some(tx);
            self.book.set_state(peer, PeerState::Connecting);
        });
        installed.then_some(rx)
    }

    /// Dial a known peer and validate that it answers with the expected key.
    async fn dial_peer(&self, peer: &PeerId, address: &str) -> Result<Established, HubError> {
        let stream = transport::dial(address, self.config.dial_timeout).await?;
        transport::handshake(
            stream,
            self.codec,
            self.peer_list_frame(),
            Some(peer),
            self.config.handshake_timeout,
            true,
        )
        .await
    }

    /// Dial an address whose owner we do not know yet (a bootstrap address)
    /// and adopt the connection under whatever key answers.
    pub async fn dial_address(self: &Arc<Self>, address: &str) -> Result<PeerId, HubError> {
        let stream = transport::dial(address, self.config.dial_timeout).await?;
        let est = transport::handshake(
            stream,
            self.codec,
            self.peer_list_frame(),
            None,
            self.config.handshake_timeout,
            true,
        )
        .await?;

        let peer = est.remote.peer_id.clone();
        if peer == self.local_id {
            return Err(HubError::ConnectionFailed(format!(
                "{address} is this hub's own address"
            )));
        }
        let advertised = if est.remote.address.is_empty() {
            address.to_string()
        } else {
            est.remote.address.clone()
        };
        self.book.upsert(&peer, &advertised);
        self.adopt(est);
        Ok(peer)
    }

    // -----------------------------------------------------------------------
    // Connection I/O
    // -----------------------------------------------------------------------

    /// Run one connection: write loop here, read loop in its own task.
    async fn drive(
        self: &Arc<Self>,
        peer: &PeerId,
        generation: u64,
        est: Established,
        rx: &mut mpsc::Receiver<Frame>,
        cancel: &CancellationToken,
    ) -> Result<(), HubError> {
        let remote_addr = est.remote_addr;
        let (mut sink, stream) = est.framed.split();

        let mut reader = {
            let this = Arc::clone(self);
            let peer = peer.clone();
            self.tracker.spawn_on(
                this.read_loop(peer, generation, stream, remote_addr),
                &self.runtime,
            )
        };

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Nothing read from here on may touch the book.
                    reader.abort();
                    self.flush_and_close(&mut sink, rx).await;
                    break Ok(());
                }
                read = &mut reader => {
                    break match read {
                        Ok(outcome) => outcome,
                        Err(e) => Err(HubError::ConnectionFailed(format!("read task: {e}"))),
                    };
                }
                frame = rx.recv() => {
                    let Some(frame) = frame else { break Ok(()) };
                    if let Err(e) = sink.send(frame).await {
                        break Err(link_error(e));
                    }
                    heartbeat.reset();
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = sink.send(self.heartbeat_frame()).await {
                        break Err(link_error(e));
                    }
                    trace!(peer = %peer, "heartbeat sent");
                }
            }
        };

        reader.abort();
        result
    }

    /// Read frames until the stream ends or fails. Never hands out a partial
    /// frame: the codec only yields complete bodies.
    async fn read_loop(
        self: Arc<Self>,
        peer: PeerId,
        generation: u64,
        mut stream: FrameStream,
        remote_addr: SocketAddr,
    ) -> Result<(), HubError> {
        while let Some(frame) = stream.next().await {
            match frame.map_err(link_error)? {
                Frame::Payload(payload) => self.deliver(&peer, payload),
                Frame::Control(entries) => {
                    if !self.apply_control(&peer, generation, entries, remote_addr) {
                        trace!(peer = %peer, generation, "stale control frame ignored");
                    }
                }
            }
        }
        Err(HubError::ConnectionFailed("closed by remote".into()))
    }

    /// Fold a heartbeat or gossip frame into the book. Frames arriving on a
    /// session that has since been replaced or evicted are dropped so they
    /// cannot bring a removed record back.
    fn apply_control(
        self: &Arc<Self>,
        peer: &PeerId,
        generation: u64,
        mut entries: Vec<PeerEntry>,
        remote_addr: SocketAddr,
    ) -> bool {
        {
            // Held across the book writes so an evict cannot interleave.
            let slots = self.slots.read();
            if slots.get(peer).map(|slot| slot.generation) != Some(generation) {
                return false;
            }
            self.book.touch(peer);
            if entries.first().is_some_and(|e| e.peer_id == *peer) {
                let own = entries.remove(0);
                let address = normalize_advertised(&own.address, remote_addr);
                self.book.upsert(peer, &address);
            }
        }
        discovery::merge(self, peer, entries);
        true
    }

    fn deliver(&self, from: &PeerId, payload: Bytes) {
        let len = payload.len();
        match self.inbound_tx.try_send(InboundMessage {
            from: from.clone(),
            payload,
        }) {
            Ok(()) => trace!(peer = %from, len, "payload delivered"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(peer = %from, len, "inbound queue full, payload dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(peer = %from, len, "no consumer, payload dropped");
            }
        }
    }

    /// Flush whatever is queued within the grace period, then close.
    async fn flush_and_close(&self, sink: &mut FrameSink, rx: &mut mpsc::Receiver<Frame>) {
        rx.close();
        let flushed = tokio::time::timeout(self.config.shutdown_grace, async {
            while let Some(frame) = rx.recv().await {
                sink.feed(frame).await?;
            }
            sink.flush().await?;
            sink.close().await
        })
        .await;
        match flushed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("flush on close failed: {e}"),
            Err(_) => debug!("flush on close timed out, force-closing"),
        }
    }

    // -----------------------------------------------------------------------
    // Listener
    // -----------------------------------------------------------------------

    /// Accept loop. Returns (dropping the listener) once cancelled.
    pub async fn run_listener(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        let this = Arc::clone(&self);
                        self.spawn(async move { this.accept_inbound(stream, addr).await });
                    }
                    Err(e) => {
                        error!("accept failed: {e}");
                        tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                    }
                },
            }
        }
        debug!("listener released");
    }

    async fn accept_inbound(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let handshake = transport::handshake(
            stream,
            self.codec,
            self.peer_list_frame(),
            None,
            self.config.handshake_timeout,
            false,
        );
        let est = tokio::select! {
            _ = self.cancel.cancelled() => return,
            res = handshake => match res {
                Ok(est) => est,
                Err(e) => {
                    debug!(addr = %addr, "inbound handshake failed: {e}");
                    return;
                }
            },
        };

        let peer = est.remote.peer_id.clone();
        if peer == self.local_id {
            debug!(addr = %addr, "dropping connection from ourselves");
            return;
        }
        self.book.upsert(&peer, &est.remote.address);
        self.adopt(est);
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Retire one peer: close its connection and remove its record.
    pub fn evict(&self, peer: &PeerId) -> bool {
        self.book.set_state(peer, PeerState::Retiring);
        if let Some(slot) = self.slots.write().remove(peer) {
            slot.cancel.cancel();
        }
        let removed = self.book.remove(peer).is_some();
        if removed {
            info!(peer = %peer, "peer evicted");
        }
        removed
    }

    /// Retire every connection, wait up to the grace bound for tasks to
    /// finish, and leave all records as cold `Unknown` hints.
    pub async fn shutdown(&self) {
        {
            let slots = self.slots.read();
            for peer in slots.keys() {
                self.book.set_state(peer, PeerState::Retiring);
            }
        }
        self.cancel.cancel();
        self.tracker.close();

        let bound = self.config.shutdown_grace + SHUTDOWN_SLACK;
        if tokio::time::timeout(bound, self.tracker.wait()).await.is_err() {
            warn!(
                remaining = self.tracker.len(),
                "connections did not close within {bound:?}, abandoning"
            );
        }

        self.slots.write().clear();
        self.book.reset_states();
    }
}

const ACCEPT_ERROR_PAUSE: std::time::Duration = std::time::Duration::from_millis(100);

/// Extra time `shutdown` allows on top of the flush grace period.
const SHUTDOWN_SLACK: std::time::Duration = std::time::Duration::from_millis(200);

fn enqueue(tx: &mpsc::Sender<Frame>, peer: &PeerId, frame: Frame) -> Result<(), HubError> {
    tx.try_send(frame).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => HubError::QueueFull(peer.clone()),
        mpsc::error::TrySendError::Closed(_) => HubError::PeerUnreachable(peer.clone()),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
