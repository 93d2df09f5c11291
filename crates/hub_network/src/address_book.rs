//! Address book: known peers, their last address and connection state.
//!
//! Records are spread over a fixed number of independently locked shards so
//! that a lookup for one peer never waits on an upsert for an unrelated one.
//! Locks are never held across an `.await`.

use std::collections::HashMap;
use std::collections::hash_map::{DefaultHasher, Entry};
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

const SHARDS: usize = 16;

/// Connection state of a peer, driven by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// No connection and none being attempted.
    Unknown,
    /// Dial or handshake in progress.
    Connecting,
    /// Handshake completed; frames flow.
    Connected,
    /// Last attempt failed; a redial may be scheduled.
    Failed,
    /// Being closed on request.
    Retiring,
}

/// Everything the hub knows about one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    /// Last known dialable address. Empty when the peer never advertised one.
    pub address: String,
    /// Last time we heard from or about this peer.
    pub last_seen: DateTime<Utc>,
    pub state: PeerState,
    /// Consecutive failed dials since the last successful handshake.
    pub failures: u32,
    /// When the current connection was established.
    pub connected_at: Option<DateTime<Utc>>,
}

impl PeerRecord {
    fn new(peer_id: PeerId, address: String) -> Self {
        Self {
            peer_id,
            address,
            last_seen: Utc::now(),
            state: PeerState::Unknown,
            failures: 0,
            connected_at: None,
        }
    }

    pub fn has_address(&self) -> bool {
        !self.address.is_empty()
    }
}

/// Result of an [`AddressBook::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Refreshed,
}

/// Shared map from PeerId to [`PeerRecord`].
pub struct AddressBook {
    shards: Vec<RwLock<HashMap<PeerId, PeerRecord>>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, peer_id: &PeerId) -> &RwLock<HashMap<PeerId, PeerRecord>> {
        let mut hasher = DefaultHasher::new();
        peer_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Insert a record or refresh an existing one. The address is
    /// last-write-wins; an empty address never replaces a known one. The
    /// connection state is left alone.
    pub fn upsert(&self, peer_id: &PeerId, address: &str) -> Upsert {
        let mut shard = self.shard(peer_id).write();
        match shard.entry(peer_id.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if !address.is_empty() {
                    record.address = address.to_string();
                }
                record.last_seen = Utc::now();
                Upsert::Refreshed
            }
            Entry::Vacant(entry) => {
                entry.insert(PeerRecord::new(peer_id.clone(), address.to_string()));
                Upsert::Inserted
            }
        }
    }

    /// Point-in-time copy of one record.
    pub fn lookup(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.shard(peer_id).read().get(peer_id).cloned()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.shard(peer_id).read().contains_key(peer_id)
    }

    /// Point-in-time copy of every record. Concurrent mutations may or may not
    /// be reflected.
    pub fn all(&self) -> Vec<PeerRecord> {
        self.shards
            .iter()
            .flat_map(|shard| shard.read().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Ids of peers currently in the Connected state.
    pub fn connected(&self) -> Vec<PeerId> {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .values()
                    .filter(|r| r.state == PeerState::Connected)
                    .map(|r| r.peer_id.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Update a peer's connection state. Returns false if the peer is unknown.
    pub fn set_state(&self, peer_id: &PeerId, state: PeerState) -> bool {
        let mut shard = self.shard(peer_id).write();
        let Some(record) = shard.get_mut(peer_id) else {
            return false;
        };
        match state {
            PeerState::Connected => {
                if record.state != PeerState::Connected {
                    record.connected_at = Some(Utc::now());
                }
                record.failures = 0;
                record.last_seen = Utc::now();
            }
            _ => record.connected_at = None,
        }
        record.state = state;
        true
    }

    /// Count one more failed attempt and return the running total.
    pub fn record_failure(&self, peer_id: &PeerId) -> u32 {
        let mut shard = self.shard(peer_id).write();
        match shard.get_mut(peer_id) {
            Some(record) => {
                record.failures = record.failures.saturating_add(1);
                record.state = PeerState::Failed;
                record.connected_at = None;
                record.failures
            }
            None => 0,
        }
    }

    /// Clear the failure count so the peer gets a fresh retry budget.
    pub fn reset_failures(&self, peer_id: &PeerId) {
        if let Some(record) = self.shard(peer_id).write().get_mut(peer_id) {
            record.failures = 0;
        }
    }

    /// Update the last-seen timestamp for a peer.
    pub fn touch(&self, peer_id: &PeerId) {
        if let Some(record) = self.shard(peer_id).write().get_mut(peer_id) {
            record.last_seen = Utc::now();
        }
    }

    pub fn remove(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.shard(peer_id).write().remove(peer_id)
    }

    /// Return every record to `Unknown`, keeping addresses as cold hints.
    pub fn reset_states(&self) {
        for shard in &self.shards {
            for record in shard.write().values_mut() {
                record.state = PeerState::Unknown;
                record.connected_at = None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AddressBook {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn peer(byte: u8) -> PeerId {
        PeerId::from_bytes(vec![byte; 32]).unwrap()
    }

    #[test]
    fn test_upsert_and_lookup() {
        let book = AddressBook::new();
        assert_eq!(book.upsert(&peer(1), "127.0.0.1:1"), Upsert::Inserted);
        let record = book.lookup(&peer(1)).unwrap();
        assert_eq!(record.address, "127.0.0.1:1");
        assert_eq!(record.state, PeerState::Unknown);
        assert!(book.lookup(&peer(2)).is_none());
    }

    #[test]
    fn test_last_write_wins_on_address() {
        let book = AddressBook::new();
        for port in 1..=20 {
            book.upsert(&peer(1), &format!("10.0.0.1:{port}"));
        }
        assert_eq!(book.upsert(&peer(1), "10.0.0.2:7"), Upsert::Refreshed);
        assert_eq!(book.lookup(&peer(1)).unwrap().address, "10.0.0.2:7");
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_empty_address_keeps_known_hint() {
        let book = AddressBook::new();
        book.upsert(&peer(1), "10.0.0.1:1");
        book.upsert(&peer(1), "");
        assert_eq!(book.lookup(&peer(1)).unwrap().address, "10.0.0.1:1");
    }

    #[test]
    fn test_upsert_does_not_touch_state() {
        let book = AddressBook::new();
        book.upsert(&peer(1), "a:1");
        book.set_state(&peer(1), PeerState::Connected);
        book.upsert(&peer(1), "b:2");
        let record = book.lookup(&peer(1)).unwrap();
        assert_eq!(record.state, PeerState::Connected);
        assert_eq!(record.address, "b:2");
    }

    #[test]
    fn test_state_transitions() {
        let book = AddressBook::new();
        book.upsert(&peer(3), "a:1");

        assert!(book.set_state(&peer(3), PeerState::Connecting));
        assert!(book.set_state(&peer(3), PeerState::Connected));
        assert!(book.lookup(&peer(3)).unwrap().connected_at.is_some());
        assert_eq!(book.connected(), vec![peer(3)]);

        assert_eq!(book.record_failure(&peer(3)), 1);
        assert_eq!(book.record_failure(&peer(3)), 2);
        let record = book.lookup(&peer(3)).unwrap();
        assert_eq!(record.state, PeerState::Failed);
        assert!(record.connected_at.is_none());
        assert!(book.connected().is_empty());

        book.set_state(&peer(3), PeerState::Connected);
        assert_eq!(book.lookup(&peer(3)).unwrap().failures, 0);

        assert!(!book.set_state(&peer(4), PeerState::Connected));
    }

    #[test]
    fn test_reset_states_keeps_records() {
        let book = AddressBook::new();
        book.upsert(&peer(1), "a:1");
        book.upsert(&peer(2), "b:1");
        book.set_state(&peer(1), PeerState::Connected);
        book.reset_states();
        assert_eq!(book.len(), 2);
        assert!(book.all().iter().all(|r| r.state == PeerState::Unknown));
    }

    #[test]
    fn test_remove() {
        let book = AddressBook::new();
        book.upsert(&peer(1), "a:1");
        assert!(book.remove(&peer(1)).is_some());
        assert!(book.is_empty());
        assert!(book.remove(&peer(1)).is_none());
    }

    #[test]
    fn test_concurrent_upserts_single_record_per_peer() {
        let book = Arc::new(AddressBook::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let book = Arc::clone(&book);
                std::thread::spawn(move || {
                    for i in 0..200u32 {
                        book.upsert(&peer((i % 10) as u8), &format!("10.0.{t}.{i}:1"));
                        let _ = book.all();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(book.len(), 10);
        assert_eq!(book.all().len(), 10);
    }
}
