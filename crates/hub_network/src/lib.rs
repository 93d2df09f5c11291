//! Hub Network: peer-to-peer communication hub.
//!
//! A hub listens on a local address, seeds its peer set from a bootstrap
//! address and keeps one supervised TCP connection per peer. Peers are
//! identified by public key, never by address; addresses are hints kept in the
//! [`AddressBook`] and refreshed by gossip.
//!
//! # Architecture
//!
//! - **Codec**: `[type][u32 length][body]` frames, Payload or Control.
//! - **Transport**: TCP with a hello exchange binding each connection to a key.
//! - **Connections**: per-peer supervisor with bounded outbound queue and
//!   jittered exponential backoff on failure.
//! - **Discovery**: bootstrap dial plus periodic peer-list gossip.
//! - **Control**: blocking start / stop / send / set_log_level over one
//!   process-wide hub.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use hub_network::{Hub, HubConfig, NodeIdentity};
//!
//! # async fn example() -> Result<(), hub_network::HubError> {
//! let hub = Hub::new(NodeIdentity::generate(), HubConfig::default())?;
//! let mut inbound = hub.take_messages().expect("first call");
//!
//! hub.start("0.0.0.0:41011", "seed.example.org:41011").await?;
//! while let Some(msg) = inbound.recv().await {
//!     println!("{} sent {} bytes", msg.from, msg.payload.len());
//! }
//! hub.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod address_book;
pub mod backoff;
pub mod codec;
pub mod config;
pub mod connection;
pub mod control;
pub mod discovery;
pub mod error;
pub mod hub;
pub mod identity;
pub mod logging;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use address_book::{AddressBook, PeerRecord, PeerState};
pub use codec::{Frame, FrameType, HubCodec, PeerEntry};
pub use config::HubConfig;
pub use connection::InboundMessage;
pub use discovery::Bootstrap;
pub use error::HubError;
pub use hub::{Hub, HubState};
pub use identity::{NodeIdentity, PeerId};
pub use logging::LogLevel;
