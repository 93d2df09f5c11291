//! Hub configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HubError;

/// Tunables for the hub. The listen and bootstrap addresses are not part of
/// the config; they are passed to [`Hub::start`](crate::Hub::start).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Largest frame body accepted or produced, in bytes.
    pub max_frame_len: usize,

    /// Frames that may wait in one connection's outbound queue.
    pub outbound_queue_capacity: usize,

    /// Inbound payloads buffered for the application before new ones are dropped.
    pub inbound_queue_capacity: usize,

    /// First redial delay after a failure.
    #[serde(with = "duration_ms_serde")]
    pub backoff_base: Duration,

    /// Upper bound for the redial delay.
    #[serde(with = "duration_ms_serde")]
    pub backoff_cap: Duration,

    /// Consecutive failed dials before a peer is marked permanently Failed.
    pub max_retries: u32,

    /// Timeout for establishing a TCP connection.
    #[serde(with = "duration_ms_serde")]
    pub dial_timeout: Duration,

    /// Timeout for receiving the remote hello after connecting.
    #[serde(with = "duration_ms_serde")]
    pub handshake_timeout: Duration,

    /// Interval between peer-list gossip rounds.
    #[serde(with = "duration_ms_serde")]
    pub gossip_interval: Duration,

    /// Connected peers contacted per gossip round.
    pub gossip_fanout: usize,

    /// Interval between heartbeats on an idle connection.
    #[serde(with = "duration_ms_serde")]
    pub heartbeat_interval: Duration,

    /// How long `stop` lets connections flush before force-closing them.
    #[serde(with = "duration_ms_serde")]
    pub shutdown_grace: Duration,

    /// Address announced to peers. Defaults to the bound listener address.
    pub advertise_addr: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_frame_len: 1024 * 1024,
            outbound_queue_capacity: 1024,
            inbound_queue_capacity: 4096,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            max_retries: 10,
            dial_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            gossip_interval: Duration::from_secs(30),
            gossip_fanout: 3,
            heartbeat_interval: Duration::from_secs(15),
            shutdown_grace: Duration::from_millis(300),
            advertise_addr: None,
        }
    }
}

impl HubConfig {
    /// Check the values that would make the hub misbehave.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_frame_len == 0 {
            return Err("max_frame_len must be greater than zero".into());
        }
        if self.max_frame_len > u32::MAX as usize {
            return Err("max_frame_len must fit the 4-byte length header".into());
        }
        if self.outbound_queue_capacity == 0 || self.inbound_queue_capacity == 0 {
            return Err("queue capacities must be greater than zero".into());
        }
        if self.backoff_cap < self.backoff_base {
            return Err("backoff_cap must not be below backoff_base".into());
        }
        if self.gossip_interval.is_zero() || self.heartbeat_interval.is_zero() {
            return Err("gossip and heartbeat intervals must be non-zero".into());
        }
        Ok(())
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), HubError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Load config from a JSON file, or return defaults if the file is missing
    /// or unusable.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<HubConfig>(&data) {
                    Ok(config) => match config.validate() {
                        Ok(()) => return config,
                        Err(e) => tracing::warn!("Invalid config file, using defaults: {e}"),
                    },
                    Err(e) => tracing::warn!("Corrupt config file, using defaults: {e}"),
                },
                Err(e) => tracing::warn!("Cannot read config file, using defaults: {e}"),
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
