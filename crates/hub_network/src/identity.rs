//! Peer identity: public-key peer ids and the local node keypair.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::HubError;

/// Longest key the control-frame entry encoding can carry (one length byte).
pub const MAX_PEER_ID_LEN: usize = u8::MAX as usize;

/// A peer's public key. The only stable identifier for a peer; equality is
/// byte-exact and the key is never empty.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    /// Wrap raw public-key bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self, HubError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(HubError::InvalidPeerId("empty public key".into()));
        }
        if bytes.len() > MAX_PEER_ID_LEN {
            return Err(HubError::InvalidPeerId(format!(
                "public key is {} bytes, max {MAX_PEER_ID_LEN}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// Parse a hex-encoded public key.
    pub fn from_hex(s: &str) -> Result<Self, HubError> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| HubError::InvalidPeerId(format!("bad hex {s:?}: {e}")))?;
        Self::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// The local node's keypair. Its X25519 public key is the local [`PeerId`].
#[derive(Clone)]
pub struct NodeIdentity {
    secret: StaticSecret,
    peer_id: PeerId,
}

/// On-disk form of an identity.
#[derive(Serialize, Deserialize)]
struct IdentityFile {
    secret_key: String,
}

impl NodeIdentity {
    /// Create an identity from a fresh random secret.
    pub fn generate() -> Self {
        Self::from_secret_bytes(rand::random::<[u8; 32]>())
    }

    /// Build an identity from a raw 32-byte secret.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self {
            peer_id: PeerId(public.as_bytes().to_vec()),
            secret,
        }
    }

    /// Build an identity from a hex-encoded 32-byte secret.
    pub fn from_secret_hex(s: &str) -> Result<Self, HubError> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| HubError::InvalidPeerId(format!("bad secret key hex: {e}")))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            HubError::InvalidPeerId(format!("secret key is {} bytes, expected 32", v.len()))
        })?;
        Ok(Self::from_secret_bytes(bytes))
    }

    /// The public key peers address us by.
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Save the identity to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), HubError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = IdentityFile {
            secret_key: hex::encode(self.secret.to_bytes()),
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    /// Load an identity from a JSON file, or generate and persist a new one if
    /// the file is missing or unreadable.
    pub fn load_or_generate(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<IdentityFile>(&data)
                    .map_err(HubError::from)
                    .and_then(|f| Self::from_secret_hex(&f.secret_key))
                {
                    Ok(identity) => return identity,
                    Err(e) => tracing::warn!("Corrupt identity file, generating new: {e}"),
                },
                Err(e) => tracing::warn!("Cannot read identity file, generating new: {e}"),
            }
        }

        let identity = Self::generate();
        if let Err(e) = identity.save_to_file(path) {
            tracing::warn!("Failed to persist new identity: {e}");
        }
        identity
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_rejects_empty() {
        assert!(matches!(
            PeerId::from_bytes(Vec::new()),
            Err(HubError::InvalidPeerId(_))
        ));
    }

    #[test]
    fn test_peer_id_rejects_oversized() {
        assert!(PeerId::from_bytes(vec![1u8; MAX_PEER_ID_LEN]).is_ok());
        assert!(PeerId::from_bytes(vec![1u8; MAX_PEER_ID_LEN + 1]).is_err());
    }

    #[test]
    fn test_peer_id_hex() {
        let id = PeerId::from_hex("00ff10").unwrap();
        assert_eq!(id.as_bytes(), &[0x00, 0xff, 0x10]);
        assert_eq!(format!("{id}"), "00ff10");
        assert_eq!(format!("{id:?}"), "PeerId(00ff10)");
        assert!(PeerId::from_hex("zz").is_err());
        assert!(PeerId::from_hex("").is_err());
    }

    #[test]
    fn test_peer_id_serde_as_hex_string() {
        let id = PeerId::from_bytes(vec![1, 2, 3]).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"010203\"");
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_identity_generate_unique() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        assert_ne!(a.peer_id(), b.peer_id());
        assert_eq!(a.peer_id().as_bytes().len(), 32);
    }

    #[test]
    fn test_identity_from_secret_is_deterministic() {
        let a = NodeIdentity::from_secret_bytes([7u8; 32]);
        let b = NodeIdentity::from_secret_hex(&hex::encode([7u8; 32])).unwrap();
        assert_eq!(a.peer_id(), b.peer_id());
        assert!(NodeIdentity::from_secret_hex("0102").is_err());
    }

    #[test]
    fn test_identity_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let original = NodeIdentity::generate();
        original.save_to_file(&path).unwrap();

        let loaded = NodeIdentity::load_or_generate(&path);
        assert_eq!(loaded.peer_id(), original.peer_id());
    }

    #[test]
    fn test_identity_load_missing_generates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("identity.json");

        let identity = NodeIdentity::load_or_generate(&path);
        assert!(path.exists());
        let again = NodeIdentity::load_or_generate(&path);
        assert_eq!(identity.peer_id(), again.peer_id());
    }
}
