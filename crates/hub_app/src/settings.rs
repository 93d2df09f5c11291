//! On-disk settings for the `commhub` binary.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use hub_network::{HubConfig, LogLevel, NodeIdentity};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Hex X25519 secret. Takes precedence over `identity_file`.
    pub private_key: Option<String>,
    /// Identity JSON, created on first run when missing.
    pub identity_file: Option<PathBuf>,
    /// Address the listener binds to.
    pub listen: String,
    /// `host:port`, `<hex key>@host:port`, or empty.
    pub bootstrap: String,
    pub log_level: String,
    /// Also write a daily log file here.
    pub logs_dir: Option<PathBuf>,
    pub hub: HubConfig,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            private_key: None,
            identity_file: None,
            listen: "0.0.0.0:41011".into(),
            bootstrap: String::new(),
            log_level: "info".into(),
            logs_dir: None,
            hub: HubConfig::default(),
        }
    }
}

impl AppSettings {
    /// Read settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let settings: Self = serde_json::from_str(&data)
            .with_context(|| format!("parsing {}", path.display()))?;
        settings
            .hub
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid hub settings in {}: {e}", path.display()))?;
        Ok(settings)
    }

    pub fn log_level(&self) -> Result<LogLevel> {
        Ok(LogLevel::parse(&self.log_level)?)
    }

    pub fn identity(&self) -> Result<NodeIdentity> {
        if let Some(key) = &self.private_key {
            return Ok(NodeIdentity::from_secret_hex(key)?);
        }
        match &self.identity_file {
            Some(path) => Ok(NodeIdentity::load_or_generate(path)),
            None => Ok(NodeIdentity::generate()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = AppSettings::load(&tmp.path().join("absent.json")).unwrap();
        assert_eq!(settings.listen, "0.0.0.0:41011");
        assert!(settings.bootstrap.is_empty());
        assert_eq!(settings.log_level().unwrap(), LogLevel::Info);
    }

    #[test]
    fn test_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("commhub.json");
        std::fs::write(
            &path,
            r#"{"listen":"127.0.0.1:5000","bootstrap":"127.0.0.1:5001","hub":{"gossip_fanout":5}}"#,
        )
        .unwrap();

        let settings = AppSettings::load(&path).unwrap();
        assert_eq!(settings.listen, "127.0.0.1:5000");
        assert_eq!(settings.bootstrap, "127.0.0.1:5001");
        assert_eq!(settings.hub.gossip_fanout, 5);
        assert_eq!(settings.hub.max_frame_len, HubConfig::default().max_frame_len);
    }

    #[test]
    fn test_private_key_is_deterministic() {
        let settings = AppSettings {
            private_key: Some("11".repeat(32)),
            ..AppSettings::default()
        };
        let a = settings.identity().unwrap();
        let b = settings.identity().unwrap();
        assert_eq!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn test_bad_private_key_is_an_error() {
        let settings = AppSettings {
            private_key: Some("abc".into()),
            ..AppSettings::default()
        };
        assert!(settings.identity().is_err());
    }

    #[test]
    fn test_invalid_hub_settings_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, r#"{"hub":{"max_frame_len":0}}"#).unwrap();
        assert!(AppSettings::load(&path).is_err());
    }
}
