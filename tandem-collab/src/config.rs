//! Node configuration, loadable from TOML.
//!
//! ```toml
//! local_peer = "alice@example.org/tandem"
//! nickname = "alice"
//! lifecycle_lock_timeout_ms = 10000
//! host_left_alone = "always"
//!
//! [transport]
//! force_mode = "relay"
//!
//! [websocket]
//! bind_addr = "127.0.0.1:9123"
//!
//! [websocket.peers]
//! "bob@example.org/tandem" = "ws://10.0.0.7:9123"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tandem_core::PeerId;
use thiserror::Error;

use crate::transport::manager::TransportManagerConfig;
use crate::transport::websocket::WebSocketConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// What the host does once the last remote participant has left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostLeftAlonePolicy {
    /// Keep the session running.
    #[default]
    Never,
    /// Stop the session.
    Always,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub local_peer: PeerId,
    pub nickname: String,
    /// Compared during invitation; peers with different versions cannot join.
    pub version: String,
    pub lifecycle_lock_timeout_ms: u64,
    pub negotiation_termination_timeout_ms: u64,
    pub negotiation_poll_interval_ms: u64,
    /// How long a negotiation waits for the next message from its peer.
    pub negotiation_response_timeout_ms: u64,
    /// How long a stopping session waits for its `Leave` to be delivered.
    pub leave_timeout_ms: u64,
    /// Size of the color pool, host color included.
    pub max_user_colors: u8,
    /// Payloads larger than this are lz4-compressed before sending.
    pub compression_threshold: usize,
    pub host_left_alone: HostLeftAlonePolicy,
    pub transport: TransportManagerConfig,
    pub websocket: WebSocketConfig,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            local_peer: PeerId::anonymous(),
            nickname: String::from("local"),
            version: env!("CARGO_PKG_VERSION").to_string(),
            lifecycle_lock_timeout_ms: 10_000,
            negotiation_termination_timeout_ms: 10_000,
            negotiation_poll_interval_ms: 100,
            negotiation_response_timeout_ms: 60_000,
            leave_timeout_ms: 2_000,
            max_user_colors: 5,
            compression_threshold: 1024,
            host_left_alone: HostLeftAlonePolicy::Never,
            transport: TransportManagerConfig::default(),
            websocket: WebSocketConfig::default(),
        }
    }
}

impl CollabConfig {
    pub fn new(local_peer: PeerId) -> Self {
        Self {
            nickname: local_peer.name().to_string(),
            local_peer,
            ..Self::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_peer.is_bare() {
            return Err(ConfigError::Invalid(format!(
                "local_peer `{}` must carry a resource part",
                self.local_peer
            )));
        }
        if self.max_user_colors == 0 {
            return Err(ConfigError::Invalid("max_user_colors must be at least 1".into()));
        }
        if self.negotiation_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "negotiation_poll_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn lifecycle_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lifecycle_lock_timeout_ms)
    }

    pub fn negotiation_termination_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_termination_timeout_ms)
    }

    pub fn negotiation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.negotiation_poll_interval_ms)
    }

    pub fn negotiation_response_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_response_timeout_ms)
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::transport::TransferMode;

    #[test]
    fn test_config_default() {
        let config = CollabConfig::default();
        assert_eq!(config.lifecycle_lock_timeout(), Duration::from_secs(10));
        assert_eq!(config.negotiation_termination_timeout(), Duration::from_secs(10));
        assert_eq!(config.negotiation_poll_interval(), Duration::from_millis(100));
        assert_eq!(config.leave_timeout(), Duration::from_secs(2));
        assert_eq!(config.max_user_colors, 5);
        assert_eq!(config.host_left_alone, HostLeftAlonePolicy::Never);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let config = CollabConfig::from_toml_str(
            r#"
            local_peer = "alice@example.org/tandem"
            max_user_colors = 8
            host_left_alone = "always"

            [transport]
            force_mode = "relay"

            [websocket.peers]
            "bob@example.org/tandem" = "ws://127.0.0.1:9000"
            "#,
        )
        .unwrap();

        assert_eq!(config.local_peer.as_str(), "alice@example.org/tandem");
        assert_eq!(config.max_user_colors, 8);
        assert_eq!(config.host_left_alone, HostLeftAlonePolicy::Always);
        assert_eq!(config.transport.force_mode, Some(TransferMode::Relay));
        assert_eq!(config.websocket.peers.len(), 1);
        assert_eq!(config.lifecycle_lock_timeout_ms, 10_000);
    }

    #[test]
    fn test_config_rejects_bare_peer() {
        let err = CollabConfig::from_toml_str(r#"local_peer = "alice@example.org""#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_config_rejects_malformed_peer() {
        let err = CollabConfig::from_toml_str(r#"local_peer = "alice""#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_config_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"local_peer = "carol@example.org/laptop""#).unwrap();
        writeln!(file, "negotiation_poll_interval_ms = 20").unwrap();

        let config = CollabConfig::load(file.path()).unwrap();
        assert_eq!(config.local_peer.name(), "carol");
        assert_eq!(config.negotiation_poll_interval(), Duration::from_millis(20));
    }

    #[test]
    fn test_config_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CollabConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
