//! Relay and client configuration, loadable from TOML.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::media::AudioConstraints;
use crate::room::ROOM_CAPACITY;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind: String,
    pub room_capacity: usize,
    /// Sessions silent for this long lose their room membership.
    pub membership_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            room_capacity: ROOM_CAPACITY,
            membership_timeout_secs: 30,
            ping_interval_secs: 10,
            reap_interval_secs: 5,
        }
    }
}

impl RelayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.room_capacity == 0 || self.room_capacity > ROOM_CAPACITY {
            return Err(ConfigError::Invalid(format!(
                "room_capacity must be between 1 and {ROOM_CAPACITY}"
            )));
        }
        if self.ping_interval_secs == 0 || self.ping_interval_secs >= self.membership_timeout_secs
        {
            return Err(ConfigError::Invalid(
                "ping_interval_secs must be non-zero and shorter than membership_timeout_secs"
                    .into(),
            ));
        }
        if self.reap_interval_secs == 0 {
            return Err(ConfigError::Invalid("reap_interval_secs must be non-zero".into()));
        }
        Ok(())
    }

    pub fn membership_timeout(&self) -> Duration {
        Duration::from_secs(self.membership_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub room_id: String,
    pub display_name: String,
    pub user_id: Option<String>,
    pub ice_servers: Vec<String>,
    pub negotiation_timeout_secs: u64,
    /// Delay before each signaling reconnect attempt; its length is the
    /// attempt budget.
    pub reconnect_backoff_ms: Vec<u64>,
    pub audio: AudioConstraints,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080".to_string(),
            room_id: "lobby".to_string(),
            display_name: "guest".to_string(),
            user_id: None,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            negotiation_timeout_secs: 15,
            reconnect_backoff_ms: vec![1000, 2000, 4000],
            audio: AudioConstraints::default(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.room_id.trim().is_empty() {
            return Err(ConfigError::Invalid("room_id must not be empty".into()));
        }
        if self.negotiation_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "negotiation_timeout_secs must be non-zero".into(),
            ));
        }
        if self.reconnect_backoff_ms.is_empty() {
            return Err(ConfigError::Invalid(
                "reconnect_backoff_ms needs at least one delay".into(),
            ));
        }
        Ok(())
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn reconnect_backoff(&self) -> Vec<Duration> {
        self.reconnect_backoff_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_defaults_follow_protocol_timings() {
        let config = ClientConfig::default();
        assert_eq!(config.negotiation_timeout(), Duration::from_secs(15));
        assert_eq!(
            config.reconnect_backoff(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn partial_client_toml_keeps_defaults() {
        let config = ClientConfig::from_toml_str(
            r#"
            room_id = "algebra-101"
            display_name = "Ann"

            [audio]
            input_device = "USB Mic"
            "#,
        )
        .unwrap();
        assert_eq!(config.room_id, "algebra-101");
        assert_eq!(config.audio.input_device.as_deref(), Some("USB Mic"));
        assert_eq!(config.reconnect_backoff_ms, vec![1000, 2000, 4000]);
    }

    #[test]
    fn empty_reconnect_backoff_is_rejected() {
        let err = ClientConfig::from_toml_str("reconnect_backoff_ms = []").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("reconnect_backoff_ms"));
    }

    #[test]
    fn relay_capacity_cannot_exceed_five() {
        let err = RelayConfig::from_toml_str("room_capacity = 8").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn relay_ping_must_beat_membership_timeout() {
        let err = RelayConfig::from_toml_str(
            "membership_timeout_secs = 10\nping_interval_secs = 10",
        )
        .unwrap_err();
        assert!(err.to_string().contains("ping_interval_secs"));
    }
}
