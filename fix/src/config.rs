//! FIX session configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported protocol versions; selects the BeginString on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FixVersion {
    #[default]
    #[serde(rename = "FIX42")]
    Fix42,
    #[serde(rename = "FIX44")]
    Fix44,
}

impl FixVersion {
    pub fn begin_string(self) -> &'static [u8] {
        match self {
            FixVersion::Fix42 => b"FIX.4.2",
            FixVersion::Fix44 => b"FIX.4.4",
        }
    }
}

/// Client session settings. Loads from TOML with every field optional
/// except the CompIDs, which [`FixConfig::validate`] enforces before a
/// connect is allowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FixConfig {
    pub fix_version: FixVersion,
    pub sender_comp_id: String,
    pub target_comp_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub account: Option<String>,
    pub heartbeat_interval_seconds: u32,
    pub reset_seq_num: bool,
    pub connect_timeout_ns: u64,
    pub reconnect_timeout_ns: u64,
    pub reconnect_enabled: bool,
    pub send_test_requests: bool,
}

impl Default for FixConfig {
    fn default() -> Self {
        Self {
            fix_version: FixVersion::Fix42,
            sender_comp_id: String::new(),
            target_comp_id: String::new(),
            username: None,
            password: None,
            account: None,
            heartbeat_interval_seconds: 30,
            reset_seq_num: true,
            connect_timeout_ns: 5_000_000_000,
            reconnect_timeout_ns: 5_000_000_000,
            reconnect_enabled: false,
            send_test_requests: false,
        }
    }
}

impl FixConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sender_comp_id.is_empty() {
            return Err(ConfigError::MissingField("sender_comp_id"));
        }
        if self.target_comp_id.is_empty() {
            return Err(ConfigError::MissingField("target_comp_id"));
        }
        if self.heartbeat_interval_seconds == 0 {
            return Err(ConfigError::InvalidHeartbeat);
        }
        Ok(())
    }

    pub fn heartbeat_interval_ns(&self) -> u64 {
        u64::from(self.heartbeat_interval_seconds) * 1_000_000_000
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("heartbeat interval must be positive")]
    InvalidHeartbeat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = FixConfig::default();
        assert_eq!(config.fix_version, FixVersion::Fix42);
        assert_eq!(config.heartbeat_interval_seconds, 30);
        assert!(config.reset_seq_num);
        assert_eq!(config.connect_timeout_ns, 5_000_000_000);
        assert_eq!(config.reconnect_timeout_ns, 5_000_000_000);
        assert!(!config.reconnect_enabled);
        assert!(!config.send_test_requests);
    }

    #[test]
    fn validation_requires_comp_ids() {
        let mut config = FixConfig::default();
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingField("sender_comp_id"))
        );
        config.sender_comp_id = "SENDER".into();
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingField("target_comp_id"))
        );
        config.target_comp_id = "TARGET".into();
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn loads_from_toml() {
        let config: FixConfig = toml::from_str(
            r#"
            fix_version = "FIX44"
            sender_comp_id = "SENDER"
            target_comp_id = "TARGET"
            username = "user"
            heartbeat_interval_seconds = 10
            reconnect_enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(config.fix_version, FixVersion::Fix44);
        assert_eq!(config.fix_version.begin_string(), b"FIX.4.4");
        assert_eq!(config.sender_comp_id, "SENDER");
        assert_eq!(config.username.as_deref(), Some("user"));
        assert_eq!(config.heartbeat_interval_seconds, 10);
        assert!(config.reconnect_enabled);
        // Unspecified fields keep their defaults.
        assert!(config.reset_seq_num);
        assert!(!config.send_test_requests);
    }
}
