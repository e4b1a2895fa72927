use std::time::Duration;

use serde::{Deserialize, Serialize};
use wsmux_frame::MAX_NUMBER;

use crate::error::{MuxError, Result};

/// Engine configuration.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// let config: wsmux_engine::MuxConfig =
///     serde_json::from_str(r#"{ "initial_slots": 4 }"#).unwrap();
/// assert_eq!(config.initial_slots, 4);
/// assert_eq!(config.initial_slot_quota, 8192);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Slots advertised to the peer right after startup.
    pub initial_slots: u64,
    /// Receive quota attached to each initial slot.
    pub initial_slot_quota: u64,
    /// Receive quota granted to the peer on the default channel.
    pub default_channel_quota: u64,
    /// Send quota the peer granted on the default channel during physical
    /// negotiation.
    pub default_channel_send_quota: u64,
    /// Send quota a peer-opened channel starts with, before any FlowControl.
    pub initial_send_quota: u64,
    /// Upper bound on the payload of one outgoing inner frame.
    pub max_inner_frame_payload: Option<usize>,
    /// How long shutdown waits for workers to finish, in milliseconds.
    pub drain_timeout_ms: u64,
    /// How long shutdown waits for the reader thread, in milliseconds.
    pub reader_join_timeout_ms: u64,
    /// Rules for the standard handshake validator.
    pub handshake: HandshakeConfig,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            initial_slots: 64,
            initial_slot_quota: 8192,
            default_channel_quota: 8192,
            default_channel_send_quota: 0,
            initial_send_quota: 0,
            max_inner_frame_payload: None,
            drain_timeout_ms: 5_000,
            reader_join_timeout_ms: 1_000,
            handshake: HandshakeConfig::default(),
        }
    }
}

impl MuxConfig {
    /// Load from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.default_channel_quota == 0 {
            return Err(MuxError::InvalidConfig(
                "default_channel_quota must be greater than zero".to_string(),
            ));
        }
        for (name, value) in [
            ("initial_slots", self.initial_slots),
            ("initial_slot_quota", self.initial_slot_quota),
            ("default_channel_quota", self.default_channel_quota),
            ("default_channel_send_quota", self.default_channel_send_quota),
            ("initial_send_quota", self.initial_send_quota),
        ] {
            if value > MAX_NUMBER {
                return Err(MuxError::InvalidConfig(format!(
                    "{name} exceeds {MAX_NUMBER}"
                )));
            }
        }
        if self.max_inner_frame_payload == Some(0) {
            return Err(MuxError::InvalidConfig(
                "max_inner_frame_payload must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn reader_join_timeout(&self) -> Duration {
        Duration::from_millis(self.reader_join_timeout_ms)
    }
}

/// Rules applied by [`crate::StandardValidator`].
///
/// Empty lists place no restriction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Request paths that may open a channel.
    pub allowed_paths: Vec<String>,
    /// Values of the `Origin` header that may open a channel.
    pub allowed_origins: Vec<String>,
    /// Subprotocols the server speaks, in preference order.
    pub subprotocols: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = MuxConfig::default();
        config.validate().expect("defaults should validate");
        assert_eq!(config.initial_slots, 64);
        assert_eq!(config.initial_slot_quota, 8192);
        assert_eq!(config.drain_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = MuxConfig::from_json(
            r#"{ "initial_slots": 1, "handshake": { "allowed_paths": ["/chat"] } }"#,
        )
        .expect("config should parse");
        assert_eq!(config.initial_slots, 1);
        assert_eq!(config.default_channel_quota, 8192);
        assert_eq!(config.handshake.allowed_paths, vec!["/chat".to_string()]);
        assert!(config.handshake.subprotocols.is_empty());
    }

    #[test]
    fn rejects_invalid_values() {
        let zero_quota = MuxConfig {
            default_channel_quota: 0,
            ..MuxConfig::default()
        };
        assert!(matches!(zero_quota.validate(), Err(MuxError::InvalidConfig(_))));

        let huge_slot_quota = MuxConfig {
            initial_slot_quota: u64::MAX,
            ..MuxConfig::default()
        };
        assert!(matches!(
            huge_slot_quota.validate(),
            Err(MuxError::InvalidConfig(_))
        ));

        let zero_chunk = MuxConfig {
            max_inner_frame_payload: Some(0),
            ..MuxConfig::default()
        };
        assert!(zero_chunk.validate().is_err());

        assert!(matches!(
            MuxConfig::from_json("{ not json"),
            Err(MuxError::Json(_))
        ));
    }
}
