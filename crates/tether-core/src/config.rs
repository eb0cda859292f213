//! Multiplexer configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::MuxError;
use crate::flow_control::DEFAULT_INITIAL_RATION;
use crate::framing::MAX_FRAME_SIZE;

/// Default size of each session's output staging buffer (8KB)
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 8 * 1024;

/// Default cap on concurrently live sessions per connection
pub const DEFAULT_MAX_SESSIONS: u32 = 128;

/// Settings for one multiplexed connection.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```json
/// { "initial_ration": 65536, "max_sessions": 32 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Inbound ration granted to the peer per session; `None` disables
    /// flow control for data sent to us, which also leaves the peer's
    /// outgoing queue unbounded.
    pub initial_ration: Option<u32>,

    /// Capacity of a session's output buffer, and so the largest data frame
    pub max_fragment_size: usize,

    /// Maximum number of live sessions on the connection
    pub max_sessions: u32,

    /// Period at which blocked readers and writers re-check their wait
    /// condition (milliseconds)
    pub liveness_interval_ms: u64,

    /// Time allowed for the peer's connection header (milliseconds)
    pub handshake_timeout_ms: u64,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            initial_ration: Some(DEFAULT_INITIAL_RATION),
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            max_sessions: DEFAULT_MAX_SESSIONS,
            liveness_interval_ms: 1_000,
            handshake_timeout_ms: 5_000,
        }
    }
}

impl MuxConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-session inbound ration (`None` = unlimited)
    pub fn initial_ration(mut self, ration: Option<u32>) -> Self {
        self.initial_ration = ration;
        self
    }

    /// Set the output buffer size
    pub fn max_fragment_size(mut self, size: usize) -> Self {
        self.max_fragment_size = size;
        self
    }

    /// Set the session limit
    pub fn max_sessions(mut self, sessions: u32) -> Self {
        self.max_sessions = sessions;
        self
    }

    /// Set the liveness re-check period
    pub fn liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn liveness_interval_duration(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn handshake_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Ration value advertised in the connection header (0 = unlimited)
    pub fn advertised_ration(&self) -> u32 {
        self.initial_ration.unwrap_or(0)
    }

    /// Check that the settings are usable
    pub fn validate(&self) -> Result<(), MuxError> {
        if self.initial_ration == Some(0) {
            return Err(MuxError::InvalidConfig(
                "initial_ration must be positive; use null for unlimited".into(),
            ));
        }
        if self.max_fragment_size == 0 || self.max_fragment_size > MAX_FRAME_SIZE {
            return Err(MuxError::InvalidConfig(format!(
                "max_fragment_size must be between 1 and {MAX_FRAME_SIZE}"
            )));
        }
        if self.max_sessions == 0 {
            return Err(MuxError::InvalidConfig(
                "max_sessions must be positive".into(),
            ));
        }
        if self.liveness_interval_ms == 0 {
            return Err(MuxError::InvalidConfig(
                "liveness_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self, MuxError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| MuxError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_json_file(path: &Path) -> Result<Self, MuxError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            MuxError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MuxConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.advertised_ration(), DEFAULT_INITIAL_RATION);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = MuxConfig::from_json_str(r#"{"initial_ration": 512, "max_sessions": 4}"#)
            .unwrap();
        assert_eq!(config.initial_ration, Some(512));
        assert_eq!(config.max_sessions, 4);
        assert_eq!(config.max_fragment_size, DEFAULT_MAX_FRAGMENT_SIZE);
    }

    #[test]
    fn test_null_ration_is_unlimited() {
        let config = MuxConfig::from_json_str(r#"{"initial_ration": null}"#).unwrap();
        assert_eq!(config.initial_ration, None);
        assert_eq!(config.advertised_ration(), 0);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(MuxConfig::new().max_fragment_size(0).validate().is_err());
        assert!(MuxConfig::new().initial_ration(Some(0)).validate().is_err());
        assert!(MuxConfig::new().max_sessions(0).validate().is_err());
        assert!(MuxConfig::from_json_str("{not json").is_err());
    }

    #[test]
    fn test_builder_durations() {
        let config = MuxConfig::new()
            .liveness_interval(Duration::from_millis(50))
            .handshake_timeout(Duration::from_secs(2));
        assert_eq!(config.liveness_interval_duration(), Duration::from_millis(50));
        assert_eq!(config.handshake_timeout_ms, 2_000);
    }
}
