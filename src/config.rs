//! Engine configuration
//!
//! Defaults follow the documented protocol numbers (30s keepalive, 30s dial
//! timeout, 100 messages/minute, grace window of two keepalive intervals).
//! Every knob can be overridden through `TERMGATE_*` environment variables.

use std::time::Duration;

use crate::session::backoff::ReconnectPolicy;
use crate::session::buffer::FlowControlConfig;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address the WebSocket listener binds to.
    pub bind_addr: String,
    /// Expected client ping cadence.
    pub keepalive_interval: Duration,
    /// How long a session survives its connection; `None` derives
    /// 2x keepalive.
    pub grace_window: Option<Duration>,
    /// Transport dial timeout (CONNECTING -> ERRORED on expiry).
    pub connect_timeout: Duration,
    /// Flow control watermarks for each session's output buffer.
    pub flow_control: FlowControlConfig,
    /// Maximum concurrent sessions across the process.
    pub max_sessions: usize,
    /// Inbound message budget per connection per minute.
    pub messages_per_minute: u32,
    /// Consecutive over-limit messages tolerated before the socket is
    /// closed.
    pub rate_limit_strikes: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8022".to_string(),
            keepalive_interval: Duration::from_secs(30),
            grace_window: None,
            connect_timeout: Duration::from_secs(30),
            flow_control: FlowControlConfig::default(),
            max_sessions: 64,
            messages_per_minute: 100,
            rate_limit_strikes: 3,
        }
    }
}

/// Invalid configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("low watermark must be below high watermark")]
    WatermarkOrder,

    #[error("high watermark must not exceed the hard cap")]
    WatermarkCap,

    #[error("invalid value for {0}")]
    InvalidValue(&'static str),
}

impl EngineConfig {
    /// The effective grace window. The default comes from the same policy
    /// object clients use for their reconnect timing, so both sides agree
    /// on how long a session is worth keeping alive.
    pub fn grace_window(&self) -> Duration {
        self.grace_window
            .unwrap_or_else(|| ReconnectPolicy::grace_window(self.keepalive_interval))
    }

    /// Check invariants the flow controller depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flow_control.low_watermark >= self.flow_control.high_watermark {
            return Err(ConfigError::WatermarkOrder);
        }
        if self.flow_control.high_watermark > self.flow_control.hard_cap {
            return Err(ConfigError::WatermarkCap);
        }
        Ok(())
    }

    /// Build from defaults plus `TERMGATE_*` environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("TERMGATE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(secs) = env_u64("TERMGATE_KEEPALIVE_SECS")? {
            config.keepalive_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("TERMGATE_GRACE_SECS")? {
            config.grace_window = Some(Duration::from_secs(secs));
        }
        if let Some(secs) = env_u64("TERMGATE_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = env_u64("TERMGATE_HIGH_WATERMARK")? {
            config.flow_control.high_watermark = bytes as usize;
        }
        if let Some(bytes) = env_u64("TERMGATE_LOW_WATERMARK")? {
            config.flow_control.low_watermark = bytes as usize;
        }
        if let Some(bytes) = env_u64("TERMGATE_HARD_CAP")? {
            config.flow_control.hard_cap = bytes as usize;
        }
        if let Some(count) = env_u64("TERMGATE_MAX_SESSIONS")? {
            config.max_sessions = count as usize;
        }
        if let Some(count) = env_u64("TERMGATE_MESSAGES_PER_MINUTE")? {
            config.messages_per_minute = count as u32;
        }

        config.validate()?;
        Ok(config)
    }
}

fn env_u64(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
        assert_eq!(config.grace_window(), Duration::from_secs(60));
        assert_eq!(config.messages_per_minute, 100);
    }

    #[test]
    fn test_explicit_grace_window_wins() {
        let config = EngineConfig {
            grace_window: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        assert_eq!(config.grace_window(), Duration::from_secs(5));
    }

    #[test]
    fn test_watermark_validation() {
        let mut config = EngineConfig::default();
        config.flow_control.low_watermark = config.flow_control.high_watermark;
        assert!(matches!(config.validate(), Err(ConfigError::WatermarkOrder)));

        let mut config = EngineConfig::default();
        config.flow_control.high_watermark = config.flow_control.hard_cap + 1;
        assert!(matches!(config.validate(), Err(ConfigError::WatermarkCap)));
    }
}
