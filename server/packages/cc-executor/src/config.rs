use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_PORT: u16 = 8003;
pub const WEBSOCKET_PATH: &str = "/ws/mcp";
pub const SERVICE_NAME: &str = "cc-executor";

/// Smallest accepted line limit; a fragment must be able to hold one
/// complete UTF-8 scalar.
pub const MIN_LINE_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("max_line_size must be at least {MIN_LINE_SIZE} bytes (got {value})")]
    LineSizeTooSmall { value: usize },
    #[error("heartbeat_timeout ({timeout_ms}ms) must exceed heartbeat_interval ({interval_ms}ms)")]
    HeartbeatTimeout { interval_ms: u64, timeout_ms: u64 },
    #[error("allowed command entries must not be blank")]
    BlankAllowedCommand,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Base command names accepted by `execute`. `None` accepts anything.
    pub allowed_commands: Option<Vec<String>>,
    pub max_sessions: usize,
    pub session_idle_timeout: Duration,
    pub max_line_size: usize,
    /// `None` disables stall detection.
    pub stream_timeout: Option<Duration>,
    pub cancel_on_stall: bool,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect_grace: Duration,
    pub max_pending_messages: usize,
    pub termination_grace: Duration,
    pub handshake_timeout: Duration,
    pub drain_timeout: Duration,
    pub shell: PathBuf,
    pub working_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let heartbeat_interval = Duration::from_secs(20);
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            allowed_commands: None,
            max_sessions: 100,
            session_idle_timeout: Duration::from_secs(3600),
            max_line_size: 8 * 1024 * 1024,
            stream_timeout: Some(Duration::from_secs(600)),
            cancel_on_stall: true,
            heartbeat_interval,
            heartbeat_timeout: heartbeat_interval * 2,
            reconnect_grace: Duration::from_secs(60),
            max_pending_messages: 10_000,
            termination_grace: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
            shell: PathBuf::from("/bin/sh"),
            working_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("max_sessions", self.max_sessions == 0),
            ("max_pending_messages", self.max_pending_messages == 0),
            ("heartbeat_interval", self.heartbeat_interval.is_zero()),
            ("termination_grace", self.termination_grace.is_zero()),
            ("handshake_timeout", self.handshake_timeout.is_zero()),
            ("session_idle_timeout", self.session_idle_timeout.is_zero()),
        ];
        if let Some((field, _)) = non_zero.into_iter().find(|(_, zero)| *zero) {
            return Err(ConfigError::Zero { field });
        }
        if self.max_line_size < MIN_LINE_SIZE {
            return Err(ConfigError::LineSizeTooSmall {
                value: self.max_line_size,
            });
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::HeartbeatTimeout {
                interval_ms: self.heartbeat_interval.as_millis() as u64,
                timeout_ms: self.heartbeat_timeout.as_millis() as u64,
            });
        }
        if let Some(allowed) = &self.allowed_commands {
            if allowed.iter().any(|entry| entry.trim().is_empty()) {
                return Err(ConfigError::BlankAllowedCommand);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        config.validate().expect("default config");
        assert_eq!(config.port, 8003);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(40));
        assert_eq!(config.termination_grace, Duration::from_secs(10));
    }

    #[test]
    fn rejects_unusable_limits() {
        let config = ServerConfig {
            max_line_size: 2,
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LineSizeTooSmall { value: 2 })
        ));

        let config = ServerConfig {
            max_sessions: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "max_sessions"
            })
        ));

        let config = ServerConfig {
            heartbeat_timeout: Duration::from_secs(5),
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HeartbeatTimeout { .. })
        ));

        let config = ServerConfig {
            allowed_commands: Some(vec!["echo".to_string(), " ".to_string()]),
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BlankAllowedCommand)
        ));
    }
}
