use std::time::Duration;

use crate::ConfigError;

/// Smallest non-zero payload limit a client may configure (256 KiB).
pub const MIN_CLIENT_PAYLOAD: usize = 256 * 1024;

/// Largest payload limit a client may configure.
pub const MAX_CLIENT_PAYLOAD: usize = i32::MAX as usize;

/// Default payload limit on the client side (1 MiB).
pub const DEFAULT_CLIENT_PAYLOAD: usize = 1024 * 1024;

/// Default payload limit on the server side (1 GiB).
pub const DEFAULT_SERVER_PAYLOAD: usize = 1024 * 1024 * 1024;

/// Size of the data frames a stream sender produces.
pub const IDEAL_CHUNK_SIZE: usize = 64 * 1024;

/// Transport-buffered bytes above which stream senders pause.
pub const SEND_HIGH_WATER_MARK: usize = 512 * 1024;

/// Per-stream receive budget.
pub const RECEIVE_HIGH_WATER_MARK: usize = 8 * 1024 * 1024;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const HEARTBEAT_TRIES: u32 = 3;

/// Per-connection settings shared by both endpoint roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Largest inbound message accepted, in bytes. 0 means unlimited.
    pub max_payload: usize,
    pub heartbeat_interval: Duration,
    /// Unanswered heartbeat intervals tolerated before the connection is
    /// declared dead.
    pub heartbeat_tries: u32,
    pub ideal_chunk_size: usize,
    pub send_high_water_mark: usize,
    pub receive_high_water_mark: usize,
    /// How long to wait for the peer to acknowledge a local close.
    pub close_timeout: Duration,
}

impl ConnectionConfig {
    /// Defaults for the connecting side.
    pub fn client() -> Self {
        Self {
            max_payload: DEFAULT_CLIENT_PAYLOAD,
            ..Self::server()
        }
    }

    /// Defaults for the accepting side.
    pub fn server() -> Self {
        Self {
            max_payload: DEFAULT_SERVER_PAYLOAD,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_tries: HEARTBEAT_TRIES,
            ideal_chunk_size: IDEAL_CHUNK_SIZE,
            send_high_water_mark: SEND_HIGH_WATER_MARK,
            receive_high_water_mark: RECEIVE_HIGH_WATER_MARK,
            close_timeout: HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, tries: u32) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_tries = tries;
        self
    }

    pub fn with_receive_high_water_mark(mut self, bytes: usize) -> Self {
        self.receive_high_water_mark = bytes;
        self
    }

    pub fn with_send_high_water_mark(mut self, bytes: usize) -> Self {
        self.send_high_water_mark = bytes;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Check the settings shared by both roles.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Zero("heartbeat_interval"));
        }
        if self.heartbeat_tries == 0 {
            return Err(ConfigError::Zero("heartbeat_tries"));
        }
        if self.heartbeat_tries > u32::from(u8::MAX) {
            return Err(ConfigError::HeartbeatTries(self.heartbeat_tries));
        }
        if self.ideal_chunk_size == 0 {
            return Err(ConfigError::Zero("ideal_chunk_size"));
        }
        if self.send_high_water_mark == 0 {
            return Err(ConfigError::Zero("send_high_water_mark"));
        }
        if self.receive_high_water_mark < 1024 {
            return Err(ConfigError::Zero("receive_high_water_mark (in KiB)"));
        }
        Ok(())
    }

    /// Check the settings, applying the client's payload bounds as well.
    pub fn validate_client(&self) -> Result<(), ConfigError> {
        self.validate()?;
        let got = self.max_payload;
        if got != 0 && !(MIN_CLIENT_PAYLOAD..=MAX_CLIENT_PAYLOAD).contains(&got) {
            return Err(ConfigError::MaxPayload {
                min: MIN_CLIENT_PAYLOAD,
                max: MAX_CLIENT_PAYLOAD,
                got,
            });
        }
        Ok(())
    }

    /// The low-water mark below which paused senders resume.
    pub(crate) fn low_water_mark(&self) -> usize {
        self.ideal_chunk_size
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::client()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_defaults() {
        assert_eq!(ConnectionConfig::client().max_payload, 1024 * 1024);
        assert_eq!(ConnectionConfig::server().max_payload, 1024 * 1024 * 1024);
        assert_eq!(ConnectionConfig::default().heartbeat_tries, 3);
        assert!(ConnectionConfig::client().validate_client().is_ok());
    }

    #[test]
    fn client_payload_bounds() {
        let unlimited = ConnectionConfig::client().with_max_payload(0);
        assert!(unlimited.validate_client().is_ok());

        let tiny = ConnectionConfig::client().with_max_payload(1024);
        assert!(matches!(
            tiny.validate_client(),
            Err(ConfigError::MaxPayload { got: 1024, .. })
        ));

        let huge = ConnectionConfig::client().with_max_payload(usize::MAX);
        assert!(huge.validate_client().is_err());
        assert!(huge.validate().is_ok());
    }

    #[test]
    fn heartbeat_must_tick() {
        let config = ConnectionConfig::server().with_heartbeat(Duration::ZERO, 3);
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero("heartbeat_interval"))
        );
        let config = ConnectionConfig::server().with_heartbeat(HEARTBEAT_INTERVAL, 300);
        assert_eq!(config.validate(), Err(ConfigError::HeartbeatTries(300)));
    }
}
