use crate::error::ConfigError;
use serde::Deserialize;
use std::time::Duration;

/// The root configuration structure for the streaming services.
///
/// Every section is optional in `config.toml`; missing values fall back to
/// the defaults below.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Settings {
    /// Rejects settings the services cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.client.validate()?;
        Ok(())
    }
}

/// What the outbound queue does when it is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued event to admit the new one.
    #[default]
    DropOldest,
    /// Refuse the new event.
    DropNewest,
}

/// Parameters for the streaming server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Socket address to listen on (e.g., "0.0.0.0:3000").
    pub bind_addr: String,
    /// How often the outbound queue is drained.
    pub drain_interval_ms: u64,
    /// How often idle connections are swept.
    pub sweep_interval_secs: u64,
    /// Connections without inbound activity for this long are evicted.
    pub idle_timeout_secs: u64,
    /// Maximum number of envelopes waiting to be fanned out.
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Per-connection buffer of serialized frames awaiting the socket writer.
    pub send_buffer: usize,
    /// Consecutive write failures after which a connection is evicted.
    /// `1` evicts on the first failure.
    pub max_delivery_failures: u32,
    /// Topics for push streams opened without a `subscriptions` parameter.
    pub default_push_subscriptions: Vec<String>,
    /// Reject handshakes that carry no bearer token.
    pub require_token: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            drain_interval_ms: 100,
            sweep_interval_secs: 5 * 60,
            idle_timeout_secs: 30 * 60,
            queue_capacity: 10_000,
            overflow_policy: OverflowPolicy::DropOldest,
            send_buffer: 256,
            max_delivery_failures: 1,
            default_push_subscriptions: vec!["signal".to_string(), "proposal".to_string()],
            require_token: false,
        }
    }
}

impl ServerSettings {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.drain_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "server.drain_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "server.sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.queue_capacity == 0 || self.send_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "server.queue_capacity and server.send_buffer must be greater than 0".to_string(),
            ));
        }
        if self.max_delivery_failures == 0 {
            return Err(ConfigError::ValidationError(
                "server.max_delivery_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parameters for the streaming client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// WebSocket endpoint, without query string.
    pub ws_url: String,
    /// Server-Sent-Events endpoint, without query string.
    pub sse_url: String,
    pub user_id: String,
    /// Opaque bearer credential forwarded on both handshakes.
    pub token: Option<String>,
    /// Initial subscriptions. Defaults to every topic.
    pub subscriptions: Vec<String>,
    /// Delay before the first reconnection attempt; doubled on every further attempt.
    pub reconnect_base_delay_ms: u64,
    /// Reconnection attempts before automatic reconnection stops.
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_secs: u64,
    /// Force a reconnect when nothing has been received for this long.
    /// Unset disables the check and leaves liveness to the transport.
    pub pong_timeout_secs: Option<u64>,
    /// How many recent envelope ids are remembered for de-duplication.
    pub dedup_window: usize,
    pub enable_socket: bool,
    pub enable_push: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:3000/stream/ws".to_string(),
            sse_url: "http://127.0.0.1:3000/stream/sse".to_string(),
            user_id: "anonymous".to_string(),
            token: None,
            subscriptions: ["signal", "proposal", "decision", "outcome", "risk", "system"]
                .into_iter()
                .map(String::from)
                .collect(),
            reconnect_base_delay_ms: 1_000,
            max_reconnect_attempts: 5,
            heartbeat_interval_secs: 30,
            pong_timeout_secs: Some(90),
            dedup_window: 1_024,
            enable_socket: true,
            enable_push: true,
        }
    }
}

impl ClientSettings {
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn pong_timeout(&self) -> Option<Duration> {
        self.pong_timeout_secs.map(Duration::from_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reconnect_base_delay_ms == 0 {
            return Err(ConfigError::ValidationError(
                "client.reconnect_base_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "client.heartbeat_interval_secs must be greater than 0".to_string(),
            ));
        }
        if let Some(timeout) = self.pong_timeout_secs {
            if timeout <= self.heartbeat_interval_secs {
                return Err(ConfigError::ValidationError(format!(
                    "client.pong_timeout_secs ({}) must exceed the heartbeat interval ({})",
                    timeout, self.heartbeat_interval_secs
                )));
            }
        }
        if !self.enable_socket && !self.enable_push {
            return Err(ConfigError::ValidationError(
                "at least one of client.enable_socket / client.enable_push must be set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where and how much to log.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter used when `RUST_LOG` is not set.
    pub default_filter: String,
    /// Directory for the daily rolling log file. Unset logs to stdout only.
    pub directory: Option<String>,
    pub file_prefix: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            directory: Some("logs".to_string()),
            file_prefix: "pulse.log".to_string(),
        }
    }
}
