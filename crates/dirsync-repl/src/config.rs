//! Configuration for the broker and the replication domain.

use crate::error::ReplError;
use crate::protocol::AssuredMode;
use crate::topology::split_url;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Updates the relay may send before waiting for credit.
pub const DEFAULT_WINDOW_SIZE: u32 = 100;
/// Heartbeat interval expected from the relay.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;
/// Interval of change-time heartbeats sent to the relay.
pub const DEFAULT_CHANGE_TIME_HEARTBEAT_INTERVAL_MS: u64 = 1_000;
/// Bound on one connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
/// Pause between reconnection attempts.
pub const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 500;
/// Wait for one send credit before probing the relay.
pub const DEFAULT_SEND_WINDOW_WAIT_MS: u64 = 500;
/// Pause before retrying a failed publish.
pub const DEFAULT_PUBLISH_RETRY_DELAY_MS: u64 = 100;
/// Wait for a monitor reply.
pub const DEFAULT_MONITOR_RESPONSE_TIMEOUT_MS: u64 = 10_000;
/// Bound on one session receive.
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 1_000;
/// Wait for acknowledgment of an assured update.
pub const DEFAULT_ASSURED_TIMEOUT_MS: u64 = 2_000;
/// Age after which history facts are purged (three days).
pub const DEFAULT_HISTORY_PURGE_DELAY_MS: u64 = 3 * 24 * 60 * 60 * 1_000;

/// Broker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Local replica id, non-zero.
    pub server_id: u32,
    /// Replicated base DN.
    pub base_dn: String,
    /// `host:port` of each configured relay.
    pub relay_urls: Vec<String>,
    /// URL announced to relays for this replica.
    pub local_url: String,
    /// Receive window.
    pub window_size: u32,
    /// Expected heartbeat interval, 0 disables the heartbeat monitor.
    pub heartbeat_interval_ms: u64,
    /// Change-time heartbeat interval, 0 disables the publisher.
    pub change_time_heartbeat_interval_ms: u64,
    /// Group id of this replica.
    pub group_id: u8,
    /// URLs clients may be referred to.
    pub referral_urls: Vec<String>,
    /// Whether updates from this replica are assured.
    pub assured: bool,
    /// Assured mode.
    pub assured_mode: AssuredMode,
    /// Number of servers that must hold an update in safe-data mode.
    pub safe_data_level: u8,
    /// Bound on one connection attempt.
    pub connect_timeout_ms: u64,
    /// Pause between reconnection attempts.
    pub reconnect_backoff_ms: u64,
    /// Wait for one send credit before probing the relay.
    pub send_window_wait_ms: u64,
    /// Pause before retrying a failed publish.
    pub publish_retry_delay_ms: u64,
    /// Wait for a monitor reply.
    pub monitor_response_timeout_ms: u64,
    /// Bound on one session receive.
    pub receive_timeout_ms: u64,
    /// Extra host names that refer to this machine.
    pub local_hosts: Vec<String>,
    /// Ports of relays running in this process.
    pub in_process_ports: Vec<u16>,
    /// Move to a better relay when monitoring shows one.
    pub reconnect_to_best_relay: bool,
    /// Reconnect when the session fails.
    pub reconnect_on_failure: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server_id: 1,
            base_dn: String::new(),
            relay_urls: Vec::new(),
            local_url: String::new(),
            window_size: DEFAULT_WINDOW_SIZE,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            change_time_heartbeat_interval_ms: DEFAULT_CHANGE_TIME_HEARTBEAT_INTERVAL_MS,
            group_id: 1,
            referral_urls: Vec::new(),
            assured: false,
            assured_mode: AssuredMode::SafeData,
            safe_data_level: 1,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            reconnect_backoff_ms: DEFAULT_RECONNECT_BACKOFF_MS,
            send_window_wait_ms: DEFAULT_SEND_WINDOW_WAIT_MS,
            publish_retry_delay_ms: DEFAULT_PUBLISH_RETRY_DELAY_MS,
            monitor_response_timeout_ms: DEFAULT_MONITOR_RESPONSE_TIMEOUT_MS,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            local_hosts: Vec::new(),
            in_process_ports: Vec::new(),
            reconnect_to_best_relay: true,
            reconnect_on_failure: true,
        }
    }
}

fn invalid(msg: impl Into<String>) -> ReplError {
    ReplError::Config { msg: msg.into() }
}

impl BrokerConfig {
    /// Config for replica `server_id` of `base_dn` using `relay_urls`.
    pub fn new(server_id: u32, base_dn: &str, relay_urls: Vec<String>) -> Self {
        Self {
            server_id,
            base_dn: base_dn.to_string(),
            relay_urls,
            ..Default::default()
        }
    }

    /// Check values that would make the broker misbehave.
    pub fn validate(&self) -> Result<(), ReplError> {
        if self.server_id == 0 {
            return Err(invalid("server_id must be non-zero"));
        }
        if self.base_dn.trim().is_empty() {
            return Err(invalid("base_dn must be set"));
        }
        if self.window_size == 0 {
            return Err(invalid("window_size must be positive"));
        }
        for url in &self.relay_urls {
            if split_url(url).1.is_none() {
                return Err(invalid(format!("relay url {url:?} is not host:port")));
            }
        }
        if self.send_window_wait_ms == 0 || self.receive_timeout_ms == 0 {
            return Err(invalid("send and receive waits must be positive"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(invalid("connect_timeout_ms must be positive"));
        }
        Ok(())
    }

    /// Whether moving from `self` to `new` requires a new session.
    pub fn requires_restart(&self, new: &BrokerConfig) -> bool {
        self.relay_urls != new.relay_urls
            || self.window_size != new.window_size
            || self.heartbeat_interval_ms != new.heartbeat_interval_ms
            || self.group_id != new.group_id
    }

    /// Heartbeat interval, `None` when disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    /// Change-time heartbeat interval, `None` when disabled.
    pub fn change_time_heartbeat_interval(&self) -> Option<Duration> {
        (self.change_time_heartbeat_interval_ms > 0)
            .then(|| Duration::from_millis(self.change_time_heartbeat_interval_ms))
    }

    /// Bound on one connection attempt.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Pause between reconnection attempts.
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    /// Wait for a send credit.
    pub fn send_window_wait(&self) -> Duration {
        Duration::from_millis(self.send_window_wait_ms)
    }

    /// Pause before retrying a publish.
    pub fn publish_retry_delay(&self) -> Duration {
        Duration::from_millis(self.publish_retry_delay_ms)
    }

    /// Wait for a monitor reply.
    pub fn monitor_response_timeout(&self) -> Duration {
        Duration::from_millis(self.monitor_response_timeout_ms)
    }

    /// Bound on one receive.
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

/// Settings for one replicated domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Broker settings.
    pub broker: BrokerConfig,
    /// Wait for acknowledgment of an assured update.
    pub assured_timeout_ms: u64,
    /// Age after which history facts are purged, 0 keeps them forever.
    pub history_purge_delay_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            assured_timeout_ms: DEFAULT_ASSURED_TIMEOUT_MS,
            history_purge_delay_ms: DEFAULT_HISTORY_PURGE_DELAY_MS,
        }
    }
}

impl ReplicationConfig {
    /// Config around `broker`.
    pub fn new(broker: BrokerConfig) -> Self {
        Self {
            broker,
            ..Default::default()
        }
    }

    /// Load from a `.json` or `.toml` file.
    pub fn from_file(path: &Path) -> Result<Self, ReplError> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ReplicationConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| invalid(e.to_string()))?,
            "json" => serde_json::from_str(&contents).map_err(|e| invalid(e.to_string()))?,
            _ => return Err(invalid(format!("unsupported config file extension: {ext}"))),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check all settings.
    pub fn validate(&self) -> Result<(), ReplError> {
        self.broker.validate()?;
        if self.assured_timeout_ms == 0 {
            return Err(invalid("assured_timeout_ms must be positive"));
        }
        Ok(())
    }

    /// Wait for an assured acknowledgment.
    pub fn assured_timeout(&self) -> Duration {
        Duration::from_millis(self.assured_timeout_ms)
    }

    /// History purge age, `None` when purging is off.
    pub fn history_purge_delay(&self) -> Option<Duration> {
        (self.history_purge_delay_ms > 0).then(|| Duration::from_millis(self.history_purge_delay_ms))
    }
}
