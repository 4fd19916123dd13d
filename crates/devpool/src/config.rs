//! Pool configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::manager::DeviceTarget;
use crate::reliability::RetryPolicy;

/// Device pool service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Devices attached at startup
    #[serde(default)]
    pub devices: Vec<DeviceTarget>,

    /// Bound on each wait for a worker
    #[serde(with = "duration_millis")]
    pub queue_timeout: Duration,

    /// Extra attempts after a worker session dies mid-request
    pub retry: u32,

    /// Interval between pool health checks
    #[serde(with = "duration_millis")]
    pub ping_interval: Duration,

    /// Bound on a single worker ping
    #[serde(with = "duration_millis")]
    pub ping_timeout: Duration,

    /// Backoff for reattaching a lost device
    #[serde(default)]
    pub reattach: RetryPolicy,

    /// Request service shutdown when a device cannot be reattached
    pub shutdown_on_reattach_failure: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            devices: vec![],
            queue_timeout: Duration::from_secs(30),
            retry: 1,
            ping_interval: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(10),
            reattach: RetryPolicy::default(),
            shutdown_on_reattach_failure: true,
        }
    }
}

impl PoolConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `DEVPOOL_DEVICES`: Comma separated device targets
    /// - `DEVPOOL_QUEUE_TIMEOUT_MS`: Wait bound per acquisition (default: 30000)
    /// - `DEVPOOL_RETRY`: Retries after a session dies (default: 1)
    /// - `DEVPOOL_PING_INTERVAL_MS`: Health check interval (default: 5000)
    /// - `DEVPOOL_PING_TIMEOUT_MS`: Ping bound (default: 10000)
    /// - `DEVPOOL_REATTACH_ATTEMPTS`: Attach attempts per reattachment (default: 1)
    /// - `DEVPOOL_SHUTDOWN_ON_REATTACH_FAILURE`: "true" or "false" (default: true)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        let devices = lookup("DEVPOOL_DEVICES")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(DeviceTarget::new)
                    .collect()
            })
            .unwrap_or_default();

        let reattach = match lookup("DEVPOOL_REATTACH_ATTEMPTS").and_then(|s| s.trim().parse().ok()) {
            Some(attempts) if attempts > 1 => RetryPolicy::exponential().with_max_attempts(attempts),
            _ => defaults.reattach.clone(),
        };

        Self {
            devices,
            queue_timeout: millis("DEVPOOL_QUEUE_TIMEOUT_MS", defaults.queue_timeout),
            retry: lookup("DEVPOOL_RETRY")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.retry),
            ping_interval: millis("DEVPOOL_PING_INTERVAL_MS", defaults.ping_interval),
            ping_timeout: millis("DEVPOOL_PING_TIMEOUT_MS", defaults.ping_timeout),
            reattach,
            shutdown_on_reattach_failure: lookup("DEVPOOL_SHUTDOWN_ON_REATTACH_FAILURE")
                .map(|v| v.trim().to_lowercase() != "false")
                .unwrap_or(defaults.shutdown_on_reattach_failure),
        }
    }

    pub fn with_device(mut self, target: impl Into<DeviceTarget>) -> Self {
        self.devices.push(target.into());
        self
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_reattach(mut self, policy: RetryPolicy) -> Self {
        self.reattach = policy;
        self
    }

    pub fn with_shutdown_on_reattach_failure(mut self, enabled: bool) -> Self {
        self.shutdown_on_reattach_failure = enabled;
        self
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PoolConfig::from_lookup(lookup(&[]));
        assert!(config.devices.is_empty());
        assert_eq!(config.queue_timeout, Duration::from_secs(30));
        assert_eq!(config.retry, 1);
        assert_eq!(config.ping_interval, Duration::from_secs(5));
        assert_eq!(config.ping_timeout, Duration::from_secs(10));
        assert_eq!(config.reattach.max_attempts, 1);
        assert!(config.shutdown_on_reattach_failure);
    }

    #[test]
    fn test_from_lookup() {
        let config = PoolConfig::from_lookup(lookup(&[
            ("DEVPOOL_DEVICES", "192.168.1.20:5555, emulator-5554,"),
            ("DEVPOOL_QUEUE_TIMEOUT_MS", "2500"),
            ("DEVPOOL_RETRY", "3"),
            ("DEVPOOL_REATTACH_ATTEMPTS", "4"),
            ("DEVPOOL_SHUTDOWN_ON_REATTACH_FAILURE", "FALSE"),
        ]));

        assert_eq!(
            config.devices,
            vec![
                DeviceTarget::new("192.168.1.20:5555"),
                DeviceTarget::new("emulator-5554")
            ]
        );
        assert_eq!(config.queue_timeout, Duration::from_millis(2500));
        assert_eq!(config.retry, 3);
        assert_eq!(config.reattach.max_attempts, 4);
        assert!(!config.shutdown_on_reattach_failure);
    }

    #[test]
    fn test_unparseable_values_keep_defaults() {
        let config = PoolConfig::from_lookup(lookup(&[
            ("DEVPOOL_QUEUE_TIMEOUT_MS", "soon"),
            ("DEVPOOL_RETRY", "-1"),
        ]));
        assert_eq!(config.queue_timeout, Duration::from_secs(30));
        assert_eq!(config.retry, 1);
    }

    #[test]
    fn test_serialization() {
        let config = PoolConfig::default()
            .with_device("10.0.0.2:5555")
            .with_queue_timeout(Duration::from_millis(750));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["queue_timeout"], 750);
        assert_eq!(json["devices"][0], "10.0.0.2:5555");

        let parsed: PoolConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.devices, config.devices);
        assert_eq!(parsed.queue_timeout, config.queue_timeout);
    }
}
