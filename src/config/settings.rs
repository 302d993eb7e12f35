use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::message::MessagePolicy;

/// Top-level configuration for the dispatch engine.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub storage: StorageSettings,
    pub security: SecuritySettings,
    pub discovery: DiscoverySettings,
    pub delivery: DeliverySettings,
    pub logging: LoggingSettings,
    pub services: HashMap<String, ServiceSettings>,
}

/// Where the durable message cache lives.
///
/// With `disabled` set the client runs transient: nothing is written to disk
/// and persistent messages are delivered best-effort.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub path: String,
    pub disabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecuritySettings {
    /// Directory holding `<identity>.public` / `<identity>.private` files.
    pub keys_path: String,
}

/// Heartbeat polling parameters for the topology collector.
#[derive(Debug, Deserialize, Clone)]
pub struct DiscoverySettings {
    pub poll_interval_ms: u64,
    /// Consecutive failed pings after which a host is considered gone.
    pub dead_after_cycles: u32,
    pub ping_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    Exponential,
}

/// Retry, backoff and default policy parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct DeliverySettings {
    pub retry_interval_ms: u64,
    pub backoff: Backoff,
    pub max_backoff_ms: u64,
    /// How long a sent message may wait for its response before the attempt
    /// counts as failed.
    pub ack_timeout_ms: u64,
    pub default_max_retries: Option<u32>,
    pub default_timeout_ms: Option<u64>,
}

impl DeliverySettings {
    /// Delay before the next attempt of a message that has failed `attempts`
    /// times so far.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let base = self.retry_interval_ms;
        let ms = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => {
                let shift = attempts.saturating_sub(1).min(32);
                base.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }

    /// Policy used when a caller does not build its own.
    pub fn default_policy(&self) -> MessagePolicy {
        MessagePolicy {
            persistent: false,
            timeout: self.default_timeout_ms.map(Duration::from_millis),
            max_retries: self.default_max_retries,
            urgent: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Per-service settings.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServiceSettings {
    /// Identity whose key pair signs this service's traffic. Defaults to the
    /// service name.
    #[serde(default)]
    pub identity: Option<String>,
    /// Addresses advertised for this service.
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl Settings {
    /// Signing identity for `service`.
    pub fn identity_for(&self, service: &str) -> String {
        self.services
            .get(service)
            .and_then(|s| s.identity.clone())
            .unwrap_or_else(|| service.to_string())
    }
}

/// Partial configuration loaded from files or environment; missing values are
/// filled from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub storage: Option<PartialStorageSettings>,
    pub security: Option<PartialSecuritySettings>,
    pub discovery: Option<PartialDiscoverySettings>,
    pub delivery: Option<PartialDeliverySettings>,
    pub logging: Option<PartialLoggingSettings>,
    pub services: Option<HashMap<String, ServiceSettings>>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStorageSettings {
    pub path: Option<String>,
    pub disabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialSecuritySettings {
    pub keys_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialDiscoverySettings {
    pub poll_interval_ms: Option<u64>,
    pub dead_after_cycles: Option<u32>,
    pub ping_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialDeliverySettings {
    pub retry_interval_ms: Option<u64>,
    pub backoff: Option<Backoff>,
    pub max_backoff_ms: Option<u64>,
    pub ack_timeout_ms: Option<u64>,
    pub default_max_retries: Option<u32>,
    pub default_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage: StorageSettings {
                path: "/var/lib/dealer/cache".to_string(),
                disabled: false,
            },
            security: SecuritySettings {
                keys_path: "/var/lib/dealer/cache.tokens".to_string(),
            },
            discovery: DiscoverySettings {
                poll_interval_ms: 1000,
                dead_after_cycles: 3,
                ping_timeout_ms: 500,
            },
            delivery: DeliverySettings {
                retry_interval_ms: 1000,
                backoff: Backoff::Fixed,
                max_backoff_ms: 30_000,
                ack_timeout_ms: 5000,
                default_max_retries: None,
                default_timeout_ms: None,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
            services: HashMap::new(),
        }
    }
}
