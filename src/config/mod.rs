mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    Backoff, DeliverySettings, DiscoverySettings, LoggingSettings, SecuritySettings,
    ServiceSettings, Settings, StorageSettings,
};

/// Loads `config/default.*` (if present) and `DEALER__*` environment
/// variables, merged over the default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as [`load_config`] with an explicit file name (extension optional).
///
/// When no key directory is configured it sits next to the cache, at
/// `<storage.path>.tokens`.
pub fn load_config_from(name: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(name).required(false))
        .add_source(
            Environment::with_prefix("DEALER")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    let partial: PartialSettings = config.try_deserialize()?;

    let default = Settings::default();

    let storage_path = partial
        .storage
        .as_ref()
        .and_then(|s| s.path.clone())
        .unwrap_or(default.storage.path);

    let keys_path = partial
        .security
        .as_ref()
        .and_then(|s| s.keys_path.clone())
        .unwrap_or_else(|| format!("{storage_path}.tokens"));

    let delivery = partial.delivery.as_ref();
    let discovery = partial.discovery.as_ref();

    Ok(Settings {
        storage: StorageSettings {
            disabled: partial
                .storage
                .as_ref()
                .and_then(|s| s.disabled)
                .unwrap_or(default.storage.disabled),
            path: storage_path,
        },
        security: SecuritySettings { keys_path },
        discovery: DiscoverySettings {
            poll_interval_ms: discovery
                .and_then(|d| d.poll_interval_ms)
                .unwrap_or(default.discovery.poll_interval_ms),
            dead_after_cycles: discovery
                .and_then(|d| d.dead_after_cycles)
                .unwrap_or(default.discovery.dead_after_cycles),
            ping_timeout_ms: discovery
                .and_then(|d| d.ping_timeout_ms)
                .unwrap_or(default.discovery.ping_timeout_ms),
        },
        delivery: DeliverySettings {
            retry_interval_ms: delivery
                .and_then(|d| d.retry_interval_ms)
                .unwrap_or(default.delivery.retry_interval_ms),
            backoff: delivery
                .and_then(|d| d.backoff)
                .unwrap_or(default.delivery.backoff),
            max_backoff_ms: delivery
                .and_then(|d| d.max_backoff_ms)
                .unwrap_or(default.delivery.max_backoff_ms),
            ack_timeout_ms: delivery
                .and_then(|d| d.ack_timeout_ms)
                .unwrap_or(default.delivery.ack_timeout_ms),
            default_max_retries: delivery
                .and_then(|d| d.default_max_retries)
                .or(default.delivery.default_max_retries),
            default_timeout_ms: delivery
                .and_then(|d| d.default_timeout_ms)
                .or(default.delivery.default_timeout_ms),
        },
        logging: LoggingSettings {
            level: partial
                .logging
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.logging.level),
        },
        services: partial.services.unwrap_or(default.services),
    })
}
