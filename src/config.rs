//! Configuration management for Ratekeeper.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RatekeeperError, Result};
use crate::ratelimit::strategy::DEFAULT_CAS_MAX_RETRIES;
use crate::ratelimit::{RateLimiter, RuleBinding, StrategyCatalog};
use crate::store::{CounterStore, MemoryStore, RedisStore};

/// Prefix for environment overrides, e.g. `RATEKEEPER__STORE__BACKEND=redis`.
const ENV_PREFIX: &str = "RATEKEEPER";

/// Main configuration for the rate limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreSettings,

    /// Limiter tuning
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Log output
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Rule table. Empty means the built-in rules.
    #[serde(default)]
    pub rules: Vec<RuleBinding>,
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, for single-process deployments and tests
    #[default]
    Memory,
    /// Shared Redis server
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Namespace prepended to every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on one store round trip, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_key_prefix() -> String {
    "ratelimit:".to_string()
}

fn default_timeout_ms() -> u64 {
    50
}

/// Limiter tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Compare-and-swap retries for bucket updates before failing open
    #[serde(default = "default_cas_max_retries")]
    pub cas_max_retries: u32,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            cas_max_retries: default_cas_max_retries(),
        }
    }
}

fn default_cas_max_retries() -> u32 {
    DEFAULT_CAS_MAX_RETRIES
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from an optional file, then apply environment overrides.
    ///
    /// The file format follows its extension (`.yaml`, `.toml`, `.json`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let settings: Settings =
            serde_yaml::from_str(contents).map_err(|e| RatekeeperError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a YAML file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(RatekeeperError::Config(
                "store.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(RatekeeperError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.timeout_ms)
    }

    /// The configured rules, or the built-in table when none are given.
    pub fn catalog(&self) -> Result<StrategyCatalog> {
        if self.rules.is_empty() {
            StrategyCatalog::builtin()
        } else {
            StrategyCatalog::new(self.rules.clone())
        }
    }

    /// Construct the configured counter store.
    pub fn build_store(&self) -> Result<Arc<dyn CounterStore>> {
        match self.store.backend {
            StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
            StoreBackend::Redis => {
                let url = self.store.redis_url.as_deref().ok_or_else(|| {
                    RatekeeperError::Config(
                        "store.redis_url is required for the redis backend".to_string(),
                    )
                })?;
                Ok(Arc::new(RedisStore::open(url, self.store.key_prefix.clone())?))
            }
        }
    }

    /// Construct a limiter from these settings.
    pub fn build_limiter(&self) -> Result<RateLimiter> {
        let store = self.build_store()?;
        let catalog = self.catalog()?;

        info!(
            store = store.name(),
            rules = catalog.len(),
            timeout_ms = self.store.timeout_ms,
            "Rate limiter configured"
        );

        Ok(RateLimiter::new(store, catalog)
            .with_store_timeout(self.store_timeout())
            .with_cas_max_retries(self.limiter.cas_max_retries))
    }
}
