//! Process configuration for the dispatch core.

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{
    dispatcher::DispatcherSettings,
    pool::ConnectionArgs,
    request::DEFAULT_FILTER_HOST,
    retry::{BackoffPolicy, DeliverySpec, RetryConfig},
};

const CONFIG_FILE: &str = "herald.toml";
const ENV_PREFIX: &str = "HERALD_";

/// Dispatch configuration with defaults, file, and environment overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed with `HERALD_` (highest priority)
/// 2. Configuration file (`herald.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// # Example
///
/// ```no_run
/// use herald_dispatch::config::DispatchConfig;
///
/// let config = DispatchConfig::load().expect("Failed to load configuration");
/// println!("retrying up to {} times", config.retry_max);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    // Connection pool
    /// Upper bound on idle connections per client. Zero means no limit.
    ///
    /// Environment variable: `HERALD_MAX_IDLE_CONNS`
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: usize,
    /// Idle connections kept per host. Zero means no limit.
    ///
    /// Environment variable: `HERALD_MAX_IDLE_CONNS_PER_HOST`
    #[serde(default = "default_max_idle_conns_per_host")]
    pub max_idle_conns_per_host: usize,

    // Retry
    /// Retries after the first attempt.
    ///
    /// Environment variable: `HERALD_RETRY_MAX`
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,
    /// Backoff growth, `linear` or `exponential`.
    ///
    /// Environment variable: `HERALD_BACKOFF_POLICY`
    #[serde(default = "default_backoff_policy")]
    pub backoff_policy: BackoffPolicy,
    /// Base backoff delay in milliseconds.
    ///
    /// Environment variable: `HERALD_BACKOFF_DELAY_MS`
    #[serde(default = "default_backoff_delay_ms")]
    pub backoff_delay_ms: u64,
    /// Per-attempt timeout in milliseconds. Unset means no timeout.
    ///
    /// Environment variable: `HERALD_REQUEST_TIMEOUT_MS`
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Ceiling for honored `Retry-After` delays in milliseconds. Unset
    /// ignores `Retry-After`.
    ///
    /// Environment variable: `HERALD_RETRY_AFTER_MAX_MS`
    #[serde(default)]
    pub retry_after_max_ms: Option<u64>,

    // Dispatch
    /// Host of the filter component whose failure responses carry the
    /// real failing destination and body.
    ///
    /// Environment variable: `HERALD_FILTER_HOST`
    #[serde(default = "default_filter_host")]
    pub filter_host: String,
    /// `User-Agent` sent by pooled clients.
    ///
    /// Environment variable: `HERALD_USER_AGENT`
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    // Logging
    /// Log filter used when `RUST_LOG` is not set.
    ///
    /// Environment variable: `HERALD_RUST_LOG`
    #[serde(default = "default_log_level")]
    pub rust_log: String,
}

impl DispatchConfig {
    /// Load configuration from defaults, `herald.toml`, and `HERALD_`
    /// environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_FILE)
    }

    /// Like [`DispatchConfig::load`], reading the file at `path`. A missing
    /// file is skipped.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Connection tuning for the pool.
    pub fn to_connection_args(&self) -> ConnectionArgs {
        ConnectionArgs {
            max_idle_conns: self.max_idle_conns,
            max_idle_conns_per_host: self.max_idle_conns_per_host,
        }
    }

    /// Delivery spec equivalent of the retry settings.
    pub fn to_delivery_spec(&self) -> DeliverySpec {
        DeliverySpec {
            retry: Some(self.retry_max),
            backoff_policy: Some(self.backoff_policy),
            backoff_delay: Some(Duration::from_millis(self.backoff_delay_ms)),
            timeout: self.request_timeout_ms.map(Duration::from_millis),
            retry_after_max: self.retry_after_max_ms.map(Duration::from_millis),
        }
    }

    /// Default retry policy for dispatches.
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::from_delivery_spec(&self.to_delivery_spec())
    }

    /// Dispatcher settings.
    pub fn to_dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings { filter_host: self.filter_host.clone() }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.max_idle_conns > 0 && self.max_idle_conns_per_host > self.max_idle_conns {
            anyhow::bail!("max_idle_conns_per_host cannot exceed max_idle_conns");
        }

        if self.request_timeout_ms == Some(0) {
            anyhow::bail!("request_timeout_ms must be greater than 0 when set");
        }

        if self.filter_host.trim().is_empty() {
            anyhow::bail!("filter_host must not be empty");
        }

        if self.user_agent.trim().is_empty() {
            anyhow::bail!("user_agent must not be empty");
        }

        Ok(())
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_idle_conns: default_max_idle_conns(),
            max_idle_conns_per_host: default_max_idle_conns_per_host(),
            retry_max: default_retry_max(),
            backoff_policy: default_backoff_policy(),
            backoff_delay_ms: default_backoff_delay_ms(),
            request_timeout_ms: None,
            retry_after_max_ms: None,
            filter_host: default_filter_host(),
            user_agent: default_user_agent(),
            rust_log: default_log_level(),
        }
    }
}

fn default_max_idle_conns() -> usize {
    1000
}

fn default_max_idle_conns_per_host() -> usize {
    100
}

fn default_retry_max() -> u32 {
    3
}

fn default_backoff_policy() -> BackoffPolicy {
    BackoffPolicy::Exponential
}

fn default_backoff_delay_ms() -> u64 {
    200
}

fn default_filter_host() -> String {
    DEFAULT_FILTER_HOST.to_string()
}

fn default_user_agent() -> String {
    format!("herald/{}", env!("CARGO_PKG_VERSION"))
}

fn default_log_level() -> String {
    "info,herald=debug".to_string()
}
