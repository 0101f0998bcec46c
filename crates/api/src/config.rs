//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use common::RetryPolicy;
use domain::CancellationPolicy;
use event_bus::ConsumerConfig;
use inventory::EngineConfig;
use saga::OrchestratorConfig;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        })
    }
}

/// Server configuration with sensible defaults.
///
/// Every variable is optional:
/// - `HOST` / `PORT`: bind address (`0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter (`info`); `LOG_FORMAT`: `json` or `pretty`
/// - `DATABASE_URL`: PostgreSQL URL; unset runs on in-memory backends
/// - `RESERVATION_TTL_MINUTES` (15), `SWEEP_INTERVAL_SECS` (30), `SWEEP_BATCH_SIZE` (100)
/// - `CONSUMER_PREFETCH` (10), `MAX_DELIVERY_ATTEMPTS` (5)
/// - `OUTBOX_POLL_INTERVAL_MS` (500)
/// - `ALLOW_CANCEL_AFTER_SHIPMENT` (false)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub reservation_ttl_minutes: i64,
    pub sweep_interval: Duration,
    pub sweep_batch_size: usize,
    pub consumer_prefetch: usize,
    pub max_delivery_attempts: u32,
    pub outbox_poll_interval: Duration,
    pub allow_cancel_after_shipment: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            reservation_ttl_minutes: 15,
            sweep_interval: Duration::from_secs(30),
            sweep_batch_size: 100,
            consumer_prefetch: 10,
            max_delivery_attempts: 5,
            outbox_poll_interval: Duration::from_millis(500),
            allow_cancel_after_shipment: false,
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Config::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse(&lookup, "PORT", defaults.port)?,
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parse(&lookup, "LOG_FORMAT", defaults.log_format)?,
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            reservation_ttl_minutes: parse(
                &lookup,
                "RESERVATION_TTL_MINUTES",
                defaults.reservation_ttl_minutes,
            )?,
            sweep_interval: Duration::from_secs(parse(&lookup, "SWEEP_INTERVAL_SECS", 30)?),
            sweep_batch_size: parse(&lookup, "SWEEP_BATCH_SIZE", defaults.sweep_batch_size)?,
            consumer_prefetch: parse(&lookup, "CONSUMER_PREFETCH", defaults.consumer_prefetch)?,
            max_delivery_attempts: parse(
                &lookup,
                "MAX_DELIVERY_ATTEMPTS",
                defaults.max_delivery_attempts,
            )?,
            outbox_poll_interval: Duration::from_millis(parse(
                &lookup,
                "OUTBOX_POLL_INTERVAL_MS",
                500,
            )?),
            allow_cancel_after_shipment: parse(
                &lookup,
                "ALLOW_CANCEL_AFTER_SHIPMENT",
                defaults.allow_cancel_after_shipment,
            )?,
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_ttl(chrono::Duration::minutes(self.reservation_ttl_minutes))
            .with_sweep_batch_size(self.sweep_batch_size)
    }

    pub fn cancellation_policy(&self) -> CancellationPolicy {
        CancellationPolicy {
            allow_after_shipment: self.allow_cancel_after_shipment,
            ..CancellationPolicy::default()
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default().with_cancellation_policy(self.cancellation_policy())
    }

    pub fn consumer_config(&self, queue: &str) -> ConsumerConfig {
        ConsumerConfig::new(queue)
            .with_prefetch(self.consumer_prefetch)
            .with_max_attempts(self.max_delivery_attempts)
            .with_redelivery(RetryPolicy::exponential(
                self.max_delivery_attempts,
                Duration::from_millis(200),
                Duration::from_secs(10),
            ))
    }
}
