//! Configuration module for tally-service.

use service_core::config as core_config;
use service_core::error::AppError;
use service_core::retry::RetryConfig;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TallyConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub tally: TallySettings,
    pub registry: RegistryConfig,
    pub publisher: PublisherConfig,
    pub enrichment: EnrichmentConfig,
    pub jobs: JobsConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct TallySettings {
    /// Hosts are written to the store every N correlated records.
    pub host_flush_interval: usize,
    pub max_facts_per_org: i64,
    /// Facts whose stale timestamp is older than this many days are not tallied.
    pub culled_offset_days: i64,
    /// RHSM-reported sla/usage is ignored once the last sync is older than this.
    pub rhsm_sync_threshold_days: i64,
    pub hourly_lookback_hours: i64,
}

impl Default for TallySettings {
    fn default() -> Self {
        Self {
            host_flush_interval: 1000,
            max_facts_per_org: 100_000,
            culled_offset_days: 14,
            rhsm_sync_threshold_days: 30,
            hourly_lookback_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub url: Option<String>,
    pub max_elapsed: Duration,
    pub initial_interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_elapsed: Duration::from_secs(60),
            initial_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub timeout: Duration,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub org_concurrency: usize,
    pub retry: RetryConfig,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            org_concurrency: 4,
            retry: RetryConfig::default(),
        }
    }
}

/// Days of history kept per granularity.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub hourly_days: i64,
    pub daily_days: i64,
    pub weekly_days: i64,
    pub monthly_days: i64,
    pub quarterly_days: i64,
    pub yearly_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            hourly_days: 90,
            daily_days: 7 * 365,
            weekly_days: 7 * 365,
            monthly_days: 7 * 365,
            quarterly_days: 10 * 365,
            yearly_days: 10 * 365,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl TallyConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let tally_defaults = TallySettings::default();
        let retention_defaults = RetentionConfig::default();
        let publisher_defaults = PublisherConfig::default();
        let enrichment_defaults = EnrichmentConfig::default();
        let jobs_defaults = JobsConfig::default();

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "tally-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: optional_env("OTLP_ENDPOINT"),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 2),
            },
            tally: TallySettings {
                host_flush_interval: parse_env(
                    "TALLY_HOST_FLUSH_INTERVAL",
                    tally_defaults.host_flush_interval,
                )
                .max(1),
                max_facts_per_org: parse_env(
                    "TALLY_MAX_FACTS_PER_ORG",
                    tally_defaults.max_facts_per_org,
                ),
                culled_offset_days: parse_env(
                    "TALLY_CULLED_OFFSET_DAYS",
                    tally_defaults.culled_offset_days,
                ),
                rhsm_sync_threshold_days: parse_env(
                    "TALLY_RHSM_SYNC_THRESHOLD_DAYS",
                    tally_defaults.rhsm_sync_threshold_days,
                ),
                hourly_lookback_hours: parse_env(
                    "TALLY_HOURLY_LOOKBACK_HOURS",
                    tally_defaults.hourly_lookback_hours,
                ),
            },
            registry: RegistryConfig {
                path: optional_env("PRODUCT_REGISTRY_PATH"),
            },
            publisher: PublisherConfig {
                url: optional_env("PUBLISHER_URL"),
                max_elapsed: Duration::from_secs(parse_env(
                    "PUBLISHER_MAX_ELAPSED_SECS",
                    publisher_defaults.max_elapsed.as_secs(),
                )),
                initial_interval: Duration::from_millis(parse_env(
                    "PUBLISHER_INITIAL_INTERVAL_MS",
                    publisher_defaults.initial_interval.as_millis() as u64,
                )),
            },
            enrichment: EnrichmentConfig {
                enabled: parse_env("ENRICHMENT_ENABLED", enrichment_defaults.enabled),
                url: optional_env("ENRICHMENT_URL"),
                timeout: Duration::from_secs(parse_env(
                    "ENRICHMENT_TIMEOUT_SECS",
                    enrichment_defaults.timeout.as_secs(),
                )),
            },
            jobs: JobsConfig {
                org_concurrency: parse_env("JOBS_ORG_CONCURRENCY", jobs_defaults.org_concurrency)
                    .max(1),
                retry: RetryConfig::with_max_retries(parse_env(
                    "JOBS_MAX_RETRIES",
                    jobs_defaults.retry.max_retries,
                )),
            },
            retention: RetentionConfig {
                hourly_days: parse_env("RETENTION_HOURLY_DAYS", retention_defaults.hourly_days),
                daily_days: parse_env("RETENTION_DAILY_DAYS", retention_defaults.daily_days),
                weekly_days: parse_env("RETENTION_WEEKLY_DAYS", retention_defaults.weekly_days),
                monthly_days: parse_env("RETENTION_MONTHLY_DAYS", retention_defaults.monthly_days),
                quarterly_days: parse_env(
                    "RETENTION_QUARTERLY_DAYS",
                    retention_defaults.quarterly_days,
                ),
                yearly_days: parse_env("RETENTION_YEARLY_DAYS", retention_defaults.yearly_days),
            },
        })
    }

    /// Configuration that needs no environment, for running against in-memory stores.
    pub fn local(port: u16) -> Self {
        Self {
            common: core_config::Config {
                port,
                ..Default::default()
            },
            service_name: "tally-service".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
            database: DatabaseConfig {
                url: String::new(),
                max_connections: 1,
                min_connections: 1,
            },
            tally: TallySettings::default(),
            registry: RegistryConfig::default(),
            publisher: PublisherConfig::default(),
            enrichment: EnrichmentConfig::default(),
            jobs: JobsConfig {
                org_concurrency: 2,
                retry: RetryConfig::quick(),
            },
            retention: RetentionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn database_url_is_required() {
        env::remove_var("DATABASE_URL");
        let err = TallyConfig::from_env().unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    #[serial]
    fn tally_settings_read_from_env_with_defaults() {
        env::set_var("DATABASE_URL", "postgres://localhost/tally");
        env::set_var("TALLY_MAX_FACTS_PER_ORG", "250");
        env::set_var("TALLY_HOST_FLUSH_INTERVAL", "0");
        env::set_var("PUBLISHER_URL", "  ");

        let config = TallyConfig::from_env().unwrap();
        assert_eq!(config.tally.max_facts_per_org, 250);
        assert_eq!(config.tally.host_flush_interval, 1);
        assert_eq!(config.tally.culled_offset_days, 14);
        assert!(config.publisher.url.is_none());

        env::remove_var("DATABASE_URL");
        env::remove_var("TALLY_MAX_FACTS_PER_ORG");
        env::remove_var("TALLY_HOST_FLUSH_INTERVAL");
        env::remove_var("PUBLISHER_URL");
    }
}
