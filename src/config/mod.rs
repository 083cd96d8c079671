//! Configuration layer: typed settings with layered precedence (file → env).

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "stormo";
const ENV_PREFIX: &str = "STORMO";

const DEFAULT_ENDPOINT: &str = "127.0.0.1:2181";
const DEFAULT_NAMESPACE: &str = "stormo";
const DEFAULT_EVICTION_REAPER_INTERVAL_SECS: u64 = 30;
const DEFAULT_NUM_LOCKS: u32 = 300;
const DEFAULT_MAX_RETRIES: u32 = 10;
const DEFAULT_WORKER_POOL_SIZE: usize = 4;
const DEFAULT_RELOAD_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Root settings for a stormo deployment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub coordination: CoordinationSettings,
    pub scheduler: SchedulerSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Load settings from an optional file plus `STORMO_*` environment
    /// overrides (e.g. `STORMO_COORDINATION__NAMESPACE`).
    ///
    /// Without an explicit file, `stormo.{toml,json,yaml}` in the working
    /// directory is used when present.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        builder = match file {
            Some(path) => builder.add_source(File::from(path)),
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false)),
        };
        let settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }
}

/// Coordination-service connection and protocol knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinationSettings {
    /// Coordination-service address.
    pub endpoint: String,
    /// Namespace isolating this deployment's state.
    pub namespace: String,
    /// Period of the leaderless eviction reap timer.
    pub eviction_reaper_interval_secs: u64,
    /// Size of the distributed mutex pool.
    pub num_locks: u32,
    /// Bound on compare-and-swap retries for shared-value writes.
    pub max_retries: u32,
}

impl Default for CoordinationSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            eviction_reaper_interval_secs: DEFAULT_EVICTION_REAPER_INTERVAL_SECS,
            num_locks: DEFAULT_NUM_LOCKS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl CoordinationSettings {
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_reaper_interval_secs.max(1))
    }
}

/// Reload scheduler knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Upper bound on concurrently running reload jobs.
    pub worker_pool_size: usize,
    /// Cache segments managed by the scheduler.
    pub segments: Vec<SegmentSettings>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            segments: Vec::new(),
        }
    }
}

/// One named cache segment.
#[derive(Debug, Clone, Deserialize)]
pub struct SegmentSettings {
    pub name: String,
    #[serde(default = "default_reload_interval_ms")]
    pub reload_interval_ms: u64,
}

impl SegmentSettings {
    pub fn new(name: impl Into<String>, reload_interval_ms: u64) -> Self {
        Self {
            name: name.into(),
            reload_interval_ms,
        }
    }

    pub fn reload_interval(&self) -> time::Duration {
        time::Duration::milliseconds(self.reload_interval_ms as i64)
    }
}

fn default_reload_interval_ms() -> u64 {
    DEFAULT_RELOAD_INTERVAL_MS
}

/// Log verbosity, convertible into a tracing level filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let settings = Settings::default();
        assert_eq!(settings.coordination.endpoint, "127.0.0.1:2181");
        assert_eq!(settings.coordination.namespace, "stormo");
        assert_eq!(settings.coordination.eviction_reaper_interval_secs, 30);
        assert_eq!(settings.coordination.num_locks, 300);
        assert_eq!(settings.coordination.max_retries, 10);
        assert_eq!(settings.scheduler.worker_pool_size, 4);
        assert!(settings.scheduler.segments.is_empty());
        assert_eq!(settings.logging.level, LogLevel::Info);
        assert_eq!(settings.logging.format, LogFormat::Compact);
    }

    #[test]
    fn segment_interval_conversion() {
        let segment = SegmentSettings::new("t1", 1500);
        assert_eq!(segment.reload_interval(), time::Duration::milliseconds(1500));
    }

    #[test]
    fn reaper_interval_has_a_floor() {
        let settings = CoordinationSettings {
            eviction_reaper_interval_secs: 0,
            ..CoordinationSettings::default()
        };
        assert_eq!(settings.reaper_interval(), Duration::from_secs(1));
    }

    #[test]
    fn settings_deserialize_from_toml() {
        let raw = r#"
            [coordination]
            endpoint = "zk1:2181"
            namespace = "warehouse"
            max_retries = 3

            [scheduler]
            worker_pool_size = 2

            [[scheduler.segments]]
            name = "t1"
            reload_interval_ms = 1000

            [[scheduler.segments]]
            name = "t2"

            [logging]
            level = "debug"
            format = "json"
        "#;
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .expect("build")
            .try_deserialize()
            .expect("deserialize");

        assert_eq!(settings.coordination.endpoint, "zk1:2181");
        assert_eq!(settings.coordination.namespace, "warehouse");
        assert_eq!(settings.coordination.max_retries, 3);
        // Unset keys keep their defaults.
        assert_eq!(settings.coordination.num_locks, 300);
        assert_eq!(settings.scheduler.segments.len(), 2);
        assert_eq!(settings.scheduler.segments[0].reload_interval_ms, 1000);
        assert_eq!(
            settings.scheduler.segments[1].reload_interval_ms,
            DEFAULT_RELOAD_INTERVAL_MS
        );
        assert_eq!(settings.logging.level, LogLevel::Debug);
        assert_eq!(settings.logging.format, LogFormat::Json);
    }
}
