use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer};
use tracing::level_filters::LevelFilter;

use crate::bus::DEFAULT_NOTIFIER_CAPACITY;
use crate::caching::DEFAULT_REFRESH_THROTTLE;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: false,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "cachestate".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Settings of a cached operation.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a persisted result stays fresh, in milliseconds.
    pub max_age_ms: u64,

    /// The minimum spacing between two producer invocations for the same key.
    #[serde(with = "humantime_serde")]
    pub refresh_throttle: Duration,

    /// How many signals a bus channel buffers per subscriber before it starts lagging.
    pub notifier_capacity: usize,

    /// The name of a bus notifier whose signals invalidate and refresh keys.
    pub updated_notifier_key: Option<String>,

    /// The name of a bus notifier whose signals invalidate keys.
    pub invalidated_notifier_key: Option<String>,

    /// Ignore invalidation signals that do not name a key.
    pub invalidate_only_specific: bool,

    /// Ignore invalidate-and-update signals that do not name a key.
    pub update_only_specific: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 60_000,
            refresh_throttle: DEFAULT_REFRESH_THROTTLE,
            notifier_capacity: DEFAULT_NOTIFIER_CAPACITY,
            updated_notifier_key: None,
            invalidated_notifier_key: None,
            invalidate_only_specific: false,
            update_only_specific: false,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging settings.
    pub logging: Logging,

    /// Metrics settings.
    pub metrics: Metrics,

    /// Defaults for every cached operation.
    pub cache: CacheConfig,
}

impl Config {
    /// Loads the configuration file at `path`, or returns the defaults if there is none.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        let config = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        Ok(config)
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
