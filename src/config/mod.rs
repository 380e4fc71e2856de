//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::str::FromStr;

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::CacheConfig;

pub use cli::{CliArgs, Command, FlushArgs, GlobalOverrides, GovernArgs, MemoryArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "cachekeeper";
const ENV_PREFIX: &str = "CACHEKEEPER";
const DEFAULT_STORE_URL: &str = "redis://127.0.0.1:6379/0";
const STORE_SCHEMES: &[&str] = &["redis", "rediss", "redis+unix", "unix"];
const QUOTA_SUM_TOLERANCE: f64 = 1e-6;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub store: StoreSettings,
    pub logging: LoggingSettings,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    raw.apply_global_overrides(&cli.overrides);
    if let Command::Govern(args) = &cli.command {
        raw.apply_govern_overrides(args);
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    store: RawStoreSettings,
    logging: RawLoggingSettings,
    cache: CacheConfig,
}

impl RawSettings {
    fn apply_global_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(url) = overrides.store_url.as_ref() {
            self.store.url = Some(url.clone());
        }
        if let Some(namespace) = overrides.cache_namespace.as_ref() {
            self.cache.namespace = namespace.clone();
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_govern_overrides(&mut self, overrides: &GovernArgs) {
        if let Some(seconds) = overrides.interval_seconds {
            self.cache.governor.interval_secs = seconds;
        }
        if let Some(threshold) = overrides.memory_threshold {
            self.cache.governor.memory_threshold = threshold;
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            store,
            logging,
            cache,
        } = raw;

        let store = build_store_settings(store)?;
        let logging = build_logging_settings(logging)?;
        let cache = validate_cache_config(cache)?;

        Ok(Self {
            store,
            logging,
            cache,
        })
    }
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let url = store
        .url
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_STORE_URL.to_string());

    let parsed =
        Url::parse(&url).map_err(|err| LoadError::invalid("store.url", err.to_string()))?;
    if !STORE_SCHEMES.contains(&parsed.scheme()) {
        return Err(LoadError::invalid(
            "store.url",
            format!("unsupported scheme `{}`", parsed.scheme()),
        ));
    }

    Ok(StoreSettings { url })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn validate_cache_config(cache: CacheConfig) -> Result<CacheConfig, LoadError> {
    fraction(
        "cache.consistency.refresh_ttl_fraction",
        cache.consistency.refresh_ttl_fraction,
    )?;
    fraction(
        "cache.governor.memory_threshold",
        cache.governor.memory_threshold,
    )?;
    fraction(
        "cache.governor.fallback_sample_fraction",
        cache.governor.fallback_sample_fraction,
    )?;

    let rate = cache.filter.false_positive_rate;
    if !(rate > 0.0 && rate < 1.0) {
        return Err(LoadError::invalid(
            "cache.filter.false_positive_rate",
            "must be strictly between 0 and 1",
        ));
    }
    if cache.filter.capacity == 0 {
        return Err(LoadError::invalid(
            "cache.filter.capacity",
            "must be greater than zero",
        ));
    }
    if cache.lock.lease_secs == 0 {
        return Err(LoadError::invalid(
            "cache.lock.lease_secs",
            "must be greater than zero",
        ));
    }

    let mut total = 0.0;
    for (category, share) in &cache.governor.quotas {
        if crate::cache::ImageCategory::from_str(category).is_err() {
            return Err(LoadError::invalid(
                "cache.governor.quotas",
                format!("unknown image category `{category}`"),
            ));
        }
        fraction("cache.governor.quotas", *share)?;
        total += share;
    }
    if total > 1.0 + QUOTA_SUM_TOLERANCE {
        return Err(LoadError::invalid(
            "cache.governor.quotas",
            format!("quotas add up to {total:.2}, more than the whole ceiling"),
        ));
    }

    Ok(cache)
}

fn fraction(key: &'static str, value: f64) -> Result<(), LoadError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(LoadError::invalid(key, "must be between 0 and 1"))
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
