use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::BookingPolicy;
use crate::limits::DEFAULT_MAX_CONNECTIONS;

/// Server settings, read once at startup from `CAMPSITE_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub policy: BookingPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    NotPositive(&'static str),
    EmptyWindow { min_days_ahead: u32, max_days_ahead: u32 },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "{var}: cannot parse {value:?}"),
            ConfigError::NotPositive(var) => write!(f, "{var} must be a positive number of days"),
            ConfigError::EmptyWindow { min_days_ahead, max_days_ahead } => write!(
                f,
                "CAMPSITE_MIN_DAYS_AHEAD ({min_days_ahead}) exceeds CAMPSITE_MAX_DAYS_AHEAD ({max_days_ahead})"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = BookingPolicy::default();
        let policy = BookingPolicy {
            max_stay_length: days(&lookup, "CAMPSITE_MAX_STAY_LENGTH", defaults.max_stay_length)?,
            default_listing_length: days(
                &lookup,
                "CAMPSITE_DEFAULT_LISTING_LENGTH",
                defaults.default_listing_length,
            )?,
            min_days_ahead: days(&lookup, "CAMPSITE_MIN_DAYS_AHEAD", defaults.min_days_ahead)?,
            max_days_ahead: days(&lookup, "CAMPSITE_MAX_DAYS_AHEAD", defaults.max_days_ahead)?,
        };
        if policy.min_days_ahead > policy.max_days_ahead {
            return Err(ConfigError::EmptyWindow {
                min_days_ahead: policy.min_days_ahead,
                max_days_ahead: policy.max_days_ahead,
            });
        }

        Ok(Self {
            bind: lookup("CAMPSITE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "CAMPSITE_PORT", 5433)?,
            data_dir: PathBuf::from(lookup("CAMPSITE_DATA_DIR").unwrap_or_else(|| "./data".into())),
            max_connections: parse_or(&lookup, "CAMPSITE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?,
            compact_threshold: parse_or(&lookup, "CAMPSITE_COMPACT_THRESHOLD", 1000)?,
            metrics_port: parse_opt(&lookup, "CAMPSITE_METRICS_PORT")?,
            policy,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservations.wal")
    }
}

fn parse_opt<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    Ok(parse_opt(lookup, var)?.unwrap_or(default))
}

fn days(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, default: u32) -> Result<u32, ConfigError> {
    let n = parse_or(lookup, var, default)?;
    if n == 0 {
        return Err(ConfigError::NotPositive(var));
    }
    Ok(n)
}
