use crate::crypto::{CryptoError, Keyring};
use crate::models::DisplayRange;
use log::info;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error(transparent)]
    Keys(#[from] CryptoError),
}

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub bind_addr: String,
    pub mongo_uri: String,
    pub mongo_database: String,
    pub redis_uri: String,
    pub mutex_expire_secs: usize,
    pub mutex_timeout_secs: usize,
    pub grid_cell_degrees: f64,
    pub search: SearchSettings,
    pub location_key: String,
    pub location_key_version: i32,
    pub previous_keys: Vec<(i32, String)>,
    pub reencrypt_batch_size: i64,
    pub reencrypt_interval_secs: u64,
}

/// Limits applied to proximity searches.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SearchSettings {
    pub default_radius_km: f64,
    pub max_radius_km: f64,
    pub display: DisplayRange,
}

impl Config {
    /// Reads the configuration from the environment, after loading `.env` if present.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let display = DisplayRange {
            min_km: vars.parse_or("DISPLAY_MIN_KM", 0.5)?,
            max_km: vars.parse_or("DISPLAY_MAX_KM", 2.0)?,
        };
        non_negative("DISPLAY_MIN_KM", display.min_km)?;
        non_negative("DISPLAY_MAX_KM", display.max_km)?;
        if display.min_km > display.max_km {
            return Err(ConfigError::Invalid {
                key: "DISPLAY_MIN_KM",
                reason: "greater than DISPLAY_MAX_KM".to_owned(),
            });
        }

        let search = SearchSettings {
            default_radius_km: vars.parse_or("DEFAULT_RADIUS_KM", 25.0)?,
            max_radius_km: vars.parse_or("MAX_RADIUS_KM", 200.0)?,
            display,
        };
        non_negative("DEFAULT_RADIUS_KM", search.default_radius_km)?;
        non_negative("MAX_RADIUS_KM", search.max_radius_km)?;

        let previous_keys = match vars.get("LOCATION_PREVIOUS_KEYS") {
            Some(raw) => parse_previous_keys(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            bind_addr: vars.get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8000".to_owned()),
            mongo_uri: vars.get("MONGO_URI").unwrap_or_else(|| "mongodb://localhost".to_owned()),
            mongo_database: vars.get("MONGO_DATABASE").unwrap_or_else(|| "cet-extra-geo".to_owned()),
            redis_uri: vars.get("REDIS_URI").unwrap_or_else(|| "redis://localhost".to_owned()),
            mutex_expire_secs: vars.parse_or("MUTEX_EXPIRE_SECS", 60)?,
            mutex_timeout_secs: vars.parse_or("MUTEX_TIMEOUT_SECS", 5)?,
            grid_cell_degrees: vars.parse_or("GRID_CELL_DEGREES", 0.5)?,
            search,
            location_key: vars.get("LOCATION_KEY").ok_or(ConfigError::Missing("LOCATION_KEY"))?,
            location_key_version: vars.parse_or("LOCATION_KEY_VERSION", 1)?,
            previous_keys,
            reencrypt_batch_size: vars.parse_or("REENCRYPT_BATCH_SIZE", 500)?,
            reencrypt_interval_secs: vars.parse_or("REENCRYPT_INTERVAL_SECS", 3600)?,
        })
    }

    pub fn keyring(&self) -> Result<Keyring, ConfigError> {
        let previous = self.previous_keys.iter().map(|(v, k)| (*v, k.as_str()));
        Ok(Keyring::from_hex(self.location_key_version, &self.location_key, previous)?)
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + Display,
        T::Err: Display,
    {
        match self.get(key) {
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
            }),
            None => {
                info!("{} not set, using default: {}", key, default);
                Ok(default)
            }
        }
    }
}

fn non_negative(key: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        return Ok(());
    }
    Err(ConfigError::Invalid {
        key,
        reason: format!("{} is not a finite non-negative number", value),
    })
}

// "2:hexkey,3:hexkey"
fn parse_previous_keys(raw: &str) -> Result<Vec<(i32, String)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (version, key) = pair.split_once(':').ok_or_else(|| ConfigError::Invalid {
                key: "LOCATION_PREVIOUS_KEYS",
                reason: format!("expected version:key, got {}", pair),
            })?;
            let version = version.trim().parse::<i32>().map_err(|e| ConfigError::Invalid {
                key: "LOCATION_PREVIOUS_KEYS",
                reason: e.to_string(),
            })?;
            Ok((version, key.trim().to_owned()))
        })
        .collect()
}
