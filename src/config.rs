use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveTime;
use chrono_tz::Tz;
use thiserror::Error;

use crate::limits::MAX_HORIZON_DAYS;
use crate::model::Ms;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("schedule file: {0}")]
    Io(#[from] std::io::Error),
    #[error("schedule document: {0}")]
    Schedule(#[from] serde_json::Error),
}

/// Tunables of the availability and reservation engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub timezone: Tz,
    /// Free gaps shorter than this are not offered.
    pub granularity_ms: Ms,
    /// Lifetime of an accepted reservation token.
    pub token_ttl_ms: Ms,
    /// Deadline for each booking-store query.
    pub store_timeout: Duration,
    /// How many days ahead reservations and queries may reach.
    pub horizon_days: u32,
    /// Branch-local time at which the next day is materialized.
    pub materialize_at: NaiveTime,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            granularity_ms: 15 * 60_000,
            token_ttl_ms: 30_000,
            store_timeout: Duration::from_secs(2),
            horizon_days: 180,
            materialize_at: NaiveTime::from_hms_opt(23, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

/// Process-level settings read from `BAYSLOT_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    pub schedule_file: PathBuf,
    pub metrics_port: Option<u16>,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub engine: EngineConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Missing variables take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = EngineConfig::default();
        let data_dir = lookup("BAYSLOT_DATA_DIR").unwrap_or_else(|| "./data".into());
        let schedule_file = lookup("BAYSLOT_SCHEDULE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&data_dir).join("schedule.json"));

        let timezone = match lookup("BAYSLOT_TIMEZONE") {
            Some(v) => Tz::from_str(&v).map_err(|e| invalid("BAYSLOT_TIMEZONE", &v, e))?,
            None => defaults.timezone,
        };
        let granularity_minutes: i64 = parse_or(&lookup, "BAYSLOT_GRANULARITY_MINUTES", 15)?;
        if granularity_minutes <= 0 {
            return Err(invalid("BAYSLOT_GRANULARITY_MINUTES", &granularity_minutes.to_string(), "must be positive"));
        }
        let token_ttl_secs: i64 = parse_or(&lookup, "BAYSLOT_TOKEN_TTL_SECS", 30)?;
        if token_ttl_secs <= 0 {
            return Err(invalid("BAYSLOT_TOKEN_TTL_SECS", &token_ttl_secs.to_string(), "must be positive"));
        }
        let store_timeout_ms: u64 = parse_or(&lookup, "BAYSLOT_STORE_TIMEOUT_MS", 2_000)?;
        let horizon_days: u32 = parse_or(&lookup, "BAYSLOT_HORIZON_DAYS", defaults.horizon_days)?;
        if horizon_days == 0 || horizon_days > MAX_HORIZON_DAYS {
            return Err(invalid("BAYSLOT_HORIZON_DAYS", &horizon_days.to_string(), "out of range"));
        }
        let materialize_at = match lookup("BAYSLOT_MATERIALIZE_AT") {
            Some(v) => NaiveTime::parse_from_str(&v, "%H:%M")
                .map_err(|e| invalid("BAYSLOT_MATERIALIZE_AT", &v, e))?,
            None => defaults.materialize_at,
        };
        let metrics_port = match lookup("BAYSLOT_METRICS_PORT") {
            Some(v) => Some(v.parse().map_err(|e| invalid("BAYSLOT_METRICS_PORT", &v, e))?),
            None => None,
        };
        let compact_threshold = parse_or(&lookup, "BAYSLOT_COMPACT_THRESHOLD", 1_000)?;

        Ok(Self {
            data_dir: PathBuf::from(data_dir),
            schedule_file,
            metrics_port,
            compact_threshold,
            engine: EngineConfig {
                timezone,
                granularity_ms: granularity_minutes * 60_000,
                token_ttl_ms: token_ttl_secs * 1_000,
                store_timeout: Duration::from_millis(store_timeout_ms),
                horizon_days,
                materialize_at,
            },
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(v) => v.trim().parse().map_err(|e| invalid(var, &v, e)),
        None => Ok(default),
    }
}

fn invalid(var: &'static str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
