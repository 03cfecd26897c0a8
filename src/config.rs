//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{LimitBy, Period};

/// Limit value that disables a period.
pub const UNLIMITED: i64 = -1;

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log filter, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
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

/// Quotas and request identification for one limiter instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Accepted hits per second
    #[serde(default = "unlimited")]
    pub second: i64,

    /// Accepted hits per minute
    #[serde(default = "unlimited")]
    pub minute: i64,

    /// Accepted hits per hour
    #[serde(default = "unlimited")]
    pub hour: i64,

    /// Accepted hits per day
    #[serde(default = "unlimited")]
    pub day: i64,

    /// Accepted hits per month
    #[serde(default = "unlimited")]
    pub month: i64,

    /// Accepted hits per year
    #[serde(default = "unlimited")]
    pub year: i64,

    /// Criteria to limit by
    #[serde(default)]
    pub limit_by: LimitBy,

    /// Header to read when limiting by header
    #[serde(default)]
    pub header_name: Option<String>,

    /// Path to match when limiting by path
    #[serde(default)]
    pub path: Option<String>,

    /// Where counters are kept
    #[serde(default)]
    pub policy: Policy,

    /// Accept (true) or reject (false) requests when usage cannot be determined
    #[serde(default = "default_fault_tolerant")]
    pub fault_tolerant: bool,

    /// Do not return rate limit information in response headers
    #[serde(default)]
    pub hide_client_headers: bool,
}

/// Counter storage policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Counters shared by the handlers of this process
    #[default]
    Local,
}

fn unlimited() -> i64 {
    UNLIMITED
}

fn default_fault_tolerant() -> bool {
    true
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            second: UNLIMITED,
            minute: UNLIMITED,
            hour: UNLIMITED,
            day: UNLIMITED,
            month: UNLIMITED,
            year: UNLIMITED,
            limit_by: LimitBy::default(),
            header_name: None,
            path: None,
            policy: Policy::default(),
            fault_tolerant: default_fault_tolerant(),
            hide_client_headers: false,
        }
    }
}

impl RateLimitingConfig {
    /// Raw configured value for a period.
    pub fn raw_limit(&self, period: Period) -> i64 {
        match period {
            Period::Second => self.second,
            Period::Minute => self.minute,
            Period::Hour => self.hour,
            Period::Day => self.day,
            Period::Month => self.month,
            Period::Year => self.year,
        }
    }

    /// Limit for a period, or `None` when the period is unlimited.
    pub fn limit(&self, period: Period) -> Option<u64> {
        u64::try_from(self.raw_limit(period)).ok()
    }

    /// Enabled periods with their limits, shortest period first.
    pub fn enabled_periods(&self) -> impl Iterator<Item = (Period, u64)> + '_ {
        Period::ALL
            .into_iter()
            .filter_map(move |period| self.limit(period).map(|limit| (period, limit)))
    }

    /// Parse from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| {
                TollgateError::Config(format!("Failed to parse rate limiting config: {}", e))
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| {
                TollgateError::Config(format!("Failed to parse rate limiting config: {}", e))
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        for period in Period::ALL {
            let limit = self.raw_limit(period);
            if limit < UNLIMITED {
                return Err(TollgateError::Config(format!(
                    "{} limit must be {} or a non-negative number, got {}",
                    period, UNLIMITED, limit
                )));
            }
        }

        if self.enabled_periods().next().is_none() {
            return Err(TollgateError::Config(
                "at least one of second, minute, hour, day, month or year must be set".to_string(),
            ));
        }

        if let Some(name) = &self.header_name {
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !valid {
                return Err(TollgateError::Config(format!("invalid header_name: {:?}", name)));
            }
        }

        if let Some(path) = &self.path {
            if !path.starts_with('/') {
                return Err(TollgateError::Config(format!("path must start with '/': {:?}", path)));
            }
        }

        match self.limit_by {
            LimitBy::Header if self.header_name.is_none() => Err(TollgateError::Config(
                "header_name is required when limit_by is header".to_string(),
            )),
            LimitBy::Path if self.path.is_none() => Err(TollgateError::Config(
                "path is required when limit_by is path".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl TollgateConfig {
    /// Load configuration from a file, with `TOLLGATE__` environment overrides.
    ///
    /// `TOLLGATE__RATE_LIMITING__MINUTE=10` overrides `rate_limiting.minute`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let config: TollgateConfig = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(
                ::config::Environment::with_prefix("TOLLGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))?;

        config.rate_limiting.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.rate_limiting.validate()?;
        Ok(config)
    }
}
