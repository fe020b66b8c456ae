//! Pipeline configuration.
//!
//! Values come from `CLAIMS360_*` environment variables. Unset or blank
//! variables fall back to defaults; malformed values are errors.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use claims360_core::LogFormat;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What to do with a denial event that cannot be keyed or sequenced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidEventPolicy {
    /// Write the event to the quarantine table and continue.
    #[default]
    Quarantine,
    /// Reject the whole micro-batch; the stream position does not move.
    Fail,
}

impl FromStr for InvalidEventPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quarantine" => Ok(Self::Quarantine),
            "fail" => Ok(Self::Fail),
            other => Err(Error::config(format!(
                "invalid event policy must be quarantine or fail (got {other})"
            ))),
        }
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Catalog id that scopes every table path.
    pub catalog: String,
    /// Root directory for the local filesystem backend.
    pub storage_root: Option<PathBuf>,
    /// Stream application id. Keys the stream position stored in the target.
    pub app_id: String,
    /// Maximum source versions consumed per micro-batch.
    pub max_versions_per_batch: usize,
    /// Handling of invalid denial events.
    pub invalid_event_policy: InvalidEventPolicy,
    /// Materializer cadence in continuous mode.
    pub refresh_interval: Duration,
    /// Engine polling cadence in continuous mode.
    pub stream_interval: Duration,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            catalog: "claims360_dev".to_string(),
            storage_root: None,
            app_id: "fact_denial_event".to_string(),
            max_versions_per_batch: 16,
            invalid_event_policy: InvalidEventPolicy::Quarantine,
            refresh_interval: Duration::from_secs(300),
            stream_interval: Duration::from_secs(10),
            log_format: LogFormat::Pretty,
        }
    }
}

impl PipelineConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is set to an invalid value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env(lookup);
        let mut config = Self::default();

        if let Some(catalog) = env.string("CLAIMS360_CATALOG") {
            config.catalog = catalog;
        }
        config.storage_root = env.string("CLAIMS360_STORAGE_ROOT").map(PathBuf::from);
        if let Some(app_id) = env.string("CLAIMS360_APP_ID") {
            config.app_id = app_id;
        }
        if let Some(max) = env.positive_u64("CLAIMS360_MAX_VERSIONS_PER_BATCH")? {
            config.max_versions_per_batch = usize::try_from(max).map_err(|_| {
                Error::config("CLAIMS360_MAX_VERSIONS_PER_BATCH is out of range")
            })?;
        }
        if let Some(policy) = env.string("CLAIMS360_INVALID_EVENT_POLICY") {
            config.invalid_event_policy = policy.parse()?;
        }
        if let Some(secs) = env.positive_u64("CLAIMS360_REFRESH_INTERVAL_SECS")? {
            config.refresh_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env.positive_u64("CLAIMS360_STREAM_INTERVAL_SECS")? {
            config.stream_interval = Duration::from_secs(secs);
        }
        if let Some(format) = env.string("CLAIMS360_LOG_FORMAT") {
            config.log_format = format
                .parse()
                .map_err(|e: claims360_core::Error| Error::config(e.to_string()))?;
        }

        Ok(config)
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::config(format!("{name} must be a u64: {e}")))
    }

    fn positive_u64(&self, name: &str) -> Result<Option<u64>> {
        match self.u64(name)? {
            Some(0) => Err(Error::config(format!("{name} must be positive"))),
            other => Ok(other),
        }
    }
}
