//! Configuration for the sync engine.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

pub const ENV_MAX_WORKERS: &str = "ARTISYNC_MAX_WORKERS";
pub const ENV_POLL_INTERVAL_MS: &str = "ARTISYNC_POLL_INTERVAL_MS";
pub const ENV_SILENT: &str = "ARTISYNC_SILENT";
pub const ENV_STAGING_DIR: &str = "ARTISYNC_STAGING_DIR";
pub const ENV_RUN_GROUP: &str = "ARTISYNC_RUN_GROUP";

/// Configuration of a [`SyncSession`](crate::SyncSession).
///
/// Durations serialize as integer milliseconds (`poll_interval_ms`,
/// `resubmit_delay_ms`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound on concurrently executing upload jobs.
    pub max_workers: usize,
    /// Delay between remote state polls in `wait`.
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    /// Delay before a job is resubmitted after a transient backend failure.
    #[serde(rename = "resubmit_delay_ms", with = "millis")]
    pub resubmit_delay: Duration,
    pub max_resubmits: u32,
    /// Demote transfer error lines to debug traces.
    pub silent: bool,
    /// Root of temporary upload copies.
    pub staging_dir: PathBuf,
    /// Group used by `upsert_artifact`/`finish_artifact` without an explicit id.
    pub run_group: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            poll_interval: Duration::from_secs(1),
            resubmit_delay: Duration::from_millis(500),
            max_resubmits: 3,
            silent: false,
            staging_dir: artisync_core::artifact::default_staging_dir(),
            run_group: None,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with the `ARTISYNC_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().overlay_env(|key| std::env::var(key).ok())
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, SyncError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Apply `ARTISYNC_*` values returned by `lookup`. Malformed values are
    /// ignored with a warning.
    pub fn overlay_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_MAX_WORKERS) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => self.max_workers = n,
                _ => tracing::warn!(var = ENV_MAX_WORKERS, value = %raw, "ignoring malformed value"),
            }
        }
        if let Some(raw) = lookup(ENV_POLL_INTERVAL_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => self.poll_interval = Duration::from_millis(ms),
                Err(_) => {
                    tracing::warn!(var = ENV_POLL_INTERVAL_MS, value = %raw, "ignoring malformed value")
                }
            }
        }
        if let Some(raw) = lookup(ENV_SILENT) {
            match parse_bool(&raw) {
                Some(silent) => self.silent = silent,
                None => tracing::warn!(var = ENV_SILENT, value = %raw, "ignoring malformed value"),
            }
        }
        if let Some(raw) = lookup(ENV_STAGING_DIR) {
            if raw.trim().is_empty() {
                tracing::warn!(var = ENV_STAGING_DIR, "ignoring empty value");
            } else {
                self.staging_dir = PathBuf::from(raw);
            }
        }
        if let Some(raw) = lookup(ENV_RUN_GROUP) {
            let group = raw.trim();
            self.run_group = (!group.is_empty()).then(|| group.to_string());
        }
        self
    }

    /// Sets the worker count (at least one).
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_resubmit_delay(mut self, delay: Duration) -> Self {
        self.resubmit_delay = delay;
        self
    }

    pub fn with_max_resubmits(mut self, max: u32) -> Self {
        self.max_resubmits = max;
        self
    }

    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    pub fn with_run_group(mut self, group: impl Into<String>) -> Self {
        self.run_group = Some(group.into());
        self
    }

    /// Effective worker count; a zero from deserialization still runs one.
    pub fn workers(&self) -> usize {
        self.max_workers.max(1)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
