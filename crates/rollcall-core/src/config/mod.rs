//! Runtime configuration for the sync core.
//!
//! `SyncSettings` carries the timing and bounds used by every component;
//! `RemoteConfig` locates the REST endpoint used by the HTTP transport.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::blank_to_none;

/// Tunables shared by the batcher, resolver, reconciler and health monitor.
///
/// Every field has a default, so a partial JSON document is a valid override.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    /// Delay between the first enqueue and the automatic flush
    pub batch_window_ms: u64,
    /// Largest number of records sent in one bulk upsert
    pub max_batch_size: usize,
    /// Attempts per queued write before it is parked
    pub max_flush_attempts: u32,
    /// Base retry delay, multiplied by the attempt number
    pub retry_delay_ms: u64,
    pub health_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub remote_timeout_secs: u64,
    /// Reconnect probes after a failed health check before going offline
    pub max_reconnect_attempts: u32,
    /// Age after which an in-flight operation is evicted
    pub in_flight_horizon_secs: u64,
    pub stale_sweep_interval_secs: u64,
    /// Capacity of the persisted diagnostic ring buffer
    pub diagnostic_capacity: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_window_ms: 500,
            max_batch_size: 50,
            max_flush_attempts: 3,
            retry_delay_ms: 1_000,
            health_interval_secs: 30,
            probe_timeout_secs: 10,
            remote_timeout_secs: 10,
            max_reconnect_attempts: 3,
            in_flight_horizon_secs: 300,
            stale_sweep_interval_secs: 60,
            diagnostic_capacity: 50,
        }
    }
}

impl SyncSettings {
    /// Parse a (possibly partial) JSON override document.
    pub fn from_json(payload: &str) -> Result<Self, String> {
        let settings: Self = serde_json::from_str(payload)
            .map_err(|error| format!("invalid sync settings JSON: {error}"))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_batch_size == 0 {
            return Err("max_batch_size must be at least 1".to_string());
        }
        if self.max_flush_attempts == 0 {
            return Err("max_flush_attempts must be at least 1".to_string());
        }
        if self.health_interval_secs == 0 || self.stale_sweep_interval_secs == 0 {
            return Err("timer intervals must be greater than zero".to_string());
        }
        Ok(())
    }

    pub const fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub const fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub const fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    pub const fn in_flight_horizon(&self) -> Duration {
        Duration::from_secs(self.in_flight_horizon_secs)
    }

    pub const fn stale_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.stale_sweep_interval_secs)
    }
}

/// Location and key of the remote REST endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub url: String,
    pub api_key: String,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RemoteConfig")
            .field("url", &self.url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl RemoteConfig {
    /// Build a config, normalizing the URL and rejecting empty values.
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, String> {
        let url = normalize_required_http_url(url.into(), "url")?;
        let api_key = normalize_required_value(api_key.into(), "api_key")?;
        Ok(Self { url, api_key })
    }

    /// Build a config from optional parts, returning `None` when either is unset.
    pub fn from_parts(
        url: Option<String>,
        api_key: Option<String>,
    ) -> Result<Option<Self>, String> {
        match (blank_to_none(url), blank_to_none(api_key)) {
            (Some(url), Some(api_key)) => Self::new(url, api_key).map(Some),
            (None, None) => Ok(None),
            (Some(_), None) => Err("remote api_key is required when url is set".to_string()),
            (None, Some(_)) => Err("remote url is required when api_key is set".to_string()),
        }
    }
}

fn normalize_required_value(raw: String, field: &str) -> Result<String, String> {
    blank_to_none(Some(raw)).ok_or_else(|| format!("remote field '{field}' is required"))
}

fn normalize_required_http_url(raw: String, field: &str) -> Result<String, String> {
    let value = normalize_required_value(raw, field)?;
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(value.trim_end_matches('/').to_string())
    } else {
        Err(format!(
            "remote field '{field}' must include http:// or https://"
        ))
    }
}
