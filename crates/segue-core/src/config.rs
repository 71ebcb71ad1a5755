//! Engine configuration
//!
//! Every option is a named field with a default; missing fields in JSON input
//! fall back to those defaults.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub buffering: BufferingConfig,
    pub ads: AdConfig,
    pub redundancy: RedundancyConfig,
    pub fragment_cache: FragmentCacheConfig,
    pub transport: TransportConfig,
    pub playback: PlaybackConfig,
}

impl EngineConfig {
    /// Parse from a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Reject values that would break timers or scoring
    pub fn validate(&self) -> Result<()> {
        let threshold = self.ads.health_score_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::InvalidConfig(format!(
                "ads.health_score_threshold must be within [0, 1], got {threshold}"
            )));
        }
        if self.ads.health_interval_ms == 0 {
            return Err(Error::InvalidConfig("ads.health_interval_ms must be > 0".into()));
        }
        if self.ads.stall_timeout_ms == 0 {
            return Err(Error::InvalidConfig("ads.stall_timeout_ms must be > 0".into()));
        }
        for (name, value) in [
            ("buffering.startup_min_buffer", self.buffering.startup_min_buffer),
            ("buffering.rebuffer_min_buffer", self.buffering.rebuffer_min_buffer),
        ] {
            if matches!(value, Some(v) if v <= 0.0 || !v.is_finite()) {
                return Err(Error::InvalidConfig(format!("{name} must be a positive number")));
            }
        }
        if self.fragment_cache.max_entries == 0 || self.fragment_cache.max_duration_secs <= 0.0 {
            return Err(Error::InvalidConfig(
                "fragment_cache ceilings must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Buffer-level gating for startup and rebuffer recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferingConfig {
    /// Seconds that must be buffered before startup playback begins (None = no gate)
    pub startup_min_buffer: Option<f64>,
    /// Seconds that must be buffered before leaving a rebuffer (None = no gate)
    pub rebuffer_min_buffer: Option<f64>,
    /// Upper bound on how long playback rate is held at 0 waiting for the gate
    pub buffer_level_timeout_ms: u64,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            startup_min_buffer: None,
            rebuffer_min_buffer: None,
            buffer_level_timeout_ms: 5000,
        }
    }
}

impl BufferingConfig {
    pub fn buffer_level_timeout(&self) -> Duration {
        Duration::from_millis(self.buffer_level_timeout_ms)
    }
}

/// What to do with a stalled ad creative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StallHandling {
    /// Reload the same creative, bounded by `max_stall_retries`
    Retry,
    /// Advance to the next creative
    Skip,
}

/// Ad break behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdConfig {
    /// Ad-decision endpoint for pod fetches
    pub ad_decision_url: Option<String>,
    /// Timeout for the ad-decision request
    pub ad_fetch_timeout_ms: u64,
    /// Stall policy
    pub stall_handling: StallHandling,
    /// Delay after creative load before the stall inspection runs
    pub stall_timeout_ms: u64,
    /// Reloads allowed per creative before a stall forces a skip
    pub max_stall_retries: u32,
    /// Run the health checker during creative playback
    pub health_enabled: bool,
    /// Blended score below which health is reported low
    pub health_score_threshold: f64,
    /// Health sampling interval
    pub health_interval_ms: u64,
    /// Retries allowed per creative after a low-health report
    pub max_health_retries: u32,
}

impl Default for AdConfig {
    fn default() -> Self {
        Self {
            ad_decision_url: None,
            ad_fetch_timeout_ms: 8000,
            stall_handling: StallHandling::Retry,
            stall_timeout_ms: 10_000,
            max_stall_retries: 3,
            health_enabled: true,
            health_score_threshold: 0.6,
            health_interval_ms: 5000,
            max_health_retries: 0,
        }
    }
}

impl AdConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }
}

/// Segment pipeline download redundancy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedundancyConfig {
    /// Download segment n+1 while segment n is transmuxed and appended
    pub enabled: bool,
    /// Extra attempts per segment request
    pub retry_count: u32,
    /// Per-attempt segment timeout
    pub segment_timeout_ms: u64,
    /// Per-attempt manifest timeout
    pub manifest_timeout_ms: u64,
}

impl Default for RedundancyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_count: 2,
            segment_timeout_ms: 10_000,
            manifest_timeout_ms: 8000,
        }
    }
}

/// Fragment cache ceilings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentCacheConfig {
    /// Maximum cached duration per track type, in seconds
    pub max_duration_secs: f64,
    /// Maximum cached entries per track type
    pub max_entries: usize,
}

impl Default for FragmentCacheConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: 70.0,
            max_entries: 40,
        }
    }
}

/// HTTP transport retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 2,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 4000,
            request_timeout_ms: 10_000,
        }
    }
}

/// Content session behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Re-attach the content element after ads instead of reloading, when ads did not use it
    pub reuse_element_after_ads: bool,
    /// Media-error recoveries before the error becomes fatal
    pub max_media_error_recoveries: u32,
    /// Manifest-timeout reloads before the error becomes fatal
    pub max_manifest_timeout_retries: u32,
    /// Session exists only to play ads (no content URL required)
    pub ad_player_mode: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            reuse_element_after_ads: true,
            max_media_error_recoveries: 3,
            max_manifest_timeout_retries: 1,
            ad_player_mode: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.buffering.buffer_level_timeout_ms, 5000);
        assert_eq!(config.ads.stall_handling, StallHandling::Retry);
        assert_eq!(config.ads.max_stall_retries, 3);
        assert_eq!(config.ads.health_score_threshold, 0.6);
        assert_eq!(config.fragment_cache.max_duration_secs, 70.0);
        assert_eq!(config.fragment_cache.max_entries, 40);
        assert_ok!(config.validate());
    }

    #[test]
    fn test_partial_json() {
        let config = assert_ok!(EngineConfig::from_json_str(
            r#"{"ads": {"stall_handling": "skip"}, "buffering": {"startup_min_buffer": 4.0}}"#,
        ));
        assert_eq!(config.ads.stall_handling, StallHandling::Skip);
        assert_eq!(config.ads.stall_timeout_ms, 10_000);
        assert_eq!(config.buffering.startup_min_buffer, Some(4.0));
    }

    #[test]
    fn test_rejects_bad_threshold() {
        let err = assert_err!(EngineConfig::from_json_str(
            r#"{"ads": {"health_score_threshold": 1.5}}"#
        ));
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
