//! Pipeline configuration.
//!
//! Follows the same `*Config::from_env()` convention used elsewhere in
//! this codebase (session and book-store configs): every field has a sane
//! default, and `from_env` only overrides the ones present in the
//! environment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub trading_pairs: Vec<String>,
    pub rest_update_interval_seconds: f64,
    pub standardization_duration_hours: i64,
    pub safety_margin_pct: f64,
    pub rate_limiter_retry_interval_seconds: f64,
    pub past_diffs_window_size: usize,
    pub saved_message_queue_size: usize,
    pub ws_message_timeout_seconds: f64,
    pub ws_connection_timeout_seconds: f64,
    pub outdated_trade_age_seconds: f64,
    pub trade_rest_refresh_min_seconds: f64,
    pub snapshot_timeout_seconds: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            trading_pairs: Vec::new(),
            rest_update_interval_seconds: 10.0,
            standardization_duration_hours: 24,
            safety_margin_pct: 0.05,
            rate_limiter_retry_interval_seconds: 0.1,
            past_diffs_window_size: 32,
            saved_message_queue_size: 1000,
            ws_message_timeout_seconds: 30.0,
            ws_connection_timeout_seconds: 60.0,
            outdated_trade_age_seconds: 180.0,
            trade_rest_refresh_min_seconds: 5.0,
            snapshot_timeout_seconds: 60.0,
        }
    }
}

impl PipelineConfig {
    /// Load defaults, then apply overrides from the process environment.
    /// `.env` is loaded first (if present) via `dotenvy`, before reading
    /// `std::env`.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();

        if let Ok(v) = std::env::var("PIPELINE_TRADING_PAIRS") {
            config.trading_pairs = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("PIPELINE_REST_UPDATE_INTERVAL_SECONDS") {
            config.rest_update_interval_seconds =
                v.parse().unwrap_or(config.rest_update_interval_seconds);
        }
        if let Ok(v) = std::env::var("PIPELINE_STANDARDIZATION_DURATION_HOURS") {
            config.standardization_duration_hours = v
                .parse()
                .unwrap_or(config.standardization_duration_hours);
        }
        if let Ok(v) = std::env::var("PIPELINE_SAFETY_MARGIN_PCT") {
            config.safety_margin_pct = v.parse().unwrap_or(config.safety_margin_pct);
        }
        if let Ok(v) = std::env::var("PIPELINE_RATE_LIMITER_RETRY_INTERVAL_SECONDS") {
            config.rate_limiter_retry_interval_seconds = v
                .parse()
                .unwrap_or(config.rate_limiter_retry_interval_seconds);
        }
        if let Ok(v) = std::env::var("PIPELINE_WS_MESSAGE_TIMEOUT_SECONDS") {
            config.ws_message_timeout_seconds =
                v.parse().unwrap_or(config.ws_message_timeout_seconds);
        }
        if let Ok(v) = std::env::var("PIPELINE_WS_CONNECTION_TIMEOUT_SECONDS") {
            config.ws_connection_timeout_seconds = v
                .parse()
                .unwrap_or(config.ws_connection_timeout_seconds);
        }

        config
    }

    pub fn from_file(path: &std::path::Path) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Misconfigured(format!("reading {path:?}: {e}")))?;
        toml::from_str(&text)
            .map_err(|e| PipelineError::Misconfigured(format!("parsing {path:?}: {e}")))
    }

    pub fn rate_limiter_retry_interval(&self) -> Duration {
        Duration::from_secs_f64(self.rate_limiter_retry_interval_seconds.max(0.0))
    }

    pub fn ws_message_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ws_message_timeout_seconds.max(0.0))
    }

    pub fn ws_connection_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ws_connection_timeout_seconds.max(0.0))
    }

    pub fn rest_update_interval(&self) -> Duration {
        Duration::from_secs_f64(self.rest_update_interval_seconds.max(0.0))
    }

    pub fn outdated_trade_age(&self) -> Duration {
        Duration::from_secs_f64(self.outdated_trade_age_seconds.max(0.0))
    }

    pub fn trade_rest_refresh_min(&self) -> Duration {
        Duration::from_secs_f64(self.trade_rest_refresh_min_seconds.max(0.0))
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.snapshot_timeout_seconds.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.standardization_duration_hours, 24);
        assert_eq!(config.past_diffs_window_size, 32);
        assert_eq!(config.saved_message_queue_size, 1000);
        assert!((config.safety_margin_pct - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn from_file_roundtrips_toml() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("pipeline-config-test-{:p}.toml", &dir));
        std::fs::write(
            &path,
            "trading_pairs = [\"BTC-USDT\"]\nstandardization_duration_hours = 8\n",
        )
        .unwrap();
        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.trading_pairs, vec!["BTC-USDT".to_string()]);
        assert_eq!(config.standardization_duration_hours, 8);
        let _ = std::fs::remove_file(&path);
    }
}
