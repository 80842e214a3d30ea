//! Runtime configuration.
//!
//! Loaded once at startup from the environment (`.env` via `dotenv`, same as
//! the rest of this crate's ambient stack) with an optional TOML overlay,
//! matching `config_manager.cpp`'s file-plus-environment layering in the
//! original risk manager.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::errors::{RiskError, RiskResult};

/// Per-name numeric thresholds consulted by the risk evaluator and the
/// monitoring loop. Versioned: `RiskLimits::generation` bumps on every
/// `UpdateRiskLimits` call so the monitoring loop can detect a reconfigure
/// mid-tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_total_exposure: f64,
    pub max_concentration_ratio: f64,
    pub max_correlation_exposure: f64,
    pub max_leverage_ratio: f64,
    pub stress_test_threshold: f64,
    pub realtime_pnl_threshold: f64,
    pub max_portfolio_var: f64,
    pub max_single_trade_risk: f64,
    pub max_daily_trades: u32,
    pub min_spread_threshold: f64,
    pub max_alerts_per_hour: u32,
    #[serde(skip)]
    pub generation: u64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_total_exposure: 1_000_000.0,
            max_concentration_ratio: 0.25,
            max_correlation_exposure: 0.5,
            max_leverage_ratio: 3.0,
            stress_test_threshold: 0.15,
            realtime_pnl_threshold: 5_000.0,
            max_portfolio_var: 10_000.0,
            max_single_trade_risk: 2_500.0,
            max_daily_trades: 500,
            min_spread_threshold: 0.001,
            max_alerts_per_hour: 20,
            generation: 0,
        }
    }
}

impl RiskLimits {
    /// Returns a copy bumped to the next generation, as `UpdateRiskLimits`
    /// does when replacing the active snapshot.
    pub fn with_next_generation(mut self, previous_generation: u64) -> Self {
        self.generation = previous_generation + 1;
        self
    }
}

/// Scalar knobs that are not risk thresholds but still configure component
/// behavior (monitoring cadence, buffer sizes, dedupe window).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub monitoring_interval: Duration,
    pub alert_buffer_size: usize,
    pub dedupe_window: usize,
    pub equity: f64,
    pub host_tag: String,
    pub position_store_path: String,
    pub alert_store_path: String,
    /// Default `(capacity, window)` for a tenant's token bucket the
    /// first time it is addressed; individual tenants can be reconfigured
    /// afterward via `RateLimiterRegistry::configure_tenant`.
    pub rate_limit_capacity: u32,
    pub rate_limit_window: Duration,
    pub listen_addr: String,
    pub metrics_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            monitoring_interval: Duration::from_millis(1000),
            alert_buffer_size: 256,
            dedupe_window: 100_000,
            equity: 100_000.0,
            host_tag: "riskctl-local".to_string(),
            position_store_path: "./risk_positions.db".to_string(),
            alert_store_path: "./risk_alerts.db".to_string(),
            rate_limit_capacity: 50,
            rate_limit_window: Duration::from_secs(1),
            listen_addr: "0.0.0.0:8089".to_string(),
            metrics_addr: "0.0.0.0:9100".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl RiskLimits {
    /// Load risk thresholds from the environment, falling back to the
    /// published defaults for anything unset, mirroring
    /// `Config::from_env`'s `unwrap_or_else`-then-parse idiom.
    pub fn from_env() -> Self {
        let d = RiskLimits::default();
        RiskLimits {
            max_total_exposure: env_parse("MAX_TOTAL_EXPOSURE", d.max_total_exposure),
            max_concentration_ratio: env_parse(
                "MAX_CONCENTRATION_RATIO",
                d.max_concentration_ratio,
            ),
            max_correlation_exposure: env_parse(
                "MAX_CORRELATION_EXPOSURE",
                d.max_correlation_exposure,
            ),
            max_leverage_ratio: env_parse("MAX_LEVERAGE_RATIO", d.max_leverage_ratio),
            stress_test_threshold: env_parse("STRESS_TEST_THRESHOLD", d.stress_test_threshold),
            realtime_pnl_threshold: env_parse(
                "REALTIME_PNL_THRESHOLD",
                d.realtime_pnl_threshold,
            ),
            max_portfolio_var: env_parse("MAX_PORTFOLIO_VAR", d.max_portfolio_var),
            max_single_trade_risk: env_parse("MAX_SINGLE_TRADE_RISK", d.max_single_trade_risk),
            max_daily_trades: env_parse("MAX_DAILY_TRADES", d.max_daily_trades),
            min_spread_threshold: env_parse("MIN_SPREAD_THRESHOLD", d.min_spread_threshold),
            max_alerts_per_hour: env_parse("MAX_ALERTS_PER_HOUR", d.max_alerts_per_hour),
            generation: 0,
        }
    }

    /// Parse a limits record supplied by `UpdateRiskLimits`, validating
    /// that no threshold is negative (a validation error, not a crash).
    pub fn parse_update(raw: &str) -> RiskResult<RiskLimits> {
        let limits = toml::from_str::<RiskLimits>(raw)
            .map_err(|e| RiskError::validation(format!("invalid risk limits record: {e}")))?;
        limits.validate_non_negative()?;
        Ok(limits)
    }

    fn validate_non_negative(&self) -> RiskResult<()> {
        let fields: &[(&str, f64)] = &[
            ("max_total_exposure", self.max_total_exposure),
            ("max_concentration_ratio", self.max_concentration_ratio),
            ("max_correlation_exposure", self.max_correlation_exposure),
            ("max_leverage_ratio", self.max_leverage_ratio),
            ("stress_test_threshold", self.stress_test_threshold),
            ("realtime_pnl_threshold", self.realtime_pnl_threshold),
            ("max_portfolio_var", self.max_portfolio_var),
            ("max_single_trade_risk", self.max_single_trade_risk),
            ("min_spread_threshold", self.min_spread_threshold),
        ];
        for (name, value) in fields {
            if *value < 0.0 {
                return Err(RiskError::validation(format!(
                    "{name} must not be negative, got {value}"
                )));
            }
        }
        Ok(())
    }
}

impl RuntimeConfig {
    pub fn from_env() -> RiskResult<Self> {
        dotenv::dotenv().ok();
        let d = RuntimeConfig::default();

        let monitoring_interval_ms: u64 =
            env_parse("MONITORING_INTERVAL_MS", d.monitoring_interval.as_millis() as u64);

        let rate_limit_window_ms: u64 =
            env_parse("RATE_LIMIT_WINDOW_MS", d.rate_limit_window.as_millis() as u64);

        Ok(Self {
            monitoring_interval: Duration::from_millis(monitoring_interval_ms),
            alert_buffer_size: env_parse("ALERT_BUFFER_SIZE", d.alert_buffer_size),
            dedupe_window: env_parse("DEDUPE_WINDOW", d.dedupe_window),
            equity: env_parse("ACCOUNT_EQUITY", d.equity),
            host_tag: env::var("HOST_TAG").unwrap_or(d.host_tag),
            position_store_path: env::var("POSITION_STORE_PATH")
                .unwrap_or(d.position_store_path),
            alert_store_path: env::var("ALERT_STORE_PATH").unwrap_or(d.alert_store_path),
            rate_limit_capacity: env_parse("RATE_LIMIT_CAPACITY", d.rate_limit_capacity),
            rate_limit_window: Duration::from_millis(rate_limit_window_ms),
            listen_addr: env::var("LISTEN_ADDR").unwrap_or(d.listen_addr),
            metrics_addr: env::var("METRICS_ADDR").unwrap_or(d.metrics_addr),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let limits = RiskLimits::default();
        assert_eq!(limits.max_concentration_ratio, 0.25);
        assert_eq!(limits.max_leverage_ratio, 3.0);
        assert_eq!(limits.stress_test_threshold, 0.15);
        assert_eq!(limits.max_alerts_per_hour, 20);
    }

    #[test]
    fn rejects_malformed_update() {
        let err = RiskLimits::parse_update("not valid toml {{{").unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Validation);
    }

    #[test]
    fn rejects_negative_threshold() {
        let raw = r#"
            max_total_exposure = -1.0
            max_concentration_ratio = 0.25
            max_correlation_exposure = 0.5
            max_leverage_ratio = 3.0
            stress_test_threshold = 0.15
            realtime_pnl_threshold = 5000.0
            max_portfolio_var = 10000.0
            max_single_trade_risk = 2500.0
            max_daily_trades = 500
            min_spread_threshold = 0.001
            max_alerts_per_hour = 20
        "#;
        let err = RiskLimits::parse_update(raw).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Validation);
    }

    #[test]
    fn generation_bumps_monotonically() {
        let a = RiskLimits::default();
        let b = a.clone().with_next_generation(a.generation);
        assert_eq!(b.generation, a.generation + 1);
    }
}
