//! Parametric value-at-risk over a retained ring of per-snapshot total-P&L
//! samples.
//!
//! Follows the same `VaRCalculator` shape used elsewhere in this stack: a
//! fixed-size ring buffer plus a z-score lookup, using `statrs` for the
//! normal quantile. That calculator works over a *return* series; this
//! control plane has no notion of returns, only a running total-P&L mark, so
//! the ring instead retains successive total-P&L snapshots and derives a
//! standard deviation from their first differences.

use std::collections::VecDeque;

use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};

/// Result of a VaR query; `flagged` is set when fewer than `lookback`
/// samples were available, so a query for more than the number of retained
/// samples returns a best-effort estimate marked accordingly rather than an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VarEstimate {
    pub value: f64,
    pub flagged: bool,
}

const MAX_RETAINED_SAMPLES: usize = 10_000;

/// Ring buffer of total-P&L snapshots, sampled once per monitoring tick.
pub struct PnLSampleRing {
    samples: VecDeque<f64>,
}

impl PnLSampleRing {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(256),
        }
    }

    pub fn record(&mut self, total_pnl: f64) {
        self.samples.push_back(total_pnl);
        if self.samples.len() > MAX_RETAINED_SAMPLES {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Parametric VaR at the given confidence over the most recent `lookback`
    /// samples. `confidence` is a fraction in `(0, 1)`, e.g. `0.95`.
    pub fn value_at_risk(&self, confidence: f64, lookback: usize) -> VarEstimate {
        let available = self.samples.len();
        if available < 2 {
            return VarEstimate {
                value: 0.0,
                flagged: true,
            };
        }

        let window = lookback.min(available).max(2);
        let flagged = available < lookback;

        let recent: Vec<f64> = self
            .samples
            .iter()
            .rev()
            .take(window)
            .copied()
            .collect();

        // First differences of the P&L series approximate a return series.
        let diffs: Vec<f64> = recent.windows(2).map(|w| w[0] - w[1]).collect();
        if diffs.len() < 2 {
            return VarEstimate {
                value: 0.0,
                flagged: true,
            };
        }

        let mean = diffs.iter().sum::<f64>() / diffs.len() as f64;
        let variance = diffs.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (diffs.len() - 1) as f64;
        let std_dev = variance.sqrt();

        let z = Normal::new(0.0, 1.0)
            .ok()
            .map(|n| n.inverse_cdf(confidence))
            .unwrap_or(1.645);

        VarEstimate {
            value: (z * std_dev).abs(),
            flagged,
        }
    }
}

impl Default for PnLSampleRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_samples_are_flagged() {
        let mut ring = PnLSampleRing::new();
        ring.record(100.0);
        let est = ring.value_at_risk(0.95, 20);
        assert!(est.flagged);
    }

    #[test]
    fn stable_series_yields_small_var() {
        let mut ring = PnLSampleRing::new();
        for i in 0..50 {
            ring.record(1000.0 + (i % 2) as f64);
        }
        let est = ring.value_at_risk(0.95, 20);
        assert!(!est.flagged);
        assert!(est.value < 5.0);
    }

    #[test]
    fn volatile_series_yields_larger_var() {
        let mut ring = PnLSampleRing::new();
        let mut total = 0.0;
        for i in 0..50 {
            total += if i % 2 == 0 { 500.0 } else { -500.0 };
            ring.record(total);
        }
        let est = ring.value_at_risk(0.95, 20);
        assert!(est.value > 100.0);
    }

    #[test]
    fn lookback_beyond_history_is_flagged_but_still_estimates() {
        let mut ring = PnLSampleRing::new();
        for i in 0..5 {
            ring.record(i as f64 * 10.0);
        }
        let est = ring.value_at_risk(0.95, 1000);
        assert!(est.flagged);
        assert!(est.value >= 0.0);
    }
}
