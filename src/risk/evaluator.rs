//! Pre-trade risk assessment.
//!
//! Grounded in `enhanced_risk_manager.hpp`'s `validate_trade` cascade: a
//! sequence of named predicates evaluated against a snapshot taken once at
//! entry, never against live, possibly half-updated state. The reject/warn
//! split mirrors the original's `RiskCheckResult` (hard violation vs.
//! "approaching limit" warning) rather than a single boolean.

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::RiskLimits;
use crate::risk::monitor::HaltController;
use crate::risk::position::PositionBook;
use crate::risk::types::{Direction, Symbol, Venue};

/// A 90%-of-limit threshold triggers a warning on an otherwise-passing hard
/// check, mirroring the original's "approaching limit" soft alerts.
const APPROACHING_LIMIT_RATIO: f64 = 0.9;
const VAR_CONFIDENCE: f64 = 0.95;
const VAR_LOOKBACK: usize = 30;

/// A candidate trade submitted for pre-trade assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub symbol: Symbol,
    pub venue: Venue,
    pub direction: Direction,
    pub quantity: f64,
    pub expected_price: f64,
    /// Fractional adverse price move assumed for the single-trade-risk
    /// check, e.g. `0.02` for a 2% move.
    pub assumed_adverse_move: f64,
    /// Expected edge of this opportunity as a fraction of notional.
    pub expected_spread: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskAssessment {
    Approve,
    ApproveWithWarnings(Vec<String>),
    Reject(Vec<String>),
}

impl RiskAssessment {
    pub fn is_approved(&self) -> bool {
        !matches!(self, RiskAssessment::Reject(_))
    }
}

struct DailyTradeCounter {
    day: NaiveDate,
    count: u64,
}

impl DailyTradeCounter {
    fn new() -> Self {
        Self {
            day: Utc::now().date_naive(),
            count: 0,
        }
    }

    fn count_for_today(&mut self) -> u64 {
        self.roll_if_new_day();
        self.count
    }

    fn record_approval(&mut self) {
        self.roll_if_new_day();
        self.count += 1;
    }

    fn roll_if_new_day(&mut self) {
        let today = Utc::now().date_naive();
        if today != self.day {
            self.day = today;
            self.count = 0;
        }
    }
}

/// Evaluates candidate trades against the current risk-limits snapshot,
/// the position book, and halt state.
pub struct RiskEvaluator {
    limits: Arc<ArcSwap<RiskLimits>>,
    positions: Arc<PositionBook>,
    halt: Arc<HaltController>,
    equity: f64,
    daily_trades: Mutex<DailyTradeCounter>,
}

impl RiskEvaluator {
    pub fn new(
        limits: Arc<ArcSwap<RiskLimits>>,
        positions: Arc<PositionBook>,
        halt: Arc<HaltController>,
        equity: f64,
    ) -> Self {
        Self {
            limits,
            positions,
            halt,
            equity,
            daily_trades: Mutex::new(DailyTradeCounter::new()),
        }
    }

    /// Evaluates one opportunity against a snapshot taken at entry. Each
    /// hard check (exposure, concentration, leverage, VaR) rejects on
    /// breach and warns when within 90% of the limit while still passing.
    pub fn evaluate(&self, opp: &Opportunity) -> RiskAssessment {
        if self.halt.is_halted() {
            return RiskAssessment::Reject(vec!["halt".to_string()]);
        }

        let limits = self.limits.load_full();
        let mut reject_reasons = Vec::new();
        let mut warnings = Vec::new();

        let notional = opp.quantity.abs() * opp.expected_price;
        let current_total_exposure = self.positions.total_exposure();
        let current_symbol_exposure = self.positions.exposure_by_symbol(&opp.symbol);
        let post_total_exposure = current_total_exposure + notional;
        let post_symbol_exposure = current_symbol_exposure + notional;

        check_ratio(
            "exposure",
            post_total_exposure,
            limits.max_total_exposure,
            &mut reject_reasons,
            &mut warnings,
        );

        let leverage_cap = limits.max_leverage_ratio * self.equity;
        check_ratio(
            "leverage",
            post_total_exposure,
            leverage_cap,
            &mut reject_reasons,
            &mut warnings,
        );

        let concentration_ratio = if post_total_exposure > 0.0 {
            post_symbol_exposure / post_total_exposure
        } else {
            0.0
        };
        check_ratio(
            "concentration",
            concentration_ratio,
            limits.max_concentration_ratio,
            &mut reject_reasons,
            &mut warnings,
        );

        let var_estimate = self.positions.value_at_risk(VAR_CONFIDENCE, VAR_LOOKBACK);
        check_ratio(
            "var",
            var_estimate.value,
            limits.max_portfolio_var,
            &mut reject_reasons,
            &mut warnings,
        );

        // Soft-only: a breach here warns, it never rejects.
        let trade_risk = notional * opp.assumed_adverse_move;
        if trade_risk > limits.max_single_trade_risk {
            warnings.push(format!(
                "single_trade_risk {trade_risk:.2} exceeds max_single_trade_risk {:.2}",
                limits.max_single_trade_risk
            ));
        }

        {
            let mut counter = self.daily_trades.lock();
            let today_count = counter.count_for_today();
            let limit = limits.max_daily_trades as u64;
            if today_count >= limit {
                reject_reasons.push("daily_trade_count".to_string());
            } else if today_count as f64 >= APPROACHING_LIMIT_RATIO * limit as f64 {
                warnings.push(format!(
                    "approaching max_daily_trades ({today_count}/{limit})"
                ));
            }
        }

        if opp.expected_spread < limits.min_spread_threshold {
            // Not a risk violation -- the trade just isn't worth taking.
            reject_reasons.push("profitability".to_string());
        }

        if !reject_reasons.is_empty() {
            return RiskAssessment::Reject(reject_reasons);
        }

        self.daily_trades.lock().record_approval();
        if warnings.is_empty() {
            RiskAssessment::Approve
        } else {
            RiskAssessment::ApproveWithWarnings(warnings)
        }
    }

    /// Portfolio P&L under a uniform adverse move applied to every mark:
    /// down for longs, up for shorts. Used by the monitoring loop for the
    /// `stress_test_threshold` check.
    pub fn stress_test(&self, shock_pct: f64) -> f64 {
        self.positions
            .get_all_positions()
            .iter()
            .map(|p| {
                if p.quantity == 0.0 {
                    return p.realized_pnl;
                }
                let adverse_mark = if p.quantity > 0.0 {
                    p.mark_price * (1.0 - shock_pct)
                } else {
                    p.mark_price * (1.0 + shock_pct)
                };
                p.realized_pnl + p.quantity * (adverse_mark - p.average_entry)
            })
            .sum()
    }
}

fn check_ratio(
    name: &str,
    value: f64,
    limit: f64,
    reject_reasons: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    if limit <= 0.0 {
        return;
    }
    let ratio = value / limit;
    if ratio > 1.0 {
        reject_reasons.push(name.to_string());
    } else if ratio >= APPROACHING_LIMIT_RATIO {
        warnings.push(format!("approaching {name} limit ({value:.2}/{limit:.2})"));
    }
}
