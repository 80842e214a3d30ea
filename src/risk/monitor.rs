//! Monitoring loop and halt controller.
//!
//! Grounded in `enhanced_risk_manager.hpp`'s `monitoring_loop()` /
//! `halt_triggered_` / `check_and_trigger_halt` / `resume_after_halt`: a
//! single dedicated scheduler (not a pool task, so its cadence is never
//! delayed by unrelated work) that snapshots, checks thresholds, and CASes
//! an atomic halt record. The duplicate `check_and_trigger_halt` declaration
//! noted in the original header is treated as one operation here, not two.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::config::RiskLimits;
use crate::risk::alerts::{AlertPipeline, Severity};
use crate::risk::evaluator::RiskEvaluator;
use crate::risk::position::PositionBook;
use crate::risk::store::{MetricsSink, RiskMetricsRow};
use crate::risk::types::TimestampMs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltSource {
    Automatic,
    Manual,
}

#[derive(Debug, Clone, Serialize)]
pub struct HaltRecord {
    pub reason: String,
    pub since: TimestampMs,
    pub source: HaltSource,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltState {
    Running,
    Halted(HaltRecord),
}

/// Atomic halt state machine: `running <-> halted(automatic|manual)`. Reads
/// go through `ArcSwap` lock-free; writers serialize through `write_lock` so
/// a transition is a single load-check-store rather than a racy CAS retry
/// loop, one state-machine step at a time.
pub struct HaltController {
    state: ArcSwap<HaltState>,
    write_lock: Mutex<()>,
    emergency_active: AtomicBool,
}

impl HaltController {
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(HaltState::Running),
            write_lock: Mutex::new(()),
            emergency_active: AtomicBool::new(false),
        }
    }

    pub fn current(&self) -> Arc<HaltState> {
        self.state.load_full()
    }

    pub fn is_halted(&self) -> bool {
        matches!(*self.state.load(), HaltState::Halted(_))
    }

    /// `running --trigger_halt(r)--> halted(automatic, r)`. A no-op (returns
    /// `false`) when already halted: only `running` has an outbound edge to
    /// `halted` in the transition graph.
    pub fn trigger_halt(&self, reason: String, source: HaltSource) -> bool {
        let _guard = self.write_lock.lock();
        if !matches!(*self.state.load(), HaltState::Running) {
            return false;
        }
        self.state.store(Arc::new(HaltState::Halted(HaltRecord {
            reason,
            since: Utc::now().timestamp_millis(),
            source,
        })));
        true
    }

    pub fn set_emergency_active(&self, active: bool) {
        self.emergency_active.store(active, Ordering::SeqCst);
    }

    pub fn emergency_active(&self) -> bool {
        self.emergency_active.load(Ordering::SeqCst)
    }

    /// Idempotent from `running`. Rejected (no-op, returns `false`) while an
    /// emergency-level violation remains active.
    pub fn resume(&self) -> bool {
        let _guard = self.write_lock.lock();
        if self.emergency_active.load(Ordering::SeqCst) {
            return false;
        }
        self.state.store(Arc::new(HaltState::Running));
        true
    }

    /// Operator override: transitions to `running` regardless of any active
    /// emergency violation.
    pub fn force_resume(&self) {
        let _guard = self.write_lock.lock();
        self.state.store(Arc::new(HaltState::Running));
    }
}

impl Default for HaltController {
    fn default() -> Self {
        Self::new()
    }
}

struct ViolationCheck {
    name: &'static str,
    value: f64,
    limit: f64,
}

impl ViolationCheck {
    /// Exceedance over the limit as a fraction; `None` when not breached.
    fn exceedance(&self) -> Option<f64> {
        if self.limit <= 0.0 || self.value <= self.limit {
            return None;
        }
        Some((self.value - self.limit) / self.limit)
    }

    fn severity(exceedance: f64) -> Severity {
        if exceedance <= 0.10 {
            Severity::Warning
        } else if exceedance <= 0.25 {
            Severity::Critical
        } else {
            Severity::Emergency
        }
    }
}

/// Runs the periodic scan and drives the halt controller. Owns no shared
/// mutable state beyond what it borrows; intended to run as a single
/// dedicated task, never as pool work.
pub struct MonitoringLoop {
    positions: Arc<PositionBook>,
    evaluator: Arc<RiskEvaluator>,
    halt: Arc<HaltController>,
    alerts: Arc<AlertPipeline>,
    limits: Arc<ArcSwap<RiskLimits>>,
    metrics: Arc<dyn MetricsSink>,
    interval: std::time::Duration,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    consecutive_overruns: AtomicU32,
}

impl MonitoringLoop {
    pub fn new(
        positions: Arc<PositionBook>,
        evaluator: Arc<RiskEvaluator>,
        halt: Arc<HaltController>,
        alerts: Arc<AlertPipeline>,
        limits: Arc<ArcSwap<RiskLimits>>,
        metrics: Arc<dyn MetricsSink>,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            positions,
            evaluator,
            halt,
            alerts,
            limits,
            metrics,
            interval,
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            consecutive_overruns: AtomicU32::new(0),
        }
    }

    pub fn shutdown_handle(&self) -> (Arc<Notify>, Arc<AtomicBool>) {
        (self.shutdown.clone(), self.stopping.clone())
    }

    /// Spawns the dedicated monitoring task. The returned handle resolves
    /// once a shutdown is requested and the in-flight tick (if any)
    /// finishes -- a tick is never cancelled mid-flight.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.stopping.load(Ordering::SeqCst) {
                    return;
                }
                let tick_started = std::time::Instant::now();
                self.run_tick();
                let elapsed = tick_started.elapsed();

                if elapsed > self.interval {
                    let overruns = self.consecutive_overruns.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(elapsed_ms = elapsed.as_millis() as u64, "tick_overrun");
                    if overruns >= 2 {
                        self.alerts.enqueue(
                            Severity::Warning,
                            "monitoring_degraded",
                            "two consecutive monitoring ticks exceeded the interval",
                            HashMap::new(),
                        );
                    }
                    // Does not try to catch up; the next tick starts
                    // immediately with a fresh snapshot.
                    continue;
                }
                self.consecutive_overruns.store(0, Ordering::SeqCst);

                tokio::select! {
                    _ = tokio::time::sleep(self.interval - elapsed) => {}
                    _ = self.shutdown.notified() => {
                        self.stopping.store(true, Ordering::SeqCst);
                        return;
                    }
                }
            }
        })
    }

    /// One monitoring tick, run synchronously (no `.await` inside) so its
    /// cadence cannot be perturbed by scheduling elsewhere. Public so
    /// callers (and tests) can drive a tick deterministically instead of
    /// waiting on `spawn`'s interval.
    pub fn run_tick(&self) {
        self.positions.record_pnl_snapshot();

        let limits = self.limits.load_full();
        let total_pnl = self.positions.total_pnl();
        let total_exposure = self.positions.total_exposure();
        let var_estimate = self.positions.value_at_risk(0.95, 30);
        let stress_pnl = self.evaluator.stress_test(limits.stress_test_threshold);

        let checks = [
            ViolationCheck { name: "total_exposure", value: total_exposure, limit: limits.max_total_exposure },
            ViolationCheck { name: "portfolio_var", value: var_estimate.value, limit: limits.max_portfolio_var },
            ViolationCheck {
                name: "realtime_pnl",
                value: -total_pnl,
                limit: limits.realtime_pnl_threshold,
            },
            ViolationCheck {
                name: "stress_pnl",
                value: -stress_pnl,
                limit: limits.realtime_pnl_threshold,
            },
        ];

        let mut violations = Vec::new();
        let mut emergency_active = false;
        let mut pnl_breach_exceedance = 0.0_f64;

        for check in &checks {
            if let Some(exceedance) = check.exceedance() {
                let severity = ViolationCheck::severity(exceedance);
                if severity == Severity::Emergency {
                    emergency_active = true;
                }
                if check.name == "realtime_pnl" {
                    pnl_breach_exceedance = exceedance;
                }
                violations.push(check.name.to_string());
                let mut metadata = HashMap::new();
                metadata.insert("value".to_string(), serde_json::Value::from(check.value));
                metadata.insert("limit".to_string(), serde_json::Value::from(check.limit));
                self.alerts.enqueue(
                    severity,
                    check.name,
                    format!("{} breached: {:.2} vs limit {:.2}", check.name, check.value, check.limit),
                    metadata,
                );
            }
        }

        self.halt.set_emergency_active(emergency_active);

        // A >=1.5x breach of realtime_pnl_threshold is an automatic-halt
        // trigger on its own, even short of the emergency severity band.
        if emergency_active || pnl_breach_exceedance >= 0.5 {
            let reason = if violations.is_empty() {
                "unspecified violation".to_string()
            } else {
                violations.join(",")
            };
            if self.halt.trigger_halt(reason.clone(), HaltSource::Automatic) {
                self.alerts.enqueue(
                    Severity::Critical,
                    "halt_triggered",
                    format!("automatic halt triggered: {reason}"),
                    HashMap::new(),
                );
                info!(reason = %reason, "automatic halt triggered");
            }
        }

        self.metrics.record_tick(RiskMetricsRow {
            total_pnl,
            total_exposure,
            var: var_estimate.value,
            stress_pnl,
            alerts_open: self.alerts.open_count(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::position::Fill;
    use crate::worker_pool::PriorityPool;
    use std::sync::Arc;

    fn build(limits: RiskLimits, equity: f64) -> (MonitoringLoop, Arc<PositionBook>, Arc<HaltController>, Arc<AlertPipeline>) {
        let positions = Arc::new(PositionBook::new());
        let halt = Arc::new(HaltController::new());
        let pool = Arc::new(PriorityPool::new(1));
        let alerts = Arc::new(AlertPipeline::new(pool, 100, 256));
        let limits = Arc::new(ArcSwap::from_pointee(limits));
        let evaluator = Arc::new(RiskEvaluator::new(limits.clone(), positions.clone(), halt.clone(), equity));
        let metrics: Arc<dyn MetricsSink> = Arc::new(crate::risk::store::NullMetricsSink);
        let loop_ = MonitoringLoop::new(
            positions.clone(),
            evaluator,
            halt.clone(),
            alerts.clone(),
            limits,
            metrics,
            std::time::Duration::from_millis(1000),
        );
        (loop_, positions, halt, alerts)
    }

    #[test]
    fn severe_pnl_breach_triggers_automatic_halt() {
        let mut limits = RiskLimits::default();
        limits.realtime_pnl_threshold = 5000.0;
        limits.max_total_exposure = 10_000_000.0;
        limits.max_portfolio_var = 10_000_000.0;
        let (loop_, positions, halt, _alerts) = build(limits, 1_000_000.0);

        positions
            .apply_fill("BTC/USDT", "binance", Fill { delta_quantity: 1.0, fill_price: 20000.0, timestamp: 1 })
            .unwrap();
        // Mark down so unrealized P&L = -7600, a 1.52x breach of 5000.
        positions.update_marks("BTC/USDT", 12400.0, 2);

        loop_.run_tick();
        assert!(halt.is_halted());
    }

    #[test]
    fn no_breach_leaves_halt_state_running() {
        let mut limits = RiskLimits::default();
        limits.max_total_exposure = 10_000_000.0;
        limits.max_portfolio_var = 10_000_000.0;
        limits.realtime_pnl_threshold = 1_000_000.0;
        let (loop_, positions, halt, _alerts) = build(limits, 1_000_000.0);
        positions
            .apply_fill("BTC/USDT", "binance", Fill { delta_quantity: 1.0, fill_price: 20000.0, timestamp: 1 })
            .unwrap();
        positions.update_marks("BTC/USDT", 20100.0, 2);
        loop_.run_tick();
        assert!(!halt.is_halted());
    }

    #[test]
    fn resume_is_blocked_while_emergency_active_but_force_resume_overrides() {
        let halt = HaltController::new();
        halt.trigger_halt("pnl_breach".to_string(), HaltSource::Automatic);
        halt.set_emergency_active(true);
        assert!(!halt.resume());
        assert!(halt.is_halted());
        halt.force_resume();
        assert!(!halt.is_halted());
    }

    #[test]
    fn trigger_halt_is_a_noop_from_an_already_halted_state() {
        let halt = HaltController::new();
        assert!(halt.trigger_halt("first".to_string(), HaltSource::Automatic));
        assert!(!halt.trigger_halt("second".to_string(), HaltSource::Automatic));
        match halt.current().as_ref() {
            HaltState::Halted(record) => assert_eq!(record.reason, "first"),
            HaltState::Running => panic!("expected halted"),
        }
    }
}
