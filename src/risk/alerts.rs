//! Alert pipeline: creation, rate-limited queueing, retrying delivery,
//! acknowledgement, and subscriber fan-out.
//!
//! Combines a bounded alert queue with severity tiers and an eviction policy
//! for critical alerts, and a sliding per-(kind, severity) rate cap in the
//! same shape as the rate-limiting middleware elsewhere in this stack.
//! Delivery retry follows the same exponential-backoff idiom used elsewhere.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::risk::store::AlertSink;
use crate::worker_pool::PriorityPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
            Severity::Emergency => "emergency",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    pub severity: Severity,
    pub kind: String,
    pub message: String,
    pub metadata: HashMap<String, Value>,
    pub created_at: i64,
    pub acknowledged: bool,
}

const HIGH_PRIORITY: i32 = 10;
const DEFAULT_PRIORITY: i32 = 0;
const RATE_CAP_WINDOW: Duration = Duration::from_secs(3600);
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const MAX_DELIVERY_ATTEMPTS: u32 = 6;
const SUBSCRIBER_BUFFER: usize = 256;

struct RateCapEntry {
    grants: VecDeque<i64>,
}

struct Inner {
    ring: VecDeque<Alert>,
    rate_caps: HashMap<(String, Severity), RateCapEntry>,
    drop_counts: HashMap<String, u64>,
    last_meta_alert: HashMap<String, i64>,
}

/// Bounded in-memory alert queue plus a delivery worker dispatched to the
/// priority pool.
pub struct AlertPipeline {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    max_alerts_per_hour: AtomicU64,
    sinks: Mutex<Vec<Arc<dyn AlertSink>>>,
    pool: Arc<PriorityPool>,
    broadcaster: broadcast::Sender<Alert>,
    capacity: usize,
}

impl AlertPipeline {
    pub fn new(pool: Arc<PriorityPool>, max_alerts_per_hour: u32, capacity: usize) -> Self {
        let (broadcaster, _rx) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            inner: Mutex::new(Inner {
                ring: VecDeque::new(),
                rate_caps: HashMap::new(),
                drop_counts: HashMap::new(),
                last_meta_alert: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
            max_alerts_per_hour: AtomicU64::new(max_alerts_per_hour as u64),
            sinks: Mutex::new(Vec::new()),
            pool,
            broadcaster,
            capacity,
        }
    }

    pub fn add_sink(&self, sink: Arc<dyn AlertSink>) {
        self.sinks.lock().push(sink);
    }

    pub fn set_max_alerts_per_hour(&self, limit: u32) {
        self.max_alerts_per_hour.store(limit as u64, Ordering::SeqCst);
    }

    /// Stamps id/timestamp, enforces the per-(kind, severity) hourly rate
    /// cap, and dispatches delivery on the worker pool. Returns the stamped
    /// alert even when it was dropped by the rate cap (caller can inspect
    /// `id == 0` as a drop marker) -- callers that care use `enqueue_checked`.
    pub fn enqueue(&self, severity: Severity, kind: impl Into<String>, message: impl Into<String>, metadata: HashMap<String, Value>) -> Option<Alert> {
        let kind = kind.into();
        let now = Utc::now().timestamp_millis();
        let mut inner = self.inner.lock();

        let cap = self.max_alerts_per_hour.load(Ordering::SeqCst);
        let entry = inner
            .rate_caps
            .entry((kind.clone(), severity))
            .or_insert_with(|| RateCapEntry { grants: VecDeque::new() });
        while let Some(&front) = entry.grants.front() {
            if now - front > RATE_CAP_WINDOW.as_millis() as i64 {
                entry.grants.pop_front();
            } else {
                break;
            }
        }

        if entry.grants.len() as u64 >= cap {
            if severity >= Severity::Critical {
                // Evict the oldest non-critical alert of the same kind to
                // make room for a critical-or-above alert.
                if let Some(pos) = inner
                    .ring
                    .iter()
                    .position(|a| a.kind == kind && a.severity < Severity::Critical)
                {
                    inner.ring.remove(pos);
                }
            } else {
                *inner.drop_counts.entry(kind.clone()).or_insert(0) += 1;
                self.maybe_raise_meta_alert(&mut inner, &kind, now);
                return None;
            }
        }

        let entry = inner.rate_caps.get_mut(&(kind.clone(), severity)).unwrap();
        entry.grants.push_back(now);

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let alert = Alert {
            id,
            severity,
            kind,
            message: message.into(),
            metadata,
            created_at: now,
            acknowledged: false,
        };

        if inner.ring.len() >= self.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(alert.clone());
        drop(inner);

        let _ = self.broadcaster.send(alert.clone());
        self.dispatch_delivery(alert.clone());
        Some(alert)
    }

    fn maybe_raise_meta_alert(&self, inner: &mut Inner, kind: &str, now: i64) {
        let should_raise = match inner.last_meta_alert.get(kind) {
            Some(last) => now - last > RATE_CAP_WINDOW.as_millis() as i64,
            None => true,
        };
        if !should_raise {
            return;
        }
        inner.last_meta_alert.insert(kind.to_string(), now);
        let drops = *inner.drop_counts.get(kind).unwrap_or(&0);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut metadata = HashMap::new();
        metadata.insert("kind".to_string(), Value::String(kind.to_string()));
        metadata.insert("dropped".to_string(), Value::from(drops));
        let meta_alert = Alert {
            id,
            severity: Severity::Warning,
            kind: "alert_drops".to_string(),
            message: format!("{drops} alerts of kind '{kind}' dropped by the hourly rate cap"),
            metadata,
            created_at: now,
            acknowledged: false,
        };
        if inner.ring.len() >= self.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(meta_alert.clone());
        let _ = self.broadcaster.send(meta_alert.clone());
        self.dispatch_delivery(meta_alert);
    }

    fn dispatch_delivery(&self, alert: Alert) {
        let sinks = self.sinks.lock().clone();
        if sinks.is_empty() {
            return;
        }
        let priority = if alert.severity == Severity::Emergency {
            HIGH_PRIORITY
        } else {
            DEFAULT_PRIORITY
        };
        let _ = self.pool.submit_priority(priority, move || {
            for sink in &sinks {
                deliver_with_backoff(sink.as_ref(), &alert);
            }
            Ok::<(), crate::errors::RiskError>(())
        });
    }

    /// Idempotent: acknowledging an id twice, or one that was evicted, is a
    /// no-op after the first successful ack; a truly unknown id is reported
    /// not-found.
    pub fn ack(&self, alert_id: u64) -> bool {
        let mut inner = self.inner.lock();
        if let Some(alert) = inner.ring.iter_mut().find(|a| a.id == alert_id) {
            alert.acknowledged = true;
            true
        } else {
            false
        }
    }

    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        let inner = self.inner.lock();
        inner.ring.iter().rev().take(limit).cloned().collect()
    }

    pub fn open_count(&self) -> u64 {
        self.inner.lock().ring.iter().filter(|a| !a.acknowledged).count() as u64
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.broadcaster.subscribe()
    }
}

/// Blocking delivery loop run on a pool worker thread-equivalent task:
/// exponential backoff, capped attempts, never panics the worker.
fn deliver_with_backoff(sink: &dyn AlertSink, alert: &Alert) {
    let mut backoff = INITIAL_BACKOFF;
    for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
        match sink.write(alert) {
            Ok(()) => return,
            Err(e) => {
                if attempt == MAX_DELIVERY_ATTEMPTS {
                    error!(alert_id = alert.id, error = %e, "alert delivery failed, marking delivered-with-errors");
                    return;
                }
                warn!(alert_id = alert.id, attempt, error = %e, "alert sink write failed, retrying");
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RiskResult;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink {
        writes: AtomicUsize,
    }
    impl AlertSink for CountingSink {
        fn write(&self, _alert: &Alert) -> RiskResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pipeline(cap: u32) -> AlertPipeline {
        let pool = Arc::new(PriorityPool::new(1));
        AlertPipeline::new(pool, cap, 256)
    }

    #[test]
    fn enqueue_stamps_monotone_ids() {
        let p = pipeline(100);
        let a = p.enqueue(Severity::Info, "test", "one", HashMap::new()).unwrap();
        let b = p.enqueue(Severity::Info, "test", "two", HashMap::new()).unwrap();
        assert!(b.id > a.id);
    }

    #[test]
    fn rate_cap_drops_fourth_warning_and_raises_meta_alert() {
        let p = pipeline(3);
        for _ in 0..3 {
            assert!(p.enqueue(Severity::Warning, "concentration", "warn", HashMap::new()).is_some());
        }
        let dropped = p.enqueue(Severity::Warning, "concentration", "warn", HashMap::new());
        assert!(dropped.is_none());
        let recent = p.recent(10);
        assert!(recent.iter().any(|a| a.kind == "alert_drops"));
    }

    #[test]
    fn critical_alert_evicts_oldest_noncritical_of_same_kind_when_capped() {
        let p = pipeline(1);
        let first = p.enqueue(Severity::Warning, "concentration", "warn", HashMap::new()).unwrap();
        let second = p.enqueue(Severity::Critical, "concentration", "crit", HashMap::new());
        assert!(second.is_some());
        let recent = p.recent(10);
        assert!(!recent.iter().any(|a| a.id == first.id));
    }

    #[test]
    fn ack_is_idempotent_and_reports_not_found() {
        let p = pipeline(100);
        let a = p.enqueue(Severity::Info, "test", "one", HashMap::new()).unwrap();
        assert!(p.ack(a.id));
        assert!(p.ack(a.id));
        assert!(!p.ack(999_999));
    }

    #[test]
    fn recent_is_newest_first() {
        let p = pipeline(100);
        p.enqueue(Severity::Info, "test", "one", HashMap::new());
        p.enqueue(Severity::Info, "test", "two", HashMap::new());
        let recent = p.recent(2);
        assert!(recent[0].id > recent[1].id);
    }
}
