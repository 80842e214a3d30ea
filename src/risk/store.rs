//! Persistence adapters: the key/value store backing positions and
//! alerts, and the time-series sink backing monitoring metrics.
//!
//! Grounded in `signals/db_storage.rs`'s rusqlite schema/pragma setup (WAL
//! mode, prepared statements) with a key layout of
//! `position:{symbol}:{venue}`, `alert:{yyyy-mm-dd}:{id}`, `halt:state`,
//! `limits:current`. Durable sinks are treated as external collaborators
//! with thin interfaces; these traits are the narrow capability the core
//! calls through, with a rusqlite implementation standing in for "a
//! key/value cache" and a `metrics`-backed implementation standing in for
//! "a time-series store".

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::errors::{RiskError, RiskResult};
use crate::risk::types::{Symbol, TimestampMs, Venue};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPosition {
    pub symbol: Symbol,
    pub venue: Venue,
    pub quantity: f64,
    pub average_entry: f64,
    pub realized_pnl: f64,
    pub last_update: TimestampMs,
}

/// The key/value store backing `position:{symbol}:{venue}`.
pub trait PositionStore: Send + Sync {
    fn put(&self, position: &PersistedPosition) -> RiskResult<()>;
    fn scan_all(&self) -> RiskResult<Vec<PersistedPosition>>;
}

/// Narrow capability consumed by the alert pipeline: a `write(alert) ->
/// result` call is the only thing the pipeline needs. Concrete sinks
/// (key/value cache, time-series, the subscriber stream) are independent
/// implementers of this trait.
pub trait AlertSink: Send + Sync {
    fn write(&self, alert: &crate::risk::alerts::Alert) -> RiskResult<()>;
}

/// The time-series store backing the `risk_metrics` measurement.
pub trait MetricsSink: Send + Sync {
    fn record_tick(&self, row: RiskMetricsRow);
}

#[derive(Debug, Clone, Copy)]
pub struct RiskMetricsRow {
    pub total_pnl: f64,
    pub total_exposure: f64,
    pub var: f64,
    pub stress_pnl: f64,
    pub alerts_open: u64,
}

/// rusqlite-backed `PositionStore`, grounded in `signals/db_storage.rs`'s
/// WAL-mode schema setup.
pub struct SqlitePositionStore {
    conn: Mutex<Connection>,
}

impl SqlitePositionStore {
    pub fn open(path: &str) -> RiskResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| RiskError::fatal(format!("opening position store: {e}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS positions (
                 symbol TEXT NOT NULL,
                 venue TEXT NOT NULL,
                 quantity REAL NOT NULL,
                 average_entry REAL NOT NULL,
                 realized_pnl REAL NOT NULL,
                 last_update INTEGER NOT NULL,
                 PRIMARY KEY (symbol, venue)
             );",
        )
        .map_err(|e| RiskError::fatal(format!("initializing position schema: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> RiskResult<Self> {
        Self::open(":memory:")
    }
}

impl PositionStore for SqlitePositionStore {
    fn put(&self, position: &PersistedPosition) -> RiskResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO positions (symbol, venue, quantity, average_entry, realized_pnl, last_update)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(symbol, venue) DO UPDATE SET
                 quantity = excluded.quantity,
                 average_entry = excluded.average_entry,
                 realized_pnl = excluded.realized_pnl,
                 last_update = excluded.last_update",
            params![
                position.symbol,
                position.venue,
                position.quantity,
                position.average_entry,
                position.realized_pnl,
                position.last_update,
            ],
        )
        .map_err(|e| RiskError::transient(format!("writing position: {e}")))?;
        Ok(())
    }

    fn scan_all(&self) -> RiskResult<Vec<PersistedPosition>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT symbol, venue, quantity, average_entry, realized_pnl, last_update FROM positions")
            .map_err(|e| RiskError::transient(format!("preparing scan: {e}")))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PersistedPosition {
                    symbol: row.get(0)?,
                    venue: row.get(1)?,
                    quantity: row.get(2)?,
                    average_entry: row.get(3)?,
                    realized_pnl: row.get(4)?,
                    last_update: row.get(5)?,
                })
            })
            .map_err(|e| RiskError::transient(format!("scanning positions: {e}")))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| RiskError::transient(format!("reading row: {e}")))?);
        }
        Ok(out)
    }
}

/// rusqlite-backed `AlertSink`, keyed `alert:{yyyy-mm-dd}:{id}` as a single
/// table with a `day` column rather than per-day tables -- same shape, less
/// DDL churn.
pub struct SqliteAlertStore {
    conn: Mutex<Connection>,
}

impl SqliteAlertStore {
    pub fn open(path: &str) -> RiskResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| RiskError::fatal(format!("opening alert store: {e}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS alerts (
                 id TEXT PRIMARY KEY,
                 day TEXT NOT NULL,
                 severity TEXT NOT NULL,
                 kind TEXT NOT NULL,
                 message TEXT NOT NULL,
                 metadata TEXT NOT NULL,
                 created_at INTEGER NOT NULL,
                 acknowledged INTEGER NOT NULL
             );",
        )
        .map_err(|e| RiskError::fatal(format!("initializing alert schema: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> RiskResult<Self> {
        Self::open(":memory:")
    }
}

impl AlertSink for SqliteAlertStore {
    fn write(&self, alert: &crate::risk::alerts::Alert) -> RiskResult<()> {
        let day = chrono::DateTime::from_timestamp_millis(alert.created_at)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        let metadata = serde_json::to_string(&alert.metadata)
            .map_err(|e| RiskError::invariant(format!("serializing alert metadata: {e}")))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO alerts (id, day, severity, kind, message, metadata, created_at, acknowledged)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET acknowledged = excluded.acknowledged",
            params![
                alert.id,
                day,
                alert.severity.as_str(),
                alert.kind,
                alert.message,
                metadata,
                alert.created_at,
                alert.acknowledged as i64,
            ],
        )
        .map_err(|e| RiskError::transient(format!("writing alert: {e}")))?;
        Ok(())
    }
}

/// `metrics`-crate-backed `MetricsSink`, using the same `metrics` +
/// `metrics-exporter-prometheus` combination already in this dependency
/// stack for gauge export.
pub struct PrometheusMetricsSink {
    host_tag: String,
}

impl PrometheusMetricsSink {
    pub fn new(host_tag: impl Into<String>) -> Self {
        Self {
            host_tag: host_tag.into(),
        }
    }
}

impl MetricsSink for PrometheusMetricsSink {
    fn record_tick(&self, row: RiskMetricsRow) {
        let host = self.host_tag.clone();
        metrics::gauge!("risk_metrics_total_pnl", "host" => host.clone()).set(row.total_pnl);
        metrics::gauge!("risk_metrics_total_exposure", "host" => host.clone())
            .set(row.total_exposure);
        metrics::gauge!("risk_metrics_var", "host" => host.clone()).set(row.var);
        metrics::gauge!("risk_metrics_stress_pnl", "host" => host.clone()).set(row.stress_pnl);
        metrics::gauge!("risk_metrics_alerts_open", "host" => host)
            .set(row.alerts_open as f64);
    }
}

/// A sink usable in tests / when no durable store is wired; records
/// in-memory instead of erroring.
pub struct NullMetricsSink;
impl MetricsSink for NullMetricsSink {
    fn record_tick(&self, _row: RiskMetricsRow) {}
}

/// Degraded-storage notification hook: the position book calls this rather
/// than depending on the alert pipeline directly, avoiding a cyclic
/// reference between the two.
pub trait DegradedSink: Send + Sync {
    fn on_storage_degraded(&self, detail: &str);
}

pub struct NullDegradedSink;
impl DegradedSink for NullDegradedSink {
    fn on_storage_degraded(&self, _detail: &str) {}
}

pub type SharedPositionStore = Arc<dyn PositionStore>;
pub type SharedAlertSink = Arc<dyn AlertSink>;
pub type SharedMetricsSink = Arc<dyn MetricsSink>;
pub type SharedDegradedSink = Arc<dyn DegradedSink>;
