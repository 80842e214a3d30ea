//! Position and P&L accounting.
//!
//! Grounded in `enhanced_risk_manager.hpp`'s `RealTimePosition` /
//! `RealTimePnLCalculator`: weighted-average cost basis on same-direction
//! fills, realized P&L crystallized on the closing portion of an
//! opposite-direction fill, and a residual that opens a fresh position when
//! the fill's size exceeds what was open. Concurrency follows the same
//! "per-shard exclusive writer, lock-free across shards" shape as the rate
//! limiter's per-tenant buckets: one `parking_lot::Mutex` per `(symbol,
//! venue)` pair behind an outer map guarding only shard creation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::RiskResult;
use crate::risk::store::{DegradedSink, PersistedPosition, PositionStore};
use crate::risk::types::{Symbol, TimestampMs, Venue};
use crate::risk::var::{PnLSampleRing, VarEstimate};
use crate::worker_pool::PriorityPool;

/// A single fill applied to a position. `delta_quantity` is signed: positive
/// for buys, negative for sells.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Fill {
    pub delta_quantity: f64,
    pub fill_price: f64,
    pub timestamp: TimestampMs,
}

/// A snapshot of one `(symbol, venue)` position. Cloned out of the shard
/// lock on every read, so callers never hold the shard's mutex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub venue: Venue,
    /// Signed; positive is long, negative is short, zero is flat.
    pub quantity: f64,
    /// Meaningless when `quantity == 0.0` -- the C++ original leaves the
    /// field stale rather than resetting it, and so does this rendition.
    pub average_entry: f64,
    pub realized_pnl: f64,
    pub mark_price: f64,
    pub last_update: TimestampMs,
}

impl Position {
    fn flat(symbol: Symbol, venue: Venue) -> Self {
        Self {
            symbol,
            venue,
            quantity: 0.0,
            average_entry: 0.0,
            realized_pnl: 0.0,
            mark_price: 0.0,
            last_update: 0,
        }
    }

    pub fn unrealized_pnl(&self) -> f64 {
        if self.quantity == 0.0 {
            0.0
        } else {
            self.quantity * (self.mark_price - self.average_entry)
        }
    }

    pub fn total_pnl(&self) -> f64 {
        self.realized_pnl + self.unrealized_pnl()
    }

    pub fn exposure(&self) -> f64 {
        (self.quantity * self.mark_price).abs()
    }
}

struct Shard {
    position: Mutex<Position>,
}

/// The position book: the authoritative in-memory record of every open
/// position, mark prices, and cumulative realized P&L.
pub struct PositionBook {
    shards: RwLock<HashMap<(Symbol, Venue), Arc<Shard>>>,
    pnl_history: Mutex<PnLSampleRing>,
    store: Option<Arc<dyn PositionStore>>,
    degraded: Option<Arc<dyn DegradedSink>>,
    pool: Option<Arc<PriorityPool>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            pnl_history: Mutex::new(PnLSampleRing::new()),
            store: None,
            degraded: None,
            pool: None,
        }
    }

    pub fn with_persistence(
        mut self,
        store: Arc<dyn PositionStore>,
        degraded: Arc<dyn DegradedSink>,
        pool: Arc<PriorityPool>,
    ) -> Self {
        self.store = Some(store);
        self.degraded = Some(degraded);
        self.pool = Some(pool);
        self
    }

    /// Rehydrates the book from a durable store at startup, since positions
    /// must survive a restart.
    pub fn rehydrate(&self, rows: Vec<PersistedPosition>) {
        let mut shards = self.shards.write();
        for row in rows {
            let position = Position {
                symbol: row.symbol.clone(),
                venue: row.venue.clone(),
                quantity: row.quantity,
                average_entry: row.average_entry,
                realized_pnl: row.realized_pnl,
                mark_price: row.average_entry,
                last_update: row.last_update,
            };
            shards.insert(
                (row.symbol, row.venue),
                Arc::new(Shard {
                    position: Mutex::new(position),
                }),
            );
        }
    }

    fn shard_for(&self, symbol: &str, venue: &str) -> Arc<Shard> {
        if let Some(shard) = self.shards.read().get(&(symbol.to_string(), venue.to_string())) {
            return shard.clone();
        }
        let mut shards = self.shards.write();
        shards
            .entry((symbol.to_string(), venue.to_string()))
            .or_insert_with(|| {
                Arc::new(Shard {
                    position: Mutex::new(Position::flat(symbol.to_string(), venue.to_string())),
                })
            })
            .clone()
    }

    /// Applies a fill to the `(symbol, venue)` position, recomputing average
    /// entry price and crystallizing realized P&L.
    ///
    /// Rejects a zero quantity or non-positive price; every other input
    /// mutates the book. Persistence, if wired, happens out of band on the
    /// worker pool so this call never suspends.
    pub fn apply_fill(&self, symbol: &str, venue: &str, fill: Fill) -> RiskResult<Position> {
        use crate::errors::RiskError;
        if fill.delta_quantity == 0.0 {
            return Err(RiskError::validation("fill delta_quantity must be non-zero"));
        }
        if fill.fill_price <= 0.0 {
            return Err(RiskError::validation("fill price must be positive"));
        }

        let shard = self.shard_for(symbol, venue);
        let snapshot = {
            let mut position = shard.position.lock();
            Self::apply_fill_locked(&mut position, fill);
            position.clone()
        };

        self.dispatch_persist(&snapshot);
        Ok(snapshot)
    }

    fn apply_fill_locked(position: &mut Position, fill: Fill) {
        let old_qty = position.quantity;
        let old_avg = position.average_entry;
        let delta = fill.delta_quantity;

        if old_qty == 0.0 {
            position.quantity = delta;
            position.average_entry = fill.fill_price;
        } else if (old_qty > 0.0) == (delta > 0.0) {
            // Same direction: weighted-average cost basis.
            let new_qty = old_qty + delta;
            position.average_entry =
                (old_qty.abs() * old_avg + delta.abs() * fill.fill_price) / new_qty.abs();
            position.quantity = new_qty;
        } else {
            // Opposite direction: the closing portion crystallizes realized
            // P&L; any residual beyond what was open crosses zero and opens
            // a fresh position in the fill's direction.
            let sign_before = if old_qty > 0.0 { 1.0 } else { -1.0 };
            let closing_qty = delta.abs().min(old_qty.abs());
            let realized_delta = closing_qty * (fill.fill_price - old_avg) * sign_before;
            position.realized_pnl += realized_delta;

            let residual = delta.abs() - old_qty.abs();
            if residual > 0.0 {
                position.quantity = -sign_before * residual;
                position.average_entry = fill.fill_price;
            } else {
                position.quantity = old_qty + delta;
                // average_entry is left unchanged; it is stale once
                // quantity reaches zero and must not be read in that state.
            }
        }
        position.last_update = fill.timestamp;
    }

    fn dispatch_persist(&self, snapshot: &Position) {
        let (Some(store), Some(pool)) = (self.store.clone(), self.pool.clone()) else {
            return;
        };
        let degraded = self.degraded.clone();
        let row = PersistedPosition {
            symbol: snapshot.symbol.clone(),
            venue: snapshot.venue.clone(),
            quantity: snapshot.quantity,
            average_entry: snapshot.average_entry,
            realized_pnl: snapshot.realized_pnl,
            last_update: snapshot.last_update,
        };
        // Background recomputation/persistence substrate; failures are
        // logged and alerted, never rolled back into the in-memory book.
        let _ = pool.submit(move || {
            if let Err(e) = store.put(&row) {
                warn!(error = %e, symbol = %row.symbol, venue = %row.venue, "position persistence failed");
                if let Some(sink) = degraded {
                    sink.on_storage_degraded(&format!(
                        "position {}:{} failed to persist: {e}",
                        row.symbol, row.venue
                    ));
                }
            }
            Ok::<(), crate::errors::RiskError>(())
        });
    }

    /// Updates the mark price used for unrealized P&L across every venue
    /// holding `symbol`. Most-recent-writer wins when called concurrently
    /// with an older timestamp.
    pub fn update_marks(&self, symbol: &str, mark_price: f64, timestamp: TimestampMs) {
        let shards: Vec<Arc<Shard>> = self
            .shards
            .read()
            .iter()
            .filter(|((s, _), _)| s == symbol)
            .map(|(_, shard)| shard.clone())
            .collect();
        for shard in shards {
            let mut position = shard.position.lock();
            if timestamp >= position.last_update {
                position.mark_price = mark_price;
            }
        }
    }

    pub fn get_position(&self, symbol: &str, venue: &str) -> Option<Position> {
        self.shards
            .read()
            .get(&(symbol.to_string(), venue.to_string()))
            .map(|shard| shard.position.lock().clone())
    }

    pub fn get_all_positions(&self) -> Vec<Position> {
        self.shards
            .read()
            .values()
            .map(|shard| shard.position.lock().clone())
            .collect()
    }

    pub fn total_unrealized(&self) -> f64 {
        self.get_all_positions().iter().map(Position::unrealized_pnl).sum()
    }

    pub fn total_realized(&self) -> f64 {
        self.get_all_positions().iter().map(|p| p.realized_pnl).sum()
    }

    pub fn total_pnl(&self) -> f64 {
        self.total_realized() + self.total_unrealized()
    }

    pub fn total_exposure(&self) -> f64 {
        self.get_all_positions().iter().map(Position::exposure).sum()
    }

    pub fn exposure_by_symbol(&self, symbol: &str) -> f64 {
        self.shards
            .read()
            .iter()
            .filter(|((s, _), _)| s == symbol)
            .map(|(_, shard)| shard.position.lock().exposure())
            .sum()
    }

    /// Records the current total-P&L mark into the VaR sample ring. Called
    /// once per monitoring tick, not on every fill.
    pub fn record_pnl_snapshot(&self) {
        let total = self.total_pnl();
        self.pnl_history.lock().record(total);
    }

    pub fn value_at_risk(&self, confidence: f64, lookback: usize) -> VarEstimate {
        self.pnl_history.lock().value_at_risk(confidence, lookback)
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(delta: f64, price: f64, ts: i64) -> Fill {
        Fill {
            delta_quantity: delta,
            fill_price: price,
            timestamp: ts,
        }
    }

    #[test]
    fn opens_a_new_position_from_flat() {
        let book = PositionBook::new();
        let pos = book.apply_fill("BTC/USDT", "binance", fill(0.5, 20000.0, 1)).unwrap();
        assert_eq!(pos.quantity, 0.5);
        assert_eq!(pos.average_entry, 20000.0);
        assert_eq!(pos.realized_pnl, 0.0);
    }

    #[test]
    fn averages_cost_on_same_direction_add() {
        let book = PositionBook::new();
        book.apply_fill("BTC/USDT", "binance", fill(0.5, 20000.0, 1)).unwrap();
        let pos = book.apply_fill("BTC/USDT", "binance", fill(0.5, 22000.0, 2)).unwrap();
        assert_eq!(pos.quantity, 1.0);
        assert!((pos.average_entry - 21000.0).abs() < 1e-9);
    }

    #[test]
    fn partial_close_crystallizes_realized_pnl_without_crossing_zero() {
        let book = PositionBook::new();
        book.apply_fill("BTC/USDT", "binance", fill(1.0, 20000.0, 1)).unwrap();
        let pos = book.apply_fill("BTC/USDT", "binance", fill(-0.4, 21000.0, 2)).unwrap();
        assert!((pos.quantity - 0.6).abs() < 1e-9);
        assert!((pos.realized_pnl - 400.0).abs() < 1e-9);
        assert!((pos.average_entry - 20000.0).abs() < 1e-9);
    }

    #[test]
    fn closing_fill_that_crosses_zero_opens_opposite_position() {
        let book = PositionBook::new();
        book.apply_fill("BTC/USDT", "binance", fill(0.5, 20000.0, 1)).unwrap();
        let pos = book.apply_fill("BTC/USDT", "binance", fill(-0.8, 21000.0, 2)).unwrap();
        assert!((pos.quantity - (-0.3)).abs() < 1e-9);
        assert!((pos.average_entry - 21000.0).abs() < 1e-9);
        assert!((pos.realized_pnl - 500.0).abs() < 1e-9);
    }

    #[test]
    fn exact_close_zeroes_quantity_and_keeps_realized() {
        let book = PositionBook::new();
        book.apply_fill("BTC/USDT", "binance", fill(1.0, 20000.0, 1)).unwrap();
        let pos = book.apply_fill("BTC/USDT", "binance", fill(-1.0, 20500.0, 2)).unwrap();
        assert_eq!(pos.quantity, 0.0);
        assert!((pos.realized_pnl - 500.0).abs() < 1e-9);
        assert_eq!(pos.unrealized_pnl(), 0.0);
    }

    #[test]
    fn rejects_zero_quantity_and_non_positive_price() {
        let book = PositionBook::new();
        assert!(book.apply_fill("BTC/USDT", "binance", fill(0.0, 20000.0, 1)).is_err());
        assert!(book.apply_fill("BTC/USDT", "binance", fill(1.0, 0.0, 1)).is_err());
        assert!(book.apply_fill("BTC/USDT", "binance", fill(1.0, -5.0, 1)).is_err());
    }

    #[test]
    fn update_marks_affects_unrealized_pnl() {
        let book = PositionBook::new();
        book.apply_fill("BTC/USDT", "binance", fill(1.0, 20000.0, 1)).unwrap();
        book.update_marks("BTC/USDT", 21000.0, 5);
        let pos = book.get_position("BTC/USDT", "binance").unwrap();
        assert!((pos.unrealized_pnl() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn total_exposure_sums_across_venues() {
        let book = PositionBook::new();
        book.apply_fill("BTC/USDT", "binance", fill(1.0, 20000.0, 1)).unwrap();
        book.apply_fill("BTC/USDT", "coinbase", fill(-0.5, 20000.0, 1)).unwrap();
        book.update_marks("BTC/USDT", 20000.0, 2);
        assert!((book.exposure_by_symbol("BTC/USDT") - 30000.0).abs() < 1e-6);
        assert!((book.total_exposure() - 30000.0).abs() < 1e-6);
    }

    #[test]
    fn var_is_flagged_with_no_history() {
        let book = PositionBook::new();
        let est = book.value_at_risk(0.95, 20);
        assert!(est.flagged);
    }
}
