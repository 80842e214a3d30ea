//! Ingestion & streaming facade.
//!
//! Handles the trading engine's callback surface into the risk manager
//! (trade execution, order update, balance update, market price) and fans
//! results back out over a `broadcast::Sender<WsServerEvent>`-style egress
//! stream, matching the websocket broadcaster pattern used for egress
//! elsewhere in this stack. The duplicate-suppression LRU is a hand-rolled
//! bounded map, since this dependency stack carries no LRU crate of its own.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::errors::RiskResult;
use crate::risk::alerts::{AlertPipeline, Severity};
use crate::risk::position::{Fill, Position, PositionBook};
use crate::risk::types::{Symbol, TimestampMs, Venue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

/// One inbound message from the trading engine. The transport producing
/// these is out of scope; tests and callers construct the enum directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IngressEvent {
    TradeExecution {
        execution_id: String,
        symbol: Symbol,
        venue: Venue,
        side: Side,
        quantity: f64,
        price: f64,
        fee: f64,
        timestamp: TimestampMs,
        /// Monotonic per-`(symbol, venue)` sequence number, if the engine
        /// supplies one: resolved by the embedded sequence number when
        /// present, otherwise last-write-wins by timestamp.
        sequence: Option<u64>,
    },
    OrderUpdate {
        order_id: String,
        symbol: Symbol,
        venue: Venue,
        status: OrderStatus,
        filled_qty: f64,
        remaining_qty: f64,
        timestamp: TimestampMs,
        sequence: Option<u64>,
    },
    Balance {
        venue: Venue,
        asset: String,
        free: f64,
        locked: f64,
        timestamp: TimestampMs,
    },
    /// A mark update from a market-data feed. Venue-agnostic: the latest
    /// price applies to every venue currently holding the symbol, matching
    /// `PositionBook::update_marks`'s most-recent-writer-wins semantics.
    MarketPrice {
        symbol: Symbol,
        price: f64,
        timestamp: TimestampMs,
    },
}

impl IngressEvent {
    /// The venue this event concerns -- also the rate limiter's tenant id,
    /// since the outbound exchange call each event stands in for is always
    /// scoped to one venue. `MarketPrice` has no single venue, so it has no
    /// tenant to rate-limit against.
    pub fn venue(&self) -> Option<&str> {
        match self {
            IngressEvent::TradeExecution { venue, .. } => Some(venue),
            IngressEvent::OrderUpdate { venue, .. } => Some(venue),
            IngressEvent::Balance { venue, .. } => Some(venue),
            IngressEvent::MarketPrice { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BalanceRow {
    pub free: f64,
    pub locked: f64,
    pub timestamp: TimestampMs,
}

/// Egress record pushed to position-update subscribers, debounced so a
/// subscriber only sees a push when a displayed field moves by more than
/// 1% of its prior value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub symbol: Symbol,
    pub venue: Venue,
    pub quantity: f64,
    pub average_price: f64,
    pub mark: f64,
    pub unrealized: f64,
    pub realized: f64,
    pub timestamp: TimestampMs,
}

impl PositionUpdate {
    fn from_position(p: &Position) -> Self {
        Self {
            symbol: p.symbol.clone(),
            venue: p.venue.clone(),
            quantity: p.quantity,
            average_price: p.average_entry,
            mark: p.mark_price,
            unrealized: p.unrealized_pnl(),
            realized: p.realized_pnl,
            timestamp: p.last_update,
        }
    }
}

const DEBOUNCE_RATIO: f64 = 0.01;
const POSITION_STREAM_BUFFER: usize = 256;

fn changed_enough(prior: &PositionUpdate, next: &PositionUpdate) -> bool {
    fn moved(a: f64, b: f64) -> bool {
        if a == 0.0 {
            return b != 0.0;
        }
        ((b - a) / a).abs() > DEBOUNCE_RATIO
    }
    moved(prior.quantity, next.quantity)
        || moved(prior.average_price, next.average_price)
        || moved(prior.mark, next.mark)
        || moved(prior.unrealized, next.unrealized)
        || moved(prior.realized, next.realized)
}

struct DedupeLru {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DedupeLru {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns `true` if `id` was already seen (i.e. this is a duplicate).
    fn observe(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return true;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        false
    }
}

struct SequenceTracker {
    last_sequence: HashMap<(Symbol, Venue), u64>,
    last_timestamp: HashMap<(Symbol, Venue), TimestampMs>,
}

impl SequenceTracker {
    fn new() -> Self {
        Self {
            last_sequence: HashMap::new(),
            last_timestamp: HashMap::new(),
        }
    }

    /// Returns `true` if this event is stale relative to what was already
    /// applied for `(symbol, venue)` and should be dropped.
    fn is_stale(&mut self, symbol: &str, venue: &str, sequence: Option<u64>, timestamp: TimestampMs) -> bool {
        let key = (symbol.to_string(), venue.to_string());
        if let Some(seq) = sequence {
            if let Some(&last) = self.last_sequence.get(&key) {
                if seq <= last {
                    return true;
                }
            }
            self.last_sequence.insert(key.clone(), seq);
            self.last_timestamp.insert(key, timestamp);
            false
        } else {
            if let Some(&last) = self.last_timestamp.get(&key) {
                if timestamp < last {
                    return true;
                }
            }
            self.last_timestamp.insert(key, timestamp);
            false
        }
    }
}

/// Applies inbound events to the position book and fans out position/alert
/// updates to subscribers. Owns the open-order-count table used by
/// rate-limit decisions and the balance table (informational only, not
/// used to reconstruct positions).
pub struct IngestionFacade {
    positions: Arc<PositionBook>,
    alerts: Arc<AlertPipeline>,
    dedupe: Mutex<DedupeLru>,
    sequencing: Mutex<SequenceTracker>,
    balances: Mutex<HashMap<(Venue, String), BalanceRow>>,
    open_orders: Mutex<HashMap<Venue, i64>>,
    last_broadcast: Mutex<HashMap<(Symbol, Venue), PositionUpdate>>,
    position_stream: broadcast::Sender<PositionUpdate>,
}

impl IngestionFacade {
    pub fn new(positions: Arc<PositionBook>, alerts: Arc<AlertPipeline>, dedupe_window: usize) -> Self {
        let (position_stream, _rx) = broadcast::channel(POSITION_STREAM_BUFFER);
        Self {
            positions,
            alerts,
            dedupe: Mutex::new(DedupeLru::new(dedupe_window)),
            sequencing: Mutex::new(SequenceTracker::new()),
            balances: Mutex::new(HashMap::new()),
            open_orders: Mutex::new(HashMap::new()),
            last_broadcast: Mutex::new(HashMap::new()),
            position_stream,
        }
    }

    pub fn subscribe_positions(&self) -> broadcast::Receiver<PositionUpdate> {
        self.position_stream.subscribe()
    }

    /// Dispatches one inbound event to the matching handler. At-least-once
    /// ordered per `(symbol, venue)` is assumed of the transport; this is
    /// where duplicates and reordering are resolved.
    pub fn apply(&self, event: IngressEvent) -> RiskResult<()> {
        match event {
            IngressEvent::TradeExecution {
                execution_id,
                symbol,
                venue,
                side,
                quantity,
                price,
                fee: _,
                timestamp,
                sequence,
            } => self.apply_trade_execution(&execution_id, &symbol, &venue, side, quantity, price, timestamp, sequence),
            IngressEvent::OrderUpdate {
                order_id,
                symbol,
                venue,
                status,
                filled_qty,
                remaining_qty,
                timestamp,
                sequence,
            } => {
                self.apply_order_update(&order_id, &symbol, &venue, status, filled_qty, remaining_qty, timestamp, sequence);
                Ok(())
            }
            IngressEvent::Balance {
                venue,
                asset,
                free,
                locked,
                timestamp,
            } => {
                self.apply_balance_update(&venue, &asset, free, locked, timestamp);
                Ok(())
            }
            IngressEvent::MarketPrice {
                symbol,
                price,
                timestamp,
            } => {
                self.apply_market_price(&symbol, price, timestamp);
                Ok(())
            }
        }
    }

    fn apply_trade_execution(
        &self,
        execution_id: &str,
        symbol: &str,
        venue: &str,
        side: Side,
        quantity: f64,
        price: f64,
        timestamp: TimestampMs,
        sequence: Option<u64>,
    ) -> RiskResult<()> {
        if self.dedupe.lock().observe(execution_id) {
            debug!(execution_id, "duplicate trade execution suppressed");
            return Ok(());
        }
        if self.sequencing.lock().is_stale(symbol, venue, sequence, timestamp) {
            debug!(symbol, venue, "out-of-order trade execution dropped");
            return Ok(());
        }

        let signed_qty = match side {
            Side::Buy => quantity,
            Side::Sell => -quantity,
        };
        let fill = Fill {
            delta_quantity: signed_qty,
            fill_price: price,
            timestamp,
        };
        let position = self.positions.apply_fill(symbol, venue, fill)?;
        self.maybe_broadcast_position(&position);
        Ok(())
    }

    fn apply_order_update(
        &self,
        _order_id: &str,
        symbol: &str,
        venue: &str,
        status: OrderStatus,
        _filled_qty: f64,
        _remaining_qty: f64,
        timestamp: TimestampMs,
        sequence: Option<u64>,
    ) {
        if self.sequencing.lock().is_stale(symbol, venue, sequence, timestamp) {
            return;
        }
        let mut counts = self.open_orders.lock();
        let entry = counts.entry(venue.to_string()).or_insert(0);
        match status {
            OrderStatus::New => *entry += 1,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected => {
                *entry = (*entry - 1).max(0);
            }
            OrderStatus::PartiallyFilled => {}
        }
    }

    fn apply_balance_update(&self, venue: &str, asset: &str, free: f64, locked: f64, timestamp: TimestampMs) {
        let mut balances = self.balances.lock();
        let key = (venue.to_string(), asset.to_string());
        let replace = match balances.get(&key) {
            Some(row) => timestamp >= row.timestamp,
            None => true,
        };
        if replace {
            balances.insert(key, BalanceRow { free, locked, timestamp });
        }
    }

    /// Also invoked from `update_marks` callers (mark-price events) so a
    /// mark-driven change to unrealized P&L is debounced the same way a
    /// fill-driven change is.
    pub fn on_mark_update(&self, symbol: &str, venue: &str) {
        if let Some(position) = self.positions.get_position(symbol, venue) {
            self.maybe_broadcast_position(&position);
        }
    }

    /// Seeds the mark for every venue currently holding `symbol`, then
    /// re-broadcasts each affected position so subscribers see the
    /// resulting unrealized P&L move. A mark with no open position anywhere
    /// is simply recorded for when a position opens later.
    fn apply_market_price(&self, symbol: &str, price: f64, timestamp: TimestampMs) {
        self.positions.update_marks(symbol, price, timestamp);
        for position in self.positions.get_all_positions() {
            if position.symbol == symbol {
                self.on_mark_update(&position.symbol, &position.venue);
            }
        }
    }

    fn maybe_broadcast_position(&self, position: &Position) {
        let update = PositionUpdate::from_position(position);
        let key = (position.symbol.clone(), position.venue.clone());
        let mut last = self.last_broadcast.lock();
        let should_send = match last.get(&key) {
            Some(prior) => changed_enough(prior, &update),
            None => true,
        };
        if should_send {
            last.insert(key, update.clone());
            drop(last);
            let _ = self.position_stream.send(update);
        }
    }

    pub fn open_order_count(&self, venue: &str) -> i64 {
        self.open_orders.lock().get(venue).copied().unwrap_or(0)
    }

    pub fn balance(&self, venue: &str, asset: &str) -> Option<BalanceRow> {
        self.balances
            .lock()
            .get(&(venue.to_string(), asset.to_string()))
            .copied()
    }

    /// Raises a meta-alert when storage behind this facade is degraded;
    /// shares the `storage_degraded` alert kind used by the position book's
    /// own persistence path.
    pub fn report_degraded(&self, detail: &str) {
        warn!(detail, "ingestion-observed storage degradation");
        let mut metadata = HashMap::new();
        metadata.insert("detail".to_string(), serde_json::Value::String(detail.to_string()));
        self.alerts.enqueue(Severity::Warning, "storage_degraded", detail.to_string(), metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker_pool::PriorityPool;

    fn facade() -> IngestionFacade {
        let positions = Arc::new(PositionBook::new());
        let pool = Arc::new(PriorityPool::new(1));
        let alerts = Arc::new(AlertPipeline::new(pool, 100, 256));
        IngestionFacade::new(positions, alerts, 100_000)
    }

    fn trade(execution_id: &str, symbol: &str, venue: &str, side: Side, qty: f64, price: f64, ts: i64, seq: Option<u64>) -> IngressEvent {
        IngressEvent::TradeExecution {
            execution_id: execution_id.to_string(),
            symbol: symbol.to_string(),
            venue: venue.to_string(),
            side,
            quantity: qty,
            price,
            fee: 0.0,
            timestamp: ts,
            sequence: seq,
        }
    }

    #[test]
    fn applies_trade_execution_to_position_book() {
        let facade = facade();
        facade.apply(trade("e1", "BTC/USDT", "binance", Side::Buy, 1.0, 20000.0, 1, Some(1))).unwrap();
        let pos = facade.positions.get_position("BTC/USDT", "binance").unwrap();
        assert_eq!(pos.quantity, 1.0);
    }

    #[test]
    fn duplicate_execution_id_is_suppressed() {
        let facade = facade();
        facade.apply(trade("e1", "BTC/USDT", "binance", Side::Buy, 1.0, 20000.0, 1, Some(1))).unwrap();
        facade.apply(trade("e1", "BTC/USDT", "binance", Side::Buy, 1.0, 20000.0, 2, Some(2))).unwrap();
        let pos = facade.positions.get_position("BTC/USDT", "binance").unwrap();
        assert_eq!(pos.quantity, 1.0);
    }

    #[test]
    fn out_of_order_sequence_is_dropped() {
        let facade = facade();
        facade.apply(trade("e1", "BTC/USDT", "binance", Side::Buy, 1.0, 20000.0, 5, Some(5))).unwrap();
        facade.apply(trade("e2", "BTC/USDT", "binance", Side::Buy, 1.0, 19000.0, 2, Some(2))).unwrap();
        let pos = facade.positions.get_position("BTC/USDT", "binance").unwrap();
        assert_eq!(pos.quantity, 1.0);
        assert_eq!(pos.average_entry, 20000.0);
    }

    #[test]
    fn order_update_tracks_open_order_count_per_venue() {
        let facade = facade();
        facade.apply(IngressEvent::OrderUpdate {
            order_id: "o1".into(),
            symbol: "BTC/USDT".into(),
            venue: "binance".into(),
            status: OrderStatus::New,
            filled_qty: 0.0,
            remaining_qty: 1.0,
            timestamp: 1,
            sequence: None,
        }).unwrap();
        assert_eq!(facade.open_order_count("binance"), 1);
        facade.apply(IngressEvent::OrderUpdate {
            order_id: "o1".into(),
            symbol: "BTC/USDT".into(),
            venue: "binance".into(),
            status: OrderStatus::Filled,
            filled_qty: 1.0,
            remaining_qty: 0.0,
            timestamp: 2,
            sequence: None,
        }).unwrap();
        assert_eq!(facade.open_order_count("binance"), 0);
    }

    #[test]
    fn balance_update_is_last_write_wins_by_timestamp() {
        let facade = facade();
        facade.apply(IngressEvent::Balance { venue: "binance".into(), asset: "USDT".into(), free: 100.0, locked: 0.0, timestamp: 5 }).unwrap();
        facade.apply(IngressEvent::Balance { venue: "binance".into(), asset: "USDT".into(), free: 50.0, locked: 0.0, timestamp: 2 }).unwrap();
        let row = facade.balance("binance", "USDT").unwrap();
        assert_eq!(row.free, 100.0);
    }

    #[test]
    fn position_stream_debounces_small_changes() {
        let facade = facade();
        let mut rx = facade.subscribe_positions();
        facade.apply(trade("e1", "BTC/USDT", "binance", Side::Buy, 1.0, 20000.0, 1, Some(1))).unwrap();
        assert!(rx.try_recv().is_ok());

        facade.positions.update_marks("BTC/USDT", 20000.01, 2);
        facade.on_mark_update("BTC/USDT", "binance");
        assert!(rx.try_recv().is_err(), "a sub-1% mark move should be debounced");

        facade.positions.update_marks("BTC/USDT", 21000.0, 3);
        facade.on_mark_update("BTC/USDT", "binance");
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn market_price_event_seeds_marks_and_broadcasts_affected_positions() {
        let facade = facade();
        let mut rx = facade.subscribe_positions();
        facade.apply(trade("e1", "BTC/USDT", "binance", Side::Buy, 1.0, 20000.0, 1, Some(1))).unwrap();
        assert!(rx.try_recv().is_ok());

        facade.apply(IngressEvent::MarketPrice {
            symbol: "BTC/USDT".into(),
            price: 21000.0,
            timestamp: 2,
        }).unwrap();

        let pos = facade.positions.get_position("BTC/USDT", "binance").unwrap();
        assert!((pos.mark_price - 21000.0).abs() < 1e-9);
        assert!((pos.unrealized_pnl() - 1000.0).abs() < 1e-9);
        assert!(rx.try_recv().is_ok(), "a 5% mark move should broadcast");
    }

    #[test]
    fn market_price_event_with_no_open_position_is_a_no_op() {
        let facade = facade();
        facade.apply(IngressEvent::MarketPrice {
            symbol: "ETH/USDT".into(),
            price: 3000.0,
            timestamp: 1,
        }).unwrap();
        assert!(facade.positions.get_position("ETH/USDT", "binance").is_none());
    }
}
