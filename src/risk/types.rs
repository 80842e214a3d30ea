//! Shared identifiers used across the risk control plane.

use serde::{Deserialize, Serialize};

/// An exchange identifier; also the rate limiter's tenant id, since a
/// tenant is typically a venue.
pub type Venue = String;

/// A tradable symbol, e.g. `"BTC/USDT"`.
pub type Symbol = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Buy => 1.0,
            Direction::Sell => -1.0,
        }
    }
}

/// Millisecond-precision UTC timestamp, matching the event `timestamp`
/// field's wire contract.
pub type TimestampMs = i64;
