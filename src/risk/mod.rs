//! The real-time risk control plane: position/P&L accounting, pre-trade
//! risk assessment, the alert pipeline, the monitoring loop and halt
//! controller, and the ingestion/streaming facade.

pub mod alerts;
pub mod evaluator;
pub mod ingestion;
pub mod monitor;
pub mod position;
pub mod store;
pub mod types;
pub mod var;

pub use alerts::{Alert, AlertPipeline, Severity};
pub use evaluator::{Opportunity, RiskAssessment, RiskEvaluator};
pub use ingestion::{BalanceRow, IngestionFacade, IngressEvent, OrderStatus, PositionUpdate, Side};
pub use monitor::{HaltController, HaltRecord, HaltSource, MonitoringLoop};
pub use position::{Fill, Position, PositionBook};
pub use types::{Direction, Venue};
