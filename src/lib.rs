//! Risk control plane library.
//!
//! Exposes the components described in the crate's design document: the
//! token-bucket rate limiter, the priority worker pool, and the risk
//! control plane proper under `risk`. `main.rs` wires these into the
//! control surface and owns process bootstrap.

pub mod auth;
pub mod config;
pub mod errors;
pub mod rate_limiter;
pub mod risk;
pub mod telemetry;
pub mod worker_pool;
