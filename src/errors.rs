//! Error taxonomy for the risk control plane.
//!
//! Every public operation in the crate returns `Result<_, RiskError>` rather
//! than panicking. `anyhow` is reserved for the bootstrap path in `main.rs`
//! (config loading, store initialization) where a fatal error should abort
//! the process with context; everywhere else a typed error crosses the
//! component boundary so callers can branch on `kind()`.

use thiserror::Error;

/// The four error classes from the control plane's error handling design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input to a public operation. No state change occurred.
    Validation,
    /// Cache/TSDB/sink I/O that is expected to be transient and retried.
    Transient,
    /// Corrupted or impossible internal state. The specific operation is
    /// refused; the process keeps running.
    Invariant,
    /// Configuration or storage failure at startup. The core refuses to
    /// start.
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Transient => "transient",
            ErrorKind::Invariant => "invariant",
            ErrorKind::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Error)]
pub enum RiskError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl RiskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RiskError::Validation(_) => ErrorKind::Validation,
            RiskError::Transient(_) => ErrorKind::Transient,
            RiskError::Invariant(_) => ErrorKind::Invariant,
            RiskError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        RiskError::Validation(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        RiskError::Transient(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        RiskError::Invariant(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        RiskError::Fatal(msg.into())
    }
}

pub type RiskResult<T> = Result<T, RiskError>;
