// src/error.rs
use std::fmt;

/// Error taxonomy for the credit ledger core. Each variant maps to exactly
/// one propagation behavior.
#[derive(Debug)]
pub enum LedgerError {
    /// Argument violates a contract (non-positive amount, empty id). No
    /// state change has occurred.
    Invalid(String),
    /// Referenced entity does not exist. No state change has occurred.
    NotFound(String),
    /// Operation not permitted in the current state-machine state. No
    /// state change has occurred.
    InvalidState(String),
    /// Not enough `available` across selectable lots. Transaction rolled
    /// back before this is returned.
    InsufficientBalance,
    /// Idempotency mismatch, or BUSY-retry schedule exhausted.
    Conflict(String),
    /// A single-transfer or rolling-window governance cap was exceeded.
    GovernanceLimit(String),
    /// A provenance or budget pre-check denied the operation.
    PolicyDenied(String),
    /// Underlying store returned an error outside the taxonomy above.
    Storage(String),
    /// An invariant was found broken at runtime. Fail-loud: logged with
    /// full context at the point of construction, not just by the caller.
    Internal(String),
}

impl LedgerError {
    pub fn internal(context: impl Into<String>) -> Self {
        let msg = context.into();
        tracing::error!(message = %msg, "ledger invariant breach");
        LedgerError::Internal(msg)
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(msg) => write!(f, "invalid argument: {msg}"),
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::InsufficientBalance => write!(f, "insufficient balance"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::GovernanceLimit(field) => write!(f, "governance limit exceeded: {field}"),
            Self::PolicyDenied(reason) => write!(f, "policy denied: {reason}"),
            Self::Storage(msg) => write!(f, "storage error: {msg}"),
            Self::Internal(msg) => write!(f, "internal invariant breach: {msg}"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
