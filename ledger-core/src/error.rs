//! Error types for the ledger

use crate::types::{FundStatus, TransactionStatus};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Fund does not exist
    #[error("Fund not found: {0}")]
    FundNotFound(Uuid),

    /// Transaction does not exist
    #[error("Transaction not found: {0}")]
    TransactionNotFound(Uuid),

    /// Requested amount exceeds what the fund can still disburse
    #[error("Insufficient balance on fund {fund_id}: requested {requested}, available {available}")]
    InsufficientBalance {
        /// Fund that rejected the hold
        fund_id: Uuid,
        /// Amount asked for
        requested: Decimal,
        /// Remaining balance minus open reservations
        available: Decimal,
    },

    /// Fund is suspended or closed
    #[error("Fund {fund_id} is {status}")]
    FundNotActive {
        /// Fund that rejected the hold
        fund_id: Uuid,
        /// Its current status
        status: FundStatus,
    },

    /// Amount is zero, negative or otherwise unusable
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Fund definition or update is malformed
    #[error("Invalid fund: {0}")]
    InvalidFund(String),

    /// Reservation was already committed or released
    #[error("Reservation already resolved: {0}")]
    ReservationResolved(Uuid),

    /// Transaction already reached a terminal state
    #[error("Transaction {transaction_id} is already {status}")]
    TransactionNotPending {
        /// Transaction asked about
        transaction_id: Uuid,
        /// Its current status
        status: TransactionStatus,
    },

    /// Invariant violation (balance bounds, terminal state, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
