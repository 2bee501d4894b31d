//! TranspareX Ledger Core
//!
//! Fund balances, reservations and the disbursement records drawn against them.
//!
//! # Architecture
//!
//! - **Reservation first**: a disbursement holds part of a fund's available
//!   balance before anything leaves the system, and the hold is either
//!   committed (balance deducted) or released (balance untouched)
//! - **Single gate per fund**: the check-and-hold on a fund is one atomic step,
//!   a conditional `UPDATE` in PostgreSQL or the fund's map-entry lock in memory
//! - **Terminal transactions**: `completed` and `failed` are never left
//!
//! # Invariants
//!
//! - `0 <= reserved_amount <= remaining_amount <= total_amount`
//! - `total_amount - remaining_amount == Σ amount(completed transactions)`
//! - A failed transaction never decrements a balance

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod types;

// Re-exports
pub use error::{Error, Result};
pub use memory::MemoryLedger;
pub use postgres::PgLedgerStore;
pub use store::LedgerStore;
pub use types::{
    Fund, FundStatus, FundUpdate, LedgerStats, NewFund, Reservation, Resolution, Settlement,
    Transaction, TransactionDraft, TransactionFilter, TransactionStatus,
};
