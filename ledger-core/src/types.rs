//! Core types for the ledger
//!
//! All types are designed for:
//! - Exact arithmetic (Decimal for money)
//! - Explicit state (status enums, never free strings)
//! - Single use of a balance hold (`Reservation` is neither `Clone` nor `Copy`)

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of a fund
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FundStatus {
    /// Accepts new reservations
    Active,
    /// Temporarily frozen, may be reactivated
    Suspended,
    /// Permanently closed
    Closed,
}

impl FundStatus {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            FundStatus::Active => "active",
            FundStatus::Suspended => "suspended",
            FundStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for FundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FundStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(FundStatus::Active),
            "suspended" => Ok(FundStatus::Suspended),
            "closed" => Ok(FundStatus::Closed),
            other => Err(Error::Storage(format!("Unknown fund status: {}", other))),
        }
    }
}

/// A pool of money that transactions draw from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fund {
    /// Fund ID
    pub id: Uuid,

    /// Display name
    pub name: String,

    /// Free-text description
    pub description: Option<String>,

    /// Amount allocated at creation, never changes
    pub total_amount: Decimal,

    /// Amount not yet disbursed by completed transactions
    pub remaining_amount: Decimal,

    /// Amount held by open reservations
    pub reserved_amount: Decimal,

    /// Lifecycle status
    pub status: FundStatus,

    /// Admin user who created the fund
    pub created_by: Uuid,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last balance or metadata change
    pub updated_at: DateTime<Utc>,
}

impl Fund {
    /// Amount a new reservation may still claim
    pub fn available_amount(&self) -> Decimal {
        self.remaining_amount - self.reserved_amount
    }

    /// Amount paid out by completed transactions
    pub fn disbursed_amount(&self) -> Decimal {
        self.total_amount - self.remaining_amount
    }

    /// Check balance bounds
    pub fn check_invariants(&self) -> Result<()> {
        if self.remaining_amount < Decimal::ZERO || self.remaining_amount > self.total_amount {
            return Err(Error::InvariantViolation(format!(
                "fund {} remaining {} outside [0, {}]",
                self.id, self.remaining_amount, self.total_amount
            )));
        }
        if self.reserved_amount < Decimal::ZERO || self.reserved_amount > self.remaining_amount {
            return Err(Error::InvariantViolation(format!(
                "fund {} reserved {} outside [0, {}]",
                self.id, self.reserved_amount, self.remaining_amount
            )));
        }
        Ok(())
    }
}

/// Input for creating a fund
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFund {
    /// Display name
    pub name: String,
    /// Free-text description
    pub description: Option<String>,
    /// Amount allocated
    pub total_amount: Decimal,
    /// Creating admin
    pub created_by: Uuid,
}

impl NewFund {
    /// Reject empty names and non-positive totals
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidFund("name must not be empty".to_string()));
        }
        if self.total_amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!(
                "total amount must be positive, got {}",
                self.total_amount
            )));
        }
        Ok(())
    }
}

/// Mutable fund fields; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FundUpdate {
    /// New display name
    pub name: Option<String>,
    /// New description
    pub description: Option<String>,
    /// New status
    pub status: Option<FundStatus>,
}

impl FundUpdate {
    /// Validate the update against the fund's current state
    pub fn validate_against(&self, fund: &Fund) -> Result<()> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(Error::InvalidFund("name must not be empty".to_string()));
            }
        }
        if let Some(status) = self.status {
            if fund.status == FundStatus::Closed && status != FundStatus::Closed {
                return Err(Error::InvalidFund(format!(
                    "fund {} is closed and cannot become {}",
                    fund.id, status
                )));
            }
        }
        Ok(())
    }

    /// Apply to an in-memory fund
    pub fn apply(&self, fund: &mut Fund, now: DateTime<Utc>) {
        if let Some(name) = &self.name {
            fund.name = name.clone();
        }
        if let Some(description) = &self.description {
            fund.description = Some(description.clone());
        }
        if let Some(status) = self.status {
            fund.status = status;
        }
        fund.updated_at = now;
    }
}

/// A provisional hold against a fund's available balance
///
/// Consumed by [`LedgerStore::commit`](crate::LedgerStore::commit) or
/// [`LedgerStore::release`](crate::LedgerStore::release).
#[derive(Debug)]
pub struct Reservation {
    id: Uuid,
    fund_id: Uuid,
    amount: Decimal,
    created_at: DateTime<Utc>,
}

impl Reservation {
    pub(crate) fn new(fund_id: Uuid, amount: Decimal, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            fund_id,
            amount,
            created_at,
        }
    }

    /// Reservation ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Fund the hold is placed on
    pub fn fund_id(&self) -> Uuid {
        self.fund_id
    }

    /// Held amount
    pub fn amount(&self) -> Decimal {
        self.amount
    }

    /// When the hold was placed
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Transaction lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    /// Recorded, settlement outstanding
    Pending,
    /// Settled, balance deducted
    Completed,
    /// Settlement failed, balance untouched
    Failed,
}

impl TransactionStatus {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }

    /// `completed` and `failed` are sinks
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(Error::Storage(format!("Unknown transaction status: {}", other))),
        }
    }
}

/// A disbursement from a fund to an external-ledger address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction ID
    pub id: Uuid,

    /// Fund drawn from
    pub fund_id: Uuid,

    /// Initiating user
    pub user_id: Uuid,

    /// Reservation backing this transaction
    pub reservation_id: Option<Uuid>,

    /// External-ledger recipient account
    pub recipient_address: String,

    /// Disbursed amount
    pub amount: Decimal,

    /// Lifecycle status
    pub status: TransactionStatus,

    /// Settlement receipt (external transaction hash)
    pub transaction_hash: Option<String>,

    /// Block the settlement was included in
    pub block_number: Option<i64>,

    /// Gas consumed by the settlement
    pub gas_used: Option<i64>,

    /// Why settlement failed
    pub failure_reason: Option<String>,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Time the terminal state was reached
    pub completed_at: Option<DateTime<Utc>>,
}

/// Caller-supplied part of a new transaction; fund and amount come from the reservation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionDraft {
    /// Initiating user
    pub user_id: Uuid,
    /// External-ledger recipient account
    pub recipient_address: String,
}

/// Successful settlement outcome recorded on commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    /// Receipt identifier
    pub transaction_hash: String,
    /// Block the settlement was included in
    pub block_number: Option<i64>,
    /// Gas consumed
    pub gas_used: Option<i64>,
}

/// Operator decision for a `pending` transaction whose outcome was never recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum Resolution {
    /// The external transfer happened; the held amount is deducted
    Completed(Settlement),
    /// No transfer happened; the hold is voided
    Failed {
        /// Recorded as the failure reason
        reason: String,
    },
}

/// Transaction listing filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionFilter {
    /// Only this initiator
    pub user_id: Option<Uuid>,
    /// Only this fund
    pub fund_id: Option<Uuid>,
    /// Only this status
    pub status: Option<TransactionStatus>,
    /// Maximum rows, newest first
    pub limit: Option<i64>,
}

impl TransactionFilter {
    /// Default row cap for listings
    pub const DEFAULT_LIMIT: i64 = 100;

    /// Whether a transaction passes the filter (limit excluded)
    pub fn matches(&self, tx: &Transaction) -> bool {
        self.user_id.map_or(true, |id| tx.user_id == id)
            && self.fund_id.map_or(true, |id| tx.fund_id == id)
            && self.status.map_or(true, |status| tx.status == status)
    }

    /// Effective row cap
    pub fn effective_limit(&self) -> i64 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).max(1)
    }
}

/// Aggregate ledger figures for dashboards
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Number of funds
    pub total_funds: i64,
    /// Funds in `active` status
    pub active_funds: i64,
    /// Σ total_amount
    pub total_allocated: Decimal,
    /// Σ remaining_amount
    pub total_remaining: Decimal,
    /// Number of transactions
    pub total_transactions: i64,
    /// Transactions awaiting settlement
    pub pending_transactions: i64,
    /// Settled transactions
    pub completed_transactions: i64,
    /// Failed transactions
    pub failed_transactions: i64,
    /// Σ amount over completed transactions
    pub total_disbursed: Decimal,
}
