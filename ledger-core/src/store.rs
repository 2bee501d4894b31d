//! Storage contract for funds, reservations and transactions
//!
//! Both implementations honour the same concurrency contract: `reserve` is a
//! single check-and-hold step per fund, and `commit`/`release` resolve a
//! reservation exactly once.

use crate::error::{Error, Result};
use crate::types::{
    Fund, FundUpdate, LedgerStats, NewFund, Reservation, Resolution, Settlement, Transaction,
    TransactionDraft, TransactionFilter,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Ledger Store
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create a fund with `remaining_amount == total_amount`
    async fn create_fund(&self, fund: NewFund) -> Result<Fund>;

    /// Get fund by ID
    async fn get_fund(&self, fund_id: Uuid) -> Result<Fund>;

    /// All funds, newest first
    async fn list_funds(&self) -> Result<Vec<Fund>>;

    /// Change name, description or status
    async fn update_fund(&self, fund_id: Uuid, update: FundUpdate) -> Result<Fund>;

    /// Hold `amount` against the fund's available balance
    ///
    /// Fails with `FundNotFound`, `FundNotActive`, `InvalidAmount` or
    /// `InsufficientBalance`; a failed call leaves the fund untouched.
    async fn reserve(&self, fund_id: Uuid, amount: Decimal) -> Result<Reservation>;

    /// Persist a `pending` transaction backed by the reservation
    async fn open_transaction(
        &self,
        reservation: &Reservation,
        draft: TransactionDraft,
    ) -> Result<Transaction>;

    /// Deduct the held amount and mark the transaction `completed`
    async fn commit(
        &self,
        reservation: Reservation,
        transaction_id: Uuid,
        settlement: Settlement,
    ) -> Result<Transaction>;

    /// Void the hold and, when a transaction was opened, mark it `failed`
    ///
    /// The fund's remaining balance is never touched.
    async fn release(
        &self,
        reservation: Reservation,
        transaction_id: Option<Uuid>,
        reason: &str,
    ) -> Result<Option<Transaction>>;

    /// Resolve a `pending` transaction through the reservation it still holds
    ///
    /// Used when the settling task could not record its outcome and the
    /// reservation token is gone. Fails with `TransactionNotPending` once the
    /// transaction is terminal, so a transaction is resolved at most once.
    async fn reconcile(&self, transaction_id: Uuid, resolution: Resolution) -> Result<Transaction>;

    /// Get transaction by ID
    async fn get_transaction(&self, transaction_id: Uuid) -> Result<Transaction>;

    /// Transactions matching the filter, newest first
    async fn list_transactions(&self, filter: TransactionFilter) -> Result<Vec<Transaction>>;

    /// Aggregate figures
    async fn stats(&self) -> Result<LedgerStats>;
}

/// Reject zero and negative disbursement amounts
pub fn validate_amount(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(Error::InvalidAmount(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_validate_amount() {
        assert!(validate_amount(dec!(0.01)).is_ok());
        assert!(validate_amount(Decimal::ZERO).is_err());
        assert!(validate_amount(dec!(-5)).is_err());
    }
}
