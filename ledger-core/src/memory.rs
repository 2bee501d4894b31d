//! In-memory ledger store
//!
//! Funds live in a `DashMap`; the check-and-hold in `reserve` runs while the
//! fund's entry is exclusively locked, so concurrent reservations on one fund
//! serialize while different funds proceed in parallel.
//!
//! Commit and release change the fund and the transaction under both entry
//! guards at once. Lock order is snapshot gate, fund entry, transaction
//! entry; nothing takes a fund entry while holding a transaction entry.
//! `stats` takes the gate exclusively so it never sees one without the other.

use crate::error::{Error, Result};
use crate::store::{validate_amount, LedgerStore};
use crate::types::{
    Fund, FundStatus, FundUpdate, LedgerStats, NewFund, Reservation, Resolution, Settlement,
    Transaction, TransactionDraft, TransactionFilter, TransactionStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct Hold {
    fund_id: Uuid,
    amount: Decimal,
}

/// Ledger store backed by process memory
#[derive(Debug, Default)]
pub struct MemoryLedger {
    funds: DashMap<Uuid, Fund>,
    holds: DashMap<Uuid, Hold>,
    transactions: DashMap<Uuid, Transaction>,
    snapshot: RwLock<()>,
}

impl MemoryLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reservations not yet committed or released
    pub fn open_reservations(&self) -> usize {
        self.holds.len()
    }

    /// Resolve a hold exactly once; on error the hold stays open and nothing changes
    fn resolve(
        &self,
        reservation_id: Uuid,
        transaction_id: Option<Uuid>,
        resolution: &Resolution,
    ) -> Result<(Hold, Option<Transaction>)> {
        let _gate = self.snapshot.read();

        let hold = self
            .holds
            .remove(&reservation_id)
            .map(|(_, hold)| hold)
            .ok_or(Error::ReservationResolved(reservation_id))?;

        match self.apply_resolution(reservation_id, hold, transaction_id, resolution) {
            Ok(tx) => Ok((hold, tx)),
            Err(e) => {
                self.holds.insert(reservation_id, hold);
                Err(e)
            }
        }
    }

    fn apply_resolution(
        &self,
        reservation_id: Uuid,
        hold: Hold,
        transaction_id: Option<Uuid>,
        resolution: &Resolution,
    ) -> Result<Option<Transaction>> {
        let mut fund = self.funds.get_mut(&hold.fund_id).ok_or_else(|| {
            Error::InvariantViolation(format!("fund {} vanished under a hold", hold.fund_id))
        })?;

        let mut linked = match transaction_id {
            Some(id) => {
                let tx = self
                    .transactions
                    .get_mut(&id)
                    .ok_or(Error::TransactionNotFound(id))?;
                check_linked(&tx, reservation_id)?;
                Some(tx)
            }
            None => None,
        };

        let now = Utc::now();
        let mut next = fund.clone();
        next.reserved_amount -= hold.amount;
        if matches!(resolution, Resolution::Completed(_)) {
            next.remaining_amount -= hold.amount;
        }
        next.updated_at = now;
        next.check_invariants()?;
        *fund = next;

        Ok(linked.as_mut().map(|guard| {
            let tx: &mut Transaction = guard;
            finish(tx, resolution, now);
            tx.clone()
        }))
    }
}

/// Check that a transaction is pending and backed by the reservation
fn check_linked(tx: &Transaction, reservation_id: Uuid) -> Result<()> {
    if tx.status.is_terminal() {
        return Err(Error::TransactionNotPending {
            transaction_id: tx.id,
            status: tx.status,
        });
    }
    if tx.reservation_id != Some(reservation_id) {
        return Err(Error::InvariantViolation(format!(
            "transaction {} is not backed by reservation {}",
            tx.id, reservation_id
        )));
    }
    Ok(())
}

fn finish(tx: &mut Transaction, resolution: &Resolution, now: DateTime<Utc>) {
    match resolution {
        Resolution::Completed(settlement) => {
            tx.status = TransactionStatus::Completed;
            tx.transaction_hash = Some(settlement.transaction_hash.clone());
            tx.block_number = settlement.block_number;
            tx.gas_used = settlement.gas_used;
        }
        Resolution::Failed { reason } => {
            tx.status = TransactionStatus::Failed;
            tx.failure_reason = Some(reason.clone());
        }
    }
    tx.completed_at = Some(now);
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn create_fund(&self, new_fund: NewFund) -> Result<Fund> {
        new_fund.validate()?;

        let now = Utc::now();
        let fund = Fund {
            id: Uuid::new_v4(),
            name: new_fund.name,
            description: new_fund.description,
            total_amount: new_fund.total_amount,
            remaining_amount: new_fund.total_amount,
            reserved_amount: Decimal::ZERO,
            status: FundStatus::Active,
            created_by: new_fund.created_by,
            created_at: now,
            updated_at: now,
        };

        self.funds.insert(fund.id, fund.clone());
        info!("Created fund {} with {}", fund.id, fund.total_amount);
        Ok(fund)
    }

    async fn get_fund(&self, fund_id: Uuid) -> Result<Fund> {
        self.funds
            .get(&fund_id)
            .map(|f| f.clone())
            .ok_or(Error::FundNotFound(fund_id))
    }

    async fn list_funds(&self) -> Result<Vec<Fund>> {
        let mut funds: Vec<Fund> = self.funds.iter().map(|f| f.clone()).collect();
        funds.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(funds)
    }

    async fn update_fund(&self, fund_id: Uuid, update: FundUpdate) -> Result<Fund> {
        let mut fund = self
            .funds
            .get_mut(&fund_id)
            .ok_or(Error::FundNotFound(fund_id))?;

        update.validate_against(&fund)?;
        update.apply(&mut fund, Utc::now());
        Ok(fund.clone())
    }

    async fn reserve(&self, fund_id: Uuid, amount: Decimal) -> Result<Reservation> {
        validate_amount(amount)?;

        let mut fund = self
            .funds
            .get_mut(&fund_id)
            .ok_or(Error::FundNotFound(fund_id))?;

        if fund.status != FundStatus::Active {
            return Err(Error::FundNotActive {
                fund_id,
                status: fund.status,
            });
        }

        let available = fund.available_amount();
        if available < amount {
            return Err(Error::InsufficientBalance {
                fund_id,
                requested: amount,
                available,
            });
        }

        let now = Utc::now();
        fund.reserved_amount += amount;
        fund.updated_at = now;
        drop(fund);

        let reservation = Reservation::new(fund_id, amount, now);
        self.holds.insert(reservation.id(), Hold { fund_id, amount });

        debug!("Reserved {} on fund {} ({})", amount, fund_id, reservation.id());
        Ok(reservation)
    }

    async fn open_transaction(
        &self,
        reservation: &Reservation,
        draft: TransactionDraft,
    ) -> Result<Transaction> {
        if !self.holds.contains_key(&reservation.id()) {
            return Err(Error::ReservationResolved(reservation.id()));
        }

        let tx = Transaction {
            id: Uuid::new_v4(),
            fund_id: reservation.fund_id(),
            user_id: draft.user_id,
            reservation_id: Some(reservation.id()),
            recipient_address: draft.recipient_address,
            amount: reservation.amount(),
            status: TransactionStatus::Pending,
            transaction_hash: None,
            block_number: None,
            gas_used: None,
            failure_reason: None,
            created_at: Utc::now(),
            completed_at: None,
        };

        self.transactions.insert(tx.id, tx.clone());
        Ok(tx)
    }

    async fn commit(
        &self,
        reservation: Reservation,
        transaction_id: Uuid,
        settlement: Settlement,
    ) -> Result<Transaction> {
        let (hold, tx) = self.resolve(
            reservation.id(),
            Some(transaction_id),
            &Resolution::Completed(settlement),
        )?;
        let tx = tx.ok_or(Error::TransactionNotFound(transaction_id))?;

        info!(
            "Committed {} from fund {} (transaction {})",
            hold.amount, hold.fund_id, transaction_id
        );
        Ok(tx)
    }

    async fn release(
        &self,
        reservation: Reservation,
        transaction_id: Option<Uuid>,
        reason: &str,
    ) -> Result<Option<Transaction>> {
        let resolution = Resolution::Failed {
            reason: reason.to_string(),
        };
        let (hold, tx) = self.resolve(reservation.id(), transaction_id, &resolution)?;

        debug!(
            "Released {} on fund {} ({}): {}",
            hold.amount,
            hold.fund_id,
            reservation.id(),
            reason
        );
        Ok(tx)
    }

    async fn reconcile(&self, transaction_id: Uuid, resolution: Resolution) -> Result<Transaction> {
        let reservation_id = {
            let tx = self
                .transactions
                .get(&transaction_id)
                .ok_or(Error::TransactionNotFound(transaction_id))?;
            if tx.status.is_terminal() {
                return Err(Error::TransactionNotPending {
                    transaction_id,
                    status: tx.status,
                });
            }
            tx.reservation_id.ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "pending transaction {} has no reservation",
                    transaction_id
                ))
            })?
        };

        let (hold, tx) = self.resolve(reservation_id, Some(transaction_id), &resolution)?;
        let tx = tx.ok_or(Error::TransactionNotFound(transaction_id))?;

        info!(
            "Reconciled transaction {} as {} ({} on fund {})",
            transaction_id, tx.status, hold.amount, hold.fund_id
        );
        Ok(tx)
    }

    async fn get_transaction(&self, transaction_id: Uuid) -> Result<Transaction> {
        self.transactions
            .get(&transaction_id)
            .map(|t| t.clone())
            .ok_or(Error::TransactionNotFound(transaction_id))
    }

    async fn list_transactions(&self, filter: TransactionFilter) -> Result<Vec<Transaction>> {
        let mut txs: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|t| filter.matches(t))
            .map(|t| t.clone())
            .collect();
        txs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        txs.truncate(filter.effective_limit() as usize);
        Ok(txs)
    }

    async fn stats(&self) -> Result<LedgerStats> {
        let _gate = self.snapshot.write();
        let mut stats = LedgerStats::default();

        for fund in self.funds.iter() {
            stats.total_funds += 1;
            if fund.status == FundStatus::Active {
                stats.active_funds += 1;
            }
            stats.total_allocated += fund.total_amount;
            stats.total_remaining += fund.remaining_amount;
        }

        for tx in self.transactions.iter() {
            stats.total_transactions += 1;
            match tx.status {
                TransactionStatus::Pending => stats.pending_transactions += 1,
                TransactionStatus::Completed => {
                    stats.completed_transactions += 1;
                    stats.total_disbursed += tx.amount;
                }
                TransactionStatus::Failed => stats.failed_transactions += 1,
            }
        }

        Ok(stats)
    }
}
