//! PostgreSQL ledger store
//!
//! The check-and-hold in `reserve` is a single conditional `UPDATE`; the
//! database row lock serializes concurrent holds on the same fund. Commit and
//! release flip the reservation row from `held` inside the same database
//! transaction as the balance change, so a reservation resolves at most once.
//! `reconcile` locks the pending transaction row first and reuses the same
//! statements.

use crate::error::{Error, Result};
use crate::store::{validate_amount, LedgerStore};
use crate::types::{
    Fund, FundStatus, FundUpdate, LedgerStats, NewFund, Reservation, Resolution, Settlement,
    Transaction, TransactionDraft, TransactionFilter, TransactionStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Row};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(sqlx::FromRow)]
struct FundRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    total_amount: Decimal,
    remaining_amount: Decimal,
    reserved_amount: Decimal,
    status: String,
    created_by: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<FundRow> for Fund {
    type Error = Error;

    fn try_from(row: FundRow) -> Result<Self> {
        Ok(Fund {
            id: row.id,
            name: row.name,
            description: row.description,
            total_amount: row.total_amount,
            remaining_amount: row.remaining_amount,
            reserved_amount: row.reserved_amount,
            status: row.status.parse()?,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    fund_id: Uuid,
    user_id: Uuid,
    reservation_id: Option<Uuid>,
    recipient_address: String,
    amount: Decimal,
    status: String,
    transaction_hash: Option<String>,
    block_number: Option<i64>,
    gas_used: Option<i64>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = Error;

    fn try_from(row: TransactionRow) -> Result<Self> {
        Ok(Transaction {
            id: row.id,
            fund_id: row.fund_id,
            user_id: row.user_id,
            reservation_id: row.reservation_id,
            recipient_address: row.recipient_address,
            amount: row.amount,
            status: row.status.parse()?,
            transaction_hash: row.transaction_hash,
            block_number: row.block_number,
            gas_used: row.gas_used,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

/// Ledger store backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Wrap an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_fund<'e, E>(executor: E, fund_id: Uuid) -> Result<Option<Fund>>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let row = sqlx::query_as::<_, FundRow>(
            r#"
            SELECT * FROM funds WHERE id = $1
            "#,
        )
        .bind(fund_id)
        .fetch_optional(executor)
        .await?;

        row.map(Fund::try_from).transpose()
    }

    /// Flip the reservation row out of `held`, returning false if it was not held
    async fn resolve_reservation(
        conn: &mut sqlx::PgConnection,
        reservation_id: Uuid,
        outcome: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE fund_reservations
            SET status = $1, resolved_at = $2
            WHERE id = $3 AND status = 'held'
            "#,
        )
        .bind(outcome)
        .bind(Utc::now())
        .bind(reservation_id)
        .execute(conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Deduct a held amount and complete its transaction
    async fn apply_commit(
        conn: &mut sqlx::PgConnection,
        reservation_id: Uuid,
        fund_id: Uuid,
        amount: Decimal,
        transaction_id: Uuid,
        settlement: &Settlement,
    ) -> Result<Transaction> {
        if !Self::resolve_reservation(&mut *conn, reservation_id, "committed").await? {
            return Err(Error::ReservationResolved(reservation_id));
        }

        let deducted = sqlx::query(
            r#"
            UPDATE funds
            SET remaining_amount = remaining_amount - $1,
                reserved_amount = reserved_amount - $1,
                updated_at = $2
            WHERE id = $3 AND reserved_amount >= $1 AND remaining_amount >= $1
            "#,
        )
        .bind(amount)
        .bind(Utc::now())
        .bind(fund_id)
        .execute(&mut *conn)
        .await?;

        if deducted.rows_affected() == 0 {
            return Err(Error::InvariantViolation(format!(
                "fund {} cannot absorb commit of {}",
                fund_id, amount
            )));
        }

        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            UPDATE transactions
            SET status = 'completed', transaction_hash = $1, block_number = $2,
                gas_used = $3, completed_at = $4
            WHERE id = $5 AND reservation_id = $6 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(&settlement.transaction_hash)
        .bind(settlement.block_number)
        .bind(settlement.gas_used)
        .bind(Utc::now())
        .bind(transaction_id)
        .bind(reservation_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| {
            Error::InvariantViolation(format!(
                "transaction {} is not pending under reservation {}",
                transaction_id, reservation_id
            ))
        })?;

        Transaction::try_from(row)
    }

    /// Void a hold and, when given, fail its transaction
    async fn apply_release(
        conn: &mut sqlx::PgConnection,
        reservation_id: Uuid,
        fund_id: Uuid,
        amount: Decimal,
        transaction_id: Option<Uuid>,
        reason: &str,
    ) -> Result<Option<Transaction>> {
        if !Self::resolve_reservation(&mut *conn, reservation_id, "released").await? {
            return Err(Error::ReservationResolved(reservation_id));
        }

        sqlx::query(
            r#"
            UPDATE funds
            SET reserved_amount = reserved_amount - $1, updated_at = $2
            WHERE id = $3
            "#,
        )
        .bind(amount)
        .bind(Utc::now())
        .bind(fund_id)
        .execute(&mut *conn)
        .await?;

        let Some(id) = transaction_id else {
            return Ok(None);
        };

        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            UPDATE transactions
            SET status = 'failed', failure_reason = $1, completed_at = $2
            WHERE id = $3 AND reservation_id = $4 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(id)
        .bind(reservation_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| {
            Error::InvariantViolation(format!(
                "transaction {} is not pending under reservation {}",
                id, reservation_id
            ))
        })?;

        Ok(Some(Transaction::try_from(row)?))
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn create_fund(&self, new_fund: NewFund) -> Result<Fund> {
        new_fund.validate()?;

        let now = Utc::now();
        let row = sqlx::query_as::<_, FundRow>(
            r#"
            INSERT INTO funds (id, name, description, total_amount, remaining_amount,
                               reserved_amount, status, created_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4, 0, 'active', $5, $6, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new_fund.name)
        .bind(&new_fund.description)
        .bind(new_fund.total_amount)
        .bind(new_fund.created_by)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let fund = Fund::try_from(row)?;
        info!("Created fund {} with {}", fund.id, fund.total_amount);
        Ok(fund)
    }

    async fn get_fund(&self, fund_id: Uuid) -> Result<Fund> {
        Self::fetch_fund(&self.pool, fund_id)
            .await?
            .ok_or(Error::FundNotFound(fund_id))
    }

    async fn list_funds(&self) -> Result<Vec<Fund>> {
        let rows = sqlx::query_as::<_, FundRow>(
            r#"
            SELECT * FROM funds ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Fund::try_from).collect()
    }

    async fn update_fund(&self, fund_id: Uuid, update: FundUpdate) -> Result<Fund> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, FundRow>(
            r#"
            SELECT * FROM funds WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(fund_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(Error::FundNotFound(fund_id))?;
        let current = Fund::try_from(current)?;

        update.validate_against(&current)?;

        let row = sqlx::query_as::<_, FundRow>(
            r#"
            UPDATE funds
            SET name = COALESCE($1, name),
                description = COALESCE($2, description),
                status = COALESCE($3, status),
                updated_at = $4
            WHERE id = $5
            RETURNING *
            "#,
        )
        .bind(&update.name)
        .bind(&update.description)
        .bind(update.status.map(|s| s.as_str()))
        .bind(Utc::now())
        .bind(fund_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Fund::try_from(row)
    }

    async fn reserve(&self, fund_id: Uuid, amount: Decimal) -> Result<Reservation> {
        validate_amount(amount)?;

        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let held = sqlx::query(
            r#"
            UPDATE funds
            SET reserved_amount = reserved_amount + $1, updated_at = $2
            WHERE id = $3 AND status = 'active' AND remaining_amount - reserved_amount >= $1
            "#,
        )
        .bind(amount)
        .bind(now)
        .bind(fund_id)
        .execute(&mut *tx)
        .await?;

        if held.rows_affected() == 0 {
            tx.rollback().await?;
            let fund = self.get_fund(fund_id).await?;
            if fund.status != FundStatus::Active {
                return Err(Error::FundNotActive {
                    fund_id,
                    status: fund.status,
                });
            }
            return Err(Error::InsufficientBalance {
                fund_id,
                requested: amount,
                available: fund.available_amount(),
            });
        }

        let reservation = Reservation::new(fund_id, amount, now);
        sqlx::query(
            r#"
            INSERT INTO fund_reservations (id, fund_id, amount, status, created_at)
            VALUES ($1, $2, $3, 'held', $4)
            "#,
        )
        .bind(reservation.id())
        .bind(fund_id)
        .bind(amount)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!("Reserved {} on fund {} ({})", amount, fund_id, reservation.id());
        Ok(reservation)
    }

    async fn open_transaction(
        &self,
        reservation: &Reservation,
        draft: TransactionDraft,
    ) -> Result<Transaction> {
        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            INSERT INTO transactions (id, fund_id, user_id, reservation_id, recipient_address,
                                      amount, status, created_at)
            SELECT $1, r.fund_id, $2, r.id, $3, r.amount, 'pending', $4
            FROM fund_reservations r
            WHERE r.id = $5 AND r.status = 'held'
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(draft.user_id)
        .bind(&draft.recipient_address)
        .bind(Utc::now())
        .bind(reservation.id())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::ReservationResolved(reservation.id()))?;

        Transaction::try_from(row)
    }

    async fn commit(
        &self,
        reservation: Reservation,
        transaction_id: Uuid,
        settlement: Settlement,
    ) -> Result<Transaction> {
        let mut tx = self.pool.begin().await?;
        let committed = Self::apply_commit(
            &mut tx,
            reservation.id(),
            reservation.fund_id(),
            reservation.amount(),
            transaction_id,
            &settlement,
        )
        .await?;
        tx.commit().await?;

        info!(
            "Committed {} from fund {} (transaction {})",
            reservation.amount(),
            reservation.fund_id(),
            transaction_id
        );
        Ok(committed)
    }

    async fn release(
        &self,
        reservation: Reservation,
        transaction_id: Option<Uuid>,
        reason: &str,
    ) -> Result<Option<Transaction>> {
        let mut tx = self.pool.begin().await?;
        let failed = Self::apply_release(
            &mut tx,
            reservation.id(),
            reservation.fund_id(),
            reservation.amount(),
            transaction_id,
            reason,
        )
        .await?;
        tx.commit().await?;

        debug!(
            "Released {} on fund {} ({}): {}",
            reservation.amount(),
            reservation.fund_id(),
            reservation.id(),
            reason
        );
        Ok(failed)
    }

    async fn reconcile(&self, transaction_id: Uuid, resolution: Resolution) -> Result<Transaction> {
        let mut tx = self.pool.begin().await?;

        let pending = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT * FROM transactions WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(Error::TransactionNotFound(transaction_id))?;
        let pending = Transaction::try_from(pending)?;

        if pending.status.is_terminal() {
            return Err(Error::TransactionNotPending {
                transaction_id,
                status: pending.status,
            });
        }
        let reservation_id = pending.reservation_id.ok_or_else(|| {
            Error::InvariantViolation(format!(
                "pending transaction {} has no reservation",
                transaction_id
            ))
        })?;

        let resolved = match &resolution {
            Resolution::Completed(settlement) => {
                Self::apply_commit(
                    &mut tx,
                    reservation_id,
                    pending.fund_id,
                    pending.amount,
                    transaction_id,
                    settlement,
                )
                .await?
            }
            Resolution::Failed { reason } => Self::apply_release(
                &mut tx,
                reservation_id,
                pending.fund_id,
                pending.amount,
                Some(transaction_id),
                reason,
            )
            .await?
            .ok_or(Error::TransactionNotFound(transaction_id))?,
        };
        tx.commit().await?;

        info!(
            "Reconciled transaction {} as {} ({} on fund {})",
            transaction_id, resolved.status, pending.amount, pending.fund_id
        );
        Ok(resolved)
    }

    async fn get_transaction(&self, transaction_id: Uuid) -> Result<Transaction> {
        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT * FROM transactions WHERE id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::TransactionNotFound(transaction_id))?;

        Transaction::try_from(row)
    }

    async fn list_transactions(&self, filter: TransactionFilter) -> Result<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT * FROM transactions
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::uuid IS NULL OR fund_id = $2)
              AND ($3::text IS NULL OR status = $3)
            ORDER BY created_at DESC
            LIMIT $4
            "#,
        )
        .bind(filter.user_id)
        .bind(filter.fund_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.effective_limit())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Transaction::try_from).collect()
    }

    async fn stats(&self) -> Result<LedgerStats> {
        // Both aggregates read one snapshot
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let funds = sqlx::query(
            r#"
            SELECT COUNT(*) AS total_funds,
                   COUNT(*) FILTER (WHERE status = 'active') AS active_funds,
                   COALESCE(SUM(total_amount), 0) AS total_allocated,
                   COALESCE(SUM(remaining_amount), 0) AS total_remaining
            FROM funds
            "#,
        )
        .fetch_one(&mut *tx)
        .await?;

        let txs = sqlx::query(
            r#"
            SELECT COUNT(*) AS total_transactions,
                   COUNT(*) FILTER (WHERE status = $1) AS pending_transactions,
                   COUNT(*) FILTER (WHERE status = $2) AS completed_transactions,
                   COUNT(*) FILTER (WHERE status = $3) AS failed_transactions,
                   COALESCE(SUM(amount) FILTER (WHERE status = $2), 0) AS total_disbursed
            FROM transactions
            "#,
        )
        .bind(TransactionStatus::Pending.as_str())
        .bind(TransactionStatus::Completed.as_str())
        .bind(TransactionStatus::Failed.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(LedgerStats {
            total_funds: funds.try_get("total_funds")?,
            active_funds: funds.try_get("active_funds")?,
            total_allocated: funds.try_get("total_allocated")?,
            total_remaining: funds.try_get("total_remaining")?,
            total_transactions: txs.try_get("total_transactions")?,
            pending_transactions: txs.try_get("pending_transactions")?,
            completed_transactions: txs.try_get("completed_transactions")?,
            failed_transactions: txs.try_get("failed_transactions")?,
            total_disbursed: txs.try_get("total_disbursed")?,
        })
    }
}
