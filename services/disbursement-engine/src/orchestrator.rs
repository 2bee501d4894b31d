//! Transaction Orchestrator
//!
//! `submit` drives one disbursement through
//! reserve -> pending record -> gateway release -> commit | release.
//!
//! The reservation is the only hold taken; no lock is held while the gateway
//! runs. Everything after the pending record is written runs on a spawned task,
//! so a dropped HTTP request still resolves the transaction.
//!
//! When the ledger cannot record a settlement outcome the transaction stays
//! `pending` with its hold in place, an audit entry names it, and an
//! administrator resolves it through `reconcile`.

use crate::audit::{actions, AuditLog};
use crate::errors::{EngineError, Result};
use crate::gateway::{GatewayError, Receipt, SettlementGateway};
use crate::metrics;
use crate::models::{is_valid_address, RequestOrigin, SubmitTransactionRequest, User};
use chrono::Utc;
use ledger_core::{LedgerStore, Reservation, Resolution, Transaction, TransactionDraft};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Drives disbursements from reservation to a recorded settlement outcome
#[derive(Clone)]
pub struct TransactionOrchestrator {
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn SettlementGateway>,
    audit: AuditLog,
    settlement_timeout: Duration,
}

/// Why a settlement did not produce a receipt
#[derive(Debug)]
enum SettlementFailure {
    Gateway(GatewayError),
    TimedOut(Duration),
    Panicked,
}

impl std::fmt::Display for SettlementFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettlementFailure::Gateway(e) => write!(f, "{}", e),
            SettlementFailure::TimedOut(d) => {
                write!(f, "Settlement timed out after {}s", d.as_secs_f64())
            }
            SettlementFailure::Panicked => write!(f, "Settlement task aborted"),
        }
    }
}

impl TransactionOrchestrator {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<dyn SettlementGateway>,
        audit: AuditLog,
        settlement_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            gateway,
            audit,
            settlement_timeout,
        }
    }

    pub async fn submit(
        &self,
        request: SubmitTransactionRequest,
        actor: &User,
        origin: RequestOrigin,
    ) -> Result<Transaction> {
        if !actor.can_submit_transactions() {
            return Err(EngineError::Forbidden(
                "Auditors cannot submit transactions".to_string(),
            ));
        }
        if request.amount <= Decimal::ZERO {
            return Err(EngineError::Validation("Amount must be positive".to_string()));
        }
        if !is_valid_address(&request.recipient_address) {
            return Err(EngineError::Validation(
                "Recipient address must be 0x followed by 40 hex digits".to_string(),
            ));
        }

        let reservation = match self.ledger.reserve(request.fund_id, request.amount).await {
            Ok(reservation) => reservation,
            Err(e) => {
                if matches!(e, ledger_core::Error::InsufficientBalance { .. }) {
                    metrics::INSUFFICIENT_BALANCE_REJECTIONS.inc();
                }
                metrics::TRANSACTIONS_SUBMITTED
                    .with_label_values(&["rejected"])
                    .inc();
                return Err(e.into());
            }
        };

        let draft = TransactionDraft {
            user_id: actor.id,
            recipient_address: request.recipient_address.clone(),
        };
        let pending = match self.ledger.open_transaction(&reservation, draft).await {
            Ok(tx) => tx,
            Err(e) => {
                error!("Failed to record pending transaction: {}", e);
                if let Err(release_err) = self
                    .ledger
                    .release(reservation, None, "transaction record failed")
                    .await
                {
                    error!("Failed to release reservation: {}", release_err);
                }
                return Err(e.into());
            }
        };

        info!(
            "Transaction {} pending: {} from fund {} to {}",
            pending.id, pending.amount, pending.fund_id, pending.recipient_address
        );

        let this = self.clone();
        let actor_id = actor.id;
        tokio::spawn(async move { this.settle(reservation, pending, actor_id, origin).await })
            .await
            .map_err(|e| EngineError::Internal(format!("Settlement task failed: {}", e)))?
    }

    async fn settle(
        &self,
        reservation: Reservation,
        pending: Transaction,
        actor_id: Uuid,
        origin: RequestOrigin,
    ) -> Result<Transaction> {
        let started = Instant::now();
        let outcome = self.call_gateway(&pending.recipient_address, pending.amount).await;
        let label = if outcome.is_ok() { "success" } else { "failure" };
        metrics::SETTLEMENT_DURATION
            .with_label_values(&[label])
            .observe(started.elapsed().as_secs_f64());

        match outcome {
            Ok(receipt) => {
                let hash = receipt.transaction_hash.clone();
                let tx = match self.ledger.commit(reservation, pending.id, receipt.into()).await {
                    Ok(tx) => tx,
                    Err(e) => {
                        error!(
                            transaction_id = %pending.id,
                            receipt = %hash,
                            "Settlement succeeded but commit failed: {}", e
                        );
                        self.record_unreconciled(
                            &pending,
                            actor_id,
                            &origin,
                            format!("settled on chain as {} but not recorded: {}", hash, e),
                        )
                        .await;
                        return Err(e.into());
                    }
                };

                metrics::TRANSACTIONS_SUBMITTED
                    .with_label_values(&["completed"])
                    .inc();
                info!("Transaction {} completed ({})", tx.id, hash);
                self.audit
                    .record(
                        Some(actor_id),
                        actions::TRANSACTION_COMPLETED,
                        format!(
                            "Transaction {} released {} from fund {} to {} ({})",
                            tx.id, tx.amount, tx.fund_id, tx.recipient_address, hash
                        ),
                        &origin,
                    )
                    .await;
                Ok(tx)
            }
            Err(failure) => {
                let reason = failure.to_string();
                warn!("Transaction {} failed: {}", pending.id, reason);

                let released = self
                    .ledger
                    .release(reservation, Some(pending.id), &reason)
                    .await
                    .map_err(EngineError::from)
                    .and_then(|tx| {
                        tx.ok_or_else(|| {
                            EngineError::Internal(format!("Transaction {} vanished", pending.id))
                        })
                    });
                let tx = match released {
                    Ok(tx) => tx,
                    Err(e) => {
                        error!(
                            transaction_id = %pending.id,
                            "Settlement failed and release failed: {}", e
                        );
                        self.record_unreconciled(
                            &pending,
                            actor_id,
                            &origin,
                            format!("failed ({}) but hold not released: {}", reason, e),
                        )
                        .await;
                        return Err(e);
                    }
                };

                metrics::TRANSACTIONS_SUBMITTED
                    .with_label_values(&["failed"])
                    .inc();
                self.audit
                    .record(
                        Some(actor_id),
                        actions::TRANSACTION_FAILED,
                        format!(
                            "Transaction {} of {} from fund {} failed: {}",
                            tx.id, tx.amount, tx.fund_id, reason
                        ),
                        &origin,
                    )
                    .await;
                Ok(tx)
            }
        }
    }

    async fn record_unreconciled(
        &self,
        pending: &Transaction,
        actor_id: Uuid,
        origin: &RequestOrigin,
        detail: String,
    ) {
        metrics::LEDGER_INCONSISTENCIES.inc();
        self.audit
            .record(
                Some(actor_id),
                actions::SETTLEMENT_UNRECONCILED,
                format!(
                    "Transaction {} of {} from fund {} {}",
                    pending.id, pending.amount, pending.fund_id, detail
                ),
                origin,
            )
            .await;
    }

    /// Resolve a transaction left `pending` after its outcome could not be recorded
    ///
    /// Admin only. Refused while the settlement could still be in flight.
    pub async fn reconcile(
        &self,
        transaction_id: Uuid,
        resolution: Resolution,
        actor: &User,
        origin: RequestOrigin,
    ) -> Result<Transaction> {
        actor.require_admin()?;

        let current = self.ledger.get_transaction(transaction_id).await?;
        if current.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "Transaction {} is already {}",
                transaction_id, current.status
            )));
        }
        let age = (Utc::now() - current.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age < self.settlement_timeout {
            return Err(EngineError::Conflict(format!(
                "Transaction {} may still be settling",
                transaction_id
            )));
        }

        let tx = self.ledger.reconcile(transaction_id, resolution).await?;

        info!("Transaction {} reconciled as {} by {}", tx.id, tx.status, actor.id);
        self.audit
            .record(
                Some(actor.id),
                actions::TRANSACTION_RECONCILED,
                format!(
                    "Transaction {} of {} from fund {} reconciled as {}{}",
                    tx.id,
                    tx.amount,
                    tx.fund_id,
                    tx.status,
                    tx.transaction_hash
                        .as_deref()
                        .map(|h| format!(" ({})", h))
                        .unwrap_or_default()
                ),
                &origin,
            )
            .await;
        Ok(tx)
    }

    /// Run the release on its own task so a panic or timeout becomes a failure
    async fn call_gateway(
        &self,
        recipient: &str,
        amount: Decimal,
    ) -> std::result::Result<Receipt, SettlementFailure> {
        let gateway = Arc::clone(&self.gateway);
        let recipient = recipient.to_string();
        let mut handle = tokio::spawn(async move { gateway.release(&recipient, amount).await });

        match tokio::time::timeout(self.settlement_timeout, &mut handle).await {
            Ok(Ok(Ok(receipt))) => Ok(receipt),
            Ok(Ok(Err(e))) => Err(SettlementFailure::Gateway(e)),
            Ok(Err(_)) => Err(SettlementFailure::Panicked),
            Err(_) => {
                handle.abort();
                Err(SettlementFailure::TimedOut(self.settlement_timeout))
            }
        }
    }
}
