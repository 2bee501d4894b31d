// Orchestrator tests over the in-memory ledger and stub gateways

use async_trait::async_trait;
use chrono::Utc;
use disbursement_engine::audit::{actions, AuditLog, AuditStore, MemoryAuditStore};
use disbursement_engine::errors::{EngineError, Result};
use disbursement_engine::gateway::{
    EventBatch, GatewayError, GatewayResult, Receipt, SettlementGateway, SettlementRecord,
    SimulatedGateway,
};
use disbursement_engine::models::{
    AuditLogEntry, NewAuditEntry, RequestOrigin, Role, SubmitTransactionRequest, User,
};
use disbursement_engine::orchestrator::TransactionOrchestrator;
use ledger_core::{
    Fund, FundStatus, FundUpdate, LedgerStats, LedgerStore, MemoryLedger, NewFund, Reservation,
    Resolution, Settlement, Transaction, TransactionDraft, TransactionFilter, TransactionStatus,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const RECIPIENT: &str = "0x1234567890abcdef1234567890abcdef12345678";

#[derive(Clone, Copy)]
enum Behaviour {
    Fail,
    Hang,
    Panic,
}

struct StubGateway {
    behaviour: Behaviour,
}

#[async_trait]
impl SettlementGateway for StubGateway {
    async fn get_balance(&self) -> GatewayResult<Decimal> {
        Ok(dec!(1000))
    }

    async fn get_account_balance(&self, _address: &str) -> GatewayResult<Decimal> {
        Ok(Decimal::ZERO)
    }

    async fn is_connected(&self) -> bool {
        true
    }

    async fn release(&self, _recipient: &str, _amount: Decimal) -> GatewayResult<Receipt> {
        match self.behaviour {
            Behaviour::Fail => Err(GatewayError::Rejected("execution reverted".to_string())),
            Behaviour::Hang => std::future::pending().await,
            Behaviour::Panic => panic!("gateway exploded"),
        }
    }

    async fn list_events(
        &self,
        from_checkpoint: u64,
        _to_block: Option<u64>,
    ) -> GatewayResult<EventBatch> {
        Ok(EventBatch {
            events: Vec::new(),
            next_checkpoint: from_checkpoint,
        })
    }

    async fn get_details(&self, transaction_hash: &str) -> GatewayResult<SettlementRecord> {
        Err(GatewayError::NotFound(transaction_hash.to_string()))
    }
}

struct BrokenAuditStore;

#[async_trait]
impl AuditStore for BrokenAuditStore {
    async fn append(&self, _entry: NewAuditEntry) -> Result<AuditLogEntry> {
        Err(EngineError::Database("audit_logs is read-only".to_string()))
    }

    async fn list(&self, _user_id: Option<Uuid>, _limit: i64) -> Result<Vec<AuditLogEntry>> {
        Ok(Vec::new())
    }
}

#[derive(Clone, Copy)]
enum Outage {
    Commit,
    Release,
}

/// Memory ledger whose commit or release fails as if the database dropped
struct FlakyLedger {
    inner: Arc<MemoryLedger>,
    outage: Outage,
}

impl FlakyLedger {
    fn outage() -> ledger_core::Error {
        ledger_core::Error::Storage("connection reset".to_string())
    }
}

#[async_trait]
impl LedgerStore for FlakyLedger {
    async fn create_fund(&self, fund: NewFund) -> ledger_core::Result<Fund> {
        self.inner.create_fund(fund).await
    }

    async fn get_fund(&self, fund_id: Uuid) -> ledger_core::Result<Fund> {
        self.inner.get_fund(fund_id).await
    }

    async fn list_funds(&self) -> ledger_core::Result<Vec<Fund>> {
        self.inner.list_funds().await
    }

    async fn update_fund(&self, fund_id: Uuid, update: FundUpdate) -> ledger_core::Result<Fund> {
        self.inner.update_fund(fund_id, update).await
    }

    async fn reserve(&self, fund_id: Uuid, amount: Decimal) -> ledger_core::Result<Reservation> {
        self.inner.reserve(fund_id, amount).await
    }

    async fn open_transaction(
        &self,
        reservation: &Reservation,
        draft: TransactionDraft,
    ) -> ledger_core::Result<Transaction> {
        self.inner.open_transaction(reservation, draft).await
    }

    async fn commit(
        &self,
        reservation: Reservation,
        transaction_id: Uuid,
        settlement: Settlement,
    ) -> ledger_core::Result<Transaction> {
        match self.outage {
            Outage::Commit => Err(Self::outage()),
            Outage::Release => self.inner.commit(reservation, transaction_id, settlement).await,
        }
    }

    async fn release(
        &self,
        reservation: Reservation,
        transaction_id: Option<Uuid>,
        reason: &str,
    ) -> ledger_core::Result<Option<Transaction>> {
        match self.outage {
            Outage::Release => Err(Self::outage()),
            Outage::Commit => self.inner.release(reservation, transaction_id, reason).await,
        }
    }

    async fn reconcile(
        &self,
        transaction_id: Uuid,
        resolution: Resolution,
    ) -> ledger_core::Result<Transaction> {
        self.inner.reconcile(transaction_id, resolution).await
    }

    async fn get_transaction(&self, transaction_id: Uuid) -> ledger_core::Result<Transaction> {
        self.inner.get_transaction(transaction_id).await
    }

    async fn list_transactions(
        &self,
        filter: TransactionFilter,
    ) -> ledger_core::Result<Vec<Transaction>> {
        self.inner.list_transactions(filter).await
    }

    async fn stats(&self) -> ledger_core::Result<LedgerStats> {
        self.inner.stats().await
    }
}

struct Harness {
    ledger: Arc<MemoryLedger>,
    audit: AuditLog,
    orchestrator: TransactionOrchestrator,
}

fn harness(gateway: Arc<dyn SettlementGateway>, audit_store: Arc<dyn AuditStore>) -> Harness {
    let ledger = Arc::new(MemoryLedger::new());
    harness_over(ledger.clone(), ledger, gateway, audit_store)
}

fn flaky_harness(outage: Outage, gateway: Arc<dyn SettlementGateway>) -> Harness {
    let ledger = Arc::new(MemoryLedger::new());
    let flaky = Arc::new(FlakyLedger {
        inner: ledger.clone(),
        outage,
    });
    harness_over(ledger, flaky, gateway, Arc::new(MemoryAuditStore::new()))
}

/// `ledger` is inspected by the test, `store` is what the orchestrator writes through
fn harness_over(
    ledger: Arc<MemoryLedger>,
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn SettlementGateway>,
    audit_store: Arc<dyn AuditStore>,
) -> Harness {
    let audit = AuditLog::new(audit_store);
    let orchestrator = TransactionOrchestrator::new(
        store,
        gateway,
        audit.clone(),
        Duration::from_millis(200),
    );
    Harness {
        ledger,
        audit,
        orchestrator,
    }
}

fn simulated_harness() -> Harness {
    harness(
        Arc::new(SimulatedGateway::new(0, 1.0, dec!(1000))),
        Arc::new(MemoryAuditStore::new()),
    )
}

fn user(role: Role) -> User {
    User {
        id: Uuid::new_v4(),
        username: format!("{}-{}", role, Uuid::new_v4().simple()),
        email: format!("{}@example.com", Uuid::new_v4().simple()),
        password_hash: String::new(),
        role,
        is_active: true,
        created_at: Utc::now(),
    }
}

async fn fund(ledger: &MemoryLedger, total: Decimal) -> Fund {
    ledger
        .create_fund(NewFund {
            name: "Relief".to_string(),
            description: None,
            total_amount: total,
            created_by: Uuid::new_v4(),
        })
        .await
        .unwrap()
}

fn request(fund_id: Uuid, amount: Decimal) -> SubmitTransactionRequest {
    SubmitTransactionRequest {
        fund_id,
        recipient_address: RECIPIENT.to_string(),
        amount,
    }
}

#[tokio::test]
async fn test_sequential_disbursements_respect_balance() {
    let h = simulated_harness();
    let alice = user(Role::User);
    let fund = fund(&h.ledger, dec!(100)).await;

    let first = h
        .orchestrator
        .submit(request(fund.id, dec!(60)), &alice, RequestOrigin::default())
        .await
        .unwrap();
    assert_eq!(first.status, TransactionStatus::Completed);
    assert!(first.transaction_hash.is_some());
    assert_eq!(h.ledger.get_fund(fund.id).await.unwrap().remaining_amount, dec!(40));

    let second = h
        .orchestrator
        .submit(request(fund.id, dec!(50)), &alice, RequestOrigin::default())
        .await;
    match second {
        Err(EngineError::InsufficientBalance {
            requested,
            available,
        }) => {
            assert_eq!(requested, dec!(50));
            assert_eq!(available, dec!(40));
        }
        other => panic!("expected insufficient balance, got {:?}", other),
    }

    let third = h
        .orchestrator
        .submit(request(fund.id, dec!(40)), &alice, RequestOrigin::default())
        .await
        .unwrap();
    assert_eq!(third.status, TransactionStatus::Completed);

    let fund = h.ledger.get_fund(fund.id).await.unwrap();
    assert_eq!(fund.remaining_amount, Decimal::ZERO);
    assert_eq!(h.ledger.open_reservations(), 0);

    let entries = h.audit.list(Some(alice.id), None).await.unwrap();
    let completed = entries
        .iter()
        .filter(|e| e.action == actions::TRANSACTION_COMPLETED)
        .count();
    assert_eq!(completed, 2);
}

#[tokio::test]
async fn test_gateway_failure_leaves_fund_untouched() {
    let h = harness(
        Arc::new(StubGateway {
            behaviour: Behaviour::Fail,
        }),
        Arc::new(MemoryAuditStore::new()),
    );
    let alice = user(Role::User);
    let fund = fund(&h.ledger, dec!(100)).await;

    let tx = h
        .orchestrator
        .submit(request(fund.id, dec!(30)), &alice, RequestOrigin::default())
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::Failed);
    assert!(tx.transaction_hash.is_none());
    assert!(tx.failure_reason.unwrap().contains("execution reverted"));
    assert_eq!(h.ledger.get_fund(fund.id).await.unwrap().remaining_amount, dec!(100));
    assert_eq!(h.ledger.open_reservations(), 0);

    let entries = h.audit.list(Some(alice.id), None).await.unwrap();
    assert_eq!(entries[0].action, actions::TRANSACTION_FAILED);
}

#[tokio::test]
async fn test_hanging_gateway_times_out() {
    let h = harness(
        Arc::new(StubGateway {
            behaviour: Behaviour::Hang,
        }),
        Arc::new(MemoryAuditStore::new()),
    );
    let alice = user(Role::User);
    let fund = fund(&h.ledger, dec!(100)).await;

    let tx = h
        .orchestrator
        .submit(request(fund.id, dec!(10)), &alice, RequestOrigin::default())
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::Failed);
    assert!(tx.failure_reason.unwrap().contains("timed out"));
    assert_eq!(h.ledger.get_fund(fund.id).await.unwrap().remaining_amount, dec!(100));
    assert_eq!(h.ledger.open_reservations(), 0);
}

#[tokio::test]
async fn test_panicking_gateway_is_a_failure() {
    let h = harness(
        Arc::new(StubGateway {
            behaviour: Behaviour::Panic,
        }),
        Arc::new(MemoryAuditStore::new()),
    );
    let alice = user(Role::User);
    let fund = fund(&h.ledger, dec!(100)).await;

    let tx = h
        .orchestrator
        .submit(request(fund.id, dec!(10)), &alice, RequestOrigin::default())
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::Failed);
    assert_eq!(h.ledger.get_fund(fund.id).await.unwrap().remaining_amount, dec!(100));
    assert_eq!(h.ledger.open_reservations(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_single_winner() {
    let h = harness(
        Arc::new(SimulatedGateway::new(20, 1.0, dec!(1000))),
        Arc::new(MemoryAuditStore::new()),
    );
    let fund = fund(&h.ledger, dec!(100)).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let orchestrator = h.orchestrator.clone();
        let fund_id = fund.id;
        let submitter = user(Role::User);
        handles.push(tokio::spawn(async move {
            orchestrator
                .submit(request(fund_id, dec!(70)), &submitter, RequestOrigin::default())
                .await
        }));
    }

    let mut completed = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(tx) => {
                assert_eq!(tx.status, TransactionStatus::Completed);
                completed += 1;
            }
            Err(EngineError::InsufficientBalance { .. }) => rejected += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(completed, 1);
    assert_eq!(rejected, 7);
    assert_eq!(h.ledger.get_fund(fund.id).await.unwrap().remaining_amount, dec!(30));
}

#[tokio::test]
async fn test_audit_failure_does_not_fail_disbursement() {
    let h = harness(
        Arc::new(SimulatedGateway::new(0, 1.0, dec!(1000))),
        Arc::new(BrokenAuditStore),
    );
    let alice = user(Role::User);
    let fund = fund(&h.ledger, dec!(100)).await;

    let tx = h
        .orchestrator
        .submit(request(fund.id, dec!(25)), &alice, RequestOrigin::default())
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(h.ledger.get_fund(fund.id).await.unwrap().remaining_amount, dec!(75));
}

#[tokio::test]
async fn test_rejections_before_reserving() {
    let h = simulated_harness();
    let fund = fund(&h.ledger, dec!(100)).await;

    let auditor = user(Role::Auditor);
    let err = h
        .orchestrator
        .submit(request(fund.id, dec!(10)), &auditor, RequestOrigin::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    let alice = user(Role::User);
    let err = h
        .orchestrator
        .submit(request(fund.id, Decimal::ZERO), &alice, RequestOrigin::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let mut bad_address = request(fund.id, dec!(10));
    bad_address.recipient_address = "0xnothex".to_string();
    let err = h
        .orchestrator
        .submit(bad_address, &alice, RequestOrigin::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let err = h
        .orchestrator
        .submit(request(Uuid::new_v4(), dec!(10)), &alice, RequestOrigin::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    h.ledger
        .update_fund(
            fund.id,
            FundUpdate {
                status: Some(FundStatus::Suspended),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let err = h
        .orchestrator
        .submit(request(fund.id, dec!(10)), &alice, RequestOrigin::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    assert_eq!(h.ledger.list_transactions(Default::default()).await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_unrecorded_settlement_is_audited_and_reconcilable() {
    let gateway = Arc::new(SimulatedGateway::new(0, 1.0, dec!(1000)));
    let h = flaky_harness(Outage::Commit, gateway.clone());
    let alice = user(Role::User);
    let admin = user(Role::Admin);
    let fund = fund(&h.ledger, dec!(100)).await;

    let err = h
        .orchestrator
        .submit(request(fund.id, dec!(60)), &alice, RequestOrigin::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Database(_)));

    // Value moved on chain, the ledger still holds it
    let receipt = gateway.list_events(0, None).await.unwrap().events[0]
        .transaction_hash
        .clone();
    let entries = h.audit.list(Some(alice.id), None).await.unwrap();
    assert_eq!(entries[0].action, actions::SETTLEMENT_UNRECONCILED);
    assert!(entries[0].details.as_deref().unwrap().contains(&receipt));

    let stuck = h.ledger.list_transactions(TransactionFilter::default()).await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].status, TransactionStatus::Pending);
    let held = h.ledger.get_fund(fund.id).await.unwrap();
    assert_eq!(held.remaining_amount, dec!(100));
    assert_eq!(held.reserved_amount, dec!(60));

    let completed = Resolution::Completed(Settlement {
        transaction_hash: receipt.clone(),
        block_number: Some(1),
        gas_used: None,
    });

    let err = h
        .orchestrator
        .reconcile(stuck[0].id, completed.clone(), &admin, RequestOrigin::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)), "still within the settlement window");

    tokio::time::sleep(Duration::from_millis(250)).await;

    let err = h
        .orchestrator
        .reconcile(stuck[0].id, completed.clone(), &alice, RequestOrigin::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    let tx = h
        .orchestrator
        .reconcile(stuck[0].id, completed.clone(), &admin, RequestOrigin::default())
        .await
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(tx.transaction_hash.as_deref(), Some(receipt.as_str()));

    let fund = h.ledger.get_fund(fund.id).await.unwrap();
    assert_eq!(fund.remaining_amount, dec!(40));
    assert_eq!(fund.reserved_amount, Decimal::ZERO);
    assert_eq!(h.ledger.open_reservations(), 0);

    let entries = h.audit.list(Some(admin.id), None).await.unwrap();
    assert_eq!(entries[0].action, actions::TRANSACTION_RECONCILED);

    let again = h
        .orchestrator
        .reconcile(stuck[0].id, completed, &admin, RequestOrigin::default())
        .await
        .unwrap_err();
    assert!(matches!(again, EngineError::Conflict(_)));
}

#[tokio::test]
async fn test_unreleased_hold_is_audited_and_reconcilable() {
    let h = flaky_harness(
        Outage::Release,
        Arc::new(StubGateway {
            behaviour: Behaviour::Fail,
        }),
    );
    let alice = user(Role::User);
    let admin = user(Role::Admin);
    let fund = fund(&h.ledger, dec!(100)).await;

    let err = h
        .orchestrator
        .submit(request(fund.id, dec!(30)), &alice, RequestOrigin::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Database(_)));

    let entries = h.audit.list(Some(alice.id), None).await.unwrap();
    assert_eq!(entries[0].action, actions::SETTLEMENT_UNRECONCILED);
    assert!(entries[0].details.as_deref().unwrap().contains("execution reverted"));
    assert_eq!(h.ledger.get_fund(fund.id).await.unwrap().available_amount(), dec!(70));

    tokio::time::sleep(Duration::from_millis(250)).await;

    let stuck = h.ledger.list_transactions(TransactionFilter::default()).await.unwrap();
    let tx = h
        .orchestrator
        .reconcile(
            stuck[0].id,
            Resolution::Failed {
                reason: "execution reverted".to_string(),
            },
            &admin,
            RequestOrigin::default(),
        )
        .await
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Failed);

    let fund = h.ledger.get_fund(fund.id).await.unwrap();
    assert_eq!(fund.remaining_amount, dec!(100));
    assert_eq!(fund.available_amount(), dec!(100));
}
