use super::{
    EventBatch, FundReleasedEvent, GatewayError, GatewayResult, Receipt, SettlementGateway,
    SettlementRecord,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Gas reported for every simulated release
pub const SIMULATED_GAS_USED: i64 = 48_231;

const CONTRACT_OWNER: &str = "0x627306090abab3a6e1400e9345bc60c78a8bef57";

struct Chain {
    balance: Decimal,
    accounts: HashMap<String, Decimal>,
    block_number: u64,
    events: Vec<FundReleasedEvent>,
    records: HashMap<String, SettlementRecord>,
}

/// In-process stand-in for the disbursement contract
pub struct SimulatedGateway {
    latency_ms: u64,
    success_rate: f64,
    offline: AtomicBool,
    chain: Mutex<Chain>,
}

impl SimulatedGateway {
    pub fn new(latency_ms: u64, success_rate: f64, initial_balance: Decimal) -> Self {
        Self {
            latency_ms,
            success_rate,
            offline: AtomicBool::new(false),
            chain: Mutex::new(Chain {
                balance: initial_balance,
                accounts: HashMap::new(),
                block_number: 0,
                events: Vec::new(),
                records: HashMap::new(),
            }),
        }
    }

    /// Make every call fail with `Unavailable` until switched back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn should_succeed(&self) -> bool {
        let mut rng = rand::thread_rng();
        rng.gen::<f64>() < self.success_rate
    }

    async fn simulate_latency(&self) -> GatewayResult<()> {
        if self.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable(
                "Simulated chain is offline".to_string(),
            ));
        }
        Ok(())
    }

    fn transaction_hash(recipient: &str, amount: Decimal, block_number: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(recipient.as_bytes());
        hasher.update(amount.to_string().as_bytes());
        hasher.update(block_number.to_be_bytes());
        hasher.update(Uuid::new_v4().as_bytes());
        format!("0x{}", hex::encode(hasher.finalize()))
    }
}

#[async_trait]
impl SettlementGateway for SimulatedGateway {
    async fn get_balance(&self) -> GatewayResult<Decimal> {
        self.simulate_latency().await?;
        Ok(self.chain.lock().balance)
    }

    async fn get_account_balance(&self, address: &str) -> GatewayResult<Decimal> {
        self.simulate_latency().await?;
        Ok(self
            .chain
            .lock()
            .accounts
            .get(&address.to_lowercase())
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn is_connected(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }

    async fn release(&self, recipient: &str, amount: Decimal) -> GatewayResult<Receipt> {
        info!("Simulated chain: releasing {} to {}", amount, recipient);
        self.simulate_latency().await?;

        if !self.should_succeed() {
            warn!("Simulated chain: release to {} failed", recipient);
            return Err(GatewayError::Rejected(
                "Simulated settlement failure".to_string(),
            ));
        }

        let mut chain = self.chain.lock();
        if amount > chain.balance {
            return Err(GatewayError::Rejected(format!(
                "Contract balance {} is below {}",
                chain.balance, amount
            )));
        }

        chain.block_number += 1;
        chain.balance -= amount;
        *chain
            .accounts
            .entry(recipient.to_lowercase())
            .or_insert(Decimal::ZERO) += amount;
        let block_number = chain.block_number;
        let transaction_hash = Self::transaction_hash(recipient, amount, block_number);

        chain.events.push(FundReleasedEvent {
            recipient: recipient.to_lowercase(),
            amount,
            transaction_hash: transaction_hash.clone(),
            block_number,
        });
        chain.records.insert(
            transaction_hash.clone(),
            SettlementRecord {
                transaction_hash: transaction_hash.clone(),
                from: CONTRACT_OWNER.to_string(),
                to: Some(recipient.to_lowercase()),
                value: amount,
                gas_used: Some(SIMULATED_GAS_USED),
                block_number: Some(block_number as i64),
                succeeded: Some(true),
            },
        );

        Ok(Receipt {
            transaction_hash,
            block_number: Some(block_number as i64),
            gas_used: Some(SIMULATED_GAS_USED),
        })
    }

    async fn list_events(
        &self,
        from_checkpoint: u64,
        to_block: Option<u64>,
    ) -> GatewayResult<EventBatch> {
        self.simulate_latency().await?;

        let chain = self.chain.lock();
        let events: Vec<FundReleasedEvent> = chain
            .events
            .iter()
            .filter(|e| e.block_number >= from_checkpoint)
            .filter(|e| to_block.map_or(true, |to| e.block_number <= to))
            .cloned()
            .collect();
        let next_checkpoint = events
            .last()
            .map(|e| e.block_number + 1)
            .unwrap_or(from_checkpoint);

        Ok(EventBatch {
            events,
            next_checkpoint,
        })
    }

    async fn get_details(&self, transaction_hash: &str) -> GatewayResult<SettlementRecord> {
        self.simulate_latency().await?;

        self.chain
            .lock()
            .records
            .get(&transaction_hash.to_lowercase())
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("Transaction {}", transaction_hash)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const RECIPIENT: &str = "0x1111111111111111111111111111111111111111";

    #[tokio::test]
    async fn test_release_produces_receipt_and_event() {
        let gateway = SimulatedGateway::new(0, 1.0, dec!(10));

        let receipt = gateway.release(RECIPIENT, dec!(2.5)).await.unwrap();
        assert!(receipt.transaction_hash.starts_with("0x"));
        assert_eq!(receipt.transaction_hash.len(), 66);
        assert_eq!(receipt.block_number, Some(1));

        assert_eq!(gateway.get_balance().await.unwrap(), dec!(7.5));

        let batch = gateway.list_events(0, None).await.unwrap();
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].amount, dec!(2.5));
        assert_eq!(batch.next_checkpoint, 2);

        let record = gateway.get_details(&receipt.transaction_hash).await.unwrap();
        assert_eq!(record.value, dec!(2.5));
        assert_eq!(record.succeeded, Some(true));
    }

    #[tokio::test]
    async fn test_incremental_event_polling() {
        let gateway = SimulatedGateway::new(0, 1.0, dec!(10));
        gateway.release(RECIPIENT, dec!(1)).await.unwrap();

        let first = gateway.list_events(0, None).await.unwrap();
        gateway.release(RECIPIENT, dec!(2)).await.unwrap();

        let second = gateway.list_events(first.next_checkpoint, None).await.unwrap();
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.events[0].amount, dec!(2));

        let empty = gateway.list_events(second.next_checkpoint, None).await.unwrap();
        assert!(empty.events.is_empty());
        assert_eq!(empty.next_checkpoint, second.next_checkpoint);
    }

    #[tokio::test]
    async fn test_bounded_event_range() {
        let gateway = SimulatedGateway::new(0, 1.0, dec!(10));
        for amount in [dec!(1), dec!(2), dec!(3)] {
            gateway.release(RECIPIENT, amount).await.unwrap();
        }

        let batch = gateway.list_events(2, Some(2)).await.unwrap();
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].amount, dec!(2));
        assert_eq!(batch.next_checkpoint, 3);
    }

    #[tokio::test]
    async fn test_recipient_balance() {
        let gateway = SimulatedGateway::new(0, 1.0, dec!(10));
        gateway.release(RECIPIENT, dec!(1.25)).await.unwrap();
        gateway.release(RECIPIENT, dec!(0.75)).await.unwrap();

        assert_eq!(gateway.get_account_balance(RECIPIENT).await.unwrap(), dec!(2));
        assert_eq!(
            gateway
                .get_account_balance("0x2222222222222222222222222222222222222222")
                .await
                .unwrap(),
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn test_rejects_above_contract_balance() {
        let gateway = SimulatedGateway::new(0, 1.0, dec!(1));
        assert!(matches!(
            gateway.release(RECIPIENT, dec!(1.5)).await,
            Err(GatewayError::Rejected(_))
        ));
        assert_eq!(gateway.get_balance().await.unwrap(), dec!(1));
    }

    #[tokio::test]
    async fn test_zero_success_rate_always_fails() {
        let gateway = SimulatedGateway::new(0, 0.0, dec!(100));
        for _ in 0..5 {
            assert!(gateway.release(RECIPIENT, dec!(1)).await.is_err());
        }
        assert!(gateway.list_events(0, None).await.unwrap().events.is_empty());
    }

    #[tokio::test]
    async fn test_offline() {
        let gateway = SimulatedGateway::new(0, 1.0, dec!(100));
        gateway.set_offline(true);
        assert!(!gateway.is_connected().await);
        assert!(matches!(
            gateway.get_balance().await,
            Err(GatewayError::Unavailable(_))
        ));
        gateway.set_offline(false);
        assert!(gateway.is_connected().await);
        assert!(gateway.get_balance().await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_hash() {
        let gateway = SimulatedGateway::new(0, 1.0, dec!(100));
        assert!(matches!(
            gateway.get_details("0xdeadbeef").await,
            Err(GatewayError::NotFound(_))
        ));
    }
}
